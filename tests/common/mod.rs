//! Shared scaffolding for integration tests: in-memory transports and a
//! scripted peer standing in for an IRC server.

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::time::timeout;

use corvid::conn::{BoxTransport, ConnProvider};

const IO_DEADLINE: Duration = Duration::from_secs(5);

/// The far side of an in-memory connection.
pub struct Peer {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl Peer {
    /// Read one line, failing the test on timeout or EOF.
    pub async fn read_line(&mut self) -> String {
        let mut line = String::new();
        let n = timeout(IO_DEADLINE, self.reader.read_line(&mut line))
            .await
            .expect("peer read timed out")
            .expect("peer read failed");
        assert!(n > 0, "peer hit EOF");
        line.trim_end_matches(['\r', '\n']).to_owned()
    }

    /// Read lines until one satisfies the predicate, returning it.
    pub async fn read_until(&mut self, mut pred: impl FnMut(&str) -> bool) -> String {
        loop {
            let line = self.read_line().await;
            if pred(&line) {
                return line;
            }
        }
    }

    /// Write one line with CRLF.
    pub async fn send(&mut self, line: &str) {
        let framed = format!("{}\r\n", line);
        timeout(IO_DEADLINE, self.writer.write_all(framed.as_bytes()))
            .await
            .expect("peer write timed out")
            .expect("peer write failed");
    }
}

/// A provider whose first `eof_connects` connections close immediately;
/// later connections are handed to the peer queue for the test to drive.
pub struct ScriptedServer {
    pub provider: ConnProvider,
    pub attempts: Arc<AtomicUsize>,
    peers: Arc<Mutex<Vec<Peer>>>,
}

impl ScriptedServer {
    pub fn new(eof_connects: usize) -> Self {
        let attempts = Arc::new(AtomicUsize::new(0));
        let peers: Arc<Mutex<Vec<Peer>>> = Arc::new(Mutex::new(Vec::new()));

        let provider: ConnProvider = {
            let attempts = Arc::clone(&attempts);
            let peers = Arc::clone(&peers);
            Arc::new(move |_address: &str| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                let peers = Arc::clone(&peers);
                Box::pin(async move {
                    let (client, server) = tokio::io::duplex(16 * 1024);
                    if n < eof_connects {
                        drop(server);
                    } else {
                        let (r, w) = tokio::io::split(server);
                        peers.lock().expect("peer queue").push(Peer {
                            reader: BufReader::new(r),
                            writer: w,
                        });
                    }
                    Ok(Box::new(client) as BoxTransport) as io::Result<BoxTransport>
                })
            })
        };

        ScriptedServer {
            provider,
            attempts,
            peers,
        }
    }

    /// Take the peer for the most recent live connection, waiting for the
    /// dial to land.
    pub async fn take_peer(&self) -> Peer {
        let deadline = tokio::time::Instant::now() + IO_DEADLINE;
        loop {
            if let Some(peer) = self.peers.lock().expect("peer queue").pop() {
                return peer;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no live connection arrived"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
