//! Per-server write facade.
//!
//! An [`Endpoint`] is a cheap clonable handle that handlers use to talk
//! back to the server a message arrived on. It formats the common message
//! shapes (PRIVMSG, NOTICE, CTCP, JOIN, ...) and hands finished lines to
//! the underlying writer; the driver chunks anything over the line limit.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use corvid_proto::ctcp;

use crate::conn::{Driver, DriverError};

/// Sink for finished lines. The driver is the production implementation;
/// [`BufferWriter`] captures lines for tests and dry runs.
#[async_trait]
pub trait LineWriter: Send + Sync {
    /// Identifies the server this writer is bound to.
    fn key(&self) -> &str;
    /// Write one line (without CRLF).
    async fn write_line(&self, line: &str) -> Result<(), DriverError>;
}

#[async_trait]
impl LineWriter for Driver {
    fn key(&self) -> &str {
        &self.config().server_id
    }

    async fn write_line(&self, line: &str) -> Result<(), DriverError> {
        Driver::write_line(self, line).await
    }
}

/// Captures written lines in memory.
#[derive(Default)]
pub struct BufferWriter {
    key: String,
    lines: Mutex<Vec<String>>,
}

impl BufferWriter {
    /// A buffer writer identifying as `key`.
    pub fn new(key: impl Into<String>) -> Arc<Self> {
        Arc::new(BufferWriter {
            key: key.into(),
            lines: Mutex::new(Vec::new()),
        })
    }

    /// Everything written so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().expect("buffer writer lock").clone()
    }

    /// Drop captured lines.
    pub fn clear(&self) {
        self.lines.lock().expect("buffer writer lock").clear();
    }
}

#[async_trait]
impl LineWriter for BufferWriter {
    fn key(&self) -> &str {
        &self.key
    }

    async fn write_line(&self, line: &str) -> Result<(), DriverError> {
        self.lines
            .lock()
            .expect("buffer writer lock")
            .push(line.to_owned());
        Ok(())
    }
}

struct Discard {
    key: String,
}

#[async_trait]
impl LineWriter for Discard {
    fn key(&self) -> &str {
        &self.key
    }

    async fn write_line(&self, _line: &str) -> Result<(), DriverError> {
        Ok(())
    }
}

/// A write handle bound to one server.
#[derive(Clone)]
pub struct Endpoint {
    writer: Arc<dyn LineWriter>,
}

impl Endpoint {
    /// An endpoint over any line writer.
    pub fn new(writer: Arc<dyn LineWriter>) -> Self {
        Endpoint { writer }
    }

    /// An endpoint that drops everything; for tests and disabled servers.
    pub fn discard(key: impl Into<String>) -> Self {
        Endpoint {
            writer: Arc::new(Discard { key: key.into() }),
        }
    }

    /// The server id this endpoint writes to.
    pub fn key(&self) -> &str {
        self.writer.key()
    }

    /// Send a raw protocol line.
    pub async fn send(&self, line: &str) -> Result<(), DriverError> {
        self.writer.write_line(line).await
    }

    /// Send a formatted raw line: `ep.sendf(format_args!(...))`.
    ///
    /// The arguments render before the future is built, so the future is
    /// `Send` and usable inside spawned handlers.
    pub fn sendf(
        &self,
        args: fmt::Arguments<'_>,
    ) -> impl std::future::Future<Output = Result<(), DriverError>> + Send + '_ {
        let line = args.to_string();
        async move { self.send(&line).await }
    }

    /// Send a PRIVMSG.
    pub async fn privmsg(&self, target: &str, text: &str) -> Result<(), DriverError> {
        self.send(&format!("PRIVMSG {} :{}", target, text)).await
    }

    /// Send a formatted PRIVMSG.
    pub fn privmsgf<'a>(
        &'a self,
        target: &'a str,
        args: fmt::Arguments<'_>,
    ) -> impl std::future::Future<Output = Result<(), DriverError>> + Send + 'a {
        let text = args.to_string();
        async move { self.privmsg(target, &text).await }
    }

    /// Send a NOTICE.
    pub async fn notice(&self, target: &str, text: &str) -> Result<(), DriverError> {
        self.send(&format!("NOTICE {} :{}", target, text)).await
    }

    /// Send a formatted NOTICE.
    pub fn noticef<'a>(
        &'a self,
        target: &'a str,
        args: fmt::Arguments<'_>,
    ) -> impl std::future::Future<Output = Result<(), DriverError>> + Send + 'a {
        let text = args.to_string();
        async move { self.notice(target, &text).await }
    }

    /// Send a CTCP request (a delimited PRIVMSG).
    pub async fn ctcp(&self, target: &str, tag: &str, data: &str) -> Result<(), DriverError> {
        self.send(&format!("PRIVMSG {} :{}", target, ctcp::pack(tag, data)))
            .await
    }

    /// Send a CTCP reply (a delimited NOTICE).
    pub async fn ctcp_reply(&self, target: &str, tag: &str, data: &str) -> Result<(), DriverError> {
        self.send(&format!("NOTICE {} :{}", target, ctcp::pack(tag, data)))
            .await
    }

    /// Join channels. A no-op when `targets` is empty.
    pub async fn join(&self, targets: &[&str]) -> Result<(), DriverError> {
        if targets.is_empty() {
            return Ok(());
        }
        self.send(&format!("JOIN :{}", targets.join(","))).await
    }

    /// Part channels. A no-op when `targets` is empty.
    pub async fn part(&self, targets: &[&str]) -> Result<(), DriverError> {
        if targets.is_empty() {
            return Ok(());
        }
        self.send(&format!("PART :{}", targets.join(","))).await
    }

    /// Quit with a message.
    pub async fn quit(&self, msg: &str) -> Result<(), DriverError> {
        self.send(&format!("QUIT :{}", msg)).await
    }

    /// Change nick.
    pub async fn nick(&self, nick: &str) -> Result<(), DriverError> {
        self.send(&format!("NICK :{}", nick)).await
    }
}
