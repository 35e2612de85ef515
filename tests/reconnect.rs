//! Reconnect lifecycle: EOF connections trigger the reconnect timer,
//! synthetic CONNECT / DISCONNECT events fire per session, and a user
//! stop terminates the start stream.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use corvid::proto::{names, Message};
use corvid::{Bot, BotError, Config, Endpoint, EventHandler, Providers};

use common::ScriptedServer;

const SERVER: &str = "irc.test.net";

fn config() -> Config {
    Config::builder()
        .nick("corvid")
        .username("corvid")
        .realname("corvid bot")
        .no_reconnect(false)
        .reconnect_timeout(1)
        .server(SERVER)
        .build()
}

struct LifecycleCounter {
    bot: Bot,
    connects: Arc<AtomicUsize>,
    disconnects: Arc<AtomicUsize>,
}

#[async_trait]
impl EventHandler for LifecycleCounter {
    async fn handle(&self, msg: Arc<Message>, _ep: Endpoint) {
        match msg.name.as_str() {
            names::CONNECT => {
                // Stop once the third session is up (the first two died
                // with EOF and were reconnected).
                if self.connects.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                    self.bot.stop();
                }
            }
            names::DISCONNECT => {
                self.disconnects.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn reconnects_until_live_then_stops() {
    let scripted = ScriptedServer::new(2);
    let bot = Bot::create_with(
        config(),
        Providers {
            conn: Some(scripted.provider.clone()),
            store: None,
            reconnect_scale: Some(Duration::from_millis(1)),
        },
    )
    .unwrap();

    let connects = Arc::new(AtomicUsize::new(0));
    let disconnects = Arc::new(AtomicUsize::new(0));
    bot.register(
        names::RAW,
        Arc::new(LifecycleCounter {
            bot: bot.clone(),
            connects: Arc::clone(&connects),
            disconnects: Arc::clone(&disconnects),
        }),
    );

    let mut terminations = bot.start();

    let term = timeout(Duration::from_secs(10), terminations.recv())
        .await
        .expect("termination timed out")
        .expect("termination stream closed early");
    assert_eq!(term.server, SERVER);
    assert!(
        matches!(
            term.reason,
            BotError::Driver(corvid::conn::DriverError::UserStopped)
        ),
        "unexpected stop reason: {}",
        term.reason
    );

    // Stream closes once every server is down.
    assert!(timeout(Duration::from_secs(5), terminations.recv())
        .await
        .expect("stream close timed out")
        .is_none());

    bot.dispatcher().wait_for_handlers().await;

    // Two dead sessions then the live one; the user stop ends the third,
    // so every session produced a CONNECT/DISCONNECT pair.
    assert_eq!(scripted.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(connects.load(Ordering::SeqCst), 3);
    assert_eq!(disconnects.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn no_reconnect_terminates_on_eof() {
    let scripted = ScriptedServer::new(usize::MAX);
    let config = Config::builder()
        .nick("corvid")
        .username("corvid")
        .realname("corvid bot")
        .no_reconnect(true)
        .server(SERVER)
        .build();
    let bot = Bot::create_with(
        config,
        Providers {
            conn: Some(scripted.provider.clone()),
            store: None,
            reconnect_scale: Some(Duration::from_millis(1)),
        },
    )
    .unwrap();

    let mut terminations = bot.start();
    let term = timeout(Duration::from_secs(5), terminations.recv())
        .await
        .expect("termination timed out")
        .expect("termination stream closed early");
    assert!(
        matches!(
            term.reason,
            BotError::Driver(corvid::conn::DriverError::Eof)
        ),
        "unexpected stop reason: {}",
        term.reason
    );
    assert_eq!(scripted.attempts.load(Ordering::SeqCst), 1);
}
