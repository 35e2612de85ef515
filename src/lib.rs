//! # corvid
//!
//! A multi-server IRC bot runtime: persistent connections, wire parsing,
//! authoritative per-server state, event fan-out with panic isolation, and
//! a structured command subsystem with argument schemas and per-user
//! access control.
//!
//! The protocol primitives (message codec, capabilities, case mapping)
//! live in the `corvid-proto` crate, re-exported here as [`proto`].
//!
//! ## A minimal bot
//!
//! ```no_run
//! use corvid::config::Config;
//! use corvid::Bot;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::builder()
//!     .nick("corvid")
//!     .username("corvid")
//!     .realname("corvid bot")
//!     .server("irc.libera.chat")
//!     .channels(&["#corvid"])
//!     .build();
//!
//! let bot = Bot::create(config)?;
//! let mut terminations = bot.start();
//! while let Some(term) = terminations.recv().await {
//!     eprintln!("{} stopped: {}", term.server, term.reason);
//! }
//! # Ok(())
//! # }
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod bot;
pub mod config;
pub mod conn;
pub mod data;
pub mod dispatch;
pub mod endpoint;
pub mod state;

pub use corvid_proto as proto;

pub use bot::{Bot, BotError, Providers, ServerTermination};
pub use config::Config;
pub use dispatch::cmd::{
    CommandContext, CommandData, CommandError, CommandHandler, CommandSpec, Commander, MsgType,
    Scope,
};
pub use dispatch::{DispatchError, Dispatcher, EventHandler};
pub use endpoint::Endpoint;
pub use state::State;
