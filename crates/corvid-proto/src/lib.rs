//! # corvid-proto
//!
//! IRC wire protocol primitives for the corvid bot runtime.
//!
//! This crate is deliberately small and synchronous: it knows how to turn a
//! single IRC line into a [`Message`] and back, how to accumulate server
//! capability advertisements ([`ProtoCaps`]), and how to do the handful of
//! textual chores the protocol requires (RFC 1459 case mapping, CTCP
//! delimiting, fullhost splitting, wildcard masks). Everything stateful or
//! asynchronous lives in the `corvid` runtime crate.
//!
//! ## Parsing a line
//!
//! ```
//! use corvid_proto::Message;
//!
//! let msg = Message::parse(":nick!user@host PRIVMSG #chan :hello there").unwrap();
//! assert_eq!(msg.name, "PRIVMSG");
//! assert_eq!(msg.nick(), "nick");
//! assert_eq!(msg.args, vec!["#chan", "hello there"]);
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod caps;
pub mod casemap;
pub mod ctcp;
pub mod error;
pub mod mask;
pub mod names;
pub mod wire;

pub use self::caps::{ChanmodeClasses, PrefixTable, ProtoCaps};
pub use self::casemap::{irc_eq, irc_lower_char, irc_to_lower, Casemapping};
pub use self::error::ProtocolError;
pub use self::mask::{split_fullhost, wildcard_match, WildMask};
pub use self::wire::{Message, MAX_LINE_IN, MAX_LINE_OUT, SPLIT_BACKWARD};
