//! Wire codec: one IRC line to and from a structured [`Message`].

use std::fmt;

use chrono::{DateTime, Utc};

use crate::ctcp;
use crate::error::ProtocolError;
use crate::mask;
use crate::names;

/// Longest line accepted from the network, including CRLF.
pub const MAX_LINE_IN: usize = 512;

/// Longest payload the bot puts on the wire before CRLF. Shorter than the
/// RFC limit so the server can prepend our fullhost on rebroadcast without
/// truncating the tail.
pub const MAX_LINE_OUT: usize = 448;

/// How far back from a forced cut point the line splitter looks for a space
/// before hard-cutting mid-word.
pub const SPLIT_BACKWARD: usize = 20;

/// A single parsed IRC message.
///
/// The trailing parameter is flattened into the last element of `args`
/// (without its leading colon). Messages are immutable once parsed;
/// equality ignores the receive timestamp.
#[derive(Clone, Debug)]
pub struct Message {
    /// Uppercase command name or three-digit numeric.
    pub name: String,
    /// Raw prefix without the leading colon: `nick!user@host` or a server
    /// name. Empty when the line carried no prefix.
    pub sender: String,
    /// Ordered arguments, trailing parameter last.
    pub args: Vec<String>,
    /// When this message was received.
    pub received_at: DateTime<Utc>,
    /// Whether the final argument arrived as (or must serialize as) a
    /// `:`-prefixed trailing parameter even if it contains no space.
    trailing: bool,
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.sender == other.sender && self.args == other.args
    }
}

impl Eq for Message {}

fn valid_command(token: &str) -> bool {
    if token.is_empty() {
        return false;
    }
    let alpha = token.bytes().all(|b| b.is_ascii_alphabetic());
    let numeric = token.len() == 3 && token.bytes().all(|b| b.is_ascii_digit());
    alpha || numeric
}

fn needs_colon(arg: &str) -> bool {
    arg.is_empty() || arg.starts_with(':') || arg.contains(' ')
}

impl Message {
    /// Construct a message with the current receive timestamp.
    pub fn new<N, S>(name: N, sender: S, args: &[&str]) -> Self
    where
        N: Into<String>,
        S: Into<String>,
    {
        let args: Vec<String> = args.iter().map(|s| (*s).to_string()).collect();
        let trailing = args.last().map(|a| needs_colon(a)).unwrap_or(false);
        Message {
            name: name.into().to_ascii_uppercase(),
            sender: sender.into(),
            args,
            received_at: Utc::now(),
            trailing,
        }
    }

    /// Parse a single line. A trailing CRLF is tolerated and stripped.
    pub fn parse(line: &str) -> Result<Message, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.len() > MAX_LINE_IN {
            return Err(ProtocolError::LineTooLong {
                len: line.len(),
                limit: MAX_LINE_IN,
            });
        }

        let mut rest = line;
        let mut sender = "";
        if let Some(prefixed) = rest.strip_prefix(':') {
            match prefixed.split_once(' ') {
                Some((s, tail)) if !s.is_empty() => {
                    sender = s;
                    rest = tail;
                }
                _ => return Err(ProtocolError::MalformedLine(line.to_owned())),
            }
        }

        if !sender.is_ascii() {
            return Err(ProtocolError::MalformedLine(line.to_owned()));
        }

        let (name, mut tail) = match rest.split_once(' ') {
            Some((n, t)) => (n, t),
            None => (rest, ""),
        };
        if !valid_command(name) {
            return Err(ProtocolError::MalformedLine(line.to_owned()));
        }

        let mut args = Vec::new();
        let mut trailing = false;
        while !tail.is_empty() {
            if let Some(t) = tail.strip_prefix(':') {
                args.push(t.to_owned());
                trailing = true;
                break;
            }
            match tail.split_once(' ') {
                Some((tok, t)) => {
                    if !tok.is_empty() {
                        args.push(tok.to_owned());
                    }
                    tail = t;
                }
                None => {
                    args.push(tail.to_owned());
                    break;
                }
            }
        }

        Ok(Message {
            name: name.to_ascii_uppercase(),
            sender: sender.to_owned(),
            args,
            received_at: Utc::now(),
            trailing,
        })
    }

    /// Serialize back to a single line without CRLF.
    ///
    /// The final argument is `:`-prefixed iff it contains a space, starts
    /// with `:`, is empty, or arrived on the wire as a trailing parameter —
    /// so `serialize(parse(x)) == x` for well-formed `x`.
    pub fn serialize(&self) -> String {
        self.to_string()
    }

    /// The nick of the sender, or `""` when the prefix is not a fullhost.
    pub fn nick(&self) -> &str {
        mask::split_fullhost(&self.sender).0
    }

    /// The username of the sender, or `""` when not a fullhost.
    pub fn username(&self) -> &str {
        mask::split_fullhost(&self.sender).1
    }

    /// The hostname of the sender, or `""` when not a fullhost.
    pub fn hostname(&self) -> &str {
        mask::split_fullhost(&self.sender).2
    }

    /// Split the sender into (nick, user, host); empty strings when the
    /// prefix is not a fullhost.
    pub fn split_host(&self) -> (&str, &str, &str) {
        mask::split_fullhost(&self.sender)
    }

    /// The channel or user this message was sent to. Only meaningful for
    /// targeted messages such as PRIVMSG and NOTICE.
    pub fn target(&self) -> &str {
        self.args.first().map(String::as_str).unwrap_or("")
    }

    /// The message body. Only meaningful for PRIVMSG and NOTICE.
    pub fn body(&self) -> &str {
        self.args.get(1).map(String::as_str).unwrap_or("")
    }

    /// Split the argument at `index` on commas.
    pub fn split_arg(&self, index: usize) -> Vec<&str> {
        match self.args.get(index) {
            Some(a) => a.split(',').collect(),
            None => Vec::new(),
        }
    }

    /// Whether this is a CTCP message: PRIVMSG or NOTICE with a
    /// `\x01`-delimited body.
    pub fn is_ctcp(&self) -> bool {
        (self.name == names::PRIVMSG || self.name == names::NOTICE)
            && self.args.len() >= 2
            && ctcp::is_ctcp(self.body())
    }

    /// Unpack the CTCP tag and data from the body.
    pub fn unpack_ctcp(&self) -> Option<(String, Option<String>)> {
        ctcp::unpack(self.body())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.sender.is_empty() {
            write!(f, ":{} ", self.sender)?;
        }
        f.write_str(&self.name)?;
        if let Some((last, mids)) = self.args.split_last() {
            for mid in mids {
                write!(f, " {}", mid)?;
            }
            if self.trailing || needs_colon(last) {
                write!(f, " :{}", last)?;
            } else {
                write!(f, " {}", last)?;
            }
        }
        Ok(())
    }
}
