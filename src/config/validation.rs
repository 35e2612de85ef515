//! Configuration validation.
//!
//! Validates identities and addresses before any socket is dialed. All
//! errors found are returned together.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use super::Config;

static NICK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z\[\]\\`_^{|}][A-Za-z0-9\[\]\\`_^{|}\-]*$")
        .expect("nick pattern is valid")
});

static CHANNEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[#&+!][^\x00\x07\r\n ,]+$").expect("channel pattern is valid")
});

static HOST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:[0-9]{1,3}(?:\.[0-9]{1,3}){3}|[A-Za-z0-9][A-Za-z0-9\-]*(?:\.[A-Za-z0-9][A-Za-z0-9\-]*)*)$",
    )
    .expect("host pattern is valid")
});

/// Validation errors for a configuration.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("no servers configured")]
    NoServers,
    #[error("server {0}: invalid host {1:?}")]
    InvalidHost(String, String),
    #[error("server {0}: missing nick")]
    MissingNick(String),
    #[error("server {0}: invalid nick {1:?}")]
    InvalidNick(String, String),
    #[error("server {0}: invalid altnick {1:?}")]
    InvalidAltnick(String, String),
    #[error("server {0}: missing username")]
    MissingUsername(String),
    #[error("server {0}: missing realname")]
    MissingRealname(String),
    #[error("server {0}: invalid channel {1:?}")]
    InvalidChannel(String, String),
}

/// Validate a configuration, returning every error found.
pub(super) fn validate(config: &Config) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if config.servers.is_empty() {
        errors.push(ValidationError::NoServers);
    }

    for id in config.servers.keys() {
        let s = match config.server_settings(id) {
            Some(s) => s,
            None => continue,
        };

        if !HOST_RE.is_match(&s.host) {
            errors.push(ValidationError::InvalidHost(id.clone(), s.host.clone()));
        }

        if s.nick.is_empty() {
            errors.push(ValidationError::MissingNick(id.clone()));
        } else if !NICK_RE.is_match(&s.nick) {
            errors.push(ValidationError::InvalidNick(id.clone(), s.nick.clone()));
        }

        if !s.altnick.is_empty() && !NICK_RE.is_match(&s.altnick) {
            errors.push(ValidationError::InvalidAltnick(
                id.clone(),
                s.altnick.clone(),
            ));
        }

        if s.username.is_empty() {
            errors.push(ValidationError::MissingUsername(id.clone()));
        }
        if s.realname.is_empty() {
            errors.push(ValidationError::MissingRealname(id.clone()));
        }

        for channel in &s.channels {
            if !CHANNEL_RE.is_match(channel) {
                errors.push(ValidationError::InvalidChannel(
                    id.clone(),
                    channel.clone(),
                ));
            }
        }
    }

    errors
}
