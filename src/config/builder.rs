//! Fluent configuration builder.
//!
//! Setters apply to the global block until the first [`ConfigBuilder::server`]
//! call; after that they apply to the most recently added server. This
//! mirrors how configs are written in TOML: defaults first, then server
//! blocks that override them.

use super::{Config, ServerBlock};

/// Builds a [`Config`] programmatically.
#[derive(Clone, Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
    current: Option<String>,
}

impl ConfigBuilder {
    /// A builder with an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a server block. The id doubles as the default host.
    pub fn server(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        self.config.servers.entry(id.clone()).or_default();
        self.current = Some(id);
        self
    }

    /// Set the access-record store path.
    pub fn storage(mut self, path: impl Into<String>) -> Self {
        self.config.storage = Some(path.into());
        self
    }

    fn block(&mut self) -> &mut ServerBlock {
        match &self.current {
            Some(id) => self
                .config
                .servers
                .get_mut(id)
                .expect("current server block exists"),
            None => &mut self.config.global,
        }
    }

    /// Set the host to dial.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.block().host = Some(host.into());
        self
    }

    /// Set the port to dial.
    pub fn port(mut self, port: u16) -> Self {
        self.block().port = Some(port);
        self
    }

    /// Enable or disable TLS.
    pub fn ssl(mut self, ssl: bool) -> Self {
        self.block().ssl = Some(ssl);
        self
    }

    /// Enable or disable certificate verification.
    pub fn verify_cert(mut self, verify: bool) -> Self {
        self.block().verify_cert = Some(verify);
        self
    }

    /// Set a client certificate bundle path.
    pub fn ssl_cert(mut self, path: impl Into<String>) -> Self {
        self.block().ssl_cert = Some(path.into());
        self
    }

    /// Disable automatic reconnection.
    pub fn no_reconnect(mut self, no_reconnect: bool) -> Self {
        self.block().no_reconnect = Some(no_reconnect);
        self
    }

    /// Set the reconnect back-off in seconds.
    pub fn reconnect_timeout(mut self, seconds: u64) -> Self {
        self.block().reconnect_timeout = Some(seconds);
        self
    }

    /// Set the primary nick.
    pub fn nick(mut self, nick: impl Into<String>) -> Self {
        self.block().nick = Some(nick.into());
        self
    }

    /// Set the fallback nick.
    pub fn altnick(mut self, altnick: impl Into<String>) -> Self {
        self.block().altnick = Some(altnick.into());
        self
    }

    /// Set the registration username.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.block().username = Some(username.into());
        self
    }

    /// Set the advertised user host.
    pub fn userhost(mut self, userhost: impl Into<String>) -> Self {
        self.block().userhost = Some(userhost.into());
        self
    }

    /// Set the real name.
    pub fn realname(mut self, realname: impl Into<String>) -> Self {
        self.block().realname = Some(realname.into());
        self
    }

    /// Set the command prefix character.
    pub fn prefix(mut self, prefix: char) -> Self {
        self.block().prefix = Some(prefix);
        self
    }

    /// Set the channels to join.
    pub fn channels(mut self, channels: &[&str]) -> Self {
        self.block().channels = Some(channels.iter().map(|c| (*c).to_owned()).collect());
        self
    }

    /// Disable state tracking.
    pub fn no_state(mut self, no_state: bool) -> Self {
        self.block().no_state = Some(no_state);
        self
    }

    /// Disable the access-record store.
    pub fn no_store(mut self, no_store: bool) -> Self {
        self.block().no_store = Some(no_store);
        self
    }

    /// Finish building.
    pub fn build(self) -> Config {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_PORT;

    #[test]
    fn globals_then_server_overrides() {
        let config = ConfigBuilder::new()
            .nick("corvid")
            .altnick("corvid1")
            .username("corvid")
            .userhost("example.com")
            .realname("corvid bot")
            .no_reconnect(true)
            .ssl(true)
            .server("irc.test.net")
            .nick("corvid2")
            .build();

        let s = config.server_settings("irc.test.net").unwrap();
        assert_eq!(s.host, "irc.test.net");
        assert_eq!(s.port, DEFAULT_PORT);
        assert_eq!(s.nick, "corvid2");
        assert_eq!(s.altnick, "corvid1");
        assert!(s.ssl);
        assert!(s.no_reconnect);
    }

    #[test]
    fn multiple_servers() {
        let config = ConfigBuilder::new()
            .nick("corvid")
            .username("u")
            .realname("r")
            .server("one")
            .server("two")
            .port(6697)
            .build();

        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.server_settings("one").unwrap().port, DEFAULT_PORT);
        assert_eq!(config.server_settings("two").unwrap().port, 6697);
    }
}
