//! Configuration loading and management.
//!
//! A config is a `global` defaults block plus one block per server; every
//! per-server field falls back to the global value, then to a built-in
//! default. Validation collects every problem it finds rather than stopping
//! at the first, so a bad config file reports all of its mistakes at once.

mod builder;
mod validation;

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

pub use builder::ConfigBuilder;
pub use validation::ValidationError;

/// Default IRC port.
pub const DEFAULT_PORT: u16 = 6667;
/// Default reconnect back-off in seconds.
pub const DEFAULT_RECONNECT_TIMEOUT: u64 = 20;
/// Default command prefix.
pub const DEFAULT_PREFIX: char = '.';

/// Configuration errors raised while loading a file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// One server block. Every field is optional; unset fields inherit from
/// the global block.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServerBlock {
    /// Hostname or address to dial. Defaults to the server id.
    pub host: Option<String>,
    /// Port to dial.
    pub port: Option<u16>,
    /// Dial with TLS.
    pub ssl: Option<bool>,
    /// Verify the server certificate when dialing with TLS.
    pub verify_cert: Option<bool>,
    /// Optional client certificate bundle (PEM with cert + key).
    pub ssl_cert: Option<String>,
    /// Disable automatic reconnection.
    pub no_reconnect: Option<bool>,
    /// Seconds to wait before a reconnect attempt.
    pub reconnect_timeout: Option<u64>,
    /// Primary nick.
    pub nick: Option<String>,
    /// Fallback nick when the primary is taken.
    pub altnick: Option<String>,
    /// Username for registration.
    pub username: Option<String>,
    /// Advertised user host.
    pub userhost: Option<String>,
    /// Real name for registration.
    pub realname: Option<String>,
    /// Command prefix character.
    pub prefix: Option<char>,
    /// Channels to join after connecting.
    pub channels: Option<Vec<String>>,
    /// Disable state tracking for this server.
    pub no_state: Option<bool>,
    /// Disable the access-record store for this server.
    pub no_store: Option<bool>,
}

/// The whole bot configuration.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    /// Defaults applied to every server.
    #[serde(default)]
    pub global: ServerBlock,
    /// Server blocks keyed by server id.
    #[serde(default)]
    pub servers: BTreeMap<String, ServerBlock>,
    /// Path to the access-record store. Persistence is disabled when
    /// unset.
    #[serde(default)]
    pub storage: Option<String>,
    #[serde(skip)]
    errors: Vec<ValidationError>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Start building a config programmatically.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Validate and report whether the config is usable.
    pub fn is_valid(&mut self) -> bool {
        self.validate();
        self.errors.is_empty()
    }

    /// Run validation, replacing the collected error list.
    pub fn validate(&mut self) {
        self.errors = validation::validate(self);
    }

    /// Errors collected by the last [`Config::validate`] call.
    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    /// Resolve the concrete settings for one server, applying global
    /// fallbacks and built-in defaults.
    pub fn server_settings(&self, id: &str) -> Option<ServerSettings> {
        let block = self.servers.get(id)?;
        let g = &self.global;
        let pick = |s: &Option<String>, d: &Option<String>| -> String {
            s.clone().or_else(|| d.clone()).unwrap_or_default()
        };
        let host = block
            .host
            .clone()
            .or_else(|| g.host.clone())
            .unwrap_or_else(|| id.to_owned());
        Some(ServerSettings {
            id: id.to_owned(),
            host,
            port: block.port.or(g.port).unwrap_or(DEFAULT_PORT),
            ssl: block.ssl.or(g.ssl).unwrap_or(false),
            verify_cert: block.verify_cert.or(g.verify_cert).unwrap_or(true),
            ssl_cert: block.ssl_cert.clone().or_else(|| g.ssl_cert.clone()),
            no_reconnect: block.no_reconnect.or(g.no_reconnect).unwrap_or(false),
            reconnect_timeout: block
                .reconnect_timeout
                .or(g.reconnect_timeout)
                .unwrap_or(DEFAULT_RECONNECT_TIMEOUT),
            nick: pick(&block.nick, &g.nick),
            altnick: pick(&block.altnick, &g.altnick),
            username: pick(&block.username, &g.username),
            userhost: pick(&block.userhost, &g.userhost),
            realname: pick(&block.realname, &g.realname),
            prefix: block.prefix.or(g.prefix).unwrap_or(DEFAULT_PREFIX),
            channels: block
                .channels
                .clone()
                .or_else(|| g.channels.clone())
                .unwrap_or_default(),
            no_state: block.no_state.or(g.no_state).unwrap_or(false),
            no_store: block.no_store.or(g.no_store).unwrap_or(false),
        })
    }
}

/// Fully resolved settings for one server.
#[derive(Clone, Debug, PartialEq)]
#[allow(missing_docs)]
pub struct ServerSettings {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub ssl: bool,
    pub verify_cert: bool,
    pub ssl_cert: Option<String>,
    pub no_reconnect: bool,
    pub reconnect_timeout: u64,
    pub nick: String,
    pub altnick: String,
    pub username: String,
    pub userhost: String,
    pub realname: String,
    pub prefix: char,
    pub channels: Vec<String>,
    pub no_state: bool,
    pub no_store: bool,
}

impl ServerSettings {
    /// The `host:port` dial address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether a replacement's transport differs enough to need a rebuilt
    /// connection.
    pub fn transport_changed(&self, other: &ServerSettings) -> bool {
        self.host != other.host
            || self.port != other.port
            || self.ssl != other.ssl
            || self.verify_cert != other.verify_cert
            || self.ssl_cert != other.ssl_cert
    }
}
