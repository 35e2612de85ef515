//! User access records: levels and flags at global, server, and channel
//! scope, guarded by a bcrypt-hashed password and a set of host masks.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use corvid_proto::WildMask;

use super::store::StoreError;

/// A level/flags pair at one scope.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Access {
    /// Numeric privilege level; a command requiring level `n` passes when
    /// the caller holds `>= n`.
    pub level: u8,
    /// Single-character privilege flags.
    pub flags: BTreeSet<char>,
}

impl Access {
    /// An access with a level and no flags.
    pub fn with_level(level: u8) -> Self {
        Access {
            level,
            flags: BTreeSet::new(),
        }
    }

    /// Whether this access meets the given level.
    pub fn has_level(&self, level: u8) -> bool {
        self.level >= level
    }

    /// Whether this access holds every flag in `flags`.
    pub fn has_flags(&self, flags: &str) -> bool {
        flags.chars().all(|f| self.flags.contains(&f))
    }

    /// Whether this access holds one flag.
    pub fn has_flag(&self, flag: char) -> bool {
        self.flags.contains(&flag)
    }

    /// Add flags.
    pub fn set_flags(&mut self, flags: &str) {
        self.flags.extend(flags.chars());
    }

    /// Remove flags.
    pub fn clear_flags(&mut self, flags: &str) {
        for f in flags.chars() {
            self.flags.remove(&f);
        }
    }

    /// Set level and flags together.
    pub fn set(&mut self, level: u8, flags: &str) {
        self.level = level;
        self.set_flags(flags);
    }
}

/// A registered user: username, bcrypt-hashed password, host masks, and
/// access at each scope.
///
/// Channel access is keyed server → channel, so the same username can hold
/// different privileges on different networks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserAccess {
    /// Unique username.
    pub username: String,
    /// bcrypt hash of the password.
    pub password: String,
    /// Wildcard fullhost masks permitted to authenticate as this user.
    /// Empty means any host.
    pub masks: Vec<WildMask>,
    /// Global access.
    pub global: Option<Access>,
    /// Per-server access.
    pub servers: HashMap<String, Access>,
    /// Per-channel access, keyed server → channel.
    pub channels: HashMap<String, HashMap<String, Access>>,
}

impl UserAccess {
    /// Create a record, hashing the password with the default bcrypt cost.
    pub fn new(username: &str, password: &str) -> Result<Self, StoreError> {
        Self::with_cost(username, password, bcrypt::DEFAULT_COST)
    }

    /// Create a record with an explicit bcrypt cost. Tests use the minimum
    /// cost to stay fast.
    pub fn with_cost(username: &str, password: &str, cost: u32) -> Result<Self, StoreError> {
        if username.is_empty() || password.is_empty() {
            return Err(StoreError::MissingUsernameOrPassword);
        }
        let hashed = bcrypt::hash(password, cost)?;
        Ok(UserAccess {
            username: username.to_owned(),
            password: hashed,
            masks: Vec::new(),
            global: None,
            servers: HashMap::new(),
            channels: HashMap::new(),
        })
    }

    /// Check a password against the stored hash.
    pub fn verify_password(&self, password: &str) -> bool {
        bcrypt::verify(password, &self.password).unwrap_or(false)
    }

    /// Add host masks.
    pub fn add_masks(&mut self, masks: &[&str]) {
        self.masks.extend(masks.iter().map(|m| WildMask::from(*m)));
    }

    /// Remove host masks.
    pub fn del_masks(&mut self, masks: &[&str]) {
        self.masks.retain(|m| !masks.iter().any(|d| m.0 == *d));
    }

    /// Whether any mask matches the fullhost. A record without masks
    /// accepts any host.
    pub fn is_match(&self, fullhost: &str) -> bool {
        self.masks.is_empty() || self.masks.iter().any(|m| m.matches(fullhost))
    }

    fn server_mut(&mut self, server: &str) -> &mut Access {
        self.servers.entry(server.to_owned()).or_default()
    }

    fn channel_mut(&mut self, server: &str, channel: &str) -> &mut Access {
        self.channels
            .entry(server.to_owned())
            .or_default()
            .entry(channel.to_owned())
            .or_default()
    }

    /// Grant global level and flags.
    pub fn grant_global(&mut self, level: u8, flags: &str) {
        self.global.get_or_insert_with(Access::default).set(level, flags);
    }

    /// Grant global flags only.
    pub fn grant_global_flags(&mut self, flags: &str) {
        self.global.get_or_insert_with(Access::default).set_flags(flags);
    }

    /// Grant a global level only.
    pub fn grant_global_level(&mut self, level: u8) {
        self.global.get_or_insert_with(Access::default).level = level;
    }

    /// Remove all global access.
    pub fn revoke_global(&mut self) {
        self.global = None;
    }

    /// Remove global flags.
    pub fn revoke_global_flags(&mut self, flags: &str) {
        if let Some(g) = self.global.as_mut() {
            g.clear_flags(flags);
        }
    }

    /// Grant server level and flags.
    pub fn grant_server(&mut self, server: &str, level: u8, flags: &str) {
        self.server_mut(server).set(level, flags);
    }

    /// Grant server flags only.
    pub fn grant_server_flags(&mut self, server: &str, flags: &str) {
        self.server_mut(server).set_flags(flags);
    }

    /// Remove all access on a server.
    pub fn revoke_server(&mut self, server: &str) {
        self.servers.remove(server);
    }

    /// Grant channel level and flags.
    pub fn grant_channel(&mut self, server: &str, channel: &str, level: u8, flags: &str) {
        self.channel_mut(server, channel).set(level, flags);
    }

    /// Remove all access on a channel.
    pub fn revoke_channel(&mut self, server: &str, channel: &str) {
        if let Some(chans) = self.channels.get_mut(server) {
            chans.remove(channel);
        }
    }

    /// The global access, if any.
    pub fn global(&self) -> Option<&Access> {
        self.global.as_ref()
    }

    /// The server-scope access, if any.
    pub fn server(&self, server: &str) -> Option<&Access> {
        self.servers.get(server)
    }

    /// The channel-scope access, if any.
    pub fn channel(&self, server: &str, channel: &str) -> Option<&Access> {
        self.channels.get(server).and_then(|c| c.get(channel))
    }

    /// Whether the global scope meets a level.
    pub fn has_global_level(&self, level: u8) -> bool {
        self.global.as_ref().is_some_and(|a| a.has_level(level))
    }

    /// Whether the global scope holds every flag.
    pub fn has_global_flags(&self, flags: &str) -> bool {
        self.global.as_ref().is_some_and(|a| a.has_flags(flags))
    }

    /// Whether the server scope meets a level.
    pub fn has_server_level(&self, server: &str, level: u8) -> bool {
        self.server(server).is_some_and(|a| a.has_level(level))
    }

    /// Whether the server scope holds every flag.
    pub fn has_server_flags(&self, server: &str, flags: &str) -> bool {
        self.server(server).is_some_and(|a| a.has_flags(flags))
    }

    /// Whether the channel scope meets a level.
    pub fn has_channel_level(&self, server: &str, channel: &str, level: u8) -> bool {
        self.channel(server, channel).is_some_and(|a| a.has_level(level))
    }

    /// Whether the channel scope holds every flag.
    pub fn has_channel_flags(&self, server: &str, channel: &str, flags: &str) -> bool {
        self.channel(server, channel).is_some_and(|a| a.has_flags(flags))
    }

    /// The best level held across channel, server, and global scope.
    pub fn effective_level(&self, server: &str, channel: Option<&str>) -> u8 {
        let mut level = self.global.as_ref().map(|a| a.level).unwrap_or(0);
        if let Some(a) = self.server(server) {
            level = level.max(a.level);
        }
        if let Some(chan) = channel {
            if let Some(a) = self.channel(server, chan) {
                level = level.max(a.level);
            }
        }
        level
    }

    /// Flags from `required` not held at any scope, in required order.
    pub fn missing_flags(&self, server: &str, channel: Option<&str>, required: &str) -> String {
        required
            .chars()
            .filter(|&f| {
                let global = self.global.as_ref().is_some_and(|a| a.has_flag(f));
                let srv = self.server(server).is_some_and(|a| a.has_flag(f));
                let chan = channel
                    .and_then(|c| self.channel(server, c))
                    .is_some_and(|a| a.has_flag(f));
                !(global || srv || chan)
            })
            .collect()
    }

    /// Serialize to JSON bytes for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
