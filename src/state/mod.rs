//! Per-server state tracking.
//!
//! Applies inbound messages to an authoritative picture of the server:
//! which channels the bot is in, which users share them, and which modes
//! everyone holds. All lookups are casemapping-aware. The runtime guards a
//! `State` with a reader/writer lock; `snapshot()` hands out a structural
//! copy for inspection without holding that lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tracing::trace;

use corvid_proto::caps::{ChanmodeClasses, PrefixTable};
use corvid_proto::{names, split_fullhost, Casemapping, Message, ProtoCaps};

/// A channel the bot is in.
#[derive(Clone, Debug, PartialEq)]
pub struct Channel {
    /// Display name as first observed.
    pub name: String,
    /// Current topic.
    pub topic: String,
    /// Set channel modes; parameterized modes carry their argument.
    pub modes: BTreeMap<char, Option<String>>,
    /// When the bot first saw this channel.
    pub created_at: DateTime<Utc>,
}

impl Channel {
    fn new(name: &str) -> Self {
        Channel {
            name: name.to_owned(),
            topic: String::new(),
            modes: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }
}

/// A user sharing at least one channel with the bot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct User {
    /// Display nick as last observed.
    pub nick: String,
    /// Username portion of the fullhost, when observed.
    pub user: String,
    /// Host portion of the fullhost, when observed.
    pub host: String,
    /// Real name, when learned.
    pub realname: String,
    /// Away message, when announced via RPL_AWAY.
    pub away: Option<String>,
}

impl User {
    fn new(nick: &str) -> Self {
        User {
            nick: nick.to_owned(),
            ..User::default()
        }
    }

    /// The `nick!user@host` form, or just the nick when the host is
    /// unknown.
    pub fn fullhost(&self) -> String {
        if self.user.is_empty() || self.host.is_empty() {
            self.nick.clone()
        } else {
            format!("{}!{}@{}", self.nick, self.user, self.host)
        }
    }
}

/// Prefix-ranked channel privilege bits for one user on one channel.
///
/// Bit `i` corresponds to the `i`-th mode of the server's `PREFIX` table,
/// so bit assignment follows server rank, not a fixed alphabet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UserModes {
    bits: u8,
}

impl UserModes {
    /// Ranks beyond the bitset width are ignored; no real network
    /// advertises more than eight prefix modes.
    const MAX_RANK: usize = 8;

    /// Whether no prefix mode is held.
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Whether `mode` is held.
    pub fn has_mode(&self, table: &PrefixTable, mode: char) -> bool {
        table
            .rank_of_mode(mode)
            .is_some_and(|i| i < Self::MAX_RANK && self.bits & (1 << i) != 0)
    }

    /// Grant `mode`.
    pub fn set_mode(&mut self, table: &PrefixTable, mode: char) {
        if let Some(i) = table.rank_of_mode(mode) {
            if i < Self::MAX_RANK {
                self.bits |= 1 << i;
            }
        }
    }

    /// Revoke `mode`.
    pub fn unset_mode(&mut self, table: &PrefixTable, mode: char) {
        if let Some(i) = table.rank_of_mode(mode) {
            if i < Self::MAX_RANK {
                self.bits &= !(1 << i);
            }
        }
    }

    /// Grant the mode behind a display sigil (`@` grants `o`).
    pub fn set_sigil(&mut self, table: &PrefixTable, sigil: char) {
        if let Some(i) = table.rank_of_sigil(sigil) {
            if i < Self::MAX_RANK {
                self.bits |= 1 << i;
            }
        }
    }
}

/// Authoritative per-server state.
#[derive(Clone, Debug)]
pub struct State {
    casemap: Casemapping,
    prefixes: PrefixTable,
    classes: ChanmodeClasses,
    self_nick: String,
    self_modes: BTreeSet<char>,
    channels: HashMap<String, Channel>,
    users: HashMap<String, User>,
    channel_users: HashMap<(String, String), UserModes>,
}

impl State {
    /// A fresh state derived from the server's capabilities.
    pub fn new(caps: &ProtoCaps) -> Self {
        State {
            casemap: Casemapping::from_name(caps.casemapping()),
            prefixes: caps.prefix_table(),
            classes: caps.chanmode_classes(),
            self_nick: String::new(),
            self_modes: BTreeSet::new(),
            channels: HashMap::new(),
            users: HashMap::new(),
            channel_users: HashMap::new(),
        }
    }

    /// Re-derive casemapping, prefix table, and mode classes after a
    /// capability update, rekeying the tables when the mapping changed.
    pub fn refresh_caps(&mut self, caps: &ProtoCaps) {
        let new_map = Casemapping::from_name(caps.casemapping());
        self.prefixes = caps.prefix_table();
        self.classes = caps.chanmode_classes();
        if new_map != self.casemap {
            self.casemap = new_map;
            let channels = std::mem::take(&mut self.channels);
            self.channels = channels
                .into_values()
                .map(|c| (new_map.lower(&c.name), c))
                .collect();
            let users = std::mem::take(&mut self.users);
            self.users = users
                .into_values()
                .map(|u| (new_map.lower(&u.nick), u))
                .collect();
            let edges = std::mem::take(&mut self.channel_users);
            self.channel_users = edges
                .into_iter()
                .map(|((c, n), m)| ((new_map.lower(&c), new_map.lower(&n)), m))
                .collect();
        }
    }

    /// An immutable structural copy for inspection without the lock.
    pub fn snapshot(&self) -> State {
        self.clone()
    }

    /// The bot's current nick.
    pub fn self_nick(&self) -> &str {
        &self.self_nick
    }

    /// The bot's own user modes.
    pub fn self_modes(&self) -> &BTreeSet<char> {
        &self.self_modes
    }

    /// Whether `nick` is the bot itself.
    pub fn is_self(&self, nick: &str) -> bool {
        !self.self_nick.is_empty() && self.casemap.eq(nick, &self.self_nick)
    }

    /// Look up a channel.
    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.get(&self.casemap.lower(name))
    }

    /// Look up a user.
    pub fn user(&self, nick: &str) -> Option<&User> {
        self.users.get(&self.casemap.lower(nick))
    }

    /// The prefix modes `nick` holds on `channel`.
    pub fn user_modes(&self, channel: &str, nick: &str) -> Option<UserModes> {
        self.channel_users
            .get(&(self.casemap.lower(channel), self.casemap.lower(nick)))
            .copied()
    }

    /// Whether `nick` is on `channel`.
    pub fn is_on(&self, channel: &str, nick: &str) -> bool {
        self.user_modes(channel, nick).is_some()
    }

    /// All tracked channels.
    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    /// All tracked users.
    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    /// Nicks on a channel.
    pub fn channel_nicks(&self, channel: &str) -> Vec<&str> {
        let chan = self.casemap.lower(channel);
        self.channel_users
            .keys()
            .filter(|(c, _)| *c == chan)
            .filter_map(|(_, n)| self.users.get(n).map(|u| u.nick.as_str()))
            .collect()
    }

    /// The server's prefix table.
    pub fn prefixes(&self) -> &PrefixTable {
        &self.prefixes
    }

    /// Apply one inbound message.
    pub fn update(&mut self, msg: &Message) {
        self.refresh_sender(msg);
        match msg.name.as_str() {
            names::RPL_WELCOME => {
                if let Some(nick) = msg.args.first() {
                    self.self_nick = nick.clone();
                }
            }
            names::JOIN => self.on_join(msg),
            names::PART => self.on_part(msg),
            names::KICK => self.on_kick(msg),
            names::QUIT => self.on_quit(msg),
            names::NICK => self.on_nick(msg),
            names::MODE => self.on_mode(msg),
            names::TOPIC => {
                if msg.args.len() >= 2 {
                    self.set_topic(&msg.args[0].clone(), &msg.args[1].clone());
                }
            }
            names::RPL_TOPIC => {
                if msg.args.len() >= 3 {
                    self.set_topic(&msg.args[1].clone(), &msg.args[2].clone());
                }
            }
            names::RPL_CHANNELMODEIS => {
                if msg.args.len() >= 3 {
                    let chan = msg.args[1].clone();
                    let params: Vec<String> = msg.args[2..].to_vec();
                    self.apply_channel_modes(&chan, &params);
                }
            }
            names::RPL_NAMREPLY => self.on_namreply(msg),
            names::RPL_AWAY => {
                if msg.args.len() >= 3 {
                    let key = self.casemap.lower(&msg.args[1]);
                    if let Some(user) = self.users.get_mut(&key) {
                        user.away = Some(msg.args[2].clone());
                    }
                }
            }
            _ => {}
        }
    }

    /// Refresh the sender's user/host whenever a fullhost prefix is seen.
    fn refresh_sender(&mut self, msg: &Message) {
        let (nick, user, host) = split_fullhost(&msg.sender);
        if nick.is_empty() {
            return;
        }
        let key = self.casemap.lower(nick);
        if let Some(record) = self.users.get_mut(&key) {
            record.user = user.to_owned();
            record.host = host.to_owned();
        }
    }

    fn ensure_user(&mut self, nick: &str, user: &str, host: &str) {
        let key = self.casemap.lower(nick);
        let record = self
            .users
            .entry(key)
            .or_insert_with(|| User::new(nick));
        if !user.is_empty() {
            record.user = user.to_owned();
        }
        if !host.is_empty() {
            record.host = host.to_owned();
        }
    }

    fn on_join(&mut self, msg: &Message) {
        let (nick, user, host) = split_fullhost(&msg.sender);
        let nick = if nick.is_empty() { msg.sender.as_str() } else { nick };
        let chan = match msg.args.first() {
            Some(c) => c.clone(),
            None => return,
        };
        let chan_key = self.casemap.lower(&chan);

        if self.is_self(nick) {
            self.channels
                .entry(chan_key.clone())
                .or_insert_with(|| Channel::new(&chan));
        }
        if !self.channels.contains_key(&chan_key) {
            trace!(channel = %chan, "join for untracked channel ignored");
            return;
        }

        self.ensure_user(nick, user, host);
        let nick_key = self.casemap.lower(nick);
        self.channel_users
            .entry((chan_key, nick_key))
            .or_default();
    }

    fn on_part(&mut self, msg: &Message) {
        let nick = msg.nick();
        let nick = if nick.is_empty() { msg.sender.as_str() } else { nick };
        if let Some(chan) = msg.args.first() {
            self.remove_from_channel(&chan.clone(), &nick.to_owned());
        }
    }

    fn on_kick(&mut self, msg: &Message) {
        if msg.args.len() >= 2 {
            self.remove_from_channel(&msg.args[0].clone(), &msg.args[1].clone());
        }
    }

    fn remove_from_channel(&mut self, channel: &str, nick: &str) {
        let chan_key = self.casemap.lower(channel);
        if self.is_self(nick) {
            self.channels.remove(&chan_key);
            self.channel_users.retain(|(c, _), _| *c != chan_key);
            self.prune_users();
            return;
        }
        let nick_key = self.casemap.lower(nick);
        self.channel_users.remove(&(chan_key, nick_key.clone()));
        if !self.channel_users.keys().any(|(_, n)| *n == nick_key) {
            self.users.remove(&nick_key);
        }
    }

    fn on_quit(&mut self, msg: &Message) {
        let nick = msg.nick();
        let nick = if nick.is_empty() { msg.sender.as_str() } else { nick };
        let nick_key = self.casemap.lower(nick);
        self.channel_users.retain(|(_, n), _| *n != nick_key);
        self.users.remove(&nick_key);
    }

    fn on_nick(&mut self, msg: &Message) {
        let old = msg.nick();
        let old = if old.is_empty() { msg.sender.as_str() } else { old };
        let new = match msg.args.first() {
            Some(n) => n.clone(),
            None => return,
        };
        let old_key = self.casemap.lower(old);
        let new_key = self.casemap.lower(&new);

        if let Some(mut user) = self.users.remove(&old_key) {
            user.nick = new.clone();
            self.users.insert(new_key.clone(), user);
        }
        let edges: Vec<_> = self
            .channel_users
            .keys()
            .filter(|(_, n)| *n == old_key)
            .cloned()
            .collect();
        for (chan, _) in edges {
            if let Some(modes) = self.channel_users.remove(&(chan.clone(), old_key.clone())) {
                self.channel_users.insert((chan, new_key.clone()), modes);
            }
        }
        if self.is_self(old) {
            self.self_nick = new;
        }
    }

    fn on_mode(&mut self, msg: &Message) {
        let target = match msg.args.first() {
            Some(t) => t.clone(),
            None => return,
        };
        if self.channels.contains_key(&self.casemap.lower(&target)) {
            let params: Vec<String> = msg.args[1..].to_vec();
            self.apply_channel_modes(&target, &params);
        } else if self.is_self(&target) {
            if let Some(modes) = msg.args.get(1) {
                let mut adding = true;
                for c in modes.chars() {
                    match c {
                        '+' => adding = true,
                        '-' => adding = false,
                        _ => {
                            if adding {
                                self.self_modes.insert(c);
                            } else {
                                self.self_modes.remove(&c);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Apply a channel mode change: `params[0]` is the mode string, the
    /// rest are its arguments, interpreted per the CHANMODES classes.
    fn apply_channel_modes(&mut self, channel: &str, params: &[String]) {
        let chan_key = self.casemap.lower(channel);
        let modes = match params.first() {
            Some(m) => m.clone(),
            None => return,
        };
        let mut args = params[1..].iter();
        let mut adding = true;

        for c in modes.chars() {
            match c {
                '+' => adding = true,
                '-' => adding = false,
                _ if self.prefixes.is_prefix_mode(c) => {
                    if let Some(nick) = args.next() {
                        let nick_key = self.casemap.lower(nick);
                        let prefixes = self.prefixes.clone();
                        if let Some(modes) =
                            self.channel_users.get_mut(&(chan_key.clone(), nick_key))
                        {
                            if adding {
                                modes.set_mode(&prefixes, c);
                            } else {
                                modes.unset_mode(&prefixes, c);
                            }
                        }
                    }
                }
                _ if self.classes.a.contains(c) => {
                    // List modes carry a parameter but are not tracked.
                    let _ = args.next();
                }
                _ if self.classes.b.contains(c) => {
                    let arg = args.next().cloned();
                    self.set_channel_mode(&chan_key, c, adding, arg);
                }
                _ if self.classes.c.contains(c) => {
                    let arg = if adding { args.next().cloned() } else { None };
                    self.set_channel_mode(&chan_key, c, adding, arg);
                }
                _ => {
                    self.set_channel_mode(&chan_key, c, adding, None);
                }
            }
        }
    }

    fn set_channel_mode(&mut self, chan_key: &str, mode: char, adding: bool, arg: Option<String>) {
        if let Some(chan) = self.channels.get_mut(chan_key) {
            if adding {
                chan.modes.insert(mode, arg);
            } else {
                chan.modes.remove(&mode);
            }
        }
    }

    fn set_topic(&mut self, channel: &str, topic: &str) {
        let key = self.casemap.lower(channel);
        if let Some(chan) = self.channels.get_mut(&key) {
            chan.topic = topic.to_owned();
        }
    }

    fn on_namreply(&mut self, msg: &Message) {
        if msg.args.len() < 4 {
            return;
        }
        let chan = msg.args[2].clone();
        let chan_key = self.casemap.lower(&chan);
        if !self.channels.contains_key(&chan_key) {
            return;
        }
        let names: Vec<String> = msg.args[3]
            .split_whitespace()
            .map(str::to_owned)
            .collect();
        for name in names {
            let mut modes = UserModes::default();
            let prefixes = self.prefixes.clone();
            let nick: String = {
                let mut rest = name.as_str();
                while let Some(c) = rest.chars().next() {
                    if prefixes.rank_of_sigil(c).is_some() {
                        modes.set_sigil(&prefixes, c);
                        rest = &rest[c.len_utf8()..];
                    } else {
                        break;
                    }
                }
                rest.to_owned()
            };
            if nick.is_empty() {
                continue;
            }
            self.ensure_user(&nick, "", "");
            let nick_key = self.casemap.lower(&nick);
            self.channel_users.insert((chan_key.clone(), nick_key), modes);
        }
    }

    fn prune_users(&mut self) {
        let referenced: std::collections::HashSet<&String> =
            self.channel_users.keys().map(|(_, n)| n).collect();
        let self_key = self.casemap.lower(&self.self_nick);
        self.users
            .retain(|k, _| referenced.contains(k) || *k == self_key);
    }
}
