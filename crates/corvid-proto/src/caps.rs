//! Protocol capabilities advertised by a server.
//!
//! Servers describe themselves with `RPL_MYINFO` (004) and a stream of
//! `RPL_ISUPPORT` (005) tokens. [`ProtoCaps`] accumulates both into typed
//! fields and answers the questions the rest of the runtime keeps asking:
//! is this name a channel, which modes carry prefixes, how do channel mode
//! parameters parse.

use std::collections::HashMap;

use crate::names;
use crate::wire::Message;

/// Accumulated server capabilities.
///
/// `clone()` is a deep copy (the extras map is duplicated), so a snapshot
/// taken before a reload cannot be mutated through the original.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtoCaps {
    server_name: String,
    ircd_version: String,
    usermodes: String,
    legacy_chanmodes: String,

    rfc: String,
    ircd: String,
    casemapping: String,
    prefix: String,
    chantypes: String,
    chanmodes: String,

    chanlimit: usize,
    channellen: usize,
    nicklen: usize,
    topiclen: usize,
    awaylen: usize,
    kicklen: usize,
    modes: usize,

    extras: HashMap<String, String>,
}

impl Default for ProtoCaps {
    fn default() -> Self {
        ProtoCaps {
            server_name: String::new(),
            ircd_version: String::new(),
            usermodes: String::new(),
            legacy_chanmodes: String::new(),
            rfc: String::new(),
            ircd: String::new(),
            casemapping: "rfc1459".to_owned(),
            prefix: "(ov)@+".to_owned(),
            chantypes: "#&".to_owned(),
            chanmodes: "b,k,l,imnpst".to_owned(),
            chanlimit: 0,
            channellen: 50,
            nicklen: 9,
            topiclen: 490,
            awaylen: 0,
            kicklen: 400,
            modes: 3,
            extras: HashMap::new(),
        }
    }
}

impl ProtoCaps {
    /// A fresh capability set with conservative RFC defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume an `RPL_MYINFO` message: `[nick, server, version, usermodes,
    /// chanmodes]`. Messages with fewer arguments are ignored.
    pub fn parse_my_info(&mut self, msg: &Message) {
        if msg.name != names::RPL_MYINFO || msg.args.len() < 5 {
            return;
        }
        self.server_name = msg.args[1].clone();
        self.ircd_version = msg.args[2].clone();
        self.usermodes = msg.args[3].clone();
        self.legacy_chanmodes = msg.args[4].clone();
    }

    /// Consume an `RPL_ISUPPORT` message: `[nick, TOKEN..., trailing]`.
    ///
    /// Tokens are `KEY` or `KEY=VALUE`; the trailing human-readable
    /// argument (it contains a space) is skipped. Unknown keys land in the
    /// extras map, valueless ones with the value `"true"`.
    pub fn parse_isupport(&mut self, msg: &Message) {
        let tokens = match msg.args.split_first() {
            Some((_, rest)) => rest,
            None => return,
        };
        for token in tokens {
            if token.is_empty() || token.contains(' ') {
                continue;
            }
            let (key, value) = match token.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (token.as_str(), None),
            };
            match key {
                "PREFIX" => {
                    if let Some(v) = value {
                        self.prefix = v.to_owned();
                    }
                }
                "CHANTYPES" => {
                    if let Some(v) = value {
                        if !v.is_empty() {
                            self.chantypes = v.to_owned();
                        }
                    }
                }
                "CHANMODES" => {
                    if let Some(v) = value {
                        self.chanmodes = v.to_owned();
                    }
                }
                "CASEMAPPING" => {
                    if let Some(v) = value {
                        self.casemapping = v.to_owned();
                    }
                }
                "IRCD" => {
                    if let Some(v) = value {
                        self.ircd = v.to_owned();
                    }
                }
                "CHANLIMIT" => {
                    // CHANLIMIT=#&+:10 keeps the numeric limit.
                    if let Some(n) = value
                        .and_then(|v| v.rsplit_once(':'))
                        .and_then(|(_, n)| n.parse().ok())
                    {
                        self.chanlimit = n;
                    }
                }
                "CHANNELLEN" => self.channellen = parse_num(value, self.channellen),
                "NICKLEN" => self.nicklen = parse_num(value, self.nicklen),
                "TOPICLEN" => self.topiclen = parse_num(value, self.topiclen),
                "AWAYLEN" => self.awaylen = parse_num(value, self.awaylen),
                "KICKLEN" => self.kicklen = parse_num(value, self.kicklen),
                "MODES" => self.modes = parse_num(value, self.modes),
                _ if key.starts_with("RFC") && value.is_none() => {
                    self.rfc = key.to_owned();
                }
                _ => {
                    self.extras
                        .insert(key.to_owned(), value.unwrap_or("true").to_owned());
                }
            }
        }
    }

    /// Whether `name` is a channel name under the announced chantypes.
    pub fn is_channel(&self, name: &str) -> bool {
        name.chars()
            .next()
            .map(|c| self.chantypes.contains(c))
            .unwrap_or(false)
    }

    /// Compose another capability set into this one: `chantypes` is a set
    /// union, scalar fields are overwritten when the other side carries a
    /// value, and extras are merged with the other side winning conflicts.
    pub fn merge(&mut self, other: &ProtoCaps) {
        for c in other.chantypes.chars() {
            if !self.chantypes.contains(c) {
                self.chantypes.push(c);
            }
        }

        merge_str(&mut self.server_name, &other.server_name);
        merge_str(&mut self.ircd_version, &other.ircd_version);
        merge_str(&mut self.usermodes, &other.usermodes);
        merge_str(&mut self.legacy_chanmodes, &other.legacy_chanmodes);
        merge_str(&mut self.rfc, &other.rfc);
        merge_str(&mut self.ircd, &other.ircd);
        merge_str(&mut self.casemapping, &other.casemapping);
        merge_str(&mut self.prefix, &other.prefix);
        merge_str(&mut self.chanmodes, &other.chanmodes);

        merge_num(&mut self.chanlimit, other.chanlimit);
        merge_num(&mut self.channellen, other.channellen);
        merge_num(&mut self.nicklen, other.nicklen);
        merge_num(&mut self.topiclen, other.topiclen);
        merge_num(&mut self.awaylen, other.awaylen);
        merge_num(&mut self.kicklen, other.kicklen);
        merge_num(&mut self.modes, other.modes);

        for (k, v) in &other.extras {
            self.extras.insert(k.clone(), v.clone());
        }
    }

    /// Server name from RPL_MYINFO.
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Daemon version from RPL_MYINFO.
    pub fn ircd_version(&self) -> &str {
        &self.ircd_version
    }

    /// User mode letters from RPL_MYINFO.
    pub fn usermodes(&self) -> &str {
        &self.usermodes
    }

    /// The legacy (unclassified) channel mode letters from RPL_MYINFO.
    pub fn legacy_chanmodes(&self) -> &str {
        &self.legacy_chanmodes
    }

    /// The bare `RFCnnnn` token, when announced.
    pub fn rfc(&self) -> &str {
        &self.rfc
    }

    /// The `IRCD=` token value, when announced.
    pub fn ircd(&self) -> &str {
        &self.ircd
    }

    /// The announced case mapping name (default `rfc1459`).
    pub fn casemapping(&self) -> &str {
        &self.casemapping
    }

    /// The raw `PREFIX` token, e.g. `(ov)@+`.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Channel sigil characters; never empty.
    pub fn chantypes(&self) -> &str {
        &self.chantypes
    }

    /// The raw four-class `CHANMODES` token, e.g. `b,k,l,imnpst`.
    pub fn chanmodes(&self) -> &str {
        &self.chanmodes
    }

    /// Maximum number of joinable channels (0 = unannounced).
    pub fn chanlimit(&self) -> usize {
        self.chanlimit
    }

    /// Maximum channel name length.
    pub fn channellen(&self) -> usize {
        self.channellen
    }

    /// Maximum nick length.
    pub fn nicklen(&self) -> usize {
        self.nicklen
    }

    /// Maximum topic length.
    pub fn topiclen(&self) -> usize {
        self.topiclen
    }

    /// Maximum away message length (0 = unannounced).
    pub fn awaylen(&self) -> usize {
        self.awaylen
    }

    /// Maximum kick message length.
    pub fn kicklen(&self) -> usize {
        self.kicklen
    }

    /// Maximum mode changes per MODE command.
    pub fn modes(&self) -> usize {
        self.modes
    }

    /// Look up an unclassified ISUPPORT token.
    pub fn extra(&self, key: &str) -> Option<&str> {
        self.extras.get(key).map(String::as_str)
    }

    /// The `PREFIX` token parsed into an ordered mode/sigil table.
    pub fn prefix_table(&self) -> PrefixTable {
        PrefixTable::parse(&self.prefix)
    }

    /// The `CHANMODES` token parsed into its four classes.
    pub fn chanmode_classes(&self) -> ChanmodeClasses {
        ChanmodeClasses::parse(&self.chanmodes)
    }
}

fn parse_num(value: Option<&str>, fallback: usize) -> usize {
    value.and_then(|v| v.parse().ok()).unwrap_or(fallback)
}

fn merge_str(dst: &mut String, src: &str) {
    if !src.is_empty() {
        src.clone_into(dst);
    }
}

fn merge_num(dst: &mut usize, src: usize) {
    if src != 0 {
        *dst = src;
    }
}

/// The `PREFIX` token parsed into parallel, rank-ordered mode and sigil
/// lists. Index 0 is the highest rank.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PrefixTable {
    modes: Vec<char>,
    sigils: Vec<char>,
}

impl PrefixTable {
    /// Parse a `PREFIX` value like `(ov)@+`. Malformed values yield an
    /// empty table.
    pub fn parse(s: &str) -> Self {
        let inner = s
            .strip_prefix('(')
            .and_then(|rest| rest.split_once(')'));
        match inner {
            Some((modes, sigils)) if modes.chars().count() == sigils.chars().count() => {
                PrefixTable {
                    modes: modes.chars().collect(),
                    sigils: sigils.chars().collect(),
                }
            }
            _ => PrefixTable::default(),
        }
    }

    /// Number of ranked prefix modes.
    pub fn len(&self) -> usize {
        self.modes.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }

    /// Whether `mode` is a prefix-granting mode (e.g. `o`, `v`).
    pub fn is_prefix_mode(&self, mode: char) -> bool {
        self.modes.contains(&mode)
    }

    /// Rank of a mode character; 0 is highest.
    pub fn rank_of_mode(&self, mode: char) -> Option<usize> {
        self.modes.iter().position(|&m| m == mode)
    }

    /// Rank of a sigil character; 0 is highest.
    pub fn rank_of_sigil(&self, sigil: char) -> Option<usize> {
        self.sigils.iter().position(|&s| s == sigil)
    }

    /// The sigil for a mode character.
    pub fn sigil_for_mode(&self, mode: char) -> Option<char> {
        self.rank_of_mode(mode).map(|i| self.sigils[i])
    }

    /// The mode character for a sigil.
    pub fn mode_for_sigil(&self, sigil: char) -> Option<char> {
        self.rank_of_sigil(sigil).map(|i| self.modes[i])
    }
}

/// The four `CHANMODES` classes, controlling MODE parameter parsing.
///
/// A: list modes (always parameterized), B: always parameterized,
/// C: parameterized only when set, D: never parameterized.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChanmodeClasses {
    /// List-adding modes.
    pub a: String,
    /// Always-parameterized setting modes.
    pub b: String,
    /// Set-only-parameterized modes.
    pub c: String,
    /// Boolean modes.
    pub d: String,
}

impl ChanmodeClasses {
    /// Parse a `CHANMODES` value like `b,k,l,imnpst`. Missing classes are
    /// empty.
    pub fn parse(s: &str) -> Self {
        let mut parts = s.splitn(4, ',');
        ChanmodeClasses {
            a: parts.next().unwrap_or("").to_owned(),
            b: parts.next().unwrap_or("").to_owned(),
            c: parts.next().unwrap_or("").to_owned(),
            d: parts.next().unwrap_or("").to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER: &str = "irc.gamesurge.net";

    fn myinfo() -> Message {
        Message::new(
            names::RPL_MYINFO,
            SERVER,
            &["nick", "irc.test.net", "testircd-1.2", "acCior", "abcde"],
        )
    }

    fn isupport_1() -> Message {
        Message::new(
            names::RPL_ISUPPORT,
            SERVER,
            &[
                "NICK",
                "RFC8812",
                "IRCD=gIRCd",
                "CASEMAPPING=scii",
                "PREFIX=(v)+",
                "CHANTYPES=#&",
                "CHANMODES=a,b,c,d",
                "CHANLIMIT=#&+:10",
                "are supported by this server",
            ],
        )
    }

    fn isupport_2() -> Message {
        Message::new(
            names::RPL_ISUPPORT,
            SERVER,
            &[
                "NICK",
                "CHANNELLEN=49",
                "NICKLEN=8",
                "TOPICLEN=489",
                "AWAYLEN=126",
                "KICKLEN=399",
                "MODES=4",
                "MAXLIST=beI:49",
                "EXCEPTS=e",
                "INVEX=I",
                "PENALTY",
                "are supported by this server",
            ],
        )
    }

    #[test]
    fn parse_myinfo_and_isupport() {
        let mut p = ProtoCaps::new();
        p.parse_my_info(&myinfo());
        p.parse_isupport(&isupport_1());
        p.parse_isupport(&isupport_2());

        assert_eq!(p.server_name(), "irc.test.net");
        assert_eq!(p.ircd_version(), "testircd-1.2");
        assert_eq!(p.usermodes(), "acCior");
        assert_eq!(p.legacy_chanmodes(), "abcde");
        assert_eq!(p.rfc(), "RFC8812");
        assert_eq!(p.ircd(), "gIRCd");
        assert_eq!(p.casemapping(), "scii");
        assert_eq!(p.prefix(), "(v)+");
        assert_eq!(p.chantypes(), "#&");
        assert_eq!(p.chanmodes(), "a,b,c,d");
        assert_eq!(p.chanlimit(), 10);
        assert_eq!(p.channellen(), 49);
        assert_eq!(p.nicklen(), 8);
        assert_eq!(p.topiclen(), 489);
        assert_eq!(p.awaylen(), 126);
        assert_eq!(p.kicklen(), 399);
        assert_eq!(p.modes(), 4);
        assert_eq!(p.extra("EXCEPTS"), Some("e"));
        assert_eq!(p.extra("INVEX"), Some("I"));
        assert_eq!(p.extra("PENALTY"), Some("true"));
        assert_eq!(p.extra("NICK"), None);
    }

    #[test]
    fn clone_is_deep() {
        let mut p1 = ProtoCaps::new();
        p1.extras.insert("other".to_owned(), "other".to_owned());
        let p2 = p1.clone();
        p1.chantypes = "other".to_owned();
        p1.extras.insert("other".to_owned(), "different".to_owned());

        assert_ne!(p2.chantypes(), "other");
        assert_eq!(p2.extra("other"), Some("other"));
    }

    #[test]
    fn is_channel() {
        let mut p = ProtoCaps::new();
        p.chantypes = "#&~".to_owned();
        assert!(p.is_channel("#channel"));
        assert!(p.is_channel("&channel"));
        assert!(!p.is_channel("n#otchannel"));
        assert!(!p.is_channel(""));
    }

    #[test]
    fn merge_unions_chantypes() {
        let mut p1 = ProtoCaps::new();
        let mut p2 = ProtoCaps::new();
        p1.parse_isupport(&Message::new(names::RPL_ISUPPORT, "", &["NICK", "CHANTYPES=#&"]));
        p2.parse_isupport(&Message::new(names::RPL_ISUPPORT, "", &["NICK", "CHANTYPES=~"]));
        assert_eq!(p1.chantypes(), "#&");
        assert_eq!(p2.chantypes(), "~");

        p1.merge(&p2);
        assert_eq!(p1.chantypes(), "#&~");
    }

    #[test]
    fn merge_extras_other_wins() {
        let mut p1 = ProtoCaps::new();
        let mut p2 = ProtoCaps::new();
        p1.extras.insert("A".into(), "1".into());
        p1.extras.insert("B".into(), "1".into());
        p2.extras.insert("B".into(), "2".into());
        p1.merge(&p2);
        assert_eq!(p1.extra("A"), Some("1"));
        assert_eq!(p1.extra("B"), Some("2"));
    }

    #[test]
    fn prefix_table() {
        let t = PrefixTable::parse("(qaohv)~&@%+");
        assert_eq!(t.len(), 5);
        assert!(t.is_prefix_mode('o'));
        assert!(!t.is_prefix_mode('b'));
        assert_eq!(t.sigil_for_mode('o'), Some('@'));
        assert_eq!(t.mode_for_sigil('+'), Some('v'));
        assert_eq!(t.rank_of_mode('q'), Some(0));
        assert_eq!(t.rank_of_sigil('%'), Some(3));
        assert_eq!(t.sigil_for_mode('x'), None);
    }

    #[test]
    fn prefix_table_malformed() {
        assert!(PrefixTable::parse("").is_empty());
        assert!(PrefixTable::parse("(ov)@").is_empty());
        assert!(PrefixTable::parse("ov@+").is_empty());
    }

    #[test]
    fn chanmode_classes() {
        let c = ChanmodeClasses::parse("b,k,l,imnpst");
        assert_eq!(c.a, "b");
        assert_eq!(c.b, "k");
        assert_eq!(c.c, "l");
        assert_eq!(c.d, "imnpst");
    }
}
