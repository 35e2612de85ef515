//! Fullhost splitting and wildcard masks.

use serde::{Deserialize, Serialize};

use crate::casemap::irc_lower_char;

/// Split `nick!user@host` into its three pieces.
///
/// All three pieces must be non-empty for the split to succeed; otherwise
/// three empty strings are returned.
pub fn split_fullhost(full: &str) -> (&str, &str, &str) {
    if let Some((nick, rest)) = full.split_once('!') {
        if let Some((user, host)) = rest.split_once('@') {
            if !nick.is_empty() && !user.is_empty() && !host.is_empty() {
                return (nick, user, host);
            }
        }
    }
    ("", "", "")
}

/// Match `text` against a wildcard `pattern` under RFC 1459 case folding.
///
/// `*` matches any run of characters, `?` matches exactly one.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().map(irc_lower_char).collect();
    let t: Vec<char> = text.chars().map(irc_lower_char).collect();

    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// A fullhost pattern with `*` and `?` wildcards, used to match
/// authenticated sessions to access records.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WildMask(
    /// The raw pattern text.
    pub String,
);

impl WildMask {
    /// Whether this mask matches the given fullhost.
    pub fn matches(&self, fullhost: &str) -> bool {
        wildcard_match(&self.0, fullhost)
    }
}

impl<S: Into<String>> From<S> for WildMask {
    fn from(s: S) -> Self {
        WildMask(s.into())
    }
}
