//! CTCP packing and unpacking.
//!
//! CTCP messages ride inside PRIVMSG and NOTICE bodies delimited by
//! `\x01`. Reference: <https://modern.ircdocs.horse/ctcp.html>.

/// The CTCP delimiter character.
pub const CTCP_DELIM: char = '\x01';

/// Whether a message body is in CTCP form.
#[inline]
pub fn is_ctcp(body: &str) -> bool {
    body.starts_with(CTCP_DELIM)
}

/// Wrap a tag and optional data into a CTCP body.
///
/// The tag is uppercased; data is appended after a single space when
/// non-empty.
pub fn pack(tag: &str, data: &str) -> String {
    if data.is_empty() {
        format!("\x01{}\x01", tag.to_ascii_uppercase())
    } else {
        format!("\x01{} {}\x01", tag.to_ascii_uppercase(), data)
    }
}

/// Unpack a CTCP body into its tag and optional data.
///
/// A missing closing delimiter is tolerated (some clients omit it).
/// Returns `None` when the body is not CTCP or the tag is empty.
pub fn unpack(body: &str) -> Option<(String, Option<String>)> {
    let body = body.strip_prefix(CTCP_DELIM)?;
    let body = body.strip_suffix(CTCP_DELIM).unwrap_or(body);
    if body.is_empty() {
        return None;
    }
    match body.split_once(' ') {
        Some((tag, data)) => {
            let data = if data.is_empty() {
                None
            } else {
                Some(data.to_owned())
            };
            Some((tag.to_ascii_uppercase(), data))
        }
        None => Some((body.to_ascii_uppercase(), None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_with_data() {
        assert_eq!(pack("action", "waves hello"), "\x01ACTION waves hello\x01");
    }

    #[test]
    fn pack_without_data() {
        assert_eq!(pack("VERSION", ""), "\x01VERSION\x01");
    }

    #[test]
    fn unpack_with_data() {
        let (tag, data) = unpack("\x01ACTION waves hello\x01").unwrap();
        assert_eq!(tag, "ACTION");
        assert_eq!(data.as_deref(), Some("waves hello"));
    }

    #[test]
    fn unpack_without_data() {
        let (tag, data) = unpack("\x01VERSION\x01").unwrap();
        assert_eq!(tag, "VERSION");
        assert_eq!(data, None);
    }

    #[test]
    fn unpack_missing_trailing_delim() {
        let (tag, data) = unpack("\x01PING 12345").unwrap();
        assert_eq!(tag, "PING");
        assert_eq!(data.as_deref(), Some("12345"));
    }

    #[test]
    fn unpack_rejects_non_ctcp() {
        assert!(unpack("hello world").is_none());
        assert!(unpack("").is_none());
        assert!(unpack("\x01\x01").is_none());
    }

    #[test]
    fn round_trip() {
        let body = pack("PING", "12345");
        let (tag, data) = unpack(&body).unwrap();
        assert_eq!(tag, "PING");
        assert_eq!(data.as_deref(), Some("12345"));
    }
}
