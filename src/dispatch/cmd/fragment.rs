//! Command argument schemas.
//!
//! A command declares its arguments as a list of spec tokens which compile
//! into an immutable fragment chain:
//!
//! - `name` — required positional
//! - `[name]` — optional positional
//! - `name...` — variadic, consumes the rest, at most one, only at the end
//! - `:name` — rest-of-line terminal
//! - `#name` — channel argument, only in the leading position
//! - `*name` — registered-username argument
//! - `~name` — nick-or-username argument
//!
//! Walking a chain over a message's tokens is a pure function of the chain
//! and the token vector.

use std::collections::HashMap;

use thiserror::Error;

/// Errors raised while compiling a spec token list.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FragmentError {
    /// The token does not fit the argument grammar.
    #[error("malformed argument token: {0:?}")]
    BadToken(String),
    /// Two fragments share an id.
    #[error("duplicate argument name: {0:?}")]
    DuplicateName(String),
    /// A required fragment follows an optional one.
    #[error("required argument {0:?} follows an optional argument")]
    RequiredAfterOptional(String),
    /// A fragment follows a variadic or terminal fragment.
    #[error("argument {0:?} follows a variadic or terminal argument")]
    AfterVariadic(String),
    /// A channel fragment appears after another positional.
    #[error("channel argument {0:?} must come first")]
    ChannelPosition(String),
    /// More than one channel fragment.
    #[error("duplicate channel argument: {0:?}")]
    DuplicateChannel(String),
    /// More than one variadic or terminal fragment.
    #[error("duplicate variadic argument: {0:?}")]
    DuplicateVariadic(String),
}

/// Errors raised while walking a chain over message tokens.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WalkError {
    /// Tokens ran out with required fragments left.
    #[error("expected more arguments")]
    ExpectedMoreArguments,
    /// Tokens were left over after the chain was satisfied.
    #[error("unexpected argument")]
    UnexpectedArgument,
    /// A terminal fragment without a colon was followed by more tokens.
    #[error("extra arguments after terminal argument")]
    ExtraArgumentsAfterTerminal,
}

/// How a fragment consumes tokens.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FragKind {
    /// Exactly one token.
    Single,
    /// The rest of the tokens, comma-split per element.
    Variadic,
    /// The rest of the line, space-joined.
    Terminal,
}

/// How a fragment's value resolves to users.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserSlot {
    /// Not a user argument.
    None,
    /// `*name`: must be a registered username.
    Registered,
    /// `~name`: a nick, or a `*`-prefixed username.
    NickOrUser,
}

/// One compiled fragment.
#[derive(Clone, Debug, PartialEq)]
pub struct Fragment {
    /// Binding id.
    pub id: String,
    /// Consumption behavior.
    pub kind: FragKind,
    /// Whether the fragment may be skipped.
    pub optional: bool,
    /// Whether this is the channel slot.
    pub channel: bool,
    /// User resolution behavior.
    pub user: UserSlot,
}

/// Values bound by a walk.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BoundArgs {
    /// Plain text per id (variadic ids get the verbatim join).
    pub args: HashMap<String, String>,
    /// Comma-split values for variadic ids.
    pub argv: HashMap<String, Vec<String>>,
    /// Comma-split channel lists per channel id.
    pub channels: HashMap<String, Vec<String>>,
}

impl BoundArgs {
    /// The plain value bound for `id`.
    pub fn get(&self, id: &str) -> Option<&str> {
        self.args.get(id).map(String::as_str)
    }
}

/// An immutable compiled chain.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FragmentChain {
    frags: Vec<Fragment>,
    usage: String,
}

impl FragmentChain {
    /// Compile a list of spec tokens.
    pub fn compile(tokens: &[&str]) -> Result<FragmentChain, FragmentError> {
        let mut frags: Vec<Fragment> = Vec::new();
        for token in tokens {
            let frag = parse_token(token)?;

            if frags.iter().any(|f| f.id == frag.id) {
                return Err(FragmentError::DuplicateName(frag.id));
            }
            if frag.channel {
                if frags.iter().any(|f| f.channel) {
                    return Err(FragmentError::DuplicateChannel(frag.id));
                }
                if !frags.is_empty() {
                    return Err(FragmentError::ChannelPosition(frag.id));
                }
            }
            if let Some(last) = frags.last() {
                if last.kind != FragKind::Single {
                    return Err(FragmentError::AfterVariadic(frag.id));
                }
                if last.optional && !frag.optional && frag.kind == FragKind::Single {
                    return Err(FragmentError::RequiredAfterOptional(frag.id));
                }
            }
            frags.push(frag);
        }

        let usage = tokens.join(" ");
        Ok(FragmentChain { frags, usage })
    }

    /// The compiled fragments in order.
    pub fn fragments(&self) -> &[Fragment] {
        &self.frags
    }

    /// Whether the chain has no fragments.
    pub fn is_empty(&self) -> bool {
        self.frags.is_empty()
    }

    /// The original spec tokens joined for usage messages.
    pub fn usage(&self) -> &str {
        &self.usage
    }

    /// The channel fragment, if declared.
    pub fn channel_fragment(&self) -> Option<&Fragment> {
        self.frags.iter().find(|f| f.channel)
    }

    /// Count of required non-channel fragments.
    pub fn required(&self) -> usize {
        self.frags
            .iter()
            .filter(|f| !f.optional && !f.channel && f.kind == FragKind::Single)
            .count()
    }

    /// Count of optional single fragments.
    pub fn optional(&self) -> usize {
        self.frags
            .iter()
            .filter(|f| f.optional && f.kind == FragKind::Single)
            .count()
    }

    /// Whether the chain ends with a variadic or terminal fragment.
    pub fn open_ended(&self) -> bool {
        self.frags
            .last()
            .is_some_and(|f| f.kind != FragKind::Single)
    }

    /// Walk the non-channel fragments over `tokens`, binding values.
    ///
    /// The channel fragment is excluded because the engine resolves it
    /// first (it may be filled implicitly from the message target).
    pub fn walk(&self, tokens: &[&str]) -> Result<BoundArgs, WalkError> {
        let mut bound = BoundArgs::default();
        let mut p = 0usize;

        for frag in self.frags.iter().filter(|f| !f.channel) {
            if p >= tokens.len() {
                // Optionals and open-ended tails bind nothing when the
                // tokens run out; only required singles fail.
                if frag.optional || frag.kind != FragKind::Single {
                    continue;
                }
                return Err(WalkError::ExpectedMoreArguments);
            }
            match frag.kind {
                FragKind::Single => {
                    bound.args.insert(frag.id.clone(), tokens[p].to_owned());
                    p += 1;
                }
                FragKind::Variadic => {
                    let rest = &tokens[p..];
                    bound.args.insert(frag.id.clone(), rest.join(" "));
                    bound.argv.insert(
                        frag.id.clone(),
                        rest.iter()
                            .flat_map(|t| t.split(','))
                            .filter(|s| !s.is_empty())
                            .map(str::to_owned)
                            .collect(),
                    );
                    p = tokens.len();
                }
                FragKind::Terminal => {
                    let value = if let Some(stripped) = tokens[p].strip_prefix(':') {
                        let mut parts = vec![stripped.to_owned()];
                        parts.extend(tokens[p + 1..].iter().map(|s| (*s).to_owned()));
                        parts.join(" ")
                    } else if p + 1 != tokens.len() {
                        return Err(WalkError::ExtraArgumentsAfterTerminal);
                    } else {
                        tokens[p].to_owned()
                    };
                    bound.args.insert(frag.id.clone(), value);
                    p = tokens.len();
                }
            }
        }

        if p < tokens.len() {
            return Err(WalkError::UnexpectedArgument);
        }
        Ok(bound)
    }
}

fn parse_token(token: &str) -> Result<Fragment, FragmentError> {
    let original = token;
    let mut rest = token;

    let optional = if rest.starts_with('[') && rest.ends_with(']') {
        rest = &rest[1..rest.len() - 1];
        true
    } else {
        false
    };

    let mut channel = false;
    let mut user = UserSlot::None;
    let mut kind = FragKind::Single;

    match rest.chars().next() {
        Some('#') => {
            channel = true;
            rest = &rest[1..];
        }
        Some('*') => {
            user = UserSlot::Registered;
            rest = &rest[1..];
        }
        Some('~') => {
            user = UserSlot::NickOrUser;
            rest = &rest[1..];
        }
        Some(':') => {
            kind = FragKind::Terminal;
            rest = &rest[1..];
        }
        _ => {}
    }

    if let Some(stripped) = rest.strip_suffix("...") {
        if kind == FragKind::Terminal {
            return Err(FragmentError::BadToken(original.to_owned()));
        }
        kind = FragKind::Variadic;
        rest = stripped;
    }

    let id_ok = !rest.is_empty()
        && rest
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !id_ok {
        return Err(FragmentError::BadToken(original.to_owned()));
    }
    if channel && user != UserSlot::None {
        return Err(FragmentError::BadToken(original.to_owned()));
    }

    Ok(Fragment {
        id: rest.to_owned(),
        kind,
        optional,
        channel,
        user,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(tokens: &[&str]) -> Result<FragmentChain, FragmentError> {
        FragmentChain::compile(tokens)
    }

    #[test]
    fn rejects_malformed_tokens() {
        assert!(matches!(
            compile(&["!!!"]),
            Err(FragmentError::BadToken(_))
        ));
        assert!(matches!(
            compile(&["~#badarg"]),
            Err(FragmentError::BadToken(_))
        ));
        assert!(matches!(
            compile(&["#*badarg"]),
            Err(FragmentError::BadToken(_))
        ));
        assert!(matches!(compile(&[""]), Err(FragmentError::BadToken(_))));
    }

    #[test]
    fn rejects_bad_ordering() {
        assert_eq!(
            compile(&["[opt]", "req"]),
            Err(FragmentError::RequiredAfterOptional("req".into()))
        );
        assert_eq!(
            compile(&["req...", "[opt]"]),
            Err(FragmentError::AfterVariadic("opt".into()))
        );
        assert_eq!(
            compile(&["name", "[name]"]),
            Err(FragmentError::DuplicateName("name".into()))
        );
        assert_eq!(
            compile(&["vrgs...", "vrgs2..."]),
            Err(FragmentError::AfterVariadic("vrgs2".into()))
        );
        assert_eq!(
            compile(&["[opt]", "#chan1"]),
            Err(FragmentError::ChannelPosition("chan1".into()))
        );
        assert_eq!(
            compile(&["req", "#chan1"]),
            Err(FragmentError::ChannelPosition("chan1".into()))
        );
        assert_eq!(
            compile(&["#chan1", "#chan2"]),
            Err(FragmentError::DuplicateChannel("chan2".into()))
        );
    }

    #[test]
    fn accepts_reasonable_specs() {
        assert!(compile(&[]).is_ok());
        assert!(compile(&["arg"]).is_ok());
        assert!(compile(&["[opt]"]).is_ok());
        assert!(compile(&["[opt]", "opts..."]).is_ok());
        assert!(compile(&["arg", "[opt]"]).is_ok());
        assert!(compile(&["#chan", "arg", "[opt]"]).is_ok());
        assert!(compile(&["*user1", "~user2", "[*user3]", "~users..."]).is_ok());
        assert!(compile(&[":rest"]).is_ok());
    }

    #[test]
    fn counts() {
        let chain = compile(&["#chan", "arg", "[opt]", "rest..."]).unwrap();
        assert_eq!(chain.required(), 1);
        assert_eq!(chain.optional(), 1);
        assert!(chain.open_ended());
        assert!(chain.channel_fragment().is_some());
    }

    #[test]
    fn walk_binds_positionals() {
        let chain = compile(&["one", "[two]"]).unwrap();
        let bound = chain.walk(&["a", "b"]).unwrap();
        assert_eq!(bound.get("one"), Some("a"));
        assert_eq!(bound.get("two"), Some("b"));

        let bound = chain.walk(&["a"]).unwrap();
        assert_eq!(bound.get("one"), Some("a"));
        assert_eq!(bound.get("two"), None);
    }

    #[test]
    fn walk_requires_required() {
        let chain = compile(&["id1", "id2"]).unwrap();
        assert_eq!(
            chain.walk(&["arg1"]),
            Err(WalkError::ExpectedMoreArguments)
        );
    }

    #[test]
    fn walk_rejects_leftovers() {
        let chain = compile(&["one"]).unwrap();
        assert_eq!(chain.walk(&["a", "b"]), Err(WalkError::UnexpectedArgument));
    }

    #[test]
    fn walk_terminal() {
        let chain = compile(&[":id"]).unwrap();
        let bound = chain.walk(&[":arg1", "arg2"]).unwrap();
        assert_eq!(bound.get("id"), Some("arg1 arg2"));

        assert_eq!(
            chain.walk(&["arg1", "arg2"]),
            Err(WalkError::ExtraArgumentsAfterTerminal)
        );

        let bound = chain.walk(&["arg1"]).unwrap();
        assert_eq!(bound.get("id"), Some("arg1"));
    }

    #[test]
    fn walk_variadic() {
        let chain = compile(&["first", "rest..."]).unwrap();
        let bound = chain.walk(&["a", "b", "c,d"]).unwrap();
        assert_eq!(bound.get("first"), Some("a"));
        assert_eq!(bound.get("rest"), Some("b c,d"));
        assert_eq!(
            bound.argv.get("rest").unwrap(),
            &vec!["b".to_owned(), "c".to_owned(), "d".to_owned()]
        );
    }

    #[test]
    fn walk_skips_exhausted_optionals() {
        let chain = compile(&["[opt]", "rest..."]).unwrap();
        let bound = chain.walk(&[]).unwrap();
        assert!(bound.args.is_empty());
    }

    #[test]
    fn walk_open_ended_tail_binds_nothing_when_exhausted() {
        let chain = compile(&["first", "rest..."]).unwrap();
        let bound = chain.walk(&["a"]).unwrap();
        assert_eq!(bound.get("first"), Some("a"));
        assert_eq!(bound.get("rest"), None);
    }
}
