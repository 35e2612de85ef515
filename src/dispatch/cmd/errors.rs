//! User-visible command errors.
//!
//! Every variant formats to the exact text NOTICEd back to the caller, so
//! handlers can also construct and return them (for example a handler that
//! does its own finer-grained access checks).

use thiserror::Error;

/// Which bound an argument-count failure hit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CountBound {
    /// Fewer tokens than required.
    AtLeast,
    /// More tokens than the chain accepts.
    AtMost,
    /// The chain takes an exact count.
    Exactly,
}

impl std::fmt::Display for CountBound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CountBound::AtLeast => "at least",
            CountBound::AtMost => "at most",
            CountBound::Exactly => "exactly",
        })
    }
}

/// Errors reported to the command's caller via NOTICE.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    /// Wrong number of arguments.
    #[error("Expected {bound} {n} arguments. Usage: {usage}")]
    NArguments {
        /// Which bound failed.
        bound: CountBound,
        /// The bound's argument count.
        n: usize,
        /// The command's usage string.
        usage: String,
    },

    /// A channel argument was required but the given token is no channel.
    #[error("Expected a valid channel argument.")]
    ArgumentNotChannel,

    /// Arguments were given to a command that takes none.
    #[error("Unexpected argument(s).")]
    UnexpectedArgument,

    /// A `*` username token with nothing after the star.
    #[error("Expected a username following *.")]
    MissingUsername,

    /// The nick exists but has no authenticated session.
    #[error("User {0} is not authenticated.")]
    UserNotAuthed(String),

    /// The nick is not visible in state.
    #[error("User {0} could not be found.")]
    UserNotFound(String),

    /// The username has no access record.
    #[error("User {0} is not registered.")]
    UserNotRegistered(String),

    /// Caller's best access level is below the requirement.
    #[error("Access denied: level {0} required.")]
    InsufficientLevel(u8),
    /// Global-scope level check failed.
    #[error("Access denied: global level {0} required.")]
    InsufficientGlobalLevel(u8),
    /// Server-scope level check failed.
    #[error("Access denied: server level {0} required.")]
    InsufficientServerLevel(u8),
    /// Channel-scope level check failed.
    #[error("Access denied: channel level {0} required.")]
    InsufficientChannelLevel(u8),

    /// Caller lacks required flags.
    #[error("Access denied: flags [{0}] required.")]
    InsufficientFlags(String),
    /// Global-scope flag check failed.
    #[error("Access denied: global flags [{0}] required.")]
    InsufficientGlobalFlags(String),
    /// Server-scope flag check failed.
    #[error("Access denied: server flags [{0}] required.")]
    InsufficientServerFlags(String),
    /// Channel-scope flag check failed.
    #[error("Access denied: channel flags [{0}] required.")]
    InsufficientChannelFlags(String),

    /// A command needing state ran on a state-disabled server.
    #[error("State tracking is disabled.")]
    StateDisabled,

    /// A command needing the store ran without one.
    #[error("Access records are disabled.")]
    StoreDisabled,

    /// A handler failed in its own way; the text is relayed verbatim.
    #[error("{0}")]
    Failure(String),
}

impl CommandError {
    /// A too-few-arguments error.
    pub fn at_least(n: usize, usage: &str) -> Self {
        CommandError::NArguments {
            bound: CountBound::AtLeast,
            n,
            usage: usage.to_owned(),
        }
    }

    /// A too-many-arguments error.
    pub fn at_most(n: usize, usage: &str) -> Self {
        CommandError::NArguments {
            bound: CountBound::AtMost,
            n,
            usage: usage.to_owned(),
        }
    }

    /// An exact-count error.
    pub fn exactly(n: usize, usage: &str) -> Self {
        CommandError::NArguments {
            bound: CountBound::Exactly,
            n,
            usage: usage.to_owned(),
        }
    }
}

/// Errors raised at command registration time.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    /// The command identifier is empty.
    #[error("command name is required")]
    CmdRequired,
    /// The extension namespace is empty.
    #[error("extension is required")]
    ExtensionRequired,
    /// The description is empty.
    #[error("description is required")]
    DescriptionRequired,
    /// No handler was attached.
    #[error("handler is required")]
    HandlerRequired,
    /// The command name is already registered (in any scope).
    #[error("duplicate command: {0}")]
    DuplicateCommand(String),
    /// The argument spec failed to compile.
    #[error("bad argument spec: {0}")]
    Fragment(#[from] super::fragment::FragmentError),
}
