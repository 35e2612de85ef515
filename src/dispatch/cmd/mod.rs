//! The command engine.
//!
//! Sits on top of the dispatcher for PRIVMSG and NOTICE traffic: detects
//! the command prefix, walks the registered argument schema, resolves
//! channel and user arguments through state and the store, enforces
//! level/flag access, and invokes the handler. Binding failures are
//! formatted from the error catalog and NOTICEd back to the caller.

mod data;
mod errors;
mod fragment;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::RwLock;
use tracing::{debug, error};

use corvid_proto::{names, Message, ProtoCaps};

use crate::data::Store;
use crate::endpoint::Endpoint;
use crate::state::State;

use super::{panic_text, ActiveCounter};

pub use data::CommandData;
pub use errors::{CommandError, CountBound, RegisterError};
pub use fragment::{BoundArgs, FragmentChain, FragmentError, UserSlot, WalkError};

use fragment::FragKind;

/// Which message kinds trigger a command.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MsgType {
    /// PRIVMSG only.
    Privmsg,
    /// NOTICE only.
    Notice,
    /// Either.
    #[default]
    All,
}

impl MsgType {
    fn accepts(self, name: &str) -> bool {
        match self {
            MsgType::Privmsg => name == names::PRIVMSG,
            MsgType::Notice => name == names::NOTICE,
            MsgType::All => name == names::PRIVMSG || name == names::NOTICE,
        }
    }
}

/// Where a command may be used.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Scope {
    /// Only in a query to the bot.
    Private,
    /// Only in a channel.
    Public,
    /// Anywhere.
    #[default]
    All,
}

impl Scope {
    fn accepts(self, public: bool) -> bool {
        match self {
            Scope::Private => !public,
            Scope::Public => public,
            Scope::All => true,
        }
    }
}

/// The generic command handler interface: one entry point receiving the
/// command name, so a single implementor can back several commands.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Run the command.
    async fn command(
        &self,
        cmd: &str,
        msg: &Message,
        ep: &Endpoint,
        data: &mut CommandData,
    ) -> Result<(), CommandError>;
}

/// A command-specific callback bound at registration. When present it is
/// preferred over the generic handler.
pub type NamedFn = Arc<
    dyn for<'a> Fn(
            &'a Message,
            &'a Endpoint,
            &'a mut CommandData,
        ) -> BoxFuture<'a, Result<(), CommandError>>
        + Send
        + Sync,
>;

/// A command registration.
#[derive(Clone)]
pub struct CommandSpec {
    /// Namespace of the providing extension; informational, used in logs.
    pub extension: String,
    /// Human-readable description.
    pub description: String,
    /// The command word.
    pub cmd: String,
    /// Which message kinds trigger it.
    pub msg_type: MsgType,
    /// Where it may be used.
    pub scope: Scope,
    args: Vec<String>,
    auth: Option<(u8, String)>,
    generic: Option<Arc<dyn CommandHandler>>,
    named: Option<NamedFn>,
}

impl CommandSpec {
    /// A spec with the required identity fields.
    pub fn new(
        extension: impl Into<String>,
        description: impl Into<String>,
        cmd: impl Into<String>,
        msg_type: MsgType,
        scope: Scope,
    ) -> Self {
        CommandSpec {
            extension: extension.into(),
            description: description.into(),
            cmd: cmd.into(),
            msg_type,
            scope,
            args: Vec::new(),
            auth: None,
            generic: None,
            named: None,
        }
    }

    /// Declare the argument schema.
    pub fn args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|a| (*a).to_owned()).collect();
        self
    }

    /// Require an access level and flags from the caller.
    pub fn auth(mut self, level: u8, flags: &str) -> Self {
        self.auth = Some((level, flags.to_owned()));
        self
    }

    /// Attach the generic handler.
    pub fn handler(mut self, handler: Arc<dyn CommandHandler>) -> Self {
        self.generic = Some(handler);
        self
    }

    /// Attach a command-named callback; it takes precedence over the
    /// generic handler.
    pub fn named(mut self, named: NamedFn) -> Self {
        self.named = Some(named);
        self
    }
}

/// Summary of a registration for [`Commander::each_command`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandInfo {
    /// The command word.
    pub cmd: String,
    /// Providing extension.
    pub extension: String,
    /// Description.
    pub description: String,
}

struct Registered {
    extension: String,
    description: String,
    cmd: String,
    msg_type: MsgType,
    scope: Scope,
    chain: FragmentChain,
    auth: Option<(u8, String)>,
    generic: Option<Arc<dyn CommandHandler>>,
    named: Option<NamedFn>,
}

/// Per-dispatch collaborators: the write handle plus snapshots/handles of
/// the server's capabilities, state, and store.
#[derive(Clone)]
pub struct CommandContext {
    /// Write handle for the originating server.
    pub endpoint: Endpoint,
    /// Capability snapshot (channel detection).
    pub caps: ProtoCaps,
    /// Server state, absent when disabled.
    pub state: Option<Arc<RwLock<State>>>,
    /// Record store, absent when disabled.
    pub store: Option<Arc<Store>>,
}

type CommandTable = HashMap<Option<String>, HashMap<String, Arc<Registered>>>;

/// The command engine.
pub struct Commander {
    prefix: char,
    commands: Mutex<CommandTable>,
    active: Arc<ActiveCounter>,
}

impl Commander {
    /// An engine with the given default prefix.
    pub fn new(prefix: char) -> Self {
        Commander {
            prefix,
            commands: Mutex::new(HashMap::new()),
            active: Arc::new(ActiveCounter::default()),
        }
    }

    /// The default prefix.
    pub fn prefix(&self) -> char {
        self.prefix
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CommandTable> {
        self.commands.lock().expect("command table lock")
    }

    /// Register a command globally (`server = None`) or for one server.
    ///
    /// The command word must be unique across every scope — a duplicate is
    /// rejected regardless of extension.
    pub fn register(
        &self,
        server: Option<&str>,
        spec: CommandSpec,
    ) -> Result<(), RegisterError> {
        if spec.cmd.is_empty() {
            return Err(RegisterError::CmdRequired);
        }
        if spec.extension.is_empty() {
            return Err(RegisterError::ExtensionRequired);
        }
        if spec.description.is_empty() {
            return Err(RegisterError::DescriptionRequired);
        }
        if spec.generic.is_none() && spec.named.is_none() {
            return Err(RegisterError::HandlerRequired);
        }
        let arg_refs: Vec<&str> = spec.args.iter().map(String::as_str).collect();
        let chain = FragmentChain::compile(&arg_refs)?;

        let cmd = spec.cmd.to_ascii_lowercase();
        let mut table = self.lock();
        if table.values().any(|cmds| cmds.contains_key(&cmd)) {
            return Err(RegisterError::DuplicateCommand(cmd));
        }
        table.entry(server.map(str::to_owned)).or_default().insert(
            cmd.clone(),
            Arc::new(Registered {
                extension: spec.extension,
                description: spec.description,
                cmd,
                msg_type: spec.msg_type,
                scope: spec.scope,
                chain,
                auth: spec.auth,
                generic: spec.generic,
                named: spec.named,
            }),
        );
        Ok(())
    }

    /// Remove a registration; reports whether it existed.
    pub fn unregister(&self, server: Option<&str>, cmd: &str) -> bool {
        let cmd = cmd.to_ascii_lowercase();
        self.lock()
            .get_mut(&server.map(str::to_owned))
            .is_some_and(|cmds| cmds.remove(&cmd).is_some())
    }

    /// Visit every registration until the visitor returns `true`.
    pub fn each_command(&self, mut visitor: impl FnMut(&CommandInfo) -> bool) {
        let table = self.lock();
        for cmds in table.values() {
            for reg in cmds.values() {
                let info = CommandInfo {
                    cmd: reg.cmd.clone(),
                    extension: reg.extension.clone(),
                    description: reg.description.clone(),
                };
                if visitor(&info) {
                    return;
                }
            }
        }
    }

    /// Block until every in-flight command handler has completed.
    pub async fn wait_for_handlers(&self) {
        self.active.wait().await;
    }

    /// Evaluate one message. Returns `Ok(())` when the message is not a
    /// command (or was filtered); binding and access errors are NOTICEd to
    /// the caller and also returned for the dispatcher's caller to assert
    /// on. Handler errors are NOTICEd from the handler task.
    pub async fn dispatch(
        &self,
        server: &str,
        prefix_override: Option<char>,
        msg: Arc<Message>,
        ctx: &CommandContext,
    ) -> Result<(), CommandError> {
        let nick = msg.nick().to_owned();
        match self.evaluate(server, prefix_override, &msg, ctx).await {
            Ok(Some((reg, data))) => {
                self.invoke(reg, msg, ctx.endpoint.clone(), data, nick);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) => {
                if !nick.is_empty() {
                    let _ = ctx.endpoint.notice(&nick, &err.to_string()).await;
                }
                Err(err)
            }
        }
    }

    /// Recognition and binding. `Ok(None)` means "not a command here".
    async fn evaluate(
        &self,
        server: &str,
        prefix_override: Option<char>,
        msg: &Message,
        ctx: &CommandContext,
    ) -> Result<Option<(Arc<Registered>, CommandData)>, CommandError> {
        if msg.name != names::PRIVMSG && msg.name != names::NOTICE {
            return Ok(None);
        }
        if msg.args.len() < 2 || msg.nick().is_empty() {
            return Ok(None);
        }

        let target = msg.target().to_owned();
        let public = ctx.caps.is_channel(&target);
        let prefix = prefix_override.unwrap_or(self.prefix);

        let body = msg.body();
        let stripped = match body.strip_prefix(prefix) {
            Some(rest) => rest,
            None if !public => body,
            None => return Ok(None),
        };

        let mut words = stripped.split_whitespace();
        let cmd_word = match words.next() {
            Some(w) => w.to_ascii_lowercase(),
            None => return Ok(None),
        };
        let mut tokens: Vec<&str> = words.collect();

        let reg = {
            let table = self.lock();
            let global = table.get(&None).and_then(|c| c.get(&cmd_word)).cloned();
            global.or_else(|| {
                table
                    .get(&Some(server.to_owned()))
                    .and_then(|c| c.get(&cmd_word))
                    .cloned()
            })
        };
        let reg = match reg {
            Some(reg) => reg,
            None => return Ok(None),
        };

        if !reg.msg_type.accepts(&msg.name) || !reg.scope.accepts(public) {
            return Ok(None);
        }

        // Public commands only fire in channels the bot is actually in.
        if public {
            if let Some(state) = &ctx.state {
                if state.read().await.channel(&target).is_none() {
                    debug!(server = %server, channel = %target, "command in untracked channel ignored");
                    return Ok(None);
                }
            }
        }

        let chain = &reg.chain;
        if chain.is_empty() && !tokens.is_empty() {
            return Err(CommandError::UnexpectedArgument);
        }

        // Channel slot resolution: implicit from the target in public,
        // explicit-first-token override, mandatory explicit in private.
        let chan_frag = chain.channel_fragment().cloned();
        let mut bound_channel: Option<(String, String)> = None;
        let mut explicit = false;
        if let Some(cf) = &chan_frag {
            if public {
                if tokens
                    .first()
                    .map(|t| ctx.caps.is_channel(t))
                    .unwrap_or(false)
                {
                    explicit = true;
                    bound_channel = Some((cf.id.clone(), tokens.remove(0).to_owned()));
                } else {
                    bound_channel = Some((cf.id.clone(), target.clone()));
                }
            } else {
                match tokens.first() {
                    Some(t) if ctx.caps.is_channel(t) => {
                        explicit = true;
                        bound_channel = Some((cf.id.clone(), tokens.remove(0).to_owned()));
                    }
                    Some(_) if !cf.optional => {
                        return Err(CommandError::ArgumentNotChannel);
                    }
                    Some(_) => {}
                    None => {}
                }
            }
        }

        // Count validation over the full token vector.
        let n_total = tokens.len() + usize::from(explicit);
        let chan_required = chan_frag.as_ref().is_some_and(|cf| !cf.optional);
        let min_total = chain.required()
            + usize::from(explicit)
            + usize::from(chan_required && !public && !explicit);
        let max_total = chain.required() + chain.optional() + usize::from(explicit);

        if n_total < min_total {
            return Err(if !chain.open_ended() && min_total == max_total {
                CommandError::exactly(min_total, chain.usage())
            } else {
                CommandError::at_least(min_total, chain.usage())
            });
        }
        if !chain.open_ended() && n_total > max_total {
            return Err(CommandError::at_most(max_total, chain.usage()));
        }

        let mut bound = chain.walk(&tokens).map_err(|err| match err {
            WalkError::ExpectedMoreArguments => CommandError::at_least(min_total, chain.usage()),
            WalkError::UnexpectedArgument => {
                if chain.is_empty() {
                    CommandError::UnexpectedArgument
                } else {
                    CommandError::at_most(max_total, chain.usage())
                }
            }
            WalkError::ExtraArgumentsAfterTerminal => CommandError::UnexpectedArgument,
        })?;

        if let Some((id, chan)) = &bound_channel {
            bound.args.insert(id.clone(), chan.clone());
            bound
                .channels
                .insert(id.clone(), chan.split(',').map(str::to_owned).collect());
        }

        let mut data = CommandData::new(bound, ctx.state.clone(), ctx.store.clone());

        // Caller and channel context from state.
        if let Some(state) = &ctx.state {
            let state = state.read().await;
            data.user = state.user(msg.nick()).cloned();
            if public {
                data.channel = state.channel(&target).cloned();
                data.user_channel_modes = state.user_modes(&target, msg.nick());
            }
            if let Some((_, chan)) = &bound_channel {
                data.target_channel = state.channel(chan).cloned();
            }
        }

        // Resolve user arguments.
        self.resolve_users(server, &reg, ctx, &mut data).await?;

        // Access checks, channel scope first, then server, then global.
        if let Some((level, flags)) = &reg.auth {
            let store = ctx.store.as_ref().ok_or(CommandError::StoreDisabled)?;
            let access = store
                .authed_user(server, &msg.sender)
                .ok_or_else(|| CommandError::UserNotAuthed(msg.nick().to_owned()))?;
            let chan_scope = if public { Some(target.as_str()) } else { None };
            if access.effective_level(server, chan_scope) < *level {
                return Err(CommandError::InsufficientLevel(*level));
            }
            let missing = access.missing_flags(server, chan_scope, flags);
            if !missing.is_empty() {
                return Err(CommandError::InsufficientFlags(missing));
            }
            data.user_access = Some(access);
        }

        Ok(Some((reg, data)))
    }

    async fn resolve_users(
        &self,
        server: &str,
        reg: &Registered,
        ctx: &CommandContext,
        data: &mut CommandData,
    ) -> Result<(), CommandError> {
        for frag in reg.chain.fragments() {
            if frag.user == UserSlot::None {
                continue;
            }
            match frag.kind {
                FragKind::Single => {
                    let token = match data.args.get(&frag.id) {
                        Some(t) => t.to_owned(),
                        None => continue,
                    };
                    let (user, access) =
                        resolve_user_token(server, &token, frag.user, ctx).await?;
                    if let Some(user) = user {
                        data.target_users.insert(frag.id.clone(), user);
                    }
                    if let Some(access) = access {
                        data.target_user_access.insert(frag.id.clone(), access);
                    }
                }
                FragKind::Variadic => {
                    let values = match data.args.argv.get(&frag.id) {
                        Some(v) => v.clone(),
                        None => continue,
                    };
                    for token in values {
                        let (user, access) =
                            resolve_user_token(server, &token, frag.user, ctx).await?;
                        data.target_var_users.push(user);
                        if let Some(access) = access {
                            data.target_var_user_access.push(access);
                        }
                    }
                }
                FragKind::Terminal => {}
            }
        }
        Ok(())
    }

    /// Spawn the handler task; its error (or panic) never reaches the
    /// read loop.
    fn invoke(
        &self,
        reg: Arc<Registered>,
        msg: Arc<Message>,
        ep: Endpoint,
        mut data: CommandData,
        nick: String,
    ) {
        self.active.begin();
        let active = Arc::clone(&self.active);
        tokio::spawn(async move {
            let run = async {
                if let Some(named) = &reg.named {
                    named(&msg, &ep, &mut data).await
                } else if let Some(generic) = &reg.generic {
                    generic.command(&reg.cmd, &msg, &ep, &mut data).await
                } else {
                    Ok(())
                }
            };
            match AssertUnwindSafe(run).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if !nick.is_empty() {
                        let _ = ep.notice(&nick, &err.to_string()).await;
                    }
                }
                Err(payload) => {
                    error!(
                        command = %reg.cmd,
                        extension = %reg.extension,
                        panic = %panic_text(payload),
                        "command handler panicked; continuing"
                    );
                }
            }
            active.done();
        });
    }
}

/// A resolved user argument: the state user (when a nick was given) and
/// the access record.
type ResolvedUser = (Option<crate::state::User>, Option<crate::data::UserAccess>);

async fn resolve_user_token(
    server: &str,
    token: &str,
    slot: UserSlot,
    ctx: &CommandContext,
) -> Result<ResolvedUser, CommandError> {
    let by_username = |username: String| -> Result<ResolvedUser, CommandError> {
        if username.is_empty() {
            return Err(CommandError::MissingUsername);
        }
        let store = ctx.store.as_ref().ok_or(CommandError::StoreDisabled)?;
        let access = store
            .fetch_user(&username)
            .map_err(|e| CommandError::Failure(e.to_string()))?
            .ok_or(CommandError::UserNotRegistered(username))?;
        Ok((None, Some(access)))
    };

    match slot {
        UserSlot::None => Ok((None, None)),
        UserSlot::Registered => by_username(token.strip_prefix('*').unwrap_or(token).to_owned()),
        UserSlot::NickOrUser => {
            if let Some(username) = token.strip_prefix('*') {
                return by_username(username.to_owned());
            }
            let state = ctx.state.as_ref().ok_or(CommandError::StateDisabled)?;
            let user = state
                .read()
                .await
                .user(token)
                .cloned()
                .ok_or_else(|| CommandError::UserNotFound(token.to_owned()))?;
            let store = ctx.store.as_ref().ok_or(CommandError::StoreDisabled)?;
            let access = store
                .authed_user(server, &user.fullhost())
                .ok_or_else(|| CommandError::UserNotAuthed(token.to_owned()))?;
            Ok((Some(user), Some(access)))
        }
    }
}

#[cfg(test)]
mod tests;
