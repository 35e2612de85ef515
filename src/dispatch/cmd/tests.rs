use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::RwLock;

use corvid_proto::{names, Message, ProtoCaps};

use crate::data::{Store, UserAccess};
use crate::endpoint::{BufferWriter, Endpoint};
use crate::state::State;

use super::*;

const SERVER: &str = "irc.test.net";
const HOST: &str = "nick!user@host";
const SELF_HOST: &str = "bot!corvid@corvid.host";
const CHANNEL: &str = "#chan";
const EXT: &str = "extension";
const DSC: &str = "description";
const CMD: &str = "cmd";
const PREFIX: char = '.';

/// Records everything handed to the handler for assertions.
#[derive(Default)]
struct Captured {
    called: bool,
    cmd: String,
    args: std::collections::HashMap<String, String>,
    had_user: bool,
    had_access: bool,
    had_chan_modes: bool,
    had_channel: bool,
    had_target_channel: bool,
    target_users: Vec<String>,
    target_access: Vec<String>,
    var_users: Vec<bool>,
    var_access_len: usize,
    had_state: bool,
    had_store: bool,
}

struct CapturingHandler {
    captured: Arc<Mutex<Captured>>,
    error: Option<CommandError>,
}

impl CapturingHandler {
    fn new() -> (Arc<Self>, Arc<Mutex<Captured>>) {
        let captured = Arc::new(Mutex::new(Captured::default()));
        (
            Arc::new(CapturingHandler {
                captured: Arc::clone(&captured),
                error: None,
            }),
            captured,
        )
    }

    fn failing(error: CommandError) -> Arc<Self> {
        Arc::new(CapturingHandler {
            captured: Arc::new(Mutex::new(Captured::default())),
            error: Some(error),
        })
    }
}

#[async_trait]
impl CommandHandler for CapturingHandler {
    async fn command(
        &self,
        cmd: &str,
        _msg: &Message,
        _ep: &Endpoint,
        data: &mut CommandData,
    ) -> Result<(), CommandError> {
        let mut cap = self.captured.lock().unwrap();
        cap.called = true;
        cap.cmd = cmd.to_owned();
        cap.args = data.args.args.clone();
        cap.had_user = data.user.is_some();
        cap.had_access = data.user_access.is_some();
        cap.had_chan_modes = data.user_channel_modes.is_some();
        cap.had_channel = data.channel.is_some();
        cap.had_target_channel = data.target_channel.is_some();
        cap.target_users = data.target_users.keys().cloned().collect();
        cap.target_access = data.target_user_access.keys().cloned().collect();
        cap.var_users = data.target_var_users.iter().map(Option::is_some).collect();
        cap.var_access_len = data.target_var_user_access.len();
        cap.had_state = data.state.is_some();
        cap.had_store = data.store.is_some();
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

fn state() -> Arc<RwLock<State>> {
    let mut s = State::new(&ProtoCaps::new());
    s.update(&Message::new(names::RPL_WELCOME, SERVER, &["bot", "Welcome"]));
    s.update(&Message::new(names::JOIN, SELF_HOST, &[CHANNEL]));
    s.update(&Message::new(names::JOIN, HOST, &[CHANNEL]));
    Arc::new(RwLock::new(s))
}

fn store_with_auth() -> Arc<Store> {
    let store = Store::in_memory();
    let mut user = UserAccess::with_cost("user", "pass", 4).unwrap();
    user.add_masks(&["*!*@host"]);
    store.add_user(user).unwrap();
    store.auth_user(SERVER, HOST, "user", "pass").unwrap();
    Arc::new(store)
}

fn context(
    state: Option<Arc<RwLock<State>>>,
    store: Option<Arc<Store>>,
) -> (CommandContext, Arc<BufferWriter>) {
    let buffer = BufferWriter::new(SERVER);
    (
        CommandContext {
            endpoint: Endpoint::new(buffer.clone()),
            caps: ProtoCaps::new(),
            state,
            store,
        },
        buffer,
    )
}

fn spec(args: &[&str]) -> (CommandSpec, Arc<Mutex<Captured>>) {
    let (handler, captured) = CapturingHandler::new();
    (
        CommandSpec::new(EXT, DSC, CMD, MsgType::All, Scope::All)
            .args(args)
            .handler(handler),
        captured,
    )
}

fn privmsg(target: &str, body: &str) -> Arc<Message> {
    Arc::new(Message::new(names::PRIVMSG, HOST, &[target, body]))
}

#[test]
fn registration_validation() {
    let c = Commander::new(PREFIX);
    let (handler, _) = CapturingHandler::new();

    let no_handler = CommandSpec::new(EXT, DSC, CMD, MsgType::All, Scope::All);
    assert_eq!(
        c.register(None, no_handler).unwrap_err(),
        RegisterError::HandlerRequired
    );

    let blank_cmd = CommandSpec::new(EXT, DSC, "", MsgType::All, Scope::All)
        .handler(handler.clone());
    assert_eq!(
        c.register(None, blank_cmd).unwrap_err(),
        RegisterError::CmdRequired
    );

    let blank_ext = CommandSpec::new("", DSC, CMD, MsgType::All, Scope::All)
        .handler(handler.clone());
    assert_eq!(
        c.register(None, blank_ext).unwrap_err(),
        RegisterError::ExtensionRequired
    );

    let blank_dsc = CommandSpec::new(EXT, "", CMD, MsgType::All, Scope::All)
        .handler(handler.clone());
    assert_eq!(
        c.register(None, blank_dsc).unwrap_err(),
        RegisterError::DescriptionRequired
    );

    let bad_args = CommandSpec::new(EXT, DSC, CMD, MsgType::All, Scope::All)
        .args(&["!!!"])
        .handler(handler.clone());
    assert!(matches!(
        c.register(None, bad_args).unwrap_err(),
        RegisterError::Fragment(_)
    ));

    let ok = CommandSpec::new(EXT, DSC, CMD, MsgType::All, Scope::All).handler(handler.clone());
    c.register(None, ok.clone()).unwrap();

    assert_eq!(
        c.register(None, ok.clone()).unwrap_err(),
        RegisterError::DuplicateCommand(CMD.to_owned())
    );
    // Collisions are rejected across scopes too.
    assert_eq!(
        c.register(Some("otherserv"), ok).unwrap_err(),
        RegisterError::DuplicateCommand(CMD.to_owned())
    );

    assert!(c.unregister(None, CMD));
    assert!(!c.unregister(None, CMD));
}

#[tokio::test]
async fn dispatch_table() {
    struct Case {
        args: &'static [&'static str],
        msg_type: MsgType,
        scope: Scope,
        name: &'static str,
        msg_args: [&'static str; 2],
        called: bool,
        err: bool,
    }
    let cases = [
        // Argument shapes.
        Case { args: &[], msg_type: MsgType::All, scope: Scope::All, name: names::PRIVMSG, msg_args: ["nick", ""], called: false, err: false },
        Case { args: &[], msg_type: MsgType::All, scope: Scope::All, name: names::PRIVMSG, msg_args: ["nick", "cmd"], called: true, err: false },
        Case { args: &[], msg_type: MsgType::All, scope: Scope::All, name: names::PRIVMSG, msg_args: ["nick", "not a command"], called: false, err: false },
        Case { args: &[], msg_type: MsgType::All, scope: Scope::All, name: names::PRIVMSG, msg_args: ["nick", "cmd arg1 arg2"], called: false, err: true },
        Case { args: &["[opt]"], msg_type: MsgType::All, scope: Scope::All, name: names::PRIVMSG, msg_args: ["nick", "cmd"], called: true, err: false },
        Case { args: &["[opt]", "opts..."], msg_type: MsgType::All, scope: Scope::All, name: names::PRIVMSG, msg_args: ["nick", "cmd arg1 arg2 arg3 arg4"], called: true, err: false },
        Case { args: &["arg"], msg_type: MsgType::All, scope: Scope::All, name: names::PRIVMSG, msg_args: ["nick", "cmd"], called: false, err: true },
        Case { args: &["arg"], msg_type: MsgType::All, scope: Scope::All, name: names::PRIVMSG, msg_args: ["nick", "cmd arg1 arg2"], called: false, err: true },
        Case { args: &["arg", "[opt]"], msg_type: MsgType::All, scope: Scope::All, name: names::PRIVMSG, msg_args: ["nick", "cmd arg1 arg2"], called: true, err: false },
        Case { args: &["arg", "opts..."], msg_type: MsgType::All, scope: Scope::All, name: names::PRIVMSG, msg_args: ["nick", "cmd"], called: false, err: true },
        Case { args: &["arg", "opts..."], msg_type: MsgType::All, scope: Scope::All, name: names::PRIVMSG, msg_args: ["nick", "cmd arg1 arg2 arg3"], called: true, err: false },
        // Channel arguments.
        Case { args: &["#chan", "arg"], msg_type: MsgType::All, scope: Scope::All, name: names::PRIVMSG, msg_args: [CHANNEL, ".cmd arg1"], called: true, err: false },
        Case { args: &["#chan", "arg"], msg_type: MsgType::All, scope: Scope::All, name: names::PRIVMSG, msg_args: [CHANNEL, ".cmd arg1 #chan"], called: false, err: true },
        Case { args: &["#chan", "arg"], msg_type: MsgType::All, scope: Scope::All, name: names::PRIVMSG, msg_args: [CHANNEL, ".cmd"], called: false, err: true },
        Case { args: &["#chan", "arg"], msg_type: MsgType::All, scope: Scope::All, name: names::PRIVMSG, msg_args: [CHANNEL, ".cmd #chan arg1"], called: true, err: false },
        Case { args: &["#chan", "arg"], msg_type: MsgType::All, scope: Scope::All, name: names::PRIVMSG, msg_args: ["nick", "cmd arg1"], called: false, err: true },
        Case { args: &["#chan", "arg"], msg_type: MsgType::All, scope: Scope::All, name: names::PRIVMSG, msg_args: ["nick", "cmd #chan arg1"], called: true, err: false },
        // Non-command events and unknown channels are ignored.
        Case { args: &[], msg_type: MsgType::All, scope: Scope::All, name: names::RPL_WHOREPLY, msg_args: [CHANNEL, ".cmd"], called: false, err: false },
        Case { args: &[], msg_type: MsgType::All, scope: Scope::All, name: names::PRIVMSG, msg_args: ["#otherchan", ".cmd"], called: false, err: false },
        // Message type and scope filtering.
        Case { args: &[], msg_type: MsgType::All, scope: Scope::All, name: names::PRIVMSG, msg_args: [CHANNEL, ".cmd"], called: true, err: false },
        Case { args: &[], msg_type: MsgType::All, scope: Scope::Private, name: names::PRIVMSG, msg_args: ["nick", "cmd"], called: true, err: false },
        Case { args: &[], msg_type: MsgType::All, scope: Scope::Private, name: names::PRIVMSG, msg_args: [CHANNEL, ".cmd"], called: false, err: false },
        Case { args: &[], msg_type: MsgType::All, scope: Scope::Public, name: names::PRIVMSG, msg_args: ["nick", "cmd"], called: false, err: false },
        Case { args: &[], msg_type: MsgType::All, scope: Scope::Public, name: names::PRIVMSG, msg_args: [CHANNEL, ".cmd"], called: true, err: false },
        Case { args: &[], msg_type: MsgType::Privmsg, scope: Scope::All, name: names::PRIVMSG, msg_args: [CHANNEL, ".cmd"], called: true, err: false },
        Case { args: &[], msg_type: MsgType::Privmsg, scope: Scope::All, name: names::NOTICE, msg_args: [CHANNEL, ".cmd"], called: false, err: false },
        Case { args: &[], msg_type: MsgType::Notice, scope: Scope::All, name: names::NOTICE, msg_args: [CHANNEL, ".cmd"], called: true, err: false },
        Case { args: &[], msg_type: MsgType::Notice, scope: Scope::All, name: names::PRIVMSG, msg_args: [CHANNEL, ".cmd"], called: false, err: false },
    ];

    let state = state();
    for (i, case) in cases.iter().enumerate() {
        let c = Commander::new(PREFIX);
        let (ctx, buffer) = context(Some(Arc::clone(&state)), None);
        let (handler, captured) = CapturingHandler::new();
        c.register(
            None,
            CommandSpec::new(EXT, DSC, CMD, case.msg_type, case.scope)
                .args(case.args)
                .handler(handler),
        )
        .unwrap();

        let msg = Arc::new(Message::new(
            case.name,
            HOST,
            &[case.msg_args[0], case.msg_args[1]],
        ));
        let result = c.dispatch(SERVER, None, msg, &ctx).await;
        c.wait_for_handlers().await;

        let cap = captured.lock().unwrap();
        assert_eq!(cap.called, case.called, "case {i}: called mismatch");
        assert_eq!(result.is_err(), case.err, "case {i}: error mismatch: {result:?}");
        if case.err {
            let lines = buffer.lines();
            assert_eq!(lines.len(), 1, "case {i}: expected an error NOTICE");
            assert!(
                lines[0].starts_with("NOTICE nick :"),
                "case {i}: error goes to the caller nick: {}",
                lines[0]
            );
        }
        if cap.called {
            assert_eq!(cap.cmd, CMD, "case {i}");
            assert!(cap.had_user, "case {i}: caller user from state");
            assert!(!cap.had_access, "case {i}: permless commands skip access");
            assert!(cap.had_state, "case {i}");
            assert!(!cap.had_store, "case {i}");
            if case.msg_args[0] == CHANNEL {
                assert!(cap.had_channel, "case {i}: channel from state");
                assert!(cap.had_chan_modes, "case {i}: channel modes from state");
            }
        }
    }
}

#[tokio::test]
async fn channel_argument_binding() {
    let c = Commander::new(PREFIX);
    let state = state();
    let (ctx, _buffer) = context(Some(Arc::clone(&state)), None);
    let (cmd_spec, captured) = spec(&["#channelArg"]);
    c.register(None, cmd_spec).unwrap();

    // Implicit channel from the target.
    c.dispatch(SERVER, None, privmsg(CHANNEL, ".cmd"), &ctx)
        .await
        .unwrap();
    c.wait_for_handlers().await;
    {
        let cap = captured.lock().unwrap();
        assert!(cap.had_target_channel);
        assert_eq!(cap.args.get("channelArg").map(String::as_str), Some(CHANNEL));
    }

    // Explicit channel overrides.
    c.dispatch(SERVER, None, privmsg(CHANNEL, ".cmd #chan"), &ctx)
        .await
        .unwrap();
    c.wait_for_handlers().await;
    assert_eq!(
        captured.lock().unwrap().args.get("channelArg").map(String::as_str),
        Some(CHANNEL)
    );

    // Private requires the explicit argument.
    let err = c
        .dispatch(SERVER, None, privmsg("nick", "cmd"), &ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::NArguments { .. }));

    // Too many arguments counts the channel slot.
    let err = c
        .dispatch(SERVER, None, privmsg(CHANNEL, ".cmd #chan arg"), &ctx)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CommandError::at_most(1, "#channelArg"),
        "explicit channel counts toward the limit"
    );

    // Private with a non-channel token.
    c.unregister(None, CMD);
    let (cmd_spec, _) = spec(&["#chan", "arg"]);
    c.register(None, cmd_spec).unwrap();
    let err = c
        .dispatch(SERVER, None, privmsg("nick", "cmd arg1"), &ctx)
        .await
        .unwrap_err();
    assert_eq!(err, CommandError::ArgumentNotChannel);
}

#[tokio::test]
async fn channel_argument_needs_state() {
    let c = Commander::new(PREFIX);
    let store = store_with_auth();
    let (ctx, _) = context(None, Some(store));
    let (cmd_spec, _) = spec(&["#chan"]);
    c.register(None, cmd_spec).unwrap();

    // Without state the channel cannot be resolved, but binding still
    // succeeds; target_channel is simply absent.
    c.dispatch(SERVER, None, privmsg("nick", "cmd #chan"), &ctx)
        .await
        .unwrap();
    c.wait_for_handlers().await;
}

#[tokio::test]
async fn authorization_table() {
    struct Case {
        sender: &'static str,
        level: u8,
        flags: &'static str,
        called: bool,
        err_contains: Option<&'static str>,
    }
    let cases = [
        Case { sender: HOST, level: 250, flags: "a", called: false, err_contains: Some("level 250") },
        Case { sender: HOST, level: 100, flags: "ab", called: false, err_contains: Some("flags [b]") },
        Case { sender: "nick!user@diffhost", level: 100, flags: "a", called: false, err_contains: Some("not authenticated") },
        Case { sender: "nick!user@diffhost", level: 0, flags: "", called: false, err_contains: Some("not authenticated") },
        Case { sender: HOST, level: 100, flags: "a", called: true, err_contains: None },
        Case { sender: HOST, level: 0, flags: "", called: true, err_contains: None },
    ];

    let state = state();
    let store = store_with_auth();
    {
        let mut user = store.fetch_user("user").unwrap().unwrap();
        user.grant_global(100, "a");
        store.add_user(user).unwrap();
    }

    for (i, case) in cases.iter().enumerate() {
        let c = Commander::new(PREFIX);
        let (ctx, buffer) = context(Some(Arc::clone(&state)), Some(Arc::clone(&store)));
        let (handler, captured) = CapturingHandler::new();
        c.register(
            None,
            CommandSpec::new(EXT, DSC, CMD, MsgType::All, Scope::All)
                .auth(case.level, case.flags)
                .handler(handler),
        )
        .unwrap();

        let body = format!("{PREFIX}{CMD}");
        let msg = Arc::new(Message::new(
            names::PRIVMSG,
            case.sender,
            &[CHANNEL, body.as_str()],
        ));
        let result = c.dispatch(SERVER, None, msg, &ctx).await;
        c.wait_for_handlers().await;

        let cap = captured.lock().unwrap();
        assert_eq!(cap.called, case.called, "case {i}");
        match case.err_contains {
            Some(text) => {
                let err = result.expect_err("expected access failure");
                assert!(
                    err.to_string().contains(text),
                    "case {i}: {err} should contain {text:?}"
                );
                let lines = buffer.lines();
                assert!(
                    lines[0].contains(text),
                    "case {i}: NOTICE should contain {text:?}: {}",
                    lines[0]
                );
            }
            None => {
                result.unwrap();
                assert!(cap.had_access, "case {i}: access record provided");
                assert!(cap.had_store, "case {i}");
            }
        }
    }
}

#[tokio::test]
async fn user_argument_resolution() {
    let c = Commander::new(PREFIX);
    let state = state();
    let store = store_with_auth();
    let (ctx, _) = context(Some(Arc::clone(&state)), Some(Arc::clone(&store)));
    let (cmd_spec, captured) = spec(&["*user1", "~user2", "[*user3]", "~users..."]);
    c.register(None, cmd_spec).unwrap();

    // Username + nick.
    c.dispatch(SERVER, None, privmsg("nick", "cmd user nick"), &ctx)
        .await
        .unwrap();
    c.wait_for_handlers().await;
    {
        let cap = captured.lock().unwrap();
        assert!(cap.target_access.contains(&"user1".to_owned()));
        assert!(cap.target_users.contains(&"user2".to_owned()));
        assert!(cap.target_access.contains(&"user2".to_owned()));
    }

    // Star-prefixed username, optional third slot, variadic tail.
    c.dispatch(
        SERVER,
        None,
        privmsg("nick", "cmd *user nick *user nick nick"),
        &ctx,
    )
    .await
    .unwrap();
    c.wait_for_handlers().await;
    {
        let cap = captured.lock().unwrap();
        assert!(cap.target_access.contains(&"user1".to_owned()));
        assert!(cap.target_access.contains(&"user3".to_owned()));
        assert_eq!(cap.var_users, vec![true, true], "nick entries carry users");
        assert_eq!(cap.var_access_len, 2);
    }
}

#[tokio::test]
async fn variadic_username_entries_have_no_user() {
    let c = Commander::new(PREFIX);
    let state = state();
    let store = store_with_auth();
    let (ctx, _) = context(Some(state), Some(store));
    let (cmd_spec, captured) = spec(&["~users..."]);
    c.register(None, cmd_spec).unwrap();

    c.dispatch(SERVER, None, privmsg("nick", "cmd *user nick"), &ctx)
        .await
        .unwrap();
    c.wait_for_handlers().await;
    let cap = captured.lock().unwrap();
    assert_eq!(cap.var_users, vec![false, true]);
    assert_eq!(cap.var_access_len, 2);
}

#[tokio::test]
async fn user_resolution_errors() {
    let c = Commander::new(PREFIX);
    let state = state();
    let store = store_with_auth();
    let (ctx, _) = context(Some(Arc::clone(&state)), Some(Arc::clone(&store)));
    let (cmd_spec, _) = spec(&["*user1", "~user2"]);
    c.register(None, cmd_spec).unwrap();

    let err = c
        .dispatch(SERVER, None, privmsg("nick", "cmd *baduser nick"), &ctx)
        .await
        .unwrap_err();
    assert_eq!(err, CommandError::UserNotRegistered("baduser".into()));

    let err = c
        .dispatch(SERVER, None, privmsg("nick", "cmd * nick"), &ctx)
        .await
        .unwrap_err();
    assert_eq!(err, CommandError::MissingUsername);

    let err = c
        .dispatch(SERVER, None, privmsg("nick", "cmd user bot"), &ctx)
        .await
        .unwrap_err();
    assert_eq!(err, CommandError::UserNotAuthed("bot".into()));

    let err = c
        .dispatch(SERVER, None, privmsg("nick", "cmd user badnick"), &ctx)
        .await
        .unwrap_err();
    assert_eq!(err, CommandError::UserNotFound("badnick".into()));

    // Store-less and state-less contexts fail with the disabled errors.
    let (no_store, _) = context(Some(Arc::clone(&state)), None);
    let err = c
        .dispatch(SERVER, None, privmsg("nick", "cmd user nick"), &no_store)
        .await
        .unwrap_err();
    assert_eq!(err, CommandError::StoreDisabled);

    let (no_state, _) = context(None, Some(Arc::clone(&store)));
    let err = c
        .dispatch(SERVER, None, privmsg("nick", "cmd user nick"), &no_state)
        .await
        .unwrap_err();
    assert_eq!(err, CommandError::StateDisabled);
}

#[tokio::test]
async fn auth_without_store_is_store_disabled() {
    let c = Commander::new(PREFIX);
    let (ctx, _) = context(None, None);
    let (handler, _) = CapturingHandler::new();
    c.register(
        None,
        CommandSpec::new(EXT, DSC, CMD, MsgType::All, Scope::All)
            .auth(100, "a")
            .handler(handler),
    )
    .unwrap();

    let err = c
        .dispatch(SERVER, None, privmsg("nick", "cmd"), &ctx)
        .await
        .unwrap_err();
    assert_eq!(err, CommandError::StoreDisabled);
}

#[tokio::test]
async fn handler_errors_are_noticed() {
    let errors = [
        CommandError::InsufficientGlobalLevel(100),
        CommandError::InsufficientServerLevel(100),
        CommandError::InsufficientChannelLevel(100),
        CommandError::InsufficientGlobalFlags("a".into()),
        CommandError::InsufficientServerFlags("a".into()),
        CommandError::InsufficientChannelFlags("a".into()),
        CommandError::UserNotAuthed("user".into()),
        CommandError::UserNotFound("user".into()),
        CommandError::UserNotRegistered("user".into()),
        CommandError::Failure("handler-specific failure".into()),
    ];

    for err in errors {
        let c = Commander::new(PREFIX);
        let (ctx, buffer) = context(None, None);
        c.register(
            None,
            CommandSpec::new(EXT, DSC, CMD, MsgType::All, Scope::All)
                .handler(CapturingHandler::failing(err.clone())),
        )
        .unwrap();

        c.dispatch(SERVER, None, privmsg("nick", "cmd"), &ctx)
            .await
            .unwrap();
        c.wait_for_handlers().await;

        let lines = buffer.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0], format!("NOTICE nick :{err}"));
    }
}

#[tokio::test]
async fn named_callback_takes_precedence() {
    let c = Commander::new(PREFIX);
    let (ctx, _) = context(None, None);
    let named_called = Arc::new(AtomicBool::new(false));
    let (generic, captured) = CapturingHandler::new();

    let flag = Arc::clone(&named_called);
    let named: NamedFn = Arc::new(move |_msg, _ep, _data| {
        let flag = Arc::clone(&flag);
        Box::pin(async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })
    });

    c.register(
        None,
        CommandSpec::new(EXT, DSC, CMD, MsgType::All, Scope::All)
            .handler(generic)
            .named(named),
    )
    .unwrap();

    c.dispatch(SERVER, None, privmsg("nick", "cmd"), &ctx)
        .await
        .unwrap();
    c.wait_for_handlers().await;

    assert!(named_called.load(Ordering::SeqCst));
    assert!(!captured.lock().unwrap().called, "generic must not run");
}

#[tokio::test]
async fn generic_fallback_without_named() {
    let c = Commander::new(PREFIX);
    let (ctx, _) = context(None, None);
    let (generic, captured) = CapturingHandler::new();
    c.register(
        None,
        CommandSpec::new(EXT, DSC, CMD, MsgType::All, Scope::All).handler(generic),
    )
    .unwrap();

    c.dispatch(SERVER, None, privmsg("nick", "cmd"), &ctx)
        .await
        .unwrap();
    c.wait_for_handlers().await;
    let cap = captured.lock().unwrap();
    assert!(cap.called);
    assert_eq!(cap.cmd, CMD);
}

#[tokio::test]
async fn prefix_override() {
    let c = Commander::new(PREFIX);
    let state = state();
    let (ctx, _) = context(Some(state), None);
    let (cmd_spec, captured) = spec(&[]);
    c.register(None, cmd_spec).unwrap();

    let reset = || captured.lock().unwrap().called = false;

    c.dispatch(SERVER, None, privmsg(CHANNEL, ".cmd"), &ctx)
        .await
        .unwrap();
    c.wait_for_handlers().await;
    assert!(captured.lock().unwrap().called, "default prefix");

    reset();
    c.dispatch(SERVER, Some('!'), privmsg(CHANNEL, ".cmd"), &ctx)
        .await
        .unwrap();
    c.wait_for_handlers().await;
    assert!(!captured.lock().unwrap().called, "override replaces default");

    reset();
    c.dispatch(SERVER, Some('!'), privmsg(CHANNEL, "!cmd"), &ctx)
        .await
        .unwrap();
    c.wait_for_handlers().await;
    assert!(captured.lock().unwrap().called, "override prefix matches");

    reset();
    c.dispatch(SERVER, Some('!'), privmsg(CHANNEL, ":cmd"), &ctx)
        .await
        .unwrap();
    c.wait_for_handlers().await;
    assert!(!captured.lock().unwrap().called, "wrong rune stays silent");
}

#[tokio::test]
async fn each_command_visits_until_stopped() {
    let c = Commander::new(PREFIX);
    let (h1, _) = CapturingHandler::new();
    let (h2, _) = CapturingHandler::new();
    c.register(
        None,
        CommandSpec::new(EXT, DSC, CMD, MsgType::All, Scope::All).handler(h1),
    )
    .unwrap();
    c.register(
        None,
        CommandSpec::new(EXT, DSC, "other", MsgType::All, Scope::All).handler(h2),
    )
    .unwrap();

    let mut visited = Vec::new();
    c.each_command(|info| {
        visited.push(info.cmd.clone());
        false
    });
    visited.sort();
    assert_eq!(visited, vec!["cmd".to_owned(), "other".to_owned()]);

    let mut count = 0;
    c.each_command(|_| {
        count += 1;
        true
    });
    assert_eq!(count, 1, "visitor returning true stops iteration");
}

#[tokio::test]
async fn panicking_handler_is_contained() {
    struct PanicHandler;

    #[async_trait]
    impl CommandHandler for PanicHandler {
        async fn command(
            &self,
            _cmd: &str,
            _msg: &Message,
            _ep: &Endpoint,
            _data: &mut CommandData,
        ) -> Result<(), CommandError> {
            panic!("command panic");
        }
    }

    let c = Commander::new(PREFIX);
    let (ctx, buffer) = context(None, None);
    c.register(
        None,
        CommandSpec::new("panic", "panic desc", "panic", MsgType::All, Scope::All)
            .handler(Arc::new(PanicHandler)),
    )
    .unwrap();

    c.dispatch(SERVER, None, privmsg("nick", "panic"), &ctx)
        .await
        .unwrap();
    c.wait_for_handlers().await;
    assert!(buffer.lines().is_empty(), "panics are logged, not NOTICEd");
}

#[tokio::test]
async fn server_scoped_commands() {
    let c = Commander::new(PREFIX);
    let (ctx, _) = context(None, None);
    let (handler, captured) = CapturingHandler::new();
    c.register(
        Some(SERVER),
        CommandSpec::new(EXT, DSC, CMD, MsgType::All, Scope::All).handler(handler),
    )
    .unwrap();

    c.dispatch("other.net", None, privmsg("nick", "cmd"), &ctx)
        .await
        .unwrap();
    c.wait_for_handlers().await;
    assert!(!captured.lock().unwrap().called, "wrong server");

    c.dispatch(SERVER, None, privmsg("nick", "cmd"), &ctx)
        .await
        .unwrap();
    c.wait_for_handlers().await;
    assert!(captured.lock().unwrap().called);

    assert!(c.unregister(Some(SERVER), CMD));
}
