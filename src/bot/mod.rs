//! The bot supervisor.
//!
//! Owns the dispatcher, the command engine, the store, and one runtime per
//! configured server. Each started server runs a driver task (socket and
//! reconnect machine) plus a pump task that applies core handling in
//! order — capability accumulation, state tracking, registration and PING
//! replies — before fanning the message out to user handlers and the
//! command engine.

mod server;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock as StdRwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use corvid_proto::{names, Message};

use crate::config::{Config, ValidationError};
use crate::conn::provider::default_provider;
use crate::conn::{ConnProvider, Driver, DriverConfig, DriverError};
use crate::data::{Store, StoreError, StoreProvider};
use crate::dispatch::cmd::{CommandContext, CommandSpec, Commander, RegisterError};
use crate::dispatch::{DispatchError, Dispatcher, EventHandler};
use crate::endpoint::Endpoint;

use server::ServerRuntime;

/// Depth of the termination stream returned by [`Bot::start`].
const TERMINATION_DEPTH: usize = 16;

/// Bot-level errors.
#[derive(Debug, Error)]
pub enum BotError {
    /// The configuration failed validation; every problem is listed.
    #[error("invalid configuration: {0:?}")]
    InvalidConfig(Vec<ValidationError>),
    /// An operation named a server the bot does not have.
    #[error("unknown server: {0}")]
    UnknownServer(String),
    /// The connection was torn down by a configuration replacement.
    #[error("connection replaced by configuration reload")]
    ConfigReplaced,
    /// A driver-level failure.
    #[error(transparent)]
    Driver(#[from] DriverError),
    /// A store-level failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One entry on the termination stream: a server reached terminal stop.
#[derive(Debug)]
pub struct ServerTermination {
    /// The server id.
    pub server: String,
    /// Why it stopped.
    pub reason: BotError,
}

/// Injectable collaborators, so the core runs in tests without sockets or
/// disk.
#[derive(Default)]
pub struct Providers {
    /// Connection provider; `None` uses the TCP/TLS dialer from each
    /// server's config.
    pub conn: Option<ConnProvider>,
    /// Store provider; `None` opens redb at the configured storage path.
    pub store: Option<StoreProvider>,
    /// Reconnect timer unit; production default is one second. Tests
    /// shrink it so reconnect flows run in milliseconds.
    pub reconnect_scale: Option<Duration>,
}

struct BotInner {
    config: StdRwLock<Config>,
    servers: Mutex<HashMap<String, Arc<ServerRuntime>>>,
    dispatcher: Arc<Dispatcher>,
    commander: Arc<Commander>,
    store: Option<Arc<Store>>,
    conn_provider: Option<ConnProvider>,
    reconnect_scale: Duration,
    started: AtomicBool,
    running: AtomicUsize,
    term_tx: Mutex<Option<mpsc::Sender<ServerTermination>>>,
}

/// A multi-server IRC bot.
#[derive(Clone)]
pub struct Bot {
    inner: Arc<BotInner>,
}

impl std::fmt::Debug for Bot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bot").finish_non_exhaustive()
    }
}

impl Bot {
    /// Create a bot from a validated config with default providers.
    pub fn create(config: Config) -> Result<Bot, BotError> {
        Self::create_with(config, Providers::default())
    }

    /// Create a bot with injected providers.
    pub fn create_with(mut config: Config, providers: Providers) -> Result<Bot, BotError> {
        if !config.is_valid() {
            return Err(BotError::InvalidConfig(config.errors().to_vec()));
        }

        let store = open_store(&config, &providers.store)?;

        let prefix = config
            .global
            .prefix
            .unwrap_or(crate::config::DEFAULT_PREFIX);
        let dispatcher = Arc::new(Dispatcher::new());
        let commander = Arc::new(Commander::new(prefix));

        let mut servers = HashMap::new();
        for id in config.servers.keys() {
            let settings = config
                .server_settings(id)
                .expect("validated config resolves every server");
            dispatcher.add_server(id);
            servers.insert(id.clone(), ServerRuntime::new(settings));
        }

        Ok(Bot {
            inner: Arc::new(BotInner {
                config: StdRwLock::new(config),
                servers: Mutex::new(servers),
                dispatcher,
                commander,
                store: store.map(Arc::new),
                conn_provider: providers.conn,
                reconnect_scale: providers
                    .reconnect_scale
                    .unwrap_or(Duration::from_secs(1)),
                started: AtomicBool::new(false),
                running: AtomicUsize::new(0),
                term_tx: Mutex::new(None),
            }),
        })
    }

    /// Start every configured server. Returns the termination stream: one
    /// entry per server reaching terminal stop; the stream closes when
    /// every server has stopped.
    pub fn start(&self) -> mpsc::Receiver<ServerTermination> {
        let (tx, rx) = mpsc::channel(TERMINATION_DEPTH);
        *self.inner.term_tx.lock().expect("term lock") = Some(tx);
        self.inner.started.store(true, Ordering::SeqCst);

        let ids: Vec<String> = {
            let servers = self.inner.servers.lock().expect("servers lock");
            servers.keys().cloned().collect()
        };
        for id in ids {
            self.start_server(&id);
        }
        rx
    }

    /// Request orderly shutdown of every server. Idempotent.
    pub fn stop(&self) {
        self.inner.started.store(false, Ordering::SeqCst);
        let servers: Vec<Arc<ServerRuntime>> = {
            let servers = self.inner.servers.lock().expect("servers lock");
            servers.values().cloned().collect()
        };
        for runtime in servers {
            stop_runtime(&runtime);
        }
    }

    /// Start one server. Returns false when the id is unknown or the
    /// server is already started.
    pub fn start_server(&self, id: &str) -> bool {
        let runtime = match self.runtime(id) {
            Some(r) => r,
            None => return false,
        };
        if runtime.started.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.spawn_server(runtime);
        true
    }

    /// Stop one server. Returns false when the id is unknown or the
    /// server is not started.
    pub fn stop_server(&self, id: &str) -> bool {
        let runtime = match self.runtime(id) {
            Some(r) => r,
            None => return false,
        };
        if !runtime.is_started() {
            return false;
        }
        stop_runtime(&runtime);
        true
    }

    /// The write handle for one server.
    pub fn endpoint(&self, id: &str) -> Option<Endpoint> {
        self.runtime(id).map(|r| r.endpoint.clone())
    }

    /// Cancel a server's pending reconnect wait, forcing it to terminal
    /// stop. Returns false when the id is unknown or nothing is running.
    pub fn interrupt_reconnect(&self, id: &str) -> bool {
        match self.runtime(id).and_then(|r| r.current_driver()) {
            Some(driver) => {
                driver.interrupt_reconnect();
                true
            }
            None => false,
        }
    }

    /// Register a global event handler.
    pub fn register(&self, event: &str, handler: Arc<dyn EventHandler>) -> u64 {
        self.inner.dispatcher.register(event, handler)
    }

    /// Unregister a global event handler.
    pub fn unregister(&self, event: &str, id: u64) -> bool {
        self.inner.dispatcher.unregister(event, id)
    }

    /// Register an event handler scoped to one server.
    pub fn register_server(
        &self,
        server: &str,
        event: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<u64, DispatchError> {
        self.inner.dispatcher.register_server(server, event, handler)
    }

    /// Unregister a server-scoped event handler.
    pub fn unregister_server(
        &self,
        server: &str,
        event: &str,
        id: u64,
    ) -> Result<bool, DispatchError> {
        self.inner.dispatcher.unregister_server(server, event, id)
    }

    /// Register a command globally.
    pub fn register_command(&self, spec: CommandSpec) -> Result<(), RegisterError> {
        self.inner.commander.register(None, spec)
    }

    /// Unregister a global command.
    pub fn unregister_command(&self, cmd: &str) -> bool {
        self.inner.commander.unregister(None, cmd)
    }

    /// Register a command for one server.
    pub fn register_server_command(
        &self,
        server: &str,
        spec: CommandSpec,
    ) -> Result<(), RegisterError> {
        self.inner.commander.register(Some(server), spec)
    }

    /// Unregister a server-scoped command.
    pub fn unregister_server_command(&self, server: &str, cmd: &str) -> bool {
        self.inner.commander.unregister(Some(server), cmd)
    }

    /// The command engine, for iteration and handler barriers.
    pub fn commander(&self) -> &Commander {
        &self.inner.commander
    }

    /// The dispatcher, for handler barriers.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// The record store, when enabled.
    pub fn store(&self) -> Option<Arc<Store>> {
        self.inner.store.clone()
    }

    /// A server's state handle, when tracking is enabled.
    pub fn state(&self, id: &str) -> Option<Arc<tokio::sync::RwLock<crate::state::State>>> {
        self.runtime(id).and_then(|r| r.state.clone())
    }

    /// Read the live config under the shared lock.
    pub fn read_config<R>(&self, f: impl FnOnce(&Config) -> R) -> R {
        let config = self.inner.config.read().expect("config lock");
        f(&config)
    }

    /// Mutate the live config under the exclusive lock. Changes are not
    /// applied to running servers; use [`Bot::replace_config`] for that.
    pub fn write_config<R>(&self, f: impl FnOnce(&mut Config) -> R) -> R {
        let mut config = self.inner.config.write().expect("config lock");
        f(&mut config)
    }

    /// Atomically replace the configuration.
    ///
    /// Returns false (changing nothing) when the new config is invalid.
    /// Otherwise: removed servers stop, added servers are created (and
    /// started when the bot is running), servers with changed transport
    /// are rebuilt — their termination is reported as
    /// [`BotError::ConfigReplaced`] — and kept servers get scalar changes
    /// applied in place (a nick change sends NICK, channel changes send
    /// JOIN/PART).
    pub fn replace_config(&self, mut new_config: Config) -> bool {
        if !new_config.is_valid() {
            return false;
        }

        let old_ids: Vec<String> = {
            let servers = self.inner.servers.lock().expect("servers lock");
            servers.keys().cloned().collect()
        };

        for id in &old_ids {
            if new_config.server_settings(id).is_none() {
                info!(server = %id, "config replace: removing server");
                if let Some(runtime) = self.runtime(id) {
                    stop_runtime(&runtime);
                }
                self.inner.dispatcher.remove_server(id);
                self.inner.servers.lock().expect("servers lock").remove(id);
            }
        }

        let new_ids: Vec<String> = new_config.servers.keys().cloned().collect();
        for id in &new_ids {
            let settings = new_config
                .server_settings(id)
                .expect("validated config resolves every server");
            let existing = self.runtime(id);
            match existing {
                None => {
                    info!(server = %id, "config replace: adding server");
                    self.inner.dispatcher.add_server(id);
                    let runtime = ServerRuntime::new(settings);
                    self.inner
                        .servers
                        .lock()
                        .expect("servers lock")
                        .insert(id.clone(), runtime);
                    if self.inner.started.load(Ordering::SeqCst) {
                        self.start_server(id);
                    }
                }
                Some(runtime) => {
                    let old = runtime.settings();
                    if old.transport_changed(&settings) {
                        info!(server = %id, "config replace: rebuilding connection");
                        let was_started = runtime.is_started();
                        runtime.replace_kill.store(true, Ordering::SeqCst);
                        stop_runtime(&runtime);
                        *runtime.settings.lock().expect("settings lock") = settings;
                        if was_started {
                            // Restart with the new transport.
                            runtime.started.store(false, Ordering::SeqCst);
                            self.start_server(id);
                        }
                    } else {
                        let nick_changed = old.nick != settings.nick;
                        let joins: Vec<String> = settings
                            .channels
                            .iter()
                            .filter(|c| !old.channels.contains(c))
                            .cloned()
                            .collect();
                        let parts: Vec<String> = old
                            .channels
                            .iter()
                            .filter(|c| !settings.channels.contains(c))
                            .cloned()
                            .collect();
                        let new_nick = settings.nick.clone();
                        *runtime.settings.lock().expect("settings lock") = settings;
                        let ep = runtime.endpoint.clone();
                        tokio::spawn(async move {
                            if nick_changed {
                                let _ = ep.nick(&new_nick).await;
                            }
                            let joins: Vec<&str> =
                                joins.iter().map(String::as_str).collect();
                            let parts: Vec<&str> =
                                parts.iter().map(String::as_str).collect();
                            let _ = ep.join(&joins).await;
                            let _ = ep.part(&parts).await;
                        });
                    }
                }
            }
        }

        *self.inner.config.write().expect("config lock") = new_config;
        true
    }

    fn runtime(&self, id: &str) -> Option<Arc<ServerRuntime>> {
        self.inner.servers.lock().expect("servers lock").get(id).cloned()
    }

    /// Wire up and launch the driver + pump tasks for one server.
    fn spawn_server(&self, runtime: Arc<ServerRuntime>) {
        let settings = runtime.settings();
        let provider = self
            .inner
            .conn_provider
            .clone()
            .unwrap_or_else(|| default_provider(&settings));
        let driver = Arc::new(Driver::new(
            DriverConfig {
                server_id: settings.id.clone(),
                address: settings.address(),
                reconnect: !settings.no_reconnect,
                reconnect_timeout: settings.reconnect_timeout,
                reconnect_scale: self.inner.reconnect_scale,
            },
            provider,
        ));
        *runtime.driver.lock().expect("driver lock") = Some(driver.clone());
        runtime.writer.set_driver(Some(driver.clone()));

        let (in_tx, mut in_rx) = mpsc::channel::<Message>(64);
        let bot = self.clone();
        let pump_runtime = Arc::clone(&runtime);
        let pump = tokio::spawn(async move {
            while let Some(msg) = in_rx.recv().await {
                bot.pump_message(&pump_runtime, Arc::new(msg)).await;
            }
        });

        self.inner.running.fetch_add(1, Ordering::SeqCst);
        let bot = self.clone();
        let task_runtime = Arc::clone(&runtime);
        tokio::spawn(async move {
            let runtime = task_runtime;
            let reason = driver.run(in_tx).await;
            {
                // A replacement driver may already be installed; only
                // clear ours.
                let mut current = runtime.driver.lock().expect("driver lock");
                if current.as_ref().is_some_and(|d| Arc::ptr_eq(d, &driver)) {
                    *current = None;
                    runtime.writer.set_driver(None);
                    runtime.started.store(false, Ordering::SeqCst);
                }
            }
            let _ = pump.await;

            let reason = if runtime.replace_kill.swap(false, Ordering::SeqCst) {
                BotError::ConfigReplaced
            } else {
                BotError::Driver(reason)
            };
            debug!(server = %runtime.id, reason = %reason, "server terminated");
            bot.report_termination(&runtime.id, reason).await;
        });
    }

    async fn report_termination(&self, id: &str, reason: BotError) {
        let tx = self
            .inner
            .term_tx
            .lock()
            .expect("term lock")
            .clone();
        if let Some(tx) = tx {
            let _ = tx
                .send(ServerTermination {
                    server: id.to_owned(),
                    reason,
                })
                .await;
        }
        if self.inner.running.fetch_sub(1, Ordering::SeqCst) == 1 {
            // Last server down: close the termination stream.
            self.inner.term_tx.lock().expect("term lock").take();
        }
    }

    /// Core handling for one inbound message, in order: registration and
    /// capability bookkeeping, state tracking (awaited before anything
    /// else observes the message), then command evaluation and handler
    /// fan-out.
    async fn pump_message(&self, runtime: &Arc<ServerRuntime>, msg: Arc<Message>) {
        let settings = runtime.settings();
        let ep = runtime.endpoint.clone();

        match msg.name.as_str() {
            names::CONNECT => {
                runtime.altnick_used.store(false, Ordering::SeqCst);
                let userhost = if settings.userhost.is_empty() {
                    "0"
                } else {
                    settings.userhost.as_str()
                };
                let _ = ep.send(&format!("NICK :{}", settings.nick)).await;
                let _ = ep
                    .send(&format!(
                        "USER {} {} * :{}",
                        settings.username, userhost, settings.realname
                    ))
                    .await;
            }
            names::PING => {
                if let Some(token) = msg.args.first() {
                    let _ = ep.send(&format!("PONG :{}", token)).await;
                }
            }
            names::RPL_WELCOME => {
                let channels: Vec<&str> =
                    settings.channels.iter().map(String::as_str).collect();
                let _ = ep.join(&channels).await;
            }
            names::ERR_NICKNAMEINUSE => {
                if !settings.altnick.is_empty()
                    && !runtime.altnick_used.swap(true, Ordering::SeqCst)
                {
                    let _ = ep.send(&format!("NICK :{}", settings.altnick)).await;
                }
            }
            names::RPL_MYINFO => {
                let mut caps = runtime.caps.write().await;
                caps.parse_my_info(&msg);
                if let Some(state) = &runtime.state {
                    state.write().await.refresh_caps(&caps);
                }
            }
            names::RPL_ISUPPORT => {
                let mut caps = runtime.caps.write().await;
                caps.parse_isupport(&msg);
                if let Some(state) = &runtime.state {
                    state.write().await.refresh_caps(&caps);
                }
            }
            _ => {}
        }

        // State mutations are linearized before any dependent handler
        // can observe this message.
        if let Some(state) = &runtime.state {
            state.write().await.update(&msg);
        }

        if msg.name == names::PRIVMSG || msg.name == names::NOTICE {
            let ctx = CommandContext {
                endpoint: ep.clone(),
                caps: runtime.caps.read().await.clone(),
                state: runtime.state.clone(),
                store: self.inner.store.clone(),
            };
            let prefix = if settings.prefix == self.inner.commander.prefix() {
                None
            } else {
                Some(settings.prefix)
            };
            if let Err(err) = self
                .inner
                .commander
                .dispatch(&runtime.id, prefix, Arc::clone(&msg), &ctx)
                .await
            {
                debug!(server = %runtime.id, error = %err, "command rejected");
            }
        }

        self.inner.dispatcher.dispatch(&runtime.id, msg, ep);
    }
}

fn stop_runtime(runtime: &Arc<ServerRuntime>) {
    if let Some(driver) = runtime.current_driver() {
        driver.stop();
    }
    runtime.started.store(false, Ordering::SeqCst);
}

fn open_store(
    config: &Config,
    provider: &Option<StoreProvider>,
) -> Result<Option<Store>, BotError> {
    let path = match &config.storage {
        Some(path) => path.clone(),
        None => return Ok(None),
    };
    let required = config
        .servers
        .keys()
        .filter_map(|id| config.server_settings(id))
        .any(|s| !s.no_store);

    let result = match provider {
        Some(provider) => provider(&path),
        None => Store::open(&path),
    };
    match result {
        Ok(store) => Ok(Some(store)),
        Err(err) if required => Err(BotError::Store(err)),
        Err(err) => {
            warn!(error = %err, "store provider failed; continuing without records");
            Ok(None)
        }
    }
}
