//! Event dispatch: fan incoming messages out to registered handlers.
//!
//! Handlers register globally or per server; a delivery visits the global
//! table first, then the server table. Every handler invocation runs as its
//! own task so one slow handler never stalls the read loop; panics are
//! caught and logged. [`Dispatcher::wait_for_handlers`] is the barrier that
//! joins all in-flight invocations, used by tests and ordered shutdown.

pub mod cmd;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{error, trace};

use corvid_proto::{names, Message};

use crate::endpoint::Endpoint;

/// Dispatcher errors.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// A per-server registration named a server the dispatcher does not
    /// know.
    #[error("unknown server: {0}")]
    UnknownServer(String),
}

/// An event handler. Implementations are shared across deliveries, so any
/// mutable state belongs behind the implementor's own synchronization.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one message. `ep` writes back to the server the message
    /// arrived on.
    async fn handle(&self, msg: Arc<Message>, ep: Endpoint);
}

type HandlerEntry = (u64, Arc<dyn EventHandler>);
type EventTable = HashMap<String, Vec<HandlerEntry>>;

#[derive(Default)]
struct Tables {
    global: EventTable,
    servers: HashMap<String, EventTable>,
}

/// Tracks in-flight handler tasks so the barrier can join them.
#[derive(Default)]
pub(crate) struct ActiveCounter {
    count: AtomicUsize,
    notify: Notify,
}

impl ActiveCounter {
    pub(crate) fn begin(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn done(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify.notify_waiters();
        }
    }

    pub(crate) async fn wait(&self) {
        loop {
            // Register before the check so a wakeup between check and
            // await is not lost (notify_waiters stores no permit).
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Render a panic payload for logging.
pub(crate) fn panic_text(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// The event dispatcher.
pub struct Dispatcher {
    tables: Mutex<Tables>,
    next_id: AtomicU64,
    active: Arc<ActiveCounter>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// An empty dispatcher.
    pub fn new() -> Self {
        Dispatcher {
            tables: Mutex::new(Tables::default()),
            next_id: AtomicU64::new(1),
            active: Arc::new(ActiveCounter::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().expect("dispatcher table lock")
    }

    /// Make a server known so per-server registrations are accepted.
    pub(crate) fn add_server(&self, server: &str) {
        self.lock().servers.entry(server.to_owned()).or_default();
    }

    /// Forget a server and its handler table.
    pub(crate) fn remove_server(&self, server: &str) {
        self.lock().servers.remove(server);
    }

    /// Register a global handler for an event name. Returns the handler
    /// id for [`Dispatcher::unregister`].
    pub fn register(&self, event: &str, handler: Arc<dyn EventHandler>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .global
            .entry(event.to_ascii_uppercase())
            .or_default()
            .push((id, handler));
        id
    }

    /// Remove a global handler. Ids never cross scope: a server-scoped id
    /// is not found here.
    pub fn unregister(&self, event: &str, id: u64) -> bool {
        let mut tables = self.lock();
        match tables.global.get_mut(&event.to_ascii_uppercase()) {
            Some(list) => {
                let before = list.len();
                list.retain(|(hid, _)| *hid != id);
                before != list.len()
            }
            None => false,
        }
    }

    /// Register a handler scoped to one server.
    pub fn register_server(
        &self,
        server: &str,
        event: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<u64, DispatchError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut tables = self.lock();
        let table = tables
            .servers
            .get_mut(server)
            .ok_or_else(|| DispatchError::UnknownServer(server.to_owned()))?;
        table
            .entry(event.to_ascii_uppercase())
            .or_default()
            .push((id, handler));
        Ok(id)
    }

    /// Remove a server-scoped handler.
    pub fn unregister_server(
        &self,
        server: &str,
        event: &str,
        id: u64,
    ) -> Result<bool, DispatchError> {
        let mut tables = self.lock();
        let table = tables
            .servers
            .get_mut(server)
            .ok_or_else(|| DispatchError::UnknownServer(server.to_owned()))?;
        Ok(match table.get_mut(&event.to_ascii_uppercase()) {
            Some(list) => {
                let before = list.len();
                list.retain(|(hid, _)| *hid != id);
                before != list.len()
            }
            None => false,
        })
    }

    /// Deliver a message: gather the handlers for its name plus `RAW`, in
    /// global-then-server order, and spawn one task per handler. Dispatch
    /// order is preserved (tasks are spawned serially); completion order is
    /// not.
    pub fn dispatch(&self, server: &str, msg: Arc<Message>, ep: Endpoint) {
        let event = msg.name.to_ascii_uppercase();
        let handlers: Vec<HandlerEntry> = {
            let tables = self.lock();
            let mut gathered = Vec::new();
            for name in [event.as_str(), names::RAW] {
                if name == names::RAW && event == names::RAW {
                    continue;
                }
                if let Some(list) = tables.global.get(name) {
                    gathered.extend(list.iter().cloned());
                }
                if let Some(list) = tables.servers.get(server).and_then(|t| t.get(name)) {
                    gathered.extend(list.iter().cloned());
                }
            }
            gathered
        };

        trace!(server = %server, event = %event, handlers = handlers.len(), "dispatch");
        for (id, handler) in handlers {
            self.active.begin();
            let active = Arc::clone(&self.active);
            let msg = Arc::clone(&msg);
            let ep = ep.clone();
            let event = event.clone();
            tokio::spawn(async move {
                let result = AssertUnwindSafe(handler.handle(msg, ep))
                    .catch_unwind()
                    .await;
                if let Err(payload) = result {
                    error!(
                        event = %event,
                        handler = id,
                        panic = %panic_text(payload),
                        "handler panicked; continuing"
                    );
                }
                active.done();
            });
        }
    }

    /// Block until every in-flight handler task has completed.
    pub async fn wait_for_handlers(&self) {
        self.active.wait().await;
    }
}
