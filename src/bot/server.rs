//! Per-server runtime: the pieces the supervisor wires together for one
//! connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock as StdRwLock};

use async_trait::async_trait;
use tokio::sync::RwLock;

use corvid_proto::ProtoCaps;

use crate::config::ServerSettings;
use crate::conn::{Driver, DriverError};
use crate::endpoint::{Endpoint, LineWriter};
use crate::state::State;

/// Stable write target for one server. Endpoints hold this across
/// reconnects and restarts; it delegates to whichever driver is current.
pub(crate) struct ServerWriter {
    id: String,
    driver: StdRwLock<Option<Arc<Driver>>>,
}

impl ServerWriter {
    pub(crate) fn new(id: &str) -> Arc<Self> {
        Arc::new(ServerWriter {
            id: id.to_owned(),
            driver: StdRwLock::new(None),
        })
    }

    pub(crate) fn set_driver(&self, driver: Option<Arc<Driver>>) {
        *self.driver.write().expect("server writer lock") = driver;
    }

    fn current(&self) -> Option<Arc<Driver>> {
        self.driver.read().expect("server writer lock").clone()
    }
}

#[async_trait]
impl LineWriter for ServerWriter {
    fn key(&self) -> &str {
        &self.id
    }

    async fn write_line(&self, line: &str) -> Result<(), DriverError> {
        match self.current() {
            Some(driver) => driver.write_line(line).await,
            None => Err(DriverError::NotConnected),
        }
    }
}

/// Everything the supervisor tracks for one server.
pub(crate) struct ServerRuntime {
    pub(crate) id: String,
    pub(crate) settings: Mutex<ServerSettings>,
    pub(crate) writer: Arc<ServerWriter>,
    pub(crate) endpoint: Endpoint,
    pub(crate) caps: Arc<RwLock<ProtoCaps>>,
    pub(crate) state: Option<Arc<RwLock<State>>>,
    /// Whether start was requested and not yet stopped.
    pub(crate) started: AtomicBool,
    /// The current driver, when running.
    pub(crate) driver: Mutex<Option<Arc<Driver>>>,
    /// Altnick fallback already attempted for this connection.
    pub(crate) altnick_used: AtomicBool,
    /// The next termination is a config-replacement kill, not a user
    /// stop.
    pub(crate) replace_kill: AtomicBool,
}

impl ServerRuntime {
    pub(crate) fn new(settings: ServerSettings) -> Arc<Self> {
        let caps = ProtoCaps::new();
        let state = if settings.no_state {
            None
        } else {
            Some(Arc::new(RwLock::new(State::new(&caps))))
        };
        let writer = ServerWriter::new(&settings.id);
        let endpoint = Endpoint::new(writer.clone());
        Arc::new(ServerRuntime {
            id: settings.id.clone(),
            settings: Mutex::new(settings),
            writer,
            endpoint,
            caps: Arc::new(RwLock::new(caps)),
            state,
            started: AtomicBool::new(false),
            driver: Mutex::new(None),
            altnick_used: AtomicBool::new(false),
            replace_kill: AtomicBool::new(false),
        })
    }

    pub(crate) fn settings(&self) -> ServerSettings {
        self.settings.lock().expect("settings lock").clone()
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) fn current_driver(&self) -> Option<Arc<Driver>> {
        self.driver.lock().expect("driver lock").clone()
    }
}
