//! Scenario state for bridge behavioural tests.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use botbox::bridge::BridgeServer;
use botbox::config::BridgeConfig;
use botbox::error::Result;
use botbox::host::{HostEffectSink, Tenant, TenantFlags, TenantRegistry};
use botbox::sandbox::Language;
use rstest::fixture;
use rstest_bdd::Slot;
use rstest_bdd_macros::ScenarioState;

pub(crate) const WAIT: Duration = Duration::from_secs(2);

/// Fixed tenant list; flag writes are ignored.
struct StaticTenants(Vec<Tenant>);

impl TenantRegistry for StaticTenants {
    fn tenant(&self, id: &str) -> Result<Option<Tenant>> {
        Ok(self.0.iter().find(|tenant| tenant.id == id).cloned())
    }

    fn tenants(&self) -> Result<Vec<Tenant>> {
        Ok(self.0.clone())
    }

    fn set_flags(&self, _id: &str, _flags: TenantFlags) -> Result<()> {
        Ok(())
    }
}

/// Effect sink remembering every call as a short string.
#[derive(Debug, Default)]
pub(crate) struct RecordingEffects {
    seen: Mutex<Vec<String>>,
}

impl RecordingEffects {
    fn push(&self, entry: String) {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    pub(crate) fn snapshot(&self) -> Vec<String> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl HostEffectSink for RecordingEffects {
    fn toast(&self, alias: &str, message: &str) {
        self.push(format!("toast {alias} {message}"));
    }

    fn vibrate(&self, alias: &str, duration_ms: u64) {
        self.push(format!("vibrate {alias} {duration_ms}"));
    }

    fn notification(&self, alias: &str, title: &str, body: &str) {
        self.push(format!("notification {alias} {title} {body}"));
    }

    fn reply(&self, alias: &str, room: &str, message: &str) {
        self.push(format!("reply {alias} {room} {message}"));
    }
}

/// Blocking line client standing in for a guest wrapper.
pub(crate) struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

/// What a read attempt observed.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Read {
    Line(String),
    Closed,
    Nothing,
}

impl Client {
    fn connect(server: &BridgeServer) -> std::io::Result<Self> {
        let stream = TcpStream::connect(server.local_addr())?;
        stream.set_read_timeout(Some(WAIT))?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
        })
    }

    pub(crate) fn send(&mut self, line: &str) -> std::io::Result<()> {
        writeln!(self.writer, "{line}")
    }

    pub(crate) fn read(&mut self, timeout: Duration) -> Read {
        if self.reader.get_ref().set_read_timeout(Some(timeout)).is_err() {
            return Read::Nothing;
        }
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => Read::Closed,
            Ok(_) => Read::Line(line.trim_end().to_owned()),
            Err(error) if error.kind() == ErrorKind::ConnectionReset => Read::Closed,
            Err(_) => Read::Nothing,
        }
    }
}

/// A bridge bound to an ephemeral port with its own runtime.
pub(crate) struct BridgeWorld {
    _runtime: tokio::runtime::Runtime,
    pub(crate) server: Arc<BridgeServer>,
    pub(crate) effects: Arc<RecordingEffects>,
    clients: Mutex<HashMap<String, Client>>,
}

impl BridgeWorld {
    pub(crate) fn new(enabled: &[&str]) -> std::result::Result<Self, String> {
        let runtime =
            tokio::runtime::Runtime::new().map_err(|e| format!("failed to create runtime: {e}"))?;
        let tenants = enabled
            .iter()
            .map(|id| Tenant {
                id: String::from(*id),
                language: Language::JavaScript,
                enabled: true,
                auto_start: true,
                entry: None,
            })
            .collect();
        let effects = Arc::new(RecordingEffects::default());
        let config = BridgeConfig {
            port: 0,
            ..BridgeConfig::default()
        };

        let server = runtime
            .block_on(BridgeServer::bind(
                &config,
                Arc::new(StaticTenants(tenants)),
                Arc::clone(&effects) as Arc<dyn HostEffectSink>,
            ))
            .map_err(|e| format!("failed to bind bridge: {e}"))?;
        {
            let _context = runtime.enter();
            drop(server.serve());
        }

        Ok(Self {
            _runtime: runtime,
            server,
            effects,
            clients: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn clients(&self) -> MutexGuard<'_, HashMap<String, Client>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connect a client, announce `id` and wait until the bridge maps it.
    pub(crate) fn connect(&self, id: &str) -> std::result::Result<(), String> {
        let mut client =
            Client::connect(&self.server).map_err(|e| format!("failed to connect: {e}"))?;
        let token = self.server.hello_tokens().issue(id);
        client
            .send(&format!(
                r#"{{"type":"hello","botId":"{id}","token":"{token}"}}"#
            ))
            .map_err(|e| format!("failed to send hello: {e}"))?;
        let announced =
            wait_until(|| self.server.connected_aliases().iter().any(|alias| alias == id));
        if !announced {
            return Err(format!("bridge never registered {id}"));
        }
        self.clients().insert(String::from(id), client);
        Ok(())
    }
}

/// Poll `condition` until it holds or [`WAIT`] elapses.
pub(crate) fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    true
}

impl Drop for BridgeWorld {
    fn drop(&mut self) {
        self.server.shutdown();
        self.clients().clear();
    }
}

#[derive(Default, ScenarioState)]
pub(crate) struct BridgeState {
    pub(crate) world: Slot<Arc<BridgeWorld>>,
}

#[fixture]
pub(crate) fn bridge_state() -> BridgeState {
    BridgeState::default()
}
