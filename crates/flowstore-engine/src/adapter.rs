//! Protocol adapter seam.
//!
//! A `DeviceAdapter` talks to devices of one protocol family. Every call is
//! asynchronous and confirmable: `Ok` is the device's confirmation, and the
//! store never assumes success without one. Adapters are picked by the
//! scheme prefix of the device id.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use flowstore_core::{
    BoundTable, DeviceId, FlowEntryId, FlowError, FlowResult, FlowRule, FlowStats, LocalTableId,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type AdapterResult<T> = Result<T, AdapterError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    /// The device refused the request. Never retried automatically.
    #[error("rejected by device: {0}")]
    Rejected(String),

    /// No confirmation could be obtained.
    #[error("device unreachable: {0}")]
    Unreachable(String),
}

/// A physical port as reported by the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDescription {
    pub port_no: u32,
    pub name: String,
    pub hw_addr: String,
    pub enabled: bool,
}

/// Device lifecycle and statistics events raised by adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Connected {
        device_id: DeviceId,
        /// Local table ids the device supports, if it says.
        table_id_space: Option<u16>,
    },
    Disconnected {
        device_id: DeviceId,
    },
    Stats {
        device_id: DeviceId,
        stats: Vec<FlowStats>,
    },
}

impl DeviceEvent {
    pub fn device_id(&self) -> &DeviceId {
        match self {
            DeviceEvent::Connected { device_id, .. }
            | DeviceEvent::Disconnected { device_id }
            | DeviceEvent::Stats { device_id, .. } => device_id,
        }
    }
}

pub trait DeviceAdapter: Send + Sync {
    fn install_table<'a>(
        &'a self,
        device_id: &'a DeviceId,
        table: &'a BoundTable,
    ) -> BoxFuture<'a, AdapterResult<()>>;

    fn remove_table<'a>(
        &'a self,
        device_id: &'a DeviceId,
        table: &'a BoundTable,
    ) -> BoxFuture<'a, AdapterResult<()>>;

    fn install_entry<'a>(
        &'a self,
        device_id: &'a DeviceId,
        table: LocalTableId,
        rule: &'a FlowRule,
    ) -> BoxFuture<'a, AdapterResult<()>>;

    /// Overwrite an installed entry. Defaults to a re-install.
    fn modify_entry<'a>(
        &'a self,
        device_id: &'a DeviceId,
        table: LocalTableId,
        rule: &'a FlowRule,
    ) -> BoxFuture<'a, AdapterResult<()>> {
        self.install_entry(device_id, table, rule)
    }

    fn remove_entry<'a>(
        &'a self,
        device_id: &'a DeviceId,
        table: LocalTableId,
        entry_id: FlowEntryId,
    ) -> BoxFuture<'a, AdapterResult<()>>;

    fn list_ports<'a>(
        &'a self,
        device_id: &'a DeviceId,
    ) -> BoxFuture<'a, AdapterResult<Vec<PortDescription>>>;
}

/// Adapters keyed by device id scheme.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn DeviceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, scheme: &str, adapter: Arc<dyn DeviceAdapter>) {
        self.adapters.insert(scheme.to_string(), adapter);
    }

    pub fn with(mut self, scheme: &str, adapter: Arc<dyn DeviceAdapter>) -> Self {
        self.register(scheme, adapter);
        self
    }

    pub fn for_device(&self, device_id: &DeviceId) -> FlowResult<Arc<dyn DeviceAdapter>> {
        self.adapters
            .get(device_id.scheme())
            .cloned()
            .ok_or_else(|| {
                FlowError::InvalidRequest(format!(
                    "no adapter for scheme '{}' of {device_id}",
                    device_id.scheme()
                ))
            })
    }
}

/// Run an adapter call under a deadline, mapping the outcome to store errors.
pub async fn confirm<T>(
    device_id: &DeviceId,
    what: &str,
    deadline: Duration,
    call: BoxFuture<'_, AdapterResult<T>>,
) -> FlowResult<T> {
    match tokio::time::timeout(deadline, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(AdapterError::Rejected(reason))) => Err(FlowError::AdapterRejected {
            device_id: device_id.clone(),
            reason,
        }),
        Ok(Err(AdapterError::Unreachable(reason))) => Err(FlowError::DeviceTimeout {
            device_id: device_id.clone(),
            what: format!("{what} ({reason})"),
            waited_ms: 0,
        }),
        Err(_) => Err(FlowError::DeviceTimeout {
            device_id: device_id.clone(),
            what: what.to_string(),
            waited_ms: deadline.as_millis() as u64,
        }),
    }
}

// ── In-memory adapter ──────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemoryDevice {
    tables: HashMap<LocalTableId, BoundTable>,
    entries: HashMap<FlowEntryId, (LocalTableId, FlowRule)>,
    install_calls: HashMap<FlowEntryId, usize>,
}

#[derive(Debug, Default)]
struct MemoryState {
    devices: HashMap<DeviceId, MemoryDevice>,
    reject_entries: HashSet<FlowEntryId>,
    reject_tables: HashSet<String>,
    unreachable: bool,
    delay: Duration,
    calls: usize,
}

/// Adapter that keeps device state in memory.
///
/// Serves as the loopback device of a standalone replica and as the
/// scriptable device in tests: it can reject chosen entries or tables,
/// stall every call, or stop answering.
#[derive(Debug, Default)]
pub struct MemoryAdapter {
    state: Mutex<MemoryState>,
    ports: Vec<PortDescription>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adapter whose devices all report `count` enabled ports.
    pub fn with_ports(count: u32) -> Self {
        let ports = (1..=count)
            .map(|port_no| PortDescription {
                port_no,
                name: format!("eth{port_no}"),
                hw_addr: format!("02:00:00:00:00:{port_no:02x}"),
                enabled: true,
            })
            .collect();
        Self {
            state: Mutex::default(),
            ports,
        }
    }

    pub fn reject_entry(&self, entry_id: FlowEntryId) {
        self.lock().reject_entries.insert(entry_id);
    }

    pub fn reject_table(&self, name: &str) {
        self.lock().reject_tables.insert(name.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = delay;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Entry ids currently installed on a device, sorted.
    pub fn installed_entries(&self, device_id: &DeviceId) -> Vec<FlowEntryId> {
        let state = self.lock();
        let mut ids: Vec<FlowEntryId> = state
            .devices
            .get(device_id)
            .map(|d| d.entries.keys().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Local ids of the tables currently installed on a device, sorted.
    pub fn installed_tables(&self, device_id: &DeviceId) -> Vec<LocalTableId> {
        let state = self.lock();
        let mut ids: Vec<LocalTableId> = state
            .devices
            .get(device_id)
            .map(|d| d.tables.keys().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// How many times an install of `entry_id` reached the device.
    pub fn install_calls(&self, device_id: &DeviceId, entry_id: FlowEntryId) -> usize {
        self.lock()
            .devices
            .get(device_id)
            .and_then(|d| d.install_calls.get(&entry_id).copied())
            .unwrap_or(0)
    }

    /// Adapter calls started so far, across all devices, whether or not
    /// they completed.
    pub fn calls(&self) -> usize {
        self.lock().calls
    }

    /// Forget everything about a device, as a power-cycled switch would.
    pub fn reset_device(&self, device_id: &DeviceId) {
        self.lock().devices.remove(device_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Common preamble of every call: honour the configured delay and
    /// reachability.
    async fn reach(&self, device_id: &DeviceId) -> AdapterResult<()> {
        let (delay, unreachable) = {
            let mut state = self.lock();
            state.calls += 1;
            (state.delay, state.unreachable)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if unreachable {
            return Err(AdapterError::Unreachable(device_id.to_string()));
        }
        Ok(())
    }
}

impl DeviceAdapter for MemoryAdapter {
    fn install_table<'a>(
        &'a self,
        device_id: &'a DeviceId,
        table: &'a BoundTable,
    ) -> BoxFuture<'a, AdapterResult<()>> {
        Box::pin(async move {
            self.reach(device_id).await?;
            let mut state = self.lock();
            if state.reject_tables.contains(&table.table.name) {
                return Err(AdapterError::Rejected(format!(
                    "table {} not supported",
                    table.table.name
                )));
            }
            let device = state.devices.entry(device_id.clone()).or_default();
            device.tables.insert(table.local_id, table.clone());
            debug!(%device_id, local = %table.local_id, "memory adapter: table installed");
            Ok(())
        })
    }

    fn remove_table<'a>(
        &'a self,
        device_id: &'a DeviceId,
        table: &'a BoundTable,
    ) -> BoxFuture<'a, AdapterResult<()>> {
        Box::pin(async move {
            self.reach(device_id).await?;
            let mut state = self.lock();
            if let Some(device) = state.devices.get_mut(device_id) {
                device.tables.remove(&table.local_id);
                device
                    .entries
                    .retain(|_, (local, _)| *local != table.local_id);
            }
            Ok(())
        })
    }

    fn install_entry<'a>(
        &'a self,
        device_id: &'a DeviceId,
        table: LocalTableId,
        rule: &'a FlowRule,
    ) -> BoxFuture<'a, AdapterResult<()>> {
        Box::pin(async move {
            self.reach(device_id).await?;
            let mut state = self.lock();
            if state.reject_entries.contains(&rule.id) {
                return Err(AdapterError::Rejected(format!("entry {} refused", rule.id)));
            }
            let device = state.devices.entry(device_id.clone()).or_default();
            if !device.tables.contains_key(&table) {
                return Err(AdapterError::Rejected(format!("no table {table}")));
            }
            *device.install_calls.entry(rule.id).or_default() += 1;
            device.entries.insert(rule.id, (table, rule.clone()));
            Ok(())
        })
    }

    fn remove_entry<'a>(
        &'a self,
        device_id: &'a DeviceId,
        _table: LocalTableId,
        entry_id: FlowEntryId,
    ) -> BoxFuture<'a, AdapterResult<()>> {
        Box::pin(async move {
            self.reach(device_id).await?;
            let mut state = self.lock();
            if let Some(device) = state.devices.get_mut(device_id) {
                device.entries.remove(&entry_id);
            }
            Ok(())
        })
    }

    fn list_ports<'a>(
        &'a self,
        device_id: &'a DeviceId,
    ) -> BoxFuture<'a, AdapterResult<Vec<PortDescription>>> {
        Box::pin(async move {
            self.reach(device_id).await?;
            Ok(self.ports.clone())
        })
    }
}
