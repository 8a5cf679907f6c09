//! Standalone mode: one replica, one in-process cluster.
//!
//! The daemon:
//! 1. Opens the redb backup store when `data_dir` is set
//! 2. Registers the loopback adapter for every supported scheme
//! 3. Starts the flow store and claims the configured devices
//! 4. Reports each device as connected
//! 5. Logs every store event at debug level
//! 6. Waits for Ctrl-C and shuts the store down

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use flowstore_cluster::{LocalNetwork, MastershipManager};
use flowstore_core::StoreConfig;
use flowstore_engine::{AdapterRegistry, DeviceEvent, FlowStore, MemoryAdapter, StoreDeps};
use flowstore_state::StateStore;

use crate::DB_FILE;

const SCHEMES: [&str; 3] = ["pof", "of", "netconf"];
const LOOPBACK_PORTS: u32 = 8;

pub async fn run(config: StoreConfig) -> anyhow::Result<()> {
    info!(replica = %config.replica_id, "flow store daemon starting in standalone mode");

    // ── State ──────────────────────────────────────────────────

    let persisted = match &config.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let path = dir.join(DB_FILE);
            let state = StateStore::open(&path)?;
            info!(path = ?path, "state store opened");
            Some(state)
        }
        None => {
            info!("no data_dir configured, state is in-memory only");
            None
        }
    };
    let mastership_state = match &persisted {
        Some(state) => state.clone(),
        None => StateStore::open_in_memory()?,
    };
    let mastership = Arc::new(MastershipManager::new(mastership_state)?);

    // ── Adapters ───────────────────────────────────────────────

    let loopback = Arc::new(MemoryAdapter::with_ports(LOOPBACK_PORTS));
    let mut adapters = AdapterRegistry::new();
    for scheme in SCHEMES {
        adapters.register(scheme, loopback.clone());
    }

    // ── Store ──────────────────────────────────────────────────

    let network = LocalNetwork::new();
    let inbox = network.register(&config.replica_id);
    let replica_id = config.replica_id.clone();
    let devices = config.devices.clone();
    let store = FlowStore::start(
        config,
        StoreDeps {
            mastership: mastership.clone(),
            transport: network,
            inbox,
            adapters,
            state: persisted,
        },
    )?;

    let mut events = store.subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => debug!(device_id = %event.device_id(), event = %json, "store event"),
                    Err(e) => warn!(error = %e, "store event not serializable"),
                },
                Err(RecvError::Lagged(missed)) => warn!(missed, "store event log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    for device in &devices {
        if !device.backups.is_empty() {
            warn!(
                device_id = %device.id,
                backups = ?device.backups,
                "backups are unreachable from a standalone replica, ignoring"
            );
        }
        mastership.assign(&device.id, &replica_id, Vec::new())?;
    }

    let device_events = store.device_events();
    for device in &devices {
        device_events.send(DeviceEvent::Connected {
            device_id: device.id.clone(),
            table_id_space: device.table_id_space,
        })?;
    }
    info!(devices = devices.len(), "devices claimed");

    // ── Shutdown ───────────────────────────────────────────────

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    store.shutdown().await;
    event_log.abort();

    info!("flow store daemon stopped");
    Ok(())
}

