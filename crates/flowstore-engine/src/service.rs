//! Management facade for clients of the flow store.
//!
//! Every call returns results keyed by device and entry or table id. Only
//! logical table ids cross this boundary; device-local ids stay inside the
//! store.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use flowstore_core::{
    BatchOperation, DeviceId, FlowEntry, FlowEntryId, FlowError, FlowOp, FlowResult,
    FlowTable, LogicalTableId, OperationResult,
};

use crate::adapter::{PortDescription, confirm};
use crate::coordinator::BatchCoordinator;
use crate::store::FlowStore;

/// Outcome of removing one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalResult {
    pub device_id: DeviceId,
    pub entry_id: FlowEntryId,
    pub outcome: Result<(), FlowError>,
}

pub struct FlowService {
    store: FlowStore,
    coordinator: BatchCoordinator,
}

impl FlowService {
    pub fn new(store: FlowStore) -> Self {
        Self {
            coordinator: BatchCoordinator::new(store.clone()),
            store,
        }
    }

    pub fn store(&self) -> &FlowStore {
        &self.store
    }

    /// Entries of one device, or of every known device.
    pub async fn list_flows(&self, device_id: Option<&DeviceId>) -> FlowResult<Vec<FlowEntry>> {
        match device_id {
            Some(device_id) => self.store.device_entries(device_id).await,
            None => {
                let mut entries = Vec::new();
                for device_id in self.store.devices()? {
                    entries.extend(self.store.device_entries(&device_id).await?);
                }
                Ok(entries)
            }
        }
    }

    /// Add, modify or remove flow rules across devices.
    pub async fn apply_flows(&self, operations: Vec<BatchOperation>) -> FlowResult<Vec<OperationResult>> {
        if let Some(op) = operations
            .iter()
            .find(|o| matches!(o.op, FlowOp::AddTable(_) | FlowOp::RemoveTable { .. }))
        {
            return Err(FlowError::InvalidRequest(format!(
                "{} is a table operation; use apply_tables",
                op.id
            )));
        }
        self.coordinator.apply(operations).await
    }

    pub async fn remove_flow(&self, device_id: &DeviceId, entry_id: FlowEntryId) -> FlowResult<()> {
        self.store.remove_entry(device_id, entry_id).await
    }

    pub async fn remove_flows(&self, targets: Vec<(DeviceId, FlowEntryId)>) -> Vec<RemovalResult> {
        let outcomes = self.coordinator.remove_entries(targets.clone()).await;
        targets
            .into_iter()
            .zip(outcomes)
            .map(|((device_id, entry_id), outcome)| RemovalResult {
                device_id,
                entry_id,
                outcome,
            })
            .collect()
    }

    /// Create or remove tables across devices. Each successful add reports
    /// the logical id the table was given.
    pub async fn apply_tables(&self, operations: Vec<BatchOperation>) -> FlowResult<Vec<OperationResult>> {
        if let Some(op) = operations
            .iter()
            .find(|o| !matches!(o.op, FlowOp::AddTable(_) | FlowOp::RemoveTable { .. }))
        {
            return Err(FlowError::InvalidRequest(format!(
                "{} is a flow operation; use apply_flows",
                op.id
            )));
        }
        self.coordinator.apply(operations).await
    }

    pub async fn remove_table(&self, device_id: &DeviceId, table_id: LogicalTableId) -> FlowResult<()> {
        self.store.remove_table(device_id, table_id).await
    }

    pub async fn list_tables(&self, device_id: &DeviceId) -> FlowResult<Vec<FlowTable>> {
        self.store.device_tables(device_id).await
    }

    /// Every entry installed on behalf of an application.
    pub async fn flows_by_app(&self, app_id: &str) -> FlowResult<Vec<FlowEntry>> {
        let mut entries = self.list_flows(None).await?;
        entries.retain(|e| e.rule.app_id == app_id);
        Ok(entries)
    }

    /// Remove every entry an application owns.
    pub async fn remove_flows_by_app(&self, app_id: &str) -> FlowResult<Vec<RemovalResult>> {
        let targets: Vec<(DeviceId, FlowEntryId)> = self
            .flows_by_app(app_id)
            .await?
            .into_iter()
            .map(|e| (e.rule.device_id, e.rule.id))
            .collect();
        info!(%app_id, entries = targets.len(), "removing application flows");
        Ok(self.remove_flows(targets).await)
    }

    /// Ports of a device, straight from its adapter.
    pub async fn ports(&self, device_id: &DeviceId) -> FlowResult<Vec<PortDescription>> {
        let adapter = self.store.adapters().for_device(device_id)?;
        let ports = confirm(
            device_id,
            "list ports",
            self.store.config().adapter_timeout(),
            adapter.list_ports(device_id),
        )
        .await?;
        debug!(%device_id, ports = ports.len(), "ports listed");
        Ok(ports)
    }
}
