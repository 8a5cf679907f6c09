use serde::{Deserialize, Serialize};

use flowstore_core::{BatchResult, DeviceId, Epoch, FlowEntryId, FlowEntryState, LogicalTableId};

/// Changes published by a `FlowStore` to its subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StoreEvent {
    EntryStateChanged {
        device_id: DeviceId,
        entry_id: FlowEntryId,
        from: FlowEntryState,
        to: FlowEntryState,
    },
    TableAdded {
        device_id: DeviceId,
        table_id: LogicalTableId,
    },
    TableRemoved {
        device_id: DeviceId,
        table_id: LogicalTableId,
    },
    /// A device batch finished, locally or on a remote master.
    BatchCompleted { result: BatchResult },
    /// This replica became master of a device.
    Promoted { device_id: DeviceId, epoch: Epoch },
    /// This replica stopped being master of a device.
    Demoted { device_id: DeviceId, epoch: Epoch },
}

impl StoreEvent {
    pub fn device_id(&self) -> &DeviceId {
        match self {
            StoreEvent::EntryStateChanged { device_id, .. }
            | StoreEvent::TableAdded { device_id, .. }
            | StoreEvent::TableRemoved { device_id, .. }
            | StoreEvent::Promoted { device_id, .. }
            | StoreEvent::Demoted { device_id, .. } => device_id,
            StoreEvent::BatchCompleted { result } => &result.device_id,
        }
    }
}
