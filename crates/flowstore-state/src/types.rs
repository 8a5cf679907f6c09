//! Persisted records of the flow state store.
//!
//! A `DeviceSnapshot` is the full replicated state of one device as last
//! written by its master. `MastershipRecord` is the cluster's view of who
//! owns writes for a device.

use serde::{Deserialize, Serialize};

use flowstore_core::{
    DeviceId, Epoch, FlowEntry, FlowTable, LocalTableId, LogicalTableId, OperationResult,
    ReplicaId,
};

// ── Device snapshot ────────────────────────────────────────────────

/// Ordering stamp of a snapshot: mastership epoch first, then the master's
/// per-device write counter.
pub type SnapshotStamp = (Epoch, u64);

/// A live logical → local table id binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableBinding {
    pub logical: LogicalTableId,
    pub local: LocalTableId,
}

/// Full state of one device, shipped to backups and written to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub device_id: DeviceId,
    /// Mastership epoch of the master that produced this snapshot.
    pub epoch: Epoch,
    /// Write counter of that master, bumped on every applied mutation.
    pub version: u64,
    /// Next logical table id the allocator will hand out.
    pub next_table_id: u64,
    /// Local id space the device advertised, if it did.
    #[serde(default)]
    pub table_id_space: Option<u16>,
    #[serde(default)]
    pub bindings: Vec<TableBinding>,
    #[serde(default)]
    pub tables: Vec<FlowTable>,
    #[serde(default)]
    pub entries: Vec<FlowEntry>,
    /// Outcomes of recently applied operations, oldest first.
    #[serde(default)]
    pub recent_ops: Vec<OperationResult>,
    /// Unix timestamp (milliseconds) when the snapshot was taken.
    pub taken_at: u64,
}

impl DeviceSnapshot {
    /// An empty snapshot at the given stamp.
    pub fn empty(device_id: DeviceId, epoch: Epoch) -> Self {
        Self {
            device_id,
            epoch,
            version: 0,
            next_table_id: 1,
            table_id_space: None,
            bindings: Vec::new(),
            tables: Vec::new(),
            entries: Vec::new(),
            recent_ops: Vec::new(),
            taken_at: 0,
        }
    }

    pub fn stamp(&self) -> SnapshotStamp {
        (self.epoch, self.version)
    }

    /// Whether this snapshot supersedes one stamped `other`.
    pub fn is_newer_than(&self, other: SnapshotStamp) -> bool {
        self.stamp() > other
    }

    pub fn table_key(&self) -> String {
        self.device_id.to_string()
    }

    /// Copy without the per-row data, as stored in the header table.
    pub(crate) fn header(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            tables: Vec::new(),
            entries: Vec::new(),
            ..self.clone()
        }
    }
}

/// A table or entry row together with the stamp of the snapshot that wrote it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamped<T> {
    pub epoch: Epoch,
    pub version: u64,
    pub record: T,
}

// ── Mastership ─────────────────────────────────────────────────────

/// Which replica owns writes for a device, and who holds backups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MastershipRecord {
    pub device_id: DeviceId,
    pub master: ReplicaId,
    /// Strictly increases every time the master changes.
    pub epoch: Epoch,
    #[serde(default)]
    pub backups: Vec<ReplicaId>,
    /// Unix timestamp (milliseconds) of the last change.
    pub updated_at: u64,
}

impl MastershipRecord {
    pub fn is_master(&self, replica: &str) -> bool {
        self.master == replica
    }

    pub fn is_backup(&self, replica: &str) -> bool {
        self.backups.iter().any(|b| b == replica)
    }
}
