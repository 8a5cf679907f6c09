//! Error kinds surfaced by the flow store.
//!
//! `FlowError` is serializable so a master can return it to the replica that
//! forwarded the request.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::batch::OperationId;
use crate::flow::FlowEntryState;
use crate::ids::{DeviceId, Epoch, FlowEntryId, LogicalTableId, ReplicaId};

/// Result type alias for flow store operations.
pub type FlowResult<T> = Result<T, FlowError>;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FlowError {
    #[error("device not found: {device_id}")]
    DeviceNotFound { device_id: DeviceId },

    #[error("table {table_id} not found on {device_id}")]
    TableNotFound {
        device_id: DeviceId,
        table_id: LogicalTableId,
    },

    #[error("entry {entry_id} not found on {device_id}")]
    EntryNotFound {
        device_id: DeviceId,
        entry_id: FlowEntryId,
    },

    #[error("local table id space of {device_id} exhausted ({capacity} ids)")]
    CapacityExhausted { device_id: DeviceId, capacity: u16 },

    #[error("duplicate operation id {0}")]
    DuplicateOperation(OperationId),

    #[error("replica {replica} is not master of {device_id}")]
    NotMaster {
        device_id: DeviceId,
        replica: ReplicaId,
    },

    #[error("timed out after {waited_ms}ms: {context}")]
    Timeout { context: String, waited_ms: u64 },

    /// The device did not confirm within the adapter deadline. It may still
    /// apply the operation, so the store neither retries nor records it.
    #[error("{device_id} did not confirm {what} within {waited_ms}ms")]
    DeviceTimeout {
        device_id: DeviceId,
        what: String,
        waited_ms: u64,
    },

    #[error("{device_id} rejected the operation: {reason}")]
    AdapterRejected { device_id: DeviceId, reason: String },

    #[error("stale epoch for {device_id}: saw {seen}, current is {current}")]
    StaleEpoch {
        device_id: DeviceId,
        seen: Epoch,
        current: Epoch,
    },

    #[error("entry {entry_id} on {device_id} is {state}")]
    InvalidState {
        device_id: DeviceId,
        entry_id: FlowEntryId,
        state: FlowEntryState,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl FlowError {
    /// Errors caused by a stale view of mastership or a lost forward. The
    /// caller re-resolves the master once and retries. A `DeviceTimeout`
    /// is not one of them.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FlowError::Timeout { .. } | FlowError::StaleEpoch { .. } | FlowError::NotMaster { .. }
        )
    }

    /// Short, stable name of the error kind for logs and client responses.
    pub fn kind(&self) -> &'static str {
        match self {
            FlowError::DeviceNotFound { .. } => "device_not_found",
            FlowError::TableNotFound { .. } => "table_not_found",
            FlowError::EntryNotFound { .. } => "entry_not_found",
            FlowError::CapacityExhausted { .. } => "capacity_exhausted",
            FlowError::DuplicateOperation(_) => "duplicate_operation",
            FlowError::NotMaster { .. } => "not_master",
            FlowError::Timeout { .. } => "timeout",
            FlowError::DeviceTimeout { .. } => "device_timeout",
            FlowError::AdapterRejected { .. } => "adapter_rejected",
            FlowError::StaleEpoch { .. } => "stale_epoch",
            FlowError::InvalidState { .. } => "invalid_state",
            FlowError::InvalidRequest(_) => "invalid_request",
            FlowError::Storage(_) => "storage",
            FlowError::Transport(_) => "transport",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        let device_id = DeviceId::new("of:1");
        assert!(
            FlowError::Timeout {
                context: "apply".into(),
                waited_ms: 10
            }
            .is_retryable()
        );
        assert!(
            FlowError::StaleEpoch {
                device_id: device_id.clone(),
                seen: 1,
                current: 2
            }
            .is_retryable()
        );
        assert!(
            !FlowError::AdapterRejected {
                device_id,
                reason: "table full".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn device_timeouts_are_not_retried() {
        let err = FlowError::DeviceTimeout {
            device_id: DeviceId::new("pof:1"),
            what: "remove entry".into(),
            waited_ms: 200,
        };
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "device_timeout");
    }

    #[test]
    fn errors_cross_the_wire() {
        let err = FlowError::DuplicateOperation(OperationId(9));
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("duplicate_operation"));
        let back: FlowError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
        assert_eq!(back.kind(), "duplicate_operation");
    }
}
