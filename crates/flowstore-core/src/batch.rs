//! Batch operations and their per-operation results.
//!
//! A batch has no atomicity: every operation gets its own outcome, and one
//! failure never rolls back another operation.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, FlowResult};
use crate::flow::FlowRule;
use crate::ids::{DeviceId, Epoch, FlowEntryId, LogicalTableId};
use crate::table::TableSpec;

/// Client-chosen id of one operation. Resubmitting the same id is idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpKind {
    Add,
    Remove,
    Modify,
}

/// A single mutation. Table schemas are immutable, so tables have no modify.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowOp {
    AddFlow(FlowRule),
    ModifyFlow(FlowRule),
    RemoveFlow {
        device_id: DeviceId,
        entry_id: FlowEntryId,
    },
    AddTable(TableSpec),
    RemoveTable {
        device_id: DeviceId,
        table_id: LogicalTableId,
    },
}

impl FlowOp {
    pub fn kind(&self) -> OpKind {
        match self {
            FlowOp::AddFlow(_) | FlowOp::AddTable(_) => OpKind::Add,
            FlowOp::ModifyFlow(_) => OpKind::Modify,
            FlowOp::RemoveFlow { .. } | FlowOp::RemoveTable { .. } => OpKind::Remove,
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        match self {
            FlowOp::AddFlow(rule) | FlowOp::ModifyFlow(rule) => &rule.device_id,
            FlowOp::RemoveFlow { device_id, .. } | FlowOp::RemoveTable { device_id, .. } => {
                device_id
            }
            FlowOp::AddTable(spec) => &spec.device_id,
        }
    }

    /// The entry this operation targets, for flow operations.
    pub fn entry_id(&self) -> Option<FlowEntryId> {
        match self {
            FlowOp::AddFlow(rule) | FlowOp::ModifyFlow(rule) => Some(rule.id),
            FlowOp::RemoveFlow { entry_id, .. } => Some(*entry_id),
            FlowOp::AddTable(_) | FlowOp::RemoveTable { .. } => None,
        }
    }

    /// The table this operation targets. `None` for a table not yet allocated.
    pub fn table_id(&self) -> Option<LogicalTableId> {
        match self {
            FlowOp::AddFlow(rule) | FlowOp::ModifyFlow(rule) => Some(rule.table_id),
            FlowOp::RemoveTable { table_id, .. } => Some(*table_id),
            FlowOp::RemoveFlow { .. } | FlowOp::AddTable(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOperation {
    pub id: OperationId,
    pub op: FlowOp,
}

impl BatchOperation {
    pub fn new(id: u64, op: FlowOp) -> Self {
        Self {
            id: OperationId(id),
            op,
        }
    }
}

/// Outcome of one operation, carrying enough identity to correlate it with
/// later queries. `table_id` is the logical id, filled in after allocation
/// for table adds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub id: OperationId,
    pub kind: OpKind,
    pub device_id: DeviceId,
    pub entry_id: Option<FlowEntryId>,
    pub table_id: Option<LogicalTableId>,
    pub outcome: Result<(), FlowError>,
}

impl OperationResult {
    /// A result for `operation` with identity taken from the request.
    pub fn for_operation(operation: &BatchOperation, outcome: FlowResult<()>) -> Self {
        Self {
            id: operation.id,
            kind: operation.op.kind(),
            device_id: operation.op.device_id().clone(),
            entry_id: operation.op.entry_id(),
            table_id: operation.op.table_id(),
            outcome,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Results of one device batch as applied by that device's master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub device_id: DeviceId,
    pub correlation_id: u64,
    /// Mastership epoch the batch was applied under.
    pub epoch: Epoch,
    pub results: Vec<OperationResult>,
}

impl BatchResult {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }
}

/// Reject a batch that reuses an operation id, before anything is applied.
pub fn check_unique(operations: &[BatchOperation]) -> FlowResult<()> {
    let mut seen = HashSet::with_capacity(operations.len());
    for operation in operations {
        if !seen.insert(operation.id) {
            return Err(FlowError::DuplicateOperation(operation.id));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::PiTableAction;

    fn add(id: u64, entry: u64) -> BatchOperation {
        BatchOperation::new(
            id,
            FlowOp::AddFlow(FlowRule {
                id: FlowEntryId(entry),
                device_id: DeviceId::new("of:1"),
                table_id: LogicalTableId(3),
                priority: 10,
                app_id: "app".to_string(),
                criteria: vec![],
                actions: vec![PiTableAction::member(1)],
            }),
        )
    }

    #[test]
    fn duplicate_ids_rejected() {
        let ops = vec![add(1, 10), add(2, 11), add(1, 12)];
        assert_eq!(
            check_unique(&ops),
            Err(FlowError::DuplicateOperation(OperationId(1)))
        );
        assert!(check_unique(&ops[..2]).is_ok());
    }

    #[test]
    fn result_identity_comes_from_operation() {
        let op = add(4, 40);
        let result = OperationResult::for_operation(&op, Ok(()));
        assert_eq!(result.kind, OpKind::Add);
        assert_eq!(result.entry_id, Some(FlowEntryId(40)));
        assert_eq!(result.table_id, Some(LogicalTableId(3)));
        assert_eq!(result.device_id, DeviceId::new("of:1"));
    }

    #[test]
    fn remove_table_has_no_entry() {
        let op = FlowOp::RemoveTable {
            device_id: DeviceId::new("pof:2"),
            table_id: LogicalTableId(5),
        };
        assert_eq!(op.kind(), OpKind::Remove);
        assert_eq!(op.entry_id(), None);
        assert_eq!(op.table_id(), Some(LogicalTableId(5)));
    }

    #[test]
    fn operation_json_shape() {
        let op = BatchOperation::new(
            2,
            FlowOp::RemoveFlow {
                device_id: DeviceId::new("of:1"),
                entry_id: FlowEntryId(8),
            },
        );
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["id"], 2);
        assert_eq!(json["op"]["type"], "remove_flow");
        assert_eq!(json["op"]["entry_id"], 8);
        let back: BatchOperation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn batch_counts() {
        let ok = OperationResult::for_operation(&add(1, 1), Ok(()));
        let failed = OperationResult::for_operation(
            &add(2, 2),
            Err(FlowError::AdapterRejected {
                device_id: DeviceId::new("of:1"),
                reason: "no space".to_string(),
            }),
        );
        let batch = BatchResult {
            device_id: DeviceId::new("of:1"),
            correlation_id: 1,
            epoch: 1,
            results: vec![ok, failed],
        };
        assert_eq!(batch.succeeded(), 1);
        assert_eq!(batch.failed(), 1);
    }
}
