//! flowstore-core: shared model for the distributed flow-state store.
//!
//! Everything here is plain data: identifiers, tables, rules, the action
//! model, batch operations, the error enum, and the replica config. The
//! types are `serde`-serializable so they can be persisted and shipped
//! between replicas unchanged.

pub mod action;
pub mod batch;
pub mod config;
pub mod error;
pub mod flow;
pub mod ids;
pub mod table;

pub use action::{ActionGroupId, ActionParam, GroupMemberId, PiAction, PiTableAction, PiTableActionType};
pub use batch::{check_unique, BatchOperation, BatchResult, FlowOp, OpKind, OperationId, OperationResult};
pub use config::{DeviceConfig, ReadConsistency, StoreConfig};
pub use error::{FlowError, FlowResult};
pub use flow::{epoch_millis, Criterion, FlowEntry, FlowEntryState, FlowRule, FlowStats};
pub use ids::*;
pub use table::{BoundTable, FlowTable, MatchField, TableSpec, TableType};
