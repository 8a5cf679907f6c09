//! flowstore-engine: the replica-side flow store.
//!
//! Pulls the pieces together: the table-id allocator, the protocol adapter
//! seam, per-device single-writer workers, the mastership-aware
//! `FlowStore`, the multi-device `BatchCoordinator`, and the `FlowService`
//! facade management clients use.

pub mod adapter;
pub mod allocator;
pub mod coordinator;
mod device;
pub mod event;
pub mod service;
pub mod store;

pub use adapter::{
    AdapterError, AdapterRegistry, AdapterResult, BoxFuture, DeviceAdapter, DeviceEvent,
    MemoryAdapter, PortDescription,
};
pub use allocator::{AllocatorSnapshot, TableIdAllocator};
pub use coordinator::BatchCoordinator;
pub use event::StoreEvent;
pub use service::{FlowService, RemovalResult};
pub use store::{FlowStore, StoreDeps};
