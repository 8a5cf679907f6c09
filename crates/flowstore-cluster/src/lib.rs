//! flowstore-cluster: replica-to-replica plumbing for the flow store.
//!
//! Provides the mastership source of truth and its event feed, the fixed
//! set of message subjects, the transport seam with an in-process
//! implementation, and the request/response machinery on top of it.
//!
//! # Architecture
//!
//! ```text
//! MastershipManager
//!   ├── assign() / fail_over() → new epoch, persisted to StateStore
//!   └── subscribe() → ordered MastershipEvent feed
//!
//! Replica
//!   ├── RpcClient
//!   │   ├── call() → Envelope(Request) → transport, await reply or deadline
//!   │   ├── notify() → Envelope(Notification)
//!   │   └── invalidate(device, epoch) → pending calls fail with StaleEpoch
//!   └── Dispatcher (one task)
//!       ├── Response → RpcClient::complete()
//!       └── Request / Notification → MessageHandler (spawned)
//! ```

pub mod dispatch;
pub mod mastership;
pub mod message;
pub mod rpc;
pub mod transport;

pub use dispatch::{MessageHandler, spawn_dispatcher};
pub use mastership::{MastershipEvent, MastershipManager, MastershipService, resolve_master};
pub use message::*;
pub use rpc::RpcClient;
pub use transport::{ClusterTransport, LocalNetwork};
