//! flowstore-state: durable backup storage for the flow store.
//!
//! Backed by [redb](https://docs.rs/redb). Each replica keeps the device
//! snapshots it is master or backup for, plus the mastership records it has
//! observed, so a restarted or promoted replica can resume from disk.
//!
//! # Layout
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns.
//! Flow tables and flow entries are stored per row under `(device_id, id)`
//! tuple keys, each carrying the (epoch, version) stamp of the snapshot that wrote
//! it. The snapshot header under `{device_id}` holds the stamp, the table id
//! counter, the local id bindings and the recent operation outcomes.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
