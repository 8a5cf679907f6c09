//! redb table definitions for the flow state store.
//!
//! Values are JSON-serialized records in `&[u8]` columns. Per-device rows
//! are keyed by `(device_id, id)` tuples, so one device's rows form a
//! contiguous key range whatever characters the device id contains.

use redb::TableDefinition;

/// Key of a per-device row: the device id and the table or entry id.
pub type RowKey<'a> = (&'a str, u64);

/// Snapshot headers keyed by `{device_id}`.
pub const DEVICE_SNAPSHOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("device_snapshots");

/// Flow tables keyed by `(device_id, logical_table_id)`.
pub const FLOW_TABLES: TableDefinition<RowKey<'static>, &[u8]> = TableDefinition::new("flow_tables");

/// Flow entries keyed by `(device_id, entry_id)`.
pub const FLOW_ENTRIES: TableDefinition<RowKey<'static>, &[u8]> = TableDefinition::new("flow_entries");

/// Mastership records keyed by `{device_id}`.
pub const MASTERSHIP: TableDefinition<&str, &[u8]> = TableDefinition::new("mastership");
