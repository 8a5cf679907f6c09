//! StateStore: redb-backed backup persistence for the flow store.
//!
//! Stores device snapshots (split into a header plus per-table and
//! per-entry rows) and mastership records. All values are JSON-serialized
//! into redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadTransaction, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use flowstore_core::{DeviceId, FlowEntry, FlowTable};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Drop every row of `$device` in an open write table, then insert `$rows`.
macro_rules! replace_rows {
    ($table:expr, $device:expr, $rows:expr) => {{
        let mut stale: Vec<u64> = Vec::new();
        for entry in $table.range(device_range($device)).map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            stale.push(key.value().1);
        }
        for id in stale {
            $table.remove(($device, id)).map_err(map_err!(Write))?;
        }
        for (id, value) in $rows {
            $table
                .insert(($device, *id), value.as_slice())
                .map_err(map_err!(Write))?;
        }
    }};
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(DEVICE_SNAPSHOTS).map_err(map_err!(Table))?;
        txn.open_table(FLOW_TABLES).map_err(map_err!(Table))?;
        txn.open_table(FLOW_ENTRIES).map_err(map_err!(Table))?;
        txn.open_table(MASTERSHIP).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Device snapshots ───────────────────────────────────────────

    /// Store a device snapshot if its stamp is newer than the stored one.
    ///
    /// Returns `false` and leaves the store untouched when an equal or newer
    /// snapshot is already present, so a late backup can never overwrite a
    /// fresher write.
    pub fn put_snapshot(&self, snapshot: &DeviceSnapshot) -> StateResult<bool> {
        let key = snapshot.table_key();
        let header = serde_json::to_vec(&snapshot.header()).map_err(map_err!(Serialize))?;
        let table_rows = stamped_rows(snapshot, &snapshot.tables, |t| t.id.0)?;
        let entry_rows = stamped_rows(snapshot, &snapshot.entries, |e| e.id().value())?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let current = {
            let headers = txn.open_table(DEVICE_SNAPSHOTS).map_err(map_err!(Table))?;
            let stored = headers
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            match stored {
                Some(bytes) => {
                    let current: DeviceSnapshot =
                        serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;
                    Some(current.stamp())
                }
                None => None,
            }
        };
        if current.is_some_and(|stamp| !snapshot.is_newer_than(stamp)) {
            txn.abort().map_err(map_err!(Transaction))?;
            debug!(%key, stored = ?current, offered = ?snapshot.stamp(), "stale snapshot ignored");
            return Ok(false);
        }
        {
            let mut headers = txn.open_table(DEVICE_SNAPSHOTS).map_err(map_err!(Table))?;
            headers
                .insert(key.as_str(), header.as_slice())
                .map_err(map_err!(Write))?;
            let mut tables = txn.open_table(FLOW_TABLES).map_err(map_err!(Table))?;
            replace_rows!(tables, key.as_str(), &table_rows);
            let mut entries = txn.open_table(FLOW_ENTRIES).map_err(map_err!(Table))?;
            replace_rows!(entries, key.as_str(), &entry_rows);
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            %key,
            epoch = snapshot.epoch,
            version = snapshot.version,
            tables = snapshot.tables.len(),
            entries = snapshot.entries.len(),
            "snapshot stored"
        );
        Ok(true)
    }

    /// Get the full snapshot of a device.
    pub fn get_snapshot(&self, device_id: &DeviceId) -> StateResult<Option<DeviceSnapshot>> {
        let key = device_id.to_string();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let header = {
            let headers = txn.open_table(DEVICE_SNAPSHOTS).map_err(map_err!(Table))?;
            match headers.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => serde_json::from_slice::<DeviceSnapshot>(guard.value())
                    .map_err(map_err!(Deserialize))?,
                None => return Ok(None),
            }
        };
        let mut tables: Vec<FlowTable> = read_rows(&txn, FLOW_TABLES, &key)?
            .into_iter()
            .map(|row| row.record)
            .collect();
        tables.sort_by_key(|t| t.id);
        let entries: Vec<FlowEntry> = read_rows(&txn, FLOW_ENTRIES, &key)?
            .into_iter()
            .map(|row| row.record)
            .collect();
        Ok(Some(DeviceSnapshot {
            tables,
            entries,
            ..header
        }))
    }

    /// List every stored device snapshot.
    pub fn list_snapshots(&self) -> StateResult<Vec<DeviceSnapshot>> {
        let devices: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let headers = txn.open_table(DEVICE_SNAPSHOTS).map_err(map_err!(Table))?;
            let mut keys = Vec::new();
            for entry in headers.iter().map_err(map_err!(Read))? {
                let (key, _) = entry.map_err(map_err!(Read))?;
                keys.push(key.value().to_string());
            }
            keys
        };
        let mut results = Vec::with_capacity(devices.len());
        for device in devices {
            if let Some(snapshot) = self.get_snapshot(&DeviceId::new(device))? {
                results.push(snapshot);
            }
        }
        Ok(results)
    }

    /// Stored table rows of one device, with the stamp that wrote each.
    pub fn list_tables(&self, device_id: &DeviceId) -> StateResult<Vec<Stamped<FlowTable>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let mut rows: Vec<Stamped<FlowTable>> = read_rows(&txn, FLOW_TABLES, device_id.as_str())?;
        rows.sort_by_key(|row| row.record.id);
        Ok(rows)
    }

    /// Stored entry rows of one device, with the stamp that wrote each.
    pub fn list_entries(&self, device_id: &DeviceId) -> StateResult<Vec<Stamped<FlowEntry>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        read_rows(&txn, FLOW_ENTRIES, device_id.as_str())
    }

    /// Delete a device snapshot and all its rows. Returns true if it existed.
    pub fn delete_device(&self, device_id: &DeviceId) -> StateResult<bool> {
        let key = device_id.to_string();
        let no_rows: Vec<(u64, Vec<u8>)> = Vec::new();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut headers = txn.open_table(DEVICE_SNAPSHOTS).map_err(map_err!(Table))?;
            existed = headers
                .remove(key.as_str())
                .map_err(map_err!(Write))?
                .is_some();
            let mut tables = txn.open_table(FLOW_TABLES).map_err(map_err!(Table))?;
            replace_rows!(tables, key.as_str(), &no_rows);
            let mut entries = txn.open_table(FLOW_ENTRIES).map_err(map_err!(Table))?;
            replace_rows!(entries, key.as_str(), &no_rows);
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "device snapshot deleted");
        Ok(existed)
    }

    // ── Mastership ─────────────────────────────────────────────────

    /// Insert or update a mastership record.
    pub fn put_mastership(&self, record: &MastershipRecord) -> StateResult<()> {
        let key = record.device_id.to_string();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(MASTERSHIP).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, master = %record.master, epoch = record.epoch, "mastership stored");
        Ok(())
    }

    /// Get the mastership record of a device.
    pub fn get_mastership(&self, device_id: &DeviceId) -> StateResult<Option<MastershipRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MASTERSHIP).map_err(map_err!(Table))?;
        match table.get(device_id.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: MastershipRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List all mastership records.
    pub fn list_mastership(&self) -> StateResult<Vec<MastershipRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MASTERSHIP).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: MastershipRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }
}

/// Every row key of one device.
fn device_range(device: &str) -> RangeInclusive<RowKey<'_>> {
    (device, 0)..=(device, u64::MAX)
}

/// Serialize rows of a snapshot, each wrapped with the snapshot's stamp.
fn stamped_rows<T, F>(
    snapshot: &DeviceSnapshot,
    records: &[T],
    id_of: F,
) -> StateResult<Vec<(u64, Vec<u8>)>>
where
    T: Serialize + Clone,
    F: Fn(&T) -> u64,
{
    records
        .iter()
        .map(|record| {
            let row = Stamped {
                epoch: snapshot.epoch,
                version: snapshot.version,
                record: record.clone(),
            };
            let value = serde_json::to_vec(&row).map_err(map_err!(Serialize))?;
            Ok((id_of(record), value))
        })
        .collect()
}

fn read_rows<T: DeserializeOwned>(
    txn: &ReadTransaction,
    definition: TableDefinition<'static, RowKey<'static>, &'static [u8]>,
    device: &str,
) -> StateResult<Vec<Stamped<T>>> {
    let table = txn.open_table(definition).map_err(map_err!(Table))?;
    let mut results = Vec::new();
    for entry in table.range(device_range(device)).map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        let row: Stamped<T> =
            serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
        results.push(row);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowstore_core::{
        FlowEntryId, FlowRule, LocalTableId, LogicalTableId, MatchField, PiTableAction, TableType,
    };

    fn device() -> DeviceId {
        DeviceId::new("pof:1")
    }

    fn table(id: u64) -> FlowTable {
        FlowTable {
            id: LogicalTableId(id),
            device_id: device(),
            name: format!("table-{id}"),
            table_type: TableType::ExactMatch,
            size: 64,
            match_fields: vec![MatchField {
                field_id: 1,
                name: "dst".to_string(),
                offset: 0,
                length: 48,
            }],
            app_id: "app".to_string(),
        }
    }

    fn entry(id: u64) -> FlowEntry {
        FlowEntry::pending(
            FlowRule {
                id: FlowEntryId(id),
                device_id: device(),
                table_id: LogicalTableId(1),
                priority: 1,
                app_id: "app".to_string(),
                criteria: vec![],
                actions: vec![PiTableAction::member(1)],
            },
            0,
        )
    }

    fn snapshot(epoch: u64, version: u64, tables: u64, entries: u64) -> DeviceSnapshot {
        let mut snap = DeviceSnapshot::empty(device(), epoch);
        snap.version = version;
        snap.tables = (1..=tables).map(table).collect();
        snap.entries = (1..=entries).map(entry).collect();
        snap.bindings = vec![TableBinding {
            logical: LogicalTableId(1),
            local: LocalTableId(0),
        }];
        snap.next_table_id = tables + 1;
        snap
    }

    // ── Snapshots ──────────────────────────────────────────────────

    #[test]
    fn snapshot_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let snap = snapshot(1, 1, 2, 3);

        assert!(store.put_snapshot(&snap).unwrap());
        let retrieved = store.get_snapshot(&device()).unwrap();

        assert_eq!(retrieved, Some(snap));
    }

    #[test]
    fn stale_snapshot_is_ignored() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_snapshot(&snapshot(2, 5, 2, 2)).unwrap();

        // Same epoch, older version.
        assert!(!store.put_snapshot(&snapshot(2, 4, 1, 0)).unwrap());
        // Older epoch, higher version.
        assert!(!store.put_snapshot(&snapshot(1, 99, 1, 0)).unwrap());
        // Equal stamp.
        assert!(!store.put_snapshot(&snapshot(2, 5, 0, 0)).unwrap());

        let stored = store.get_snapshot(&device()).unwrap().unwrap();
        assert_eq!(stored.stamp(), (2, 5));
        assert_eq!(stored.tables.len(), 2);
    }

    #[test]
    fn newer_snapshot_replaces_rows() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_snapshot(&snapshot(1, 1, 3, 5)).unwrap();
        assert!(store.put_snapshot(&snapshot(1, 2, 1, 1)).unwrap());

        assert_eq!(store.list_tables(&device()).unwrap().len(), 1);
        let entries = store.list_entries(&device()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].version, 2);
    }

    #[test]
    fn devices_do_not_share_rows() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_snapshot(&snapshot(1, 1, 1, 2)).unwrap();

        let mut other = DeviceSnapshot::empty(DeviceId::new("pof:10"), 1);
        other.version = 1;
        store.put_snapshot(&other).unwrap();

        assert_eq!(store.list_entries(&device()).unwrap().len(), 2);
        assert!(
            store
                .list_entries(&DeviceId::new("pof:10"))
                .unwrap()
                .is_empty()
        );
        assert_eq!(store.list_snapshots().unwrap().len(), 2);
    }

    #[test]
    fn device_ids_sharing_a_prefix_keep_their_rows() {
        let store = StateStore::open_in_memory().unwrap();
        let subnet = DeviceId::new("netconf:10.0.0.1/24");
        let host = DeviceId::new("netconf:10.0.0.1");

        let mut first = DeviceSnapshot::empty(subnet.clone(), 1);
        first.version = 1;
        first.entries = vec![entry(1), entry(2)];
        store.put_snapshot(&first).unwrap();

        let mut second = DeviceSnapshot::empty(host.clone(), 1);
        second.version = 1;
        second.entries = vec![entry(3)];
        store.put_snapshot(&second).unwrap();

        assert_eq!(store.list_entries(&subnet).unwrap().len(), 2);
        let host_entries = store.get_snapshot(&host).unwrap().unwrap().entries;
        assert_eq!(host_entries.len(), 1);
        assert_eq!(host_entries[0].id(), FlowEntryId(3));

        assert!(store.delete_device(&host).unwrap());
        assert_eq!(store.get_snapshot(&subnet).unwrap().unwrap().entries.len(), 2);
    }

    #[test]
    fn delete_device_removes_rows() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_snapshot(&snapshot(1, 1, 2, 2)).unwrap();

        assert!(store.delete_device(&device()).unwrap());
        assert!(store.get_snapshot(&device()).unwrap().is_none());
        assert!(store.list_tables(&device()).unwrap().is_empty());
        assert!(store.list_entries(&device()).unwrap().is_empty());
        assert!(!store.delete_device(&device()).unwrap());
    }

    // ── Mastership ─────────────────────────────────────────────────

    #[test]
    fn mastership_put_get_list() {
        let store = StateStore::open_in_memory().unwrap();
        let record = MastershipRecord {
            device_id: device(),
            master: "r1".to_string(),
            epoch: 3,
            backups: vec!["r2".to_string()],
            updated_at: 10,
        };
        store.put_mastership(&record).unwrap();

        assert_eq!(store.get_mastership(&device()).unwrap(), Some(record));
        assert_eq!(store.list_mastership().unwrap().len(), 1);
        assert!(
            store
                .get_mastership(&DeviceId::new("of:9"))
                .unwrap()
                .is_none()
        );
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("flows.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_snapshot(&snapshot(4, 7, 1, 2)).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        let snap = store.get_snapshot(&device()).unwrap().unwrap();
        assert_eq!(snap.stamp(), (4, 7));
        assert_eq!(snap.entries.len(), 2);
        assert_eq!(snap.next_table_id, 2);
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_snapshots().unwrap().is_empty());
        assert!(store.list_mastership().unwrap().is_empty());
        assert!(store.get_snapshot(&device()).unwrap().is_none());
        assert!(store.list_entries(&device()).unwrap().is_empty());
    }
}
