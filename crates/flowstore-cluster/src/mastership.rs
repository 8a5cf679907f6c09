//! Mastership manager: which replica owns writes for each device.
//!
//! Holds the mastership records, persists them to the `StateStore`, and
//! publishes every change as an ordered `MastershipEvent` stream. Replicas
//! never poll; they react to the feed.

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use flowstore_core::{DeviceId, Epoch, FlowError, FlowResult, ReplicaId, epoch_millis};
use flowstore_state::{MastershipRecord, StateResult, StateStore};

const EVENT_BUFFER: usize = 1024;

/// A change of mastership for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MastershipEvent {
    /// Master before the change, if the device had one.
    pub previous: Option<ReplicaId>,
    pub record: MastershipRecord,
}

impl MastershipEvent {
    pub fn device_id(&self) -> &DeviceId {
        &self.record.device_id
    }

    pub fn epoch(&self) -> Epoch {
        self.record.epoch
    }
}

/// Read side of the mastership source of truth, as consumed by the store.
pub trait MastershipService: Send + Sync {
    /// Current record for a device, or `None` if it has never been assigned.
    fn mastership(&self, device_id: &DeviceId) -> FlowResult<Option<MastershipRecord>>;

    /// Every known record. Used to resynchronise after missing events.
    fn records(&self) -> FlowResult<Vec<MastershipRecord>>;

    /// Subscribe to mastership changes, in the order they were made.
    fn subscribe(&self) -> broadcast::Receiver<MastershipEvent>;
}

/// Assigns and tracks device mastership.
///
/// Records are cached in memory for lock-free-ish lookups on the write path
/// and written through to the `StateStore` so epochs survive restarts.
pub struct MastershipManager {
    state: StateStore,
    records: RwLock<HashMap<DeviceId, MastershipRecord>>,
    events: broadcast::Sender<MastershipEvent>,
}

impl MastershipManager {
    /// Create a manager, loading any records already persisted.
    pub fn new(state: StateStore) -> StateResult<Self> {
        let records: HashMap<DeviceId, MastershipRecord> = state
            .list_mastership()?
            .into_iter()
            .map(|r| (r.device_id.clone(), r))
            .collect();
        if !records.is_empty() {
            info!(devices = records.len(), "mastership records loaded");
        }
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Ok(Self {
            state,
            records: RwLock::new(records),
            events,
        })
    }

    /// Make `master` the writer for `device_id`, with the given backups.
    ///
    /// The epoch increases whenever the master changes. Re-assigning the
    /// current master only updates the backup list.
    pub fn assign(
        &self,
        device_id: &DeviceId,
        master: &str,
        backups: Vec<ReplicaId>,
    ) -> StateResult<MastershipRecord> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let previous = records.get(device_id).cloned();
        let epoch = match &previous {
            Some(p) if p.master == master => p.epoch,
            Some(p) => p.epoch + 1,
            None => 1,
        };
        let record = MastershipRecord {
            device_id: device_id.clone(),
            master: master.to_string(),
            epoch,
            backups: backups.into_iter().filter(|b| b != master).collect(),
            updated_at: epoch_millis(),
        };

        self.state.put_mastership(&record)?;
        records.insert(device_id.clone(), record.clone());

        // Sent under the lock so subscribers see epochs in order.
        let event = MastershipEvent {
            previous: previous.map(|p| p.master),
            record: record.clone(),
        };
        if self.events.send(event).is_err() {
            debug!(%device_id, "no mastership subscribers");
        }
        info!(%device_id, %master, epoch, backups = ?record.backups, "mastership assigned");
        Ok(record)
    }

    /// Get the record of a single device.
    pub fn get(&self, device_id: &DeviceId) -> Option<MastershipRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(device_id)
            .cloned()
    }

    /// List all records.
    pub fn list(&self) -> Vec<MastershipRecord> {
        let mut records: Vec<MastershipRecord> = self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        records
    }

    /// Devices currently mastered by `replica`.
    pub fn devices_of(&self, replica: &str) -> Vec<DeviceId> {
        self.list()
            .into_iter()
            .filter(|r| r.is_master(replica))
            .map(|r| r.device_id)
            .collect()
    }

    /// Move every device mastered by a failed replica to its first backup.
    ///
    /// Devices without a usable backup keep their record and are logged.
    /// Returns the new records.
    pub fn fail_over(&self, failed: &str) -> StateResult<Vec<MastershipRecord>> {
        let mut promoted = Vec::new();
        for record in self.list() {
            if !record.is_master(failed) {
                continue;
            }
            let mut candidates = record.backups.iter().filter(|b| *b != failed);
            match candidates.next() {
                Some(next) => {
                    let rest: Vec<ReplicaId> = candidates.cloned().collect();
                    promoted.push(self.assign(&record.device_id, next, rest)?);
                }
                None => {
                    warn!(device_id = %record.device_id, %failed, "no backup to fail over to");
                }
            }
        }
        Ok(promoted)
    }
}

impl MastershipService for MastershipManager {
    fn mastership(&self, device_id: &DeviceId) -> FlowResult<Option<MastershipRecord>> {
        Ok(self.get(device_id))
    }

    fn records(&self) -> FlowResult<Vec<MastershipRecord>> {
        Ok(self.list())
    }

    fn subscribe(&self) -> broadcast::Receiver<MastershipEvent> {
        self.events.subscribe()
    }
}

/// Resolve the master of `device_id`, failing with `DeviceNotFound` when the
/// device has never been assigned.
pub fn resolve_master(
    service: &dyn MastershipService,
    device_id: &DeviceId,
) -> FlowResult<MastershipRecord> {
    service
        .mastership(device_id)?
        .ok_or_else(|| FlowError::DeviceNotFound {
            device_id: device_id.clone(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    fn dev(id: &str) -> DeviceId {
        DeviceId::new(id)
    }

    #[test]
    fn first_assignment_starts_at_epoch_one() {
        let mgr = MastershipManager::new(test_state()).unwrap();
        let record = mgr
            .assign(&dev("of:1"), "r1", vec!["r2".to_string()])
            .unwrap();

        assert_eq!(record.epoch, 1);
        assert_eq!(record.master, "r1");
        assert_eq!(mgr.get(&dev("of:1")), Some(record));
    }

    #[test]
    fn epoch_increases_only_on_master_change() {
        let mgr = MastershipManager::new(test_state()).unwrap();
        mgr.assign(&dev("of:1"), "r1", vec![]).unwrap();
        let same = mgr
            .assign(&dev("of:1"), "r1", vec!["r3".to_string()])
            .unwrap();
        assert_eq!(same.epoch, 1);
        assert_eq!(same.backups, vec!["r3"]);

        let moved = mgr.assign(&dev("of:1"), "r2", vec![]).unwrap();
        assert_eq!(moved.epoch, 2);
    }

    #[test]
    fn master_is_never_its_own_backup() {
        let mgr = MastershipManager::new(test_state()).unwrap();
        let record = mgr
            .assign(&dev("of:1"), "r1", vec!["r1".to_string(), "r2".to_string()])
            .unwrap();
        assert_eq!(record.backups, vec!["r2"]);
    }

    #[tokio::test]
    async fn subscribers_see_changes_in_order() {
        let mgr = MastershipManager::new(test_state()).unwrap();
        let mut events = mgr.subscribe();

        mgr.assign(&dev("of:1"), "r1", vec![]).unwrap();
        mgr.assign(&dev("of:1"), "r2", vec![]).unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(first.previous, None);
        assert_eq!(first.epoch(), 1);
        let second = events.recv().await.unwrap();
        assert_eq!(second.previous.as_deref(), Some("r1"));
        assert_eq!(second.epoch(), 2);
        assert_eq!(second.device_id(), &dev("of:1"));
    }

    #[test]
    fn fail_over_promotes_first_backup() {
        let mgr = MastershipManager::new(test_state()).unwrap();
        mgr.assign(&dev("of:1"), "r1", vec!["r2".to_string(), "r3".to_string()])
            .unwrap();
        mgr.assign(&dev("of:2"), "r2", vec!["r1".to_string()])
            .unwrap();
        mgr.assign(&dev("of:3"), "r1", vec![]).unwrap();

        let promoted = mgr.fail_over("r1").unwrap();

        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].master, "r2");
        assert_eq!(promoted[0].backups, vec!["r3"]);
        assert_eq!(promoted[0].epoch, 2);
        // Unaffected device, and the one without backups, keep their master.
        assert_eq!(mgr.get(&dev("of:2")).unwrap().master, "r2");
        assert_eq!(mgr.get(&dev("of:3")).unwrap().master, "r1");
    }

    #[test]
    fn epochs_survive_restart() {
        let state = test_state();
        {
            let mgr = MastershipManager::new(state.clone()).unwrap();
            mgr.assign(&dev("of:1"), "r1", vec![]).unwrap();
            mgr.assign(&dev("of:1"), "r2", vec![]).unwrap();
        }

        let mgr = MastershipManager::new(state).unwrap();
        let record = mgr.assign(&dev("of:1"), "r3", vec![]).unwrap();
        assert_eq!(record.epoch, 3);
        assert_eq!(mgr.devices_of("r3"), vec![dev("of:1")]);
    }

    #[test]
    fn resolve_unknown_device() {
        let mgr = MastershipManager::new(test_state()).unwrap();
        let err = resolve_master(&mgr, &dev("of:9")).unwrap_err();
        assert!(matches!(err, FlowError::DeviceNotFound { .. }));
    }
}
