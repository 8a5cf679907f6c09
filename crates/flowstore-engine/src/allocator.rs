//! Table-id allocator.
//!
//! Logical table ids are per-device, start at 1 and only ever grow, so an
//! id is never handed out twice for the same device even after the table is
//! removed or the device reconnects. Local ids are the device's compact
//! addressing space; `bind` always takes the smallest free slot.
//!
//! Every operation on a device runs under that device's own lock, so
//! devices allocate in parallel while allocations for one device are
//! serialized.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use flowstore_core::config::MAX_TABLE_ID_SPACE;
use flowstore_core::{
    DeviceId, FlowError, FlowResult, LocalTableId, LogicalTableId, TableType,
};
use flowstore_state::TableBinding;

#[derive(Debug)]
struct DeviceIds {
    next_logical: u64,
    capacity: u16,
    /// Whether `capacity` came from the device rather than config.
    advertised: bool,
    bindings: BTreeMap<LogicalTableId, LocalTableId>,
}

impl DeviceIds {
    fn new(capacity: u16) -> Self {
        Self {
            next_logical: 1,
            capacity,
            advertised: false,
            bindings: BTreeMap::new(),
        }
    }

    fn smallest_free(&self) -> Option<LocalTableId> {
        let mut used = [false; MAX_TABLE_ID_SPACE as usize];
        for local in self.bindings.values() {
            used[local.0 as usize] = true;
        }
        (0..self.capacity.min(MAX_TABLE_ID_SPACE))
            .find(|slot| !used[*slot as usize])
            .map(|slot| LocalTableId(slot as u8))
    }
}

/// Allocator state of one device, as carried in snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorSnapshot {
    pub next_table_id: u64,
    /// `Some` only when the device advertised its own space.
    pub table_id_space: Option<u16>,
    pub bindings: Vec<TableBinding>,
}

pub struct TableIdAllocator {
    default_capacity: u16,
    devices: Mutex<HashMap<DeviceId, Arc<Mutex<DeviceIds>>>>,
}

impl TableIdAllocator {
    pub fn new(default_capacity: u16) -> Self {
        Self {
            default_capacity: default_capacity.clamp(1, MAX_TABLE_ID_SPACE),
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a fresh logical id for a new table on `device_id`.
    ///
    /// One counter serves every table type of a device. Ids therefore stay
    /// unique per device, and a table keeps its type in its `FlowTable`
    /// record rather than in the id.
    pub fn allocate(&self, device_id: &DeviceId, table_type: TableType) -> LogicalTableId {
        let slot = self.device(device_id);
        let mut ids = lock(&slot);
        let id = LogicalTableId(ids.next_logical);
        ids.next_logical += 1;
        debug!(%device_id, table_id = %id, %table_type, "logical table id allocated");
        id
    }

    /// Bind `logical` to the smallest free local id. Binding an already
    /// bound id returns its existing local id.
    pub fn bind(&self, device_id: &DeviceId, logical: LogicalTableId) -> FlowResult<LocalTableId> {
        let slot = self.device(device_id);
        let mut ids = lock(&slot);
        if logical.0 == 0 || logical.0 >= ids.next_logical {
            return Err(FlowError::TableNotFound {
                device_id: device_id.clone(),
                table_id: logical,
            });
        }
        if let Some(local) = ids.bindings.get(&logical) {
            return Ok(*local);
        }
        let local = ids.smallest_free().ok_or_else(|| FlowError::CapacityExhausted {
            device_id: device_id.clone(),
            capacity: ids.capacity,
        })?;
        ids.bindings.insert(logical, local);
        debug!(%device_id, table_id = %logical, %local, "table id bound");
        Ok(local)
    }

    /// Drop the binding of `logical`. Releasing an unbound id is a no-op.
    pub fn release(&self, device_id: &DeviceId, logical: LogicalTableId) -> Option<LocalTableId> {
        let slot = self.device(device_id);
        let released = lock(&slot).bindings.remove(&logical);
        if let Some(local) = released {
            debug!(%device_id, table_id = %logical, %local, "table id released");
        }
        released
    }

    pub fn lookup(&self, device_id: &DeviceId, logical: LogicalTableId) -> Option<LocalTableId> {
        let slot = self.device(device_id);
        let ids = lock(&slot);
        ids.bindings.get(&logical).copied()
    }

    /// Drop every binding of a device. The logical counter is kept.
    pub fn release_device(&self, device_id: &DeviceId) -> Vec<TableBinding> {
        let slot = self.device(device_id);
        let mut ids = lock(&slot);
        let released: Vec<TableBinding> = std::mem::take(&mut ids.bindings)
            .into_iter()
            .map(|(logical, local)| TableBinding { logical, local })
            .collect();
        debug!(%device_id, released = released.len(), "device table ids released");
        released
    }

    /// Record the id space the device advertised on connect.
    pub fn set_capacity(&self, device_id: &DeviceId, capacity: u16) {
        let slot = self.device(device_id);
        let mut ids = lock(&slot);
        ids.capacity = capacity.clamp(1, MAX_TABLE_ID_SPACE);
        ids.advertised = true;
    }

    pub fn capacity(&self, device_id: &DeviceId) -> u16 {
        let slot = self.device(device_id);
        let ids = lock(&slot);
        ids.capacity
    }

    /// Restore a device from a snapshot. The logical counter never moves
    /// backwards, so ids issued before a fail-over stay unique.
    pub fn seed(&self, device_id: &DeviceId, snapshot: &AllocatorSnapshot) {
        let slot = self.device(device_id);
        let mut ids = lock(&slot);
        ids.next_logical = ids.next_logical.max(snapshot.next_table_id).max(1);
        if let Some(space) = snapshot.table_id_space {
            ids.capacity = space.clamp(1, MAX_TABLE_ID_SPACE);
            ids.advertised = true;
        }
        ids.bindings = snapshot
            .bindings
            .iter()
            .map(|b| (b.logical, b.local))
            .collect();
        debug!(
            %device_id,
            next_table_id = ids.next_logical,
            bindings = ids.bindings.len(),
            "allocator seeded"
        );
    }

    pub fn snapshot(&self, device_id: &DeviceId) -> AllocatorSnapshot {
        let slot = self.device(device_id);
        let ids = lock(&slot);
        AllocatorSnapshot {
            next_table_id: ids.next_logical,
            table_id_space: ids.advertised.then_some(ids.capacity),
            bindings: ids
                .bindings
                .iter()
                .map(|(logical, local)| TableBinding {
                    logical: *logical,
                    local: *local,
                })
                .collect(),
        }
    }

    fn device(&self, device_id: &DeviceId) -> Arc<Mutex<DeviceIds>> {
        let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        devices
            .entry(device_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(DeviceIds::new(self.default_capacity))))
            .clone()
    }
}

fn lock(slot: &Mutex<DeviceIds>) -> MutexGuard<'_, DeviceIds> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev() -> DeviceId {
        DeviceId::new("dev:1")
    }

    #[test]
    fn allocate_bind_release_rebind() {
        let alloc = TableIdAllocator::new(256);
        let first = alloc.allocate(&dev(), TableType::ExactMatch);
        let t = alloc.allocate(&dev(), TableType::ExactMatch);
        assert!(t > first);

        assert_eq!(alloc.bind(&dev(), t).unwrap(), LocalTableId(0));
        assert_eq!(alloc.release(&dev(), t), Some(LocalTableId(0)));
        assert_eq!(alloc.bind(&dev(), t).unwrap(), LocalTableId(0));
    }

    #[test]
    fn logical_ids_are_never_reused() {
        let alloc = TableIdAllocator::new(4);
        let a = alloc.allocate(&dev(), TableType::Linear);
        alloc.bind(&dev(), a).unwrap();
        alloc.release(&dev(), a);
        alloc.release_device(&dev());

        let b = alloc.allocate(&dev(), TableType::Linear);
        assert!(b > a);
    }

    #[test]
    fn table_types_share_one_counter() {
        let alloc = TableIdAllocator::new(8);
        let ids: Vec<LogicalTableId> = [
            TableType::ExactMatch,
            TableType::Linear,
            TableType::ExactMatch,
        ]
        .into_iter()
        .map(|table_type| alloc.allocate(&dev(), table_type))
        .collect();
        assert_eq!(ids, vec![LogicalTableId(1), LogicalTableId(2), LogicalTableId(3)]);
    }

    #[test]
    fn devices_have_independent_counters() {
        let alloc = TableIdAllocator::new(8);
        assert_eq!(alloc.allocate(&dev(), TableType::Linear), LogicalTableId(1));
        assert_eq!(
            alloc.allocate(&DeviceId::new("dev:2"), TableType::Linear),
            LogicalTableId(1)
        );
        assert_eq!(alloc.allocate(&dev(), TableType::Linear), LogicalTableId(2));
    }

    #[test]
    fn bind_takes_smallest_free_slot() {
        let alloc = TableIdAllocator::new(8);
        let ids: Vec<LogicalTableId> = (0..3)
            .map(|_| alloc.allocate(&dev(), TableType::MaskedMatch))
            .collect();
        for id in &ids {
            alloc.bind(&dev(), *id).unwrap();
        }
        alloc.release(&dev(), ids[1]);

        let next = alloc.allocate(&dev(), TableType::MaskedMatch);
        assert_eq!(alloc.bind(&dev(), next).unwrap(), LocalTableId(1));
    }

    #[test]
    fn bind_is_idempotent() {
        let alloc = TableIdAllocator::new(8);
        let t = alloc.allocate(&dev(), TableType::ExactMatch);
        let local = alloc.bind(&dev(), t).unwrap();
        assert_eq!(alloc.bind(&dev(), t).unwrap(), local);
        assert_eq!(alloc.snapshot(&dev()).bindings.len(), 1);
    }

    #[test]
    fn capacity_exhausted() {
        let alloc = TableIdAllocator::new(2);
        for _ in 0..2 {
            let t = alloc.allocate(&dev(), TableType::ExactMatch);
            alloc.bind(&dev(), t).unwrap();
        }
        let t = alloc.allocate(&dev(), TableType::ExactMatch);
        assert_eq!(
            alloc.bind(&dev(), t),
            Err(FlowError::CapacityExhausted {
                device_id: dev(),
                capacity: 2
            })
        );
    }

    #[test]
    fn advertised_capacity_overrides_default() {
        let alloc = TableIdAllocator::new(256);
        alloc.set_capacity(&dev(), 1);
        let a = alloc.allocate(&dev(), TableType::Linear);
        let b = alloc.allocate(&dev(), TableType::Linear);
        alloc.bind(&dev(), a).unwrap();
        assert!(alloc.bind(&dev(), b).is_err());
        assert_eq!(alloc.snapshot(&dev()).table_id_space, Some(1));
    }

    #[test]
    fn unallocated_id_cannot_be_bound() {
        let alloc = TableIdAllocator::new(8);
        assert!(matches!(
            alloc.bind(&dev(), LogicalTableId(5)),
            Err(FlowError::TableNotFound { .. })
        ));
    }

    #[test]
    fn release_is_idempotent() {
        let alloc = TableIdAllocator::new(8);
        let t = alloc.allocate(&dev(), TableType::Linear);
        alloc.bind(&dev(), t).unwrap();
        assert!(alloc.release(&dev(), t).is_some());
        assert!(alloc.release(&dev(), t).is_none());
        assert!(alloc.lookup(&dev(), t).is_none());
    }

    #[test]
    fn local_ids_stay_bijective() {
        let alloc = TableIdAllocator::new(16);
        for _ in 0..10 {
            let t = alloc.allocate(&dev(), TableType::ExactMatch);
            alloc.bind(&dev(), t).unwrap();
        }
        for t in [2, 5, 7] {
            alloc.release(&dev(), LogicalTableId(t));
        }
        for _ in 0..3 {
            let t = alloc.allocate(&dev(), TableType::ExactMatch);
            alloc.bind(&dev(), t).unwrap();
        }
        let snapshot = alloc.snapshot(&dev());
        let mut locals: Vec<u8> = snapshot.bindings.iter().map(|b| b.local.0).collect();
        locals.sort_unstable();
        locals.dedup();
        assert_eq!(locals.len(), snapshot.bindings.len());
        assert_eq!(locals, (0..10).collect::<Vec<u8>>());
    }

    #[test]
    fn seed_never_moves_counter_backwards() {
        let alloc = TableIdAllocator::new(8);
        for _ in 0..5 {
            alloc.allocate(&dev(), TableType::Linear);
        }
        alloc.seed(
            &dev(),
            &AllocatorSnapshot {
                next_table_id: 3,
                table_id_space: None,
                bindings: vec![TableBinding {
                    logical: LogicalTableId(2),
                    local: LocalTableId(4),
                }],
            },
        );
        assert_eq!(alloc.allocate(&dev(), TableType::Linear), LogicalTableId(6));
        assert_eq!(alloc.lookup(&dev(), LogicalTableId(2)), Some(LocalTableId(4)));
    }
}
