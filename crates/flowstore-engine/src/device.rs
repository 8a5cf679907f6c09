//! Per-device state and its single-writer worker.
//!
//! The master of a device runs exactly one `DeviceWorker` for it. Every
//! mutation (batches, standalone removals, adapter events) is a
//! `DeviceCommand` on the worker's queue, so one client's operations are
//! applied in the order they were submitted. Readers look at the shared
//! `DeviceState` directly; the worker only holds its write lock between
//! awaits.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use flowstore_cluster::{BackupRequest, MastershipService, RpcClient, resolve_master};
use flowstore_core::{
    BatchOperation, BatchResult, BoundTable, DeviceId, Epoch, FlowEntry, FlowEntryId,
    FlowEntryState, FlowError, FlowOp, FlowResult, FlowRule, FlowStats, FlowTable, LocalTableId,
    LogicalTableId, OperationId, OperationResult, ReplicaId, StoreConfig, TableSpec, epoch_millis,
};
use flowstore_state::{DeviceSnapshot, SnapshotStamp, StateStore};

use crate::adapter::{AdapterRegistry, AdapterResult, BoxFuture, DeviceAdapter, DeviceEvent, confirm};
use crate::allocator::{AllocatorSnapshot, TableIdAllocator};
use crate::event::StoreEvent;

const COMMAND_QUEUE: usize = 256;

/// Everything a replica's workers share.
pub(crate) struct Shared {
    pub replica_id: ReplicaId,
    pub config: StoreConfig,
    pub mastership: Arc<dyn MastershipService>,
    pub adapters: AdapterRegistry,
    pub allocator: TableIdAllocator,
    pub state: Option<StateStore>,
    pub rpc: Arc<RpcClient>,
    pub events: broadcast::Sender<StoreEvent>,
}

impl Shared {
    pub fn emit(&self, event: StoreEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}

// ── State ──────────────────────────────────────────────────────────

/// One replica's copy of a device: authoritative on the master, a
/// read-only backup elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DeviceState {
    pub device_id: DeviceId,
    pub epoch: Epoch,
    pub version: u64,
    pub tables: BTreeMap<LogicalTableId, FlowTable>,
    pub entries: BTreeMap<FlowEntryId, FlowEntry>,
    /// Allocator state as of the last snapshot. Live on the allocator
    /// while this replica is master.
    pub allocation: AllocatorSnapshot,
    recent_ops: VecDeque<OperationResult>,
}

impl DeviceState {
    pub fn empty(device_id: &DeviceId) -> Self {
        Self::from_snapshot(&DeviceSnapshot::empty(device_id.clone(), 0))
    }

    pub fn from_snapshot(snapshot: &DeviceSnapshot) -> Self {
        Self {
            device_id: snapshot.device_id.clone(),
            epoch: snapshot.epoch,
            version: snapshot.version,
            tables: snapshot
                .tables
                .iter()
                .map(|t| (t.id, t.clone()))
                .collect(),
            entries: snapshot
                .entries
                .iter()
                .map(|e| (e.id(), e.clone()))
                .collect(),
            allocation: AllocatorSnapshot {
                next_table_id: snapshot.next_table_id,
                table_id_space: snapshot.table_id_space,
                bindings: snapshot.bindings.clone(),
            },
            recent_ops: snapshot.recent_ops.iter().cloned().collect(),
        }
    }

    pub fn stamp(&self) -> SnapshotStamp {
        (self.epoch, self.version)
    }

    pub fn snapshot(&self, taken_at: u64) -> DeviceSnapshot {
        DeviceSnapshot {
            device_id: self.device_id.clone(),
            epoch: self.epoch,
            version: self.version,
            next_table_id: self.allocation.next_table_id,
            table_id_space: self.allocation.table_id_space,
            bindings: self.allocation.bindings.clone(),
            tables: self.tables.values().cloned().collect(),
            entries: self.entries.values().cloned().collect(),
            recent_ops: self.recent_ops.iter().cloned().collect(),
            taken_at,
        }
    }

    /// Outcome already recorded for an operation id, if any.
    pub fn recorded(&self, id: OperationId) -> Option<&OperationResult> {
        self.recent_ops.iter().rev().find(|r| r.id == id)
    }

    pub fn record(&mut self, result: OperationResult, window: usize) {
        self.recent_ops.push_back(result);
        while self.recent_ops.len() > window {
            self.recent_ops.pop_front();
        }
    }

    pub fn entry(&self, entry_id: FlowEntryId) -> FlowResult<FlowEntry> {
        self.entries
            .get(&entry_id)
            .cloned()
            .ok_or_else(|| FlowError::EntryNotFound {
                device_id: self.device_id.clone(),
                entry_id,
            })
    }

    pub fn entry_list(&self) -> Vec<FlowEntry> {
        self.entries.values().cloned().collect()
    }

    pub fn table_list(&self) -> Vec<FlowTable> {
        self.tables.values().cloned().collect()
    }
}

/// Whether an outcome is final, and so safe to replay for a resubmitted
/// operation id. Outcomes that may have left the device undecided are not.
fn is_definitive(outcome: &FlowResult<()>) -> bool {
    match outcome {
        Ok(()) => true,
        Err(FlowError::DeviceTimeout { .. }) => false,
        Err(err) => !err.is_retryable(),
    }
}

// ── Commands ───────────────────────────────────────────────────────

pub(crate) enum DeviceCommand {
    Apply {
        epoch: Epoch,
        correlation_id: u64,
        operations: Vec<BatchOperation>,
        reply: oneshot::Sender<FlowResult<BatchResult>>,
    },
    RemoveEntry {
        epoch: Epoch,
        entry_id: FlowEntryId,
        reply: oneshot::Sender<FlowResult<()>>,
    },
    RemoveTable {
        epoch: Epoch,
        table_id: LogicalTableId,
        reply: oneshot::Sender<FlowResult<()>>,
    },
    Event {
        event: DeviceEvent,
        done: oneshot::Sender<()>,
    },
}

/// A running worker, as held in the owner's device slot.
pub(crate) struct WorkerHandle {
    pub epoch: Epoch,
    pub commands: mpsc::Sender<DeviceCommand>,
    /// Set (or dropped) when the replica loses the device. The worker
    /// abandons the adapter call it is waiting on.
    pub deposed: watch::Sender<bool>,
    pub handle: JoinHandle<()>,
}

/// Start the worker for `device_id` at `epoch`. It stops when every
/// command sender is gone or on shutdown.
pub(crate) fn spawn_worker(
    shared: Arc<Shared>,
    device_id: DeviceId,
    epoch: Epoch,
    state: Arc<RwLock<DeviceState>>,
    mut shutdown: watch::Receiver<bool>,
) -> WorkerHandle {
    let (commands, mut inbox) = mpsc::channel(COMMAND_QUEUE);
    let (deposed, deposed_rx) = watch::channel(false);
    let mut worker = DeviceWorker {
        shared,
        device_id,
        epoch,
        state,
        deposed: deposed_rx,
        pending_tables: HashMap::new(),
    };
    let handle = tokio::spawn(async move {
        debug!(device_id = %worker.device_id, epoch, "device worker started");
        loop {
            tokio::select! {
                command = inbox.recv() => {
                    let Some(command) = command else { break };
                    worker.handle(command).await;
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!(device_id = %worker.device_id, epoch, "device worker stopped");
    });
    WorkerHandle {
        epoch,
        commands,
        deposed,
        handle,
    }
}

// ── Worker ─────────────────────────────────────────────────────────

struct DeviceWorker {
    shared: Arc<Shared>,
    device_id: DeviceId,
    epoch: Epoch,
    state: Arc<RwLock<DeviceState>>,
    deposed: watch::Receiver<bool>,
    /// Table installs that timed out, by operation id, so a resubmission
    /// reuses the logical id instead of allocating another. Released when
    /// the device next reports in.
    pending_tables: HashMap<OperationId, LogicalTableId>,
}

impl DeviceWorker {
    async fn handle(&mut self, command: DeviceCommand) {
        match command {
            DeviceCommand::Apply {
                epoch,
                correlation_id,
                operations,
                reply,
            } => {
                let result = self.apply_batch(epoch, correlation_id, operations).await;
                let _ = reply.send(result);
            }
            DeviceCommand::RemoveEntry {
                epoch,
                entry_id,
                reply,
            } => {
                let result = match self.check_epoch(epoch) {
                    Ok(()) => {
                        let removed = self.remove_flow(entry_id).await;
                        match self.check_epoch(epoch) {
                            Ok(()) => {
                                self.commit();
                                removed
                            }
                            Err(err) => Err(err),
                        }
                    }
                    Err(err) => Err(err),
                };
                let _ = reply.send(result);
            }
            DeviceCommand::RemoveTable {
                epoch,
                table_id,
                reply,
            } => {
                let result = match self.check_epoch(epoch) {
                    Ok(()) => self
                        .remove_table(table_id)
                        .await
                        .and_then(|()| self.check_epoch(epoch)),
                    Err(err) => Err(err),
                };
                if result.is_ok() {
                    self.commit();
                }
                let _ = reply.send(result);
            }
            DeviceCommand::Event { event, done } => {
                if self.check_epoch(self.epoch).is_ok() {
                    self.on_device_event(event);
                } else {
                    debug!(device_id = %self.device_id, "device event ignored by superseded worker");
                }
                let _ = done.send(());
            }
        }
    }

    /// Confirm this worker still owns the device at `requested`.
    fn check_epoch(&self, requested: Epoch) -> FlowResult<()> {
        let record = resolve_master(self.shared.mastership.as_ref(), &self.device_id)?;
        if !record.is_master(&self.shared.replica_id) || record.epoch != self.epoch {
            return Err(self.not_master());
        }
        if requested != record.epoch {
            return Err(FlowError::StaleEpoch {
                device_id: self.device_id.clone(),
                seen: requested,
                current: record.epoch,
            });
        }
        Ok(())
    }

    /// Apply a batch in order. Ownership is re-checked before every
    /// operation and before the commit: a worker that loses the device
    /// part-way fails the whole batch so the caller retries it against the
    /// new master, and ships nothing.
    async fn apply_batch(
        &mut self,
        epoch: Epoch,
        correlation_id: u64,
        operations: Vec<BatchOperation>,
    ) -> FlowResult<BatchResult> {
        let window = self.shared.config.dedup_window;
        let mut results = Vec::with_capacity(operations.len());
        let mut changed = false;

        for operation in &operations {
            self.check_epoch(epoch)?;
            let previous = self.read().recorded(operation.id).cloned();
            if let Some(previous) = previous {
                debug!(device_id = %self.device_id, op = %operation.id, "operation already applied");
                results.push(previous);
                continue;
            }

            let (outcome, table_id) = match self.apply_op(operation).await {
                Ok(table_id) => (Ok(()), table_id),
                Err(err) => (Err(err), None),
            };
            if let Err(err) = &outcome {
                debug!(
                    device_id = %self.device_id,
                    op = %operation.id,
                    error = %err,
                    "operation failed"
                );
            }
            let mut result = OperationResult::for_operation(operation, outcome);
            if table_id.is_some() {
                result.table_id = table_id;
            }
            if is_definitive(&result.outcome) {
                self.write().record(result.clone(), window);
            }
            results.push(result);
            changed = true;
        }

        self.check_epoch(epoch)?;
        if changed {
            self.commit();
        }
        Ok(BatchResult {
            device_id: self.device_id.clone(),
            correlation_id,
            epoch: self.epoch,
            results,
        })
    }

    /// Apply one operation. Returns the logical id of a newly added table.
    async fn apply_op(&mut self, operation: &BatchOperation) -> FlowResult<Option<LogicalTableId>> {
        if operation.op.device_id() != &self.device_id {
            return Err(FlowError::InvalidRequest(format!(
                "{} targets {}, not {}",
                operation.id,
                operation.op.device_id(),
                self.device_id
            )));
        }
        match &operation.op {
            FlowOp::AddFlow(rule) => self.add_flow(rule).await.map(|_| None),
            FlowOp::ModifyFlow(rule) => self.modify_flow(rule).await.map(|_| None),
            FlowOp::RemoveFlow { entry_id, .. } => self.remove_flow(*entry_id).await.map(|_| None),
            FlowOp::AddTable(spec) => self.add_table(operation.id, spec).await.map(Some),
            FlowOp::RemoveTable { table_id, .. } => {
                self.remove_table(*table_id).await.map(|_| None)
            }
        }
    }

    // ── Tables ─────────────────────────────────────────────────────

    async fn add_table(&mut self, op_id: OperationId, spec: &TableSpec) -> FlowResult<LogicalTableId> {
        let adapter = self.adapter()?;
        let allocator = &self.shared.allocator;
        let table_id = match self.pending_tables.get(&op_id) {
            Some(table_id) => *table_id,
            None => {
                spec.validate().map_err(FlowError::InvalidRequest)?;
                allocator.allocate(&self.device_id, spec.table_type)
            }
        };
        let local_id = match allocator.bind(&self.device_id, table_id) {
            Ok(local_id) => local_id,
            Err(err) => {
                self.pending_tables.remove(&op_id);
                return Err(err);
            }
        };

        let bound = BoundTable {
            local_id,
            table: spec.clone().into_table(table_id),
        };
        let outcome = self
            .device_call("install table", adapter.install_table(&self.device_id, &bound))
            .await;

        match outcome {
            Ok(()) => {
                self.pending_tables.remove(&op_id);
                self.write().tables.insert(table_id, bound.table);
                info!(device_id = %self.device_id, %table_id, local = %local_id, "table installed");
                self.shared.emit(StoreEvent::TableAdded {
                    device_id: self.device_id.clone(),
                    table_id,
                });
                Ok(table_id)
            }
            Err(err @ FlowError::DeviceTimeout { .. }) => {
                // The device may still create it; keep the binding for a retry.
                warn!(device_id = %self.device_id, %table_id, "table install unconfirmed");
                self.pending_tables.insert(op_id, table_id);
                Err(err)
            }
            Err(err) => {
                self.pending_tables.remove(&op_id);
                self.shared.allocator.release(&self.device_id, table_id);
                Err(err)
            }
        }
    }

    async fn remove_table(&mut self, table_id: LogicalTableId) -> FlowResult<()> {
        let adapter = self.adapter()?;
        let table = self.read().tables.get(&table_id).cloned();
        let local_id = self.shared.allocator.lookup(&self.device_id, table_id);
        let (Some(table), Some(local_id)) = (table, local_id) else {
            return Err(FlowError::TableNotFound {
                device_id: self.device_id.clone(),
                table_id,
            });
        };

        let bound = BoundTable { local_id, table };
        self
            .device_call("remove table", adapter.remove_table(&self.device_id, &bound))
            .await?;

        let cascaded: Vec<(FlowEntryId, FlowEntryState)> = {
            let mut state = self.write();
            let ids: Vec<FlowEntryId> = state
                .entries
                .values()
                .filter(|e| e.table_id() == table_id)
                .map(|e| e.id())
                .collect();
            state.tables.remove(&table_id);
            let cascaded = ids
                .into_iter()
                .filter_map(|id| state.entries.remove(&id).map(|e| (id, e.state)))
                .collect();
            cascaded
        };
        for (entry_id, from) in &cascaded {
            self.emit_removed(*entry_id, *from);
        }
        self.shared.allocator.release(&self.device_id, table_id);

        info!(
            device_id = %self.device_id,
            %table_id,
            entries = cascaded.len(),
            "table removed"
        );
        self.shared.emit(StoreEvent::TableRemoved {
            device_id: self.device_id.clone(),
            table_id,
        });
        Ok(())
    }

    // ── Entries ────────────────────────────────────────────────────

    async fn add_flow(&mut self, rule: &FlowRule) -> FlowResult<()> {
        let adapter = self.adapter()?;
        let local_id = self.local_table(rule.table_id)?;

        let existing = self.read().entries.get(&rule.id).cloned();
        match existing {
            Some(entry) if entry.rule == *rule && entry.state == FlowEntryState::Added => {
                return Ok(());
            }
            // Never confirmed: ask the device again.
            Some(entry) if entry.rule == *rule && entry.state == FlowEntryState::PendingAdd => {}
            Some(entry) => {
                return Err(FlowError::InvalidState {
                    device_id: self.device_id.clone(),
                    entry_id: rule.id,
                    state: entry.state,
                });
            }
            None => {
                self.write()
                    .entries
                    .insert(rule.id, FlowEntry::pending(rule.clone(), epoch_millis()));
            }
        }

        let outcome = self
            .device_call("install entry", adapter.install_entry(&self.device_id, local_id, rule))
            .await;

        match outcome {
            Ok(()) => self.transition(rule.id, FlowEntryState::Added),
            Err(err @ FlowError::AdapterRejected { .. }) => {
                self.transition(rule.id, FlowEntryState::Failed)?;
                Err(err)
            }
            // Unconfirmed: stays PENDING_ADD.
            Err(err) => Err(err),
        }
    }

    async fn modify_flow(&mut self, rule: &FlowRule) -> FlowResult<()> {
        let adapter = self.adapter()?;
        let current = self.read().entry(rule.id)?;
        if current.state != FlowEntryState::Added {
            return Err(FlowError::InvalidState {
                device_id: self.device_id.clone(),
                entry_id: rule.id,
                state: current.state,
            });
        }
        if current.table_id() != rule.table_id {
            return Err(FlowError::InvalidRequest(format!(
                "entry {} cannot move from table {} to {}",
                rule.id,
                current.table_id(),
                rule.table_id
            )));
        }
        let local_id = self.local_table(rule.table_id)?;

        self
            .device_call("modify entry", adapter.modify_entry(&self.device_id, local_id, rule))
            .await?;

        let mut state = self.write();
        match state.entries.get_mut(&rule.id) {
            Some(entry) => entry.modify(rule.clone(), epoch_millis()),
            None => Err(FlowError::EntryNotFound {
                device_id: self.device_id.clone(),
                entry_id: rule.id,
            }),
        }
    }

    async fn remove_flow(&mut self, entry_id: FlowEntryId) -> FlowResult<()> {
        let entry = self.read().entry(entry_id)?;
        match entry.state {
            FlowEntryState::Added | FlowEntryState::PendingAdd => {
                self.transition(entry_id, FlowEntryState::PendingRemove)?;
            }
            FlowEntryState::PendingRemove => {}
            FlowEntryState::Failed => {
                // Never installed; only the record goes.
                self.write().entries.remove(&entry_id);
                debug!(device_id = %self.device_id, %entry_id, "failed entry discarded");
                return Ok(());
            }
            FlowEntryState::Removed => {
                return Err(FlowError::InvalidState {
                    device_id: self.device_id.clone(),
                    entry_id,
                    state: entry.state,
                });
            }
        }

        let adapter = self.adapter()?;
        let local_id = self.local_table(entry.table_id())?;
        self
            .device_call("remove entry", adapter.remove_entry(&self.device_id, local_id, entry_id))
            .await?;

        self.transition(entry_id, FlowEntryState::Removed)?;
        self.write().entries.remove(&entry_id);
        Ok(())
    }

    fn transition(&self, entry_id: FlowEntryId, to: FlowEntryState) -> FlowResult<()> {
        let from = {
            let mut state = self.write();
            let entry = state
                .entries
                .get_mut(&entry_id)
                .ok_or_else(|| FlowError::EntryNotFound {
                    device_id: self.device_id.clone(),
                    entry_id,
                })?;
            let from = entry.state;
            entry.transition(to, epoch_millis())?;
            from
        };
        debug!(device_id = %self.device_id, %entry_id, %from, %to, "entry state changed");
        self.shared.emit(StoreEvent::EntryStateChanged {
            device_id: self.device_id.clone(),
            entry_id,
            from,
            to,
        });
        Ok(())
    }

    fn emit_removed(&self, entry_id: FlowEntryId, from: FlowEntryState) {
        if from == FlowEntryState::Removed {
            return;
        }
        self.shared.emit(StoreEvent::EntryStateChanged {
            device_id: self.device_id.clone(),
            entry_id,
            from,
            to: FlowEntryState::Removed,
        });
    }

    // ── Device events ──────────────────────────────────────────────

    fn on_device_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Connected { table_id_space, .. } => {
                if let Some(space) = table_id_space {
                    self.shared.allocator.set_capacity(&self.device_id, space);
                }
                // Tables the device never confirmed did not survive the reconnect.
                for (op_id, table_id) in std::mem::take(&mut self.pending_tables) {
                    self.shared.allocator.release(&self.device_id, table_id);
                    debug!(
                        device_id = %self.device_id,
                        op = %op_id,
                        %table_id,
                        "unconfirmed table binding released"
                    );
                }
                info!(device_id = %self.device_id, ?table_id_space, "device connected");
                self.commit();
            }
            DeviceEvent::Disconnected { .. } => self.on_disconnect(),
            DeviceEvent::Stats { stats, .. } => self.on_stats(&stats),
        }
    }

    /// Everything on a vanished device is gone: entries are forced to
    /// REMOVED and every table binding is released.
    fn on_disconnect(&mut self) {
        let now = epoch_millis();
        let (removed, tables) = {
            let mut state = self.write();
            let removed: Vec<(FlowEntryId, FlowEntryState)> = std::mem::take(&mut state.entries)
                .into_iter()
                .map(|(id, mut entry)| (id, entry.force_removed(now)))
                .collect();
            let tables: Vec<LogicalTableId> =
                std::mem::take(&mut state.tables).into_keys().collect();
            (removed, tables)
        };
        for (entry_id, from) in &removed {
            self.emit_removed(*entry_id, *from);
        }
        for table_id in &tables {
            self.shared.emit(StoreEvent::TableRemoved {
                device_id: self.device_id.clone(),
                table_id: *table_id,
            });
        }
        let released = self.shared.allocator.release_device(&self.device_id);
        self.pending_tables.clear();

        info!(
            device_id = %self.device_id,
            entries = removed.len(),
            tables = tables.len(),
            bindings = released.len(),
            "device disconnected, state cleared"
        );
        self.commit();
    }

    fn on_stats(&mut self, stats: &[FlowStats]) {
        let accepted = {
            let mut state = self.write();
            let mut accepted = 0;
            for sample in stats {
                if let Some(entry) = state.entries.get_mut(&sample.entry_id) {
                    if entry.apply_stats(sample) {
                        accepted += 1;
                    }
                }
            }
            accepted
        };
        debug!(
            device_id = %self.device_id,
            reported = stats.len(),
            accepted,
            "flow statistics"
        );
        if accepted > 0 {
            self.commit();
        }
    }

    // ── Persistence and backups ────────────────────────────────────

    /// Bump the version, persist locally, and ship the new state to the
    /// device's backups without waiting for them.
    fn commit(&self) {
        let snapshot = {
            let mut state = self.write();
            state.version += 1;
            state.allocation = self.shared.allocator.snapshot(&self.device_id);
            state.snapshot(epoch_millis())
        };

        if let Some(store) = &self.shared.state {
            if let Err(e) = store.put_snapshot(&snapshot) {
                warn!(device_id = %self.device_id, error = %e, "failed to persist device snapshot");
            }
        }

        let backups = match self.shared.mastership.mastership(&self.device_id) {
            Ok(Some(record)) => record.backups,
            _ => Vec::new(),
        };
        for backup in backups {
            let rpc = self.shared.rpc.clone();
            let deadline = self.shared.config.backup_timeout();
            let request = BackupRequest {
                snapshot: snapshot.clone(),
            };
            tokio::spawn(async move {
                let device_id = request.snapshot.device_id.clone();
                let version = request.snapshot.version;
                match rpc.call(&backup, &request, None, deadline).await {
                    Ok(reply) => match reply.result {
                        Ok(ack) => {
                            debug!(%device_id, %backup, version, stored = ack.stored, "backup shipped")
                        }
                        Err(e) => warn!(%device_id, %backup, error = %e, "backup refused"),
                    },
                    Err(e) => warn!(%device_id, %backup, error = %e, "backup not delivered"),
                }
            });
        }
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn adapter(&self) -> FlowResult<Arc<dyn DeviceAdapter>> {
        self.shared.adapters.for_device(&self.device_id)
    }

    /// Wait for an adapter call under the adapter deadline. Losing the
    /// device stops the wait; the call is dropped, not undone.
    async fn device_call<T>(
        &self,
        what: &str,
        call: BoxFuture<'_, AdapterResult<T>>,
    ) -> FlowResult<T> {
        let deadline = self.shared.config.adapter_timeout();
        let mut deposed = self.deposed.clone();
        tokio::select! {
            outcome = confirm(&self.device_id, what, deadline, call) => outcome,
            _ = deposed.wait_for(|gone| *gone) => {
                warn!(device_id = %self.device_id, what, "device lost mid-call, abandoning");
                Err(self.not_master())
            }
        }
    }

    fn not_master(&self) -> FlowError {
        FlowError::NotMaster {
            device_id: self.device_id.clone(),
            replica: self.shared.replica_id.clone(),
        }
    }

    /// Local id of a table that exists on this device.
    fn local_table(&self, table_id: LogicalTableId) -> FlowResult<LocalTableId> {
        let known = self.read().tables.contains_key(&table_id);
        known
            .then(|| self.shared.allocator.lookup(&self.device_id, table_id))
            .flatten()
            .ok_or_else(|| FlowError::TableNotFound {
                device_id: self.device_id.clone(),
                table_id,
            })
    }

    fn read(&self) -> RwLockReadGuard<'_, DeviceState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, DeviceState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}
