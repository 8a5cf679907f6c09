//! Mastership-aware flow store.
//!
//! One `FlowStore` runs per replica. For each device it holds a slot with
//! this replica's copy of the device state and, while this replica is the
//! device's master, the handle of the device's worker. Mutations for a
//! device mastered elsewhere are forwarded to its master; a mastership
//! change invalidates calls bound to the old epoch and every caller retries
//! once against the new master.
//!
//! ```text
//!   client ──▶ FlowStore::apply_device_batch
//!                ├─ master here  → DeviceWorker (mpsc) → adapter → commit → backups
//!                └─ master there → RpcClient::call(apply-batch-flows)
//!
//!   MastershipService::subscribe ──▶ mastership task ──▶ promote / demote
//!   inbox ──▶ dispatcher ──▶ MessageHandler for FlowStore
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use flowstore_cluster::{
    ApplyBatchRequest, BackupAck, ClusterNotification, ClusterRequest, ClusterTransport, Envelope,
    GetDeviceEntriesRequest, GetDeviceTablesRequest, GetFlowEntryRequest, MastershipEvent,
    MastershipService, MessageHandler, MessageSubject, RemoveFlowEntryRequest,
    RemoveFlowTableRequest, Reply, Rpc, RpcClient, encode, resolve_master, spawn_dispatcher,
};
use flowstore_core::{
    BatchOperation, BatchResult, DeviceId, Epoch, FlowEntry, FlowEntryId, FlowError, FlowResult,
    FlowTable, LogicalTableId, ReadConsistency, StoreConfig, check_unique, epoch_millis,
};
use flowstore_state::{DeviceSnapshot, MastershipRecord, StateStore};

use crate::adapter::{AdapterRegistry, DeviceEvent};
use crate::allocator::TableIdAllocator;
use crate::device::{DeviceCommand, DeviceState, Shared, WorkerHandle, spawn_worker};
use crate::event::StoreEvent;

const EVENT_BUFFER: usize = 1024;

/// Collaborators a store is started with.
pub struct StoreDeps {
    pub mastership: Arc<dyn MastershipService>,
    pub transport: Arc<dyn ClusterTransport>,
    /// This replica's inbox on `transport`.
    pub inbox: mpsc::UnboundedReceiver<Envelope>,
    pub adapters: AdapterRegistry,
    /// Durable backup storage; `None` keeps everything in memory.
    pub state: Option<StateStore>,
}

/// This replica's view of one device.
struct DeviceSlot {
    state: Arc<RwLock<DeviceState>>,
    /// Present only while this replica is the device's master.
    worker: Option<WorkerHandle>,
}

impl DeviceSlot {
    fn backup(state: DeviceState) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
            worker: None,
        }
    }
}

struct Inner {
    shared: Arc<Shared>,
    slots: RwLock<HashMap<DeviceId, DeviceSlot>>,
    device_events: mpsc::UnboundedSender<DeviceEvent>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a running replica store. Cheap to clone.
#[derive(Clone)]
pub struct FlowStore {
    inner: Arc<Inner>,
}

impl FlowStore {
    /// Start the store: restore persisted backups, take over the devices
    /// this replica masters, and spawn the dispatcher, mastership and
    /// device-event tasks. Must be called within a Tokio runtime.
    pub fn start(config: StoreConfig, deps: StoreDeps) -> FlowResult<Self> {
        config
            .validate()
            .map_err(|e| FlowError::InvalidRequest(format!("invalid config: {e:#}")))?;

        let rpc = Arc::new(RpcClient::new(&config.replica_id, deps.transport));
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let shared = Arc::new(Shared {
            replica_id: config.replica_id.clone(),
            allocator: TableIdAllocator::new(config.table_id_space),
            config,
            mastership: deps.mastership,
            adapters: deps.adapters,
            state: deps.state,
            rpc: rpc.clone(),
            events,
        });

        // Subscribe before scanning so no change between the two is lost.
        let mastership_rx = shared.mastership.subscribe();
        let (device_tx, device_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let store = FlowStore {
            inner: Arc::new(Inner {
                shared: shared.clone(),
                slots: RwLock::new(HashMap::new()),
                device_events: device_tx,
                shutdown_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        };

        if let Some(state) = &shared.state {
            let snapshots = state.list_snapshots()?;
            let mut slots = store.write_slots();
            for snapshot in &snapshots {
                slots.insert(
                    snapshot.device_id.clone(),
                    DeviceSlot::backup(DeviceState::from_snapshot(snapshot)),
                );
            }
            info!(devices = snapshots.len(), "persisted device snapshots restored");
        }

        for record in shared.mastership.records()? {
            if record.is_master(&shared.replica_id) {
                store.promote(&record);
            }
        }

        let dispatcher = spawn_dispatcher(
            Arc::new(store.clone()),
            rpc,
            deps.inbox,
            shutdown_rx.clone(),
        );
        let mastership_task = store.spawn_mastership_task(mastership_rx, shutdown_rx.clone());
        let device_task = store.spawn_device_event_task(device_rx, shutdown_rx);
        store
            .lock_tasks()
            .extend([dispatcher, mastership_task, device_task]);

        info!(replica = %shared.replica_id, "flow store started");
        Ok(store)
    }

    pub fn replica_id(&self) -> &str {
        &self.inner.shared.replica_id
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.shared.config
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.inner.shared.adapters
    }

    /// Subscribe to entry, table, batch and mastership changes.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.shared.events.subscribe()
    }

    /// Channel for adapters to report device events on.
    pub fn device_events(&self) -> mpsc::UnboundedSender<DeviceEvent> {
        self.inner.device_events.clone()
    }

    /// Whether this replica currently runs the worker of `device_id`.
    pub fn is_master(&self, device_id: &DeviceId) -> bool {
        self.read_slots()
            .get(device_id)
            .is_some_and(|slot| slot.worker.is_some())
    }

    /// Devices known to the mastership source, sorted.
    pub fn devices(&self) -> FlowResult<Vec<DeviceId>> {
        Ok(self
            .inner
            .shared
            .mastership
            .records()?
            .into_iter()
            .map(|r| r.device_id)
            .collect())
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Apply one device's batch on its master and return one result per
    /// operation, in order.
    pub async fn apply_device_batch(
        &self,
        device_id: &DeviceId,
        operations: Vec<BatchOperation>,
    ) -> FlowResult<BatchResult> {
        check_unique(&operations)?;
        if let Some(stray) = operations.iter().find(|o| o.op.device_id() != device_id) {
            return Err(FlowError::InvalidRequest(format!(
                "{} targets {}, not {device_id}",
                stray.id,
                stray.op.device_id()
            )));
        }
        let correlation_id = self.inner.shared.rpc.next_correlation_id();
        let operations = &operations;
        retry_once(device_id, move || {
            self.try_apply(device_id, correlation_id, operations)
        })
        .await
    }

    async fn try_apply(
        &self,
        device_id: &DeviceId,
        correlation_id: u64,
        operations: &[BatchOperation],
    ) -> FlowResult<BatchResult> {
        let record = self.resolve(device_id)?;
        if record.is_master(self.replica_id()) {
            let result = self
                .apply_local(&record, correlation_id, operations.to_vec())
                .await?;
            self.emit(StoreEvent::BatchCompleted {
                result: result.clone(),
            });
            return Ok(result);
        }
        let request = ApplyBatchRequest {
            device_id: device_id.clone(),
            correlation_id,
            epoch: record.epoch,
            operations: operations.to_vec(),
        };
        self.forward(&record, &request).await
    }

    /// Remove one entry outside of a batch.
    pub async fn remove_entry(&self, device_id: &DeviceId, entry_id: FlowEntryId) -> FlowResult<()> {
        retry_once(device_id, move || async move {
            let record = self.resolve(device_id)?;
            if record.is_master(self.replica_id()) {
                return self.remove_entry_local(&record, entry_id).await;
            }
            let request = RemoveFlowEntryRequest {
                device_id: device_id.clone(),
                entry_id,
                epoch: record.epoch,
            };
            self.forward(&record, &request).await
        })
        .await
    }

    /// Remove a table and every entry in it.
    pub async fn remove_table(
        &self,
        device_id: &DeviceId,
        table_id: LogicalTableId,
    ) -> FlowResult<()> {
        retry_once(device_id, move || async move {
            let record = self.resolve(device_id)?;
            if record.is_master(self.replica_id()) {
                return self.remove_table_local(&record, table_id).await;
            }
            let request = RemoveFlowTableRequest {
                device_id: device_id.clone(),
                table_id,
                epoch: record.epoch,
            };
            self.forward(&record, &request).await
        })
        .await
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub async fn get_entry(&self, device_id: &DeviceId, entry_id: FlowEntryId) -> FlowResult<FlowEntry> {
        let request = GetFlowEntryRequest {
            device_id: device_id.clone(),
            entry_id,
        };
        self.read(device_id, &request, |state| state.entry(entry_id))
            .await
    }

    pub async fn device_entries(&self, device_id: &DeviceId) -> FlowResult<Vec<FlowEntry>> {
        let request = GetDeviceEntriesRequest {
            device_id: device_id.clone(),
        };
        self.read(device_id, &request, |state| Ok(state.entry_list()))
            .await
    }

    pub async fn device_tables(&self, device_id: &DeviceId) -> FlowResult<Vec<FlowTable>> {
        let request = GetDeviceTablesRequest {
            device_id: device_id.clone(),
        };
        self.read(device_id, &request, |state| Ok(state.table_list()))
            .await
    }

    /// This replica's copy of a device: authoritative when it is the
    /// master, otherwise the last backup received.
    pub fn snapshot(&self, device_id: &DeviceId) -> FlowResult<DeviceSnapshot> {
        let slots = self.read_slots();
        let slot = slots.get(device_id).ok_or_else(|| FlowError::DeviceNotFound {
            device_id: device_id.clone(),
        })?;
        let state = slot.state.read().unwrap_or_else(|e| e.into_inner());
        let mut snapshot = state.snapshot(epoch_millis());
        if slot.worker.is_some() {
            let live = self.inner.shared.allocator.snapshot(device_id);
            snapshot.next_table_id = live.next_table_id;
            snapshot.table_id_space = live.table_id_space;
            snapshot.bindings = live.bindings;
        }
        Ok(snapshot)
    }

    /// Serve a read from the master, or from the local copy when this
    /// replica is the master or reads are configured `local`.
    async fn read<R, F>(&self, device_id: &DeviceId, request: &R, local: F) -> FlowResult<R::Response>
    where
        R: Rpc,
        F: Fn(&DeviceState) -> FlowResult<R::Response>,
    {
        let local = &local;
        retry_once(device_id, move || async move {
            let record = self.resolve(device_id)?;
            if record.is_master(self.replica_id()) {
                self.ensure_worker(&record);
                return self.read_local(device_id, local);
            }
            match self.inner.shared.config.read_consistency {
                ReadConsistency::Local => self.read_local(device_id, local),
                ReadConsistency::Forward => self.forward(&record, request).await,
            }
        })
        .await
    }

    fn read_local<T>(
        &self,
        device_id: &DeviceId,
        read: impl Fn(&DeviceState) -> FlowResult<T>,
    ) -> FlowResult<T> {
        let slots = self.read_slots();
        match slots.get(device_id) {
            Some(slot) => read(&slot.state.read().unwrap_or_else(|e| e.into_inner())),
            None => read(&DeviceState::empty(device_id)),
        }
    }

    // ── Device events ──────────────────────────────────────────────

    /// Hand an adapter event to the device's worker and wait until it has
    /// been applied. Fails with `NotMaster` on replicas that do not own the
    /// device.
    pub async fn handle_device_event(&self, event: DeviceEvent) -> FlowResult<()> {
        let device_id = event.device_id().clone();
        let commands = self
            .worker_sender(&device_id)
            .ok_or_else(|| self.not_master(&device_id))?;
        let (done, rx) = oneshot::channel();
        commands
            .send(DeviceCommand::Event { event, done })
            .await
            .map_err(|_| self.not_master(&device_id))?;
        rx.await.map_err(|_| self.not_master(&device_id))
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Stop every task and worker of this replica and wait for them.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        let workers: Vec<JoinHandle<()>> = self
            .write_slots()
            .values_mut()
            .filter_map(|slot| slot.worker.take().map(|w| w.handle))
            .collect();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.lock_tasks());
        for handle in workers.into_iter().chain(tasks) {
            let _ = handle.await;
        }
        info!(replica = %self.replica_id(), "flow store stopped");
    }

    // ── Mastership ─────────────────────────────────────────────────

    /// Start the worker for a device this replica masters, unless one is
    /// already running at the record's epoch. Returns its command sender.
    fn ensure_worker(&self, record: &MastershipRecord) -> mpsc::Sender<DeviceCommand> {
        if let Some(commands) = self.read_slots().get(&record.device_id).and_then(|slot| {
            slot.worker
                .as_ref()
                .filter(|w| w.epoch == record.epoch && !w.commands.is_closed())
                .map(|w| w.commands.clone())
        }) {
            return commands;
        }
        self.promote(record)
    }

    /// Take over a device: the newest of the in-memory backup and the
    /// persisted snapshot becomes authoritative at the new epoch.
    fn promote(&self, record: &MastershipRecord) -> mpsc::Sender<DeviceCommand> {
        let shared = &self.inner.shared;
        let device_id = &record.device_id;
        let mut slots = self.write_slots();

        if let Some(worker) = slots.get(device_id).and_then(|s| s.worker.as_ref()) {
            if worker.epoch == record.epoch && !worker.commands.is_closed() {
                return worker.commands.clone();
            }
        }

        let in_memory = slots
            .get(device_id)
            .map(|slot| slot.state.read().unwrap_or_else(|e| e.into_inner()).clone());
        let persisted = match &shared.state {
            Some(state) => match state.get_snapshot(device_id) {
                Ok(snapshot) => snapshot.map(|s| DeviceState::from_snapshot(&s)),
                Err(e) => {
                    warn!(%device_id, error = %e, "failed to read persisted snapshot");
                    None
                }
            },
            None => None,
        };
        let mut base = match (in_memory, persisted) {
            (Some(a), Some(b)) => {
                if b.stamp() > a.stamp() {
                    b
                } else {
                    a
                }
            }
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => DeviceState::empty(device_id),
        };
        let restored = base.stamp();
        base.epoch = record.epoch;

        shared.allocator.seed(device_id, &base.allocation);
        if base.allocation.table_id_space.is_none() {
            if let Some(space) = shared
                .config
                .devices
                .iter()
                .find(|d| &d.id == device_id)
                .and_then(|d| d.table_id_space)
            {
                shared.allocator.set_capacity(device_id, space);
            }
        }

        let state = Arc::new(RwLock::new(base));
        let worker = spawn_worker(
            shared.clone(),
            device_id.clone(),
            record.epoch,
            state.clone(),
            self.inner.shutdown_tx.subscribe(),
        );
        let commands = worker.commands.clone();
        slots.insert(
            device_id.clone(),
            DeviceSlot {
                state,
                worker: Some(worker),
            },
        );
        drop(slots);

        info!(
            %device_id,
            epoch = record.epoch,
            restored_epoch = restored.0,
            restored_version = restored.1,
            "promoted to master"
        );
        self.emit(StoreEvent::Promoted {
            device_id: device_id.clone(),
            epoch: record.epoch,
        });
        commands
    }

    /// Stop writing a device. The copy stays as a backup.
    fn demote(&self, device_id: &DeviceId, epoch: Epoch) {
        let worker = self
            .write_slots()
            .get_mut(device_id)
            .and_then(|slot| slot.worker.take());
        if let Some(worker) = worker {
            // Abandon the call in flight; dropping the sender lets the
            // worker drain its queue and stop.
            let _ = worker.deposed.send(true);
            drop(worker.commands);
            info!(%device_id, old_epoch = worker.epoch, epoch, "demoted");
            self.emit(StoreEvent::Demoted {
                device_id: device_id.clone(),
                epoch,
            });
        }
    }

    fn on_mastership_event(&self, event: &MastershipEvent) {
        let device_id = event.device_id();
        let failed = self.inner.shared.rpc.invalidate(device_id, event.epoch());
        if failed > 0 {
            debug!(%device_id, epoch = event.epoch(), failed, "in-flight calls invalidated");
        }
        if event.record.is_master(self.replica_id()) {
            self.ensure_worker(&event.record);
        } else {
            self.demote(device_id, event.epoch());
        }
    }

    /// Re-read every record after the event feed lagged.
    fn resync(&self) {
        let records = match self.inner.shared.mastership.records() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "mastership resync failed");
                return;
            }
        };
        for record in records {
            self.on_mastership_event(&MastershipEvent {
                previous: None,
                record,
            });
        }
    }

    fn spawn_mastership_task(
        &self,
        mut events: broadcast::Receiver<MastershipEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => store.on_mastership_event(&event),
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "mastership feed lagged, resyncing");
                            store.resync();
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
            debug!(replica = %store.replica_id(), "mastership task stopped");
        })
    }

    fn spawn_device_event_task(
        &self,
        mut events: mpsc::UnboundedReceiver<DeviceEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        let device_id = event.device_id().clone();
                        if let Err(e) = store.handle_device_event(event).await {
                            debug!(%device_id, error = %e, "device event not applied here");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    // ── Local execution ────────────────────────────────────────────

    async fn apply_local(
        &self,
        record: &MastershipRecord,
        correlation_id: u64,
        operations: Vec<BatchOperation>,
    ) -> FlowResult<BatchResult> {
        let commands = self.ensure_worker(record);
        let (reply, rx) = oneshot::channel();
        commands
            .send(DeviceCommand::Apply {
                epoch: record.epoch,
                correlation_id,
                operations,
                reply,
            })
            .await
            .map_err(|_| self.not_master(&record.device_id))?;
        rx.await.map_err(|_| self.not_master(&record.device_id))?
    }

    async fn remove_entry_local(
        &self,
        record: &MastershipRecord,
        entry_id: FlowEntryId,
    ) -> FlowResult<()> {
        let commands = self.ensure_worker(record);
        let (reply, rx) = oneshot::channel();
        commands
            .send(DeviceCommand::RemoveEntry {
                epoch: record.epoch,
                entry_id,
                reply,
            })
            .await
            .map_err(|_| self.not_master(&record.device_id))?;
        rx.await.map_err(|_| self.not_master(&record.device_id))?
    }

    async fn remove_table_local(
        &self,
        record: &MastershipRecord,
        table_id: LogicalTableId,
    ) -> FlowResult<()> {
        let commands = self.ensure_worker(record);
        let (reply, rx) = oneshot::channel();
        commands
            .send(DeviceCommand::RemoveTable {
                epoch: record.epoch,
                table_id,
                reply,
            })
            .await
            .map_err(|_| self.not_master(&record.device_id))?;
        rx.await.map_err(|_| self.not_master(&record.device_id))?
    }

    // ── Forwarding ─────────────────────────────────────────────────

    async fn forward<R: Rpc>(&self, record: &MastershipRecord, request: &R) -> FlowResult<R::Response> {
        let shared = &self.inner.shared;
        debug!(
            device_id = %record.device_id,
            master = %record.master,
            epoch = record.epoch,
            subject = %R::SUBJECT,
            "forwarding to master"
        );
        let reply = shared
            .rpc
            .call(
                &record.master,
                request,
                Some(record.epoch),
                shared.config.forward_timeout(),
            )
            .await?;
        if reply.result.is_ok() && reply.epoch < record.epoch {
            return Err(FlowError::StaleEpoch {
                device_id: record.device_id.clone(),
                seen: reply.epoch,
                current: record.epoch,
            });
        }
        reply.result
    }

    /// The record of a device this replica is asked to act on as master.
    fn serving_record(&self, device_id: &DeviceId, epoch: Option<Epoch>) -> FlowResult<MastershipRecord> {
        let record = self.resolve(device_id)?;
        if !record.is_master(self.replica_id()) {
            return Err(self.not_master(device_id));
        }
        match epoch {
            Some(seen) if seen != record.epoch => Err(FlowError::StaleEpoch {
                device_id: device_id.clone(),
                seen,
                current: record.epoch,
            }),
            _ => Ok(record),
        }
    }

    async fn serve_apply(&self, request: ApplyBatchRequest, origin: &str) -> (Epoch, FlowResult<BatchResult>) {
        let record = match self.serving_record(&request.device_id, Some(request.epoch)) {
            Ok(record) => record,
            Err(e) => return (self.current_epoch(&request.device_id), Err(e)),
        };
        let result = match check_unique(&request.operations) {
            Ok(()) => {
                self.apply_local(&record, request.correlation_id, request.operations)
                    .await
            }
            Err(e) => Err(e),
        };
        if let Ok(batch) = &result {
            if let Err(e) = self
                .inner
                .shared
                .rpc
                .notify(origin, MessageSubject::ApplyCompleted, batch)
            {
                debug!(%origin, error = %e, "apply-completed not delivered");
            }
        }
        (record.epoch, result)
    }

    async fn serve_read<T>(
        &self,
        device_id: &DeviceId,
        read: impl Fn(&DeviceState) -> FlowResult<T>,
    ) -> (Epoch, FlowResult<T>) {
        match self.serving_record(device_id, None) {
            Ok(record) => {
                self.ensure_worker(&record);
                (record.epoch, self.read_local(device_id, read))
            }
            Err(e) => (self.current_epoch(device_id), Err(e)),
        }
    }

    /// Store a backup shipped by a device's master, if it is newer than
    /// ours and we are not writing the device ourselves.
    fn store_backup(&self, snapshot: DeviceSnapshot) -> FlowResult<BackupAck> {
        let device_id = snapshot.device_id.clone();
        {
            let mut slots = self.write_slots();
            let slot = slots
                .entry(device_id.clone())
                .or_insert_with(|| DeviceSlot::backup(DeviceState::empty(&device_id)));
            if slot.worker.is_some() {
                debug!(%device_id, epoch = snapshot.epoch, "backup ignored, device is mastered here");
                return Ok(BackupAck { stored: false });
            }
            let mut state = slot.state.write().unwrap_or_else(|e| e.into_inner());
            if !snapshot.is_newer_than(state.stamp()) {
                debug!(
                    %device_id,
                    incoming = ?snapshot.stamp(),
                    held = ?state.stamp(),
                    "stale backup ignored"
                );
                return Ok(BackupAck { stored: false });
            }
            *state = DeviceState::from_snapshot(&snapshot);
        }
        if let Some(state) = &self.inner.shared.state {
            state.put_snapshot(&snapshot)?;
        }
        debug!(%device_id, epoch = snapshot.epoch, version = snapshot.version, "backup stored");
        Ok(BackupAck { stored: true })
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn resolve(&self, device_id: &DeviceId) -> FlowResult<MastershipRecord> {
        resolve_master(self.inner.shared.mastership.as_ref(), device_id)
    }

    fn current_epoch(&self, device_id: &DeviceId) -> Epoch {
        self.resolve(device_id).map(|r| r.epoch).unwrap_or_default()
    }

    fn worker_sender(&self, device_id: &DeviceId) -> Option<mpsc::Sender<DeviceCommand>> {
        self.read_slots()
            .get(device_id)
            .and_then(|slot| slot.worker.as_ref().map(|w| w.commands.clone()))
    }

    fn not_master(&self, device_id: &DeviceId) -> FlowError {
        FlowError::NotMaster {
            device_id: device_id.clone(),
            replica: self.replica_id().to_string(),
        }
    }

    fn emit(&self, event: StoreEvent) {
        self.inner.shared.emit(event);
    }

    fn read_slots(&self) -> std::sync::RwLockReadGuard<'_, HashMap<DeviceId, DeviceSlot>> {
        self.inner.slots.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_slots(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<DeviceId, DeviceSlot>> {
        self.inner.slots.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MessageHandler for FlowStore {
    async fn on_request(&self, request: Envelope) -> Vec<u8> {
        let encoded = match ClusterRequest::decode(&request) {
            Ok(ClusterRequest::ApplyBatch(req)) => {
                let (epoch, result) = self.serve_apply(req, &request.sender).await;
                encode(&Reply::new(epoch, result))
            }
            Ok(ClusterRequest::GetEntry(req)) => {
                let entry_id = req.entry_id;
                let (epoch, result) = self
                    .serve_read(&req.device_id, |state| state.entry(entry_id))
                    .await;
                encode(&Reply::new(epoch, result))
            }
            Ok(ClusterRequest::GetDeviceEntries(req)) => {
                let (epoch, result) = self
                    .serve_read(&req.device_id, |state| Ok(state.entry_list()))
                    .await;
                encode(&Reply::new(epoch, result))
            }
            Ok(ClusterRequest::GetDeviceTables(req)) => {
                let (epoch, result) = self
                    .serve_read(&req.device_id, |state| Ok(state.table_list()))
                    .await;
                encode(&Reply::new(epoch, result))
            }
            Ok(ClusterRequest::RemoveEntry(req)) => {
                let (epoch, result) = match self.serving_record(&req.device_id, Some(req.epoch)) {
                    Ok(record) => (
                        record.epoch,
                        self.remove_entry_local(&record, req.entry_id).await,
                    ),
                    Err(e) => (self.current_epoch(&req.device_id), Err(e)),
                };
                encode(&Reply::new(epoch, result))
            }
            Ok(ClusterRequest::RemoveTable(req)) => {
                let (epoch, result) = match self.serving_record(&req.device_id, Some(req.epoch)) {
                    Ok(record) => (
                        record.epoch,
                        self.remove_table_local(&record, req.table_id).await,
                    ),
                    Err(e) => (self.current_epoch(&req.device_id), Err(e)),
                };
                encode(&Reply::new(epoch, result))
            }
            Ok(ClusterRequest::Backup(req)) => {
                let epoch = req.snapshot.epoch;
                encode(&Reply::new(epoch, self.store_backup(req.snapshot)))
            }
            Err(e) => {
                warn!(subject = %request.subject, from = %request.sender, error = %e, "undecodable request");
                encode(&Reply::<()>::new(0, Err(e)))
            }
        };
        encoded.unwrap_or_else(|e| {
            warn!(subject = %request.subject, error = %e, "failed to encode reply");
            Vec::new()
        })
    }

    async fn on_notification(&self, notification: Envelope) {
        match ClusterNotification::decode(&notification) {
            Ok(ClusterNotification::ApplyCompleted(result)) => {
                debug!(
                    device_id = %result.device_id,
                    correlation_id = result.correlation_id,
                    from = %notification.sender,
                    "remote batch completed"
                );
                self.emit(StoreEvent::BatchCompleted { result });
            }
            Err(e) => warn!(subject = %notification.subject, error = %e, "undecodable notification"),
        }
    }
}

/// Run `attempt`, and once more if it fails in a way a fresh mastership
/// resolution may cure.
async fn retry_once<T, F, Fut>(device_id: &DeviceId, attempt: F) -> FlowResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = FlowResult<T>>,
{
    match attempt().await {
        Err(err) if err.is_retryable() => {
            debug!(%device_id, error = %err, "re-resolving master and retrying once");
            attempt().await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use flowstore_cluster::{LocalNetwork, MastershipManager};
    use flowstore_core::{FlowOp, FlowRule, PiTableAction, TableSpec, TableType};

    use crate::adapter::MemoryAdapter;

    fn dev() -> DeviceId {
        DeviceId::new("pof:1")
    }

    fn start_single(
        mastership: Arc<MastershipManager>,
        adapter: Arc<MemoryAdapter>,
        state: Option<StateStore>,
    ) -> FlowStore {
        start_with(StoreConfig::new("r1"), mastership, adapter, state)
    }

    fn start_with(
        config: StoreConfig,
        mastership: Arc<MastershipManager>,
        adapter: Arc<MemoryAdapter>,
        state: Option<StateStore>,
    ) -> FlowStore {
        let net = LocalNetwork::new();
        let inbox = net.register("r1");
        FlowStore::start(
            config,
            StoreDeps {
                mastership,
                transport: net,
                inbox,
                adapters: AdapterRegistry::new().with("pof", adapter),
                state,
            },
        )
        .unwrap()
    }

    fn batch() -> Vec<BatchOperation> {
        vec![
            BatchOperation::new(
                1,
                FlowOp::AddTable(TableSpec {
                    device_id: dev(),
                    name: "t0".to_string(),
                    table_type: TableType::Linear,
                    size: 8,
                    match_fields: vec![],
                    app_id: "app".to_string(),
                }),
            ),
            BatchOperation::new(
                2,
                FlowOp::AddFlow(FlowRule {
                    id: FlowEntryId(10),
                    device_id: dev(),
                    table_id: LogicalTableId(1),
                    priority: 1,
                    app_id: "app".to_string(),
                    criteria: vec![],
                    actions: vec![PiTableAction::member(3)],
                }),
            ),
        ]
    }

    fn manager() -> Arc<MastershipManager> {
        Arc::new(MastershipManager::new(StateStore::open_in_memory().unwrap()).unwrap())
    }

    #[tokio::test]
    async fn unassigned_device_is_not_found() {
        let store = start_single(manager(), Arc::new(MemoryAdapter::new()), None);
        let err = store.apply_device_batch(&dev(), batch()).await.unwrap_err();
        assert_eq!(err, FlowError::DeviceNotFound { device_id: dev() });
        store.shutdown().await;
    }

    #[tokio::test]
    async fn master_applies_locally() {
        let mastership = manager();
        mastership.assign(&dev(), "r1", vec![]).unwrap();
        let adapter = Arc::new(MemoryAdapter::new());
        let store = start_single(mastership, adapter.clone(), None);
        let mut events = store.subscribe();

        let result = store.apply_device_batch(&dev(), batch()).await.unwrap();
        assert_eq!(result.succeeded(), 2);
        assert_eq!(result.epoch, 1);
        assert!(store.is_master(&dev()));

        let entry = store.get_entry(&dev(), FlowEntryId(10)).await.unwrap();
        assert_eq!(entry.state, flowstore_core::FlowEntryState::Added);
        assert_eq!(store.device_tables(&dev()).await.unwrap().len(), 1);

        let mut completed = false;
        while let Ok(event) = events.try_recv() {
            completed |= matches!(event, StoreEvent::BatchCompleted { .. });
        }
        assert!(completed);
        store.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_operation_ids_apply_nothing() {
        let mastership = manager();
        mastership.assign(&dev(), "r1", vec![]).unwrap();
        let adapter = Arc::new(MemoryAdapter::new());
        let store = start_single(mastership, adapter.clone(), None);

        let mut ops = batch();
        ops[1].id = ops[0].id;
        let err = store.apply_device_batch(&dev(), ops).await.unwrap_err();
        assert!(matches!(err, FlowError::DuplicateOperation(_)));
        assert!(adapter.installed_tables(&dev()).is_empty());
        store.shutdown().await;
    }

    #[tokio::test]
    async fn restart_restores_persisted_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowstore.redb");
        let mastership = manager();
        mastership.assign(&dev(), "r1", vec![]).unwrap();
        let adapter = Arc::new(MemoryAdapter::new());

        {
            let state = StateStore::open(&path).unwrap();
            let store = start_single(mastership.clone(), adapter.clone(), Some(state));
            store.apply_device_batch(&dev(), batch()).await.unwrap();
            store.shutdown().await;
        }

        let state = StateStore::open(&path).unwrap();
        let store = start_single(mastership, adapter, Some(state));
        let snapshot = store.snapshot(&dev()).unwrap();
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.next_table_id, 2);
        store.shutdown().await;
    }

    #[tokio::test]
    async fn unconfirmed_removal_is_sent_once() {
        let mastership = manager();
        mastership.assign(&dev(), "r1", vec![]).unwrap();
        let adapter = Arc::new(MemoryAdapter::new());
        let mut config = StoreConfig::new("r1");
        config.adapter_timeout_ms = 100;
        let store = start_with(config, mastership, adapter.clone(), None);
        store.apply_device_batch(&dev(), batch()).await.unwrap();

        adapter.set_delay(Duration::from_millis(400));
        let before = adapter.calls();
        let started = std::time::Instant::now();
        let err = store.remove_entry(&dev(), FlowEntryId(10)).await.unwrap_err();

        assert!(matches!(err, FlowError::DeviceTimeout { waited_ms: 100, .. }));
        assert_eq!(adapter.calls() - before, 1);
        assert!(started.elapsed() < Duration::from_millis(300));
        let entry = store.get_entry(&dev(), FlowEntryId(10)).await.unwrap();
        assert_eq!(entry.state, flowstore_core::FlowEntryState::PendingRemove);
        store.shutdown().await;
    }

    #[tokio::test]
    async fn demotion_stops_the_worker() {
        let mastership = manager();
        mastership.assign(&dev(), "r1", vec![]).unwrap();
        let store = start_single(mastership.clone(), Arc::new(MemoryAdapter::new()), None);
        assert!(store.is_master(&dev()));

        let mut events = store.subscribe();
        mastership.assign(&dev(), "r2", vec!["r1".to_string()]).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            StoreEvent::Demoted {
                device_id: dev(),
                epoch: 2
            }
        );
        assert!(!store.is_master(&dev()));
        store.shutdown().await;
    }
}
