//! Batch coordinator: fans a multi-device operation list out to the
//! store, one batch per device, and reassembles the results in input order.

use std::collections::HashMap;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use flowstore_core::{
    BatchOperation, DeviceId, FlowEntryId, FlowError, FlowResult, OperationResult, check_unique,
};

use crate::store::FlowStore;

pub struct BatchCoordinator {
    store: FlowStore,
}

impl BatchCoordinator {
    pub fn new(store: FlowStore) -> Self {
        Self { store }
    }

    /// Apply `operations` across all the devices they target.
    ///
    /// Devices run in parallel and independently; one device failing never
    /// holds back or undoes another. The result has one entry per input
    /// operation, in input order. Duplicate operation ids reject the whole
    /// list before anything is applied.
    pub async fn apply(&self, operations: Vec<BatchOperation>) -> FlowResult<Vec<OperationResult>> {
        check_unique(&operations)?;
        if operations.is_empty() {
            return Ok(Vec::new());
        }

        let total = operations.len();
        let groups = partition(&operations);
        debug!(operations = total, devices = groups.len(), "applying batch");

        let handles: Vec<(Vec<usize>, JoinHandle<FlowResult<Vec<OperationResult>>>)> = groups
            .into_iter()
            .map(|(device_id, positions)| {
                let batch: Vec<BatchOperation> =
                    positions.iter().map(|&i| operations[i].clone()).collect();
                let store = self.store.clone();
                let handle = tokio::spawn(async move {
                    store
                        .apply_device_batch(&device_id, batch)
                        .await
                        .map(|result| result.results)
                });
                (positions, handle)
            })
            .collect();

        let mut slots: Vec<Option<OperationResult>> = vec![None; total];
        for (positions, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(FlowError::Transport(format!("device batch task failed: {e}"))),
            };
            match outcome {
                Ok(results) if results.len() == positions.len() => {
                    for (position, result) in positions.into_iter().zip(results) {
                        slots[position] = Some(result);
                    }
                }
                Ok(results) => {
                    let err = FlowError::Transport(format!(
                        "master returned {} results for {} operations",
                        results.len(),
                        positions.len()
                    ));
                    fill(&mut slots, &operations, &positions, &err);
                }
                Err(err) => {
                    warn!(
                        device_id = %operations[positions[0]].op.device_id(),
                        error = %err,
                        "device batch failed"
                    );
                    fill(&mut slots, &operations, &positions, &err);
                }
            }
        }

        Ok(slots.into_iter().flatten().collect())
    }

    /// Remove entries across devices. One outcome per input pair, in order.
    pub async fn remove_entries(&self, targets: Vec<(DeviceId, FlowEntryId)>) -> Vec<FlowResult<()>> {
        let handles: Vec<JoinHandle<FlowResult<()>>> = targets
            .into_iter()
            .map(|(device_id, entry_id)| {
                let store = self.store.clone();
                tokio::spawn(async move { store.remove_entry(&device_id, entry_id).await })
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            outcomes.push(match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(FlowError::Transport(format!("removal task failed: {e}"))),
            });
        }
        outcomes
    }
}

/// Group operation positions by device, keeping first-seen device order and
/// input order within each device.
fn partition(operations: &[BatchOperation]) -> Vec<(DeviceId, Vec<usize>)> {
    let mut index: HashMap<&DeviceId, usize> = HashMap::new();
    let mut groups: Vec<(DeviceId, Vec<usize>)> = Vec::new();
    for (position, operation) in operations.iter().enumerate() {
        let device_id = operation.op.device_id();
        match index.get(device_id) {
            Some(&group) => groups[group].1.push(position),
            None => {
                index.insert(device_id, groups.len());
                groups.push((device_id.clone(), vec![position]));
            }
        }
    }
    groups
}

fn fill(
    slots: &mut [Option<OperationResult>],
    operations: &[BatchOperation],
    positions: &[usize],
    err: &FlowError,
) {
    for &position in positions {
        slots[position] = Some(OperationResult::for_operation(
            &operations[position],
            Err(err.clone()),
        ));
    }
}
