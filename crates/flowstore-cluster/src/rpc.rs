//! RPC client: correlates requests with responses.
//!
//! Each outgoing request registers a waiter keyed by correlation id. The
//! dispatcher completes it when the response arrives; the caller gives up
//! at its deadline. A call may be bound to a (device, epoch) pair so a
//! mastership change can fail it early with `StaleEpoch`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use flowstore_core::{DeviceId, Epoch, FlowError, FlowResult, ReplicaId};

use crate::message::{Envelope, MessageKind, MessageSubject, Reply, Rpc};
use crate::transport::ClusterTransport;

type Waiter = oneshot::Sender<FlowResult<Envelope>>;

struct PendingCall {
    waiter: Waiter,
    binding: Option<(DeviceId, Epoch)>,
}

/// Sends typed requests and notifications on behalf of one replica.
pub struct RpcClient {
    replica_id: ReplicaId,
    transport: Arc<dyn ClusterTransport>,
    next_correlation: AtomicU64,
    pending: Mutex<HashMap<u64, PendingCall>>,
}

impl RpcClient {
    pub fn new(replica_id: &str, transport: Arc<dyn ClusterTransport>) -> Self {
        Self {
            replica_id: replica_id.to_string(),
            transport,
            next_correlation: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    /// Allocate a correlation id, unique for this client.
    pub fn next_correlation_id(&self) -> u64 {
        self.next_correlation.fetch_add(1, Ordering::Relaxed)
    }

    /// Send `request` to `target` and wait up to `deadline` for the reply.
    ///
    /// Passing the epoch the caller resolved for the request's device lets
    /// `invalidate` cut the wait short once that epoch is superseded. A
    /// `Timeout` means only that the caller stopped waiting; the target may
    /// still have applied the request.
    pub async fn call<R: Rpc>(
        &self,
        target: &str,
        request: &R,
        epoch: Option<Epoch>,
        deadline: Duration,
    ) -> FlowResult<Reply<R::Response>> {
        let correlation_id = self.next_correlation_id();
        let envelope = Envelope::new(
            MessageKind::Request,
            R::SUBJECT,
            &self.replica_id,
            correlation_id,
            request,
        )?;

        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(
            correlation_id,
            PendingCall {
                waiter: tx,
                binding: epoch.map(|e| (request.device_id().clone(), e)),
            },
        );

        if let Err(err) = self.transport.send(target, envelope) {
            self.lock_pending().remove(&correlation_id);
            return Err(err);
        }
        debug!(%target, subject = %R::SUBJECT, correlation_id, "request sent");

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(Ok(response))) => response.decode(),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => Err(FlowError::Transport(format!(
                "{} call to {target} abandoned",
                R::SUBJECT
            ))),
            Err(_) => {
                self.lock_pending().remove(&correlation_id);
                warn!(%target, subject = %R::SUBJECT, correlation_id, "request timed out");
                Err(FlowError::Timeout {
                    context: format!("{} to {target}", R::SUBJECT),
                    waited_ms: deadline.as_millis() as u64,
                })
            }
        }
    }

    /// Fire-and-forget message.
    pub fn notify<T: Serialize>(
        &self,
        target: &str,
        subject: MessageSubject,
        body: &T,
    ) -> FlowResult<()> {
        let envelope = Envelope::new(
            MessageKind::Notification,
            subject,
            &self.replica_id,
            self.next_correlation_id(),
            body,
        )?;
        self.transport.send(target, envelope)
    }

    /// Answer `request` with an already-encoded reply payload.
    pub fn respond(&self, request: &Envelope, payload: Vec<u8>) -> FlowResult<()> {
        let envelope = Envelope {
            correlation_id: request.correlation_id,
            subject: request.subject,
            sender: self.replica_id.clone(),
            kind: MessageKind::Response,
            payload,
        };
        self.transport.send(&request.sender, envelope)
    }

    /// Hand a response to its waiting caller. Late responses are dropped.
    pub fn complete(&self, response: Envelope) {
        let correlation_id = response.correlation_id;
        match self.lock_pending().remove(&correlation_id) {
            Some(call) => {
                // The caller may have just given up; nothing to do then.
                let _ = call.waiter.send(Ok(response));
            }
            None => {
                debug!(correlation_id, subject = %response.subject, "late response dropped");
            }
        }
    }

    /// Fail every pending call bound to `device_id` at an epoch older than
    /// `current`. Returns how many calls were failed.
    pub fn invalidate(&self, device_id: &DeviceId, current: Epoch) -> usize {
        let stale: Vec<(u64, PendingCall)> = {
            let mut pending = self.lock_pending();
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, call)| {
                    matches!(&call.binding, Some((d, e)) if d == device_id && *e < current)
                })
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|call| (id, call)))
                .collect()
        };
        for (correlation_id, _) in &stale {
            debug!(%device_id, correlation_id, current, "pending call invalidated");
        }
        let count = stale.len();
        for (_, call) in stale {
            let seen = call.binding.map(|(_, e)| e).unwrap_or_default();
            let _ = call.waiter.send(Err(FlowError::StaleEpoch {
                device_id: device_id.clone(),
                seen,
                current,
            }));
        }
        count
    }

    /// Number of calls awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingCall>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}
