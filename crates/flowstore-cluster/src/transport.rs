//! Point-to-point message delivery between replicas.
//!
//! `ClusterTransport` is the seam to a real messaging facility.
//! `LocalNetwork` delivers envelopes between replicas in one process and can
//! isolate a replica to simulate a partition: messages to or from it are
//! silently dropped, so callers observe timeouts.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use flowstore_core::{FlowError, FlowResult, ReplicaId};

use crate::message::Envelope;

/// Reliable-enough, unordered-across-peers, point-to-point send.
pub trait ClusterTransport: Send + Sync {
    /// Queue `envelope` for delivery to replica `to`. Returns once queued.
    fn send(&self, to: &str, envelope: Envelope) -> FlowResult<()>;
}

#[derive(Default)]
struct Routes {
    inboxes: HashMap<ReplicaId, mpsc::UnboundedSender<Envelope>>,
    isolated: HashSet<ReplicaId>,
}

/// In-process transport hub.
#[derive(Default)]
pub struct LocalNetwork {
    routes: Mutex<Routes>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a replica and return its inbox. Re-registering replaces the
    /// previous inbox.
    pub fn register(&self, replica: &str) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        if routes.inboxes.insert(replica.to_string(), tx).is_some() {
            warn!(%replica, "replica re-registered on local network");
        }
        rx
    }

    /// Drop every message to or from `replica` until healed.
    pub fn isolate(&self, replica: &str) {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        routes.isolated.insert(replica.to_string());
        debug!(%replica, "replica isolated");
    }

    pub fn heal(&self, replica: &str) {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        routes.isolated.remove(replica);
        debug!(%replica, "replica healed");
    }
}

impl ClusterTransport for LocalNetwork {
    fn send(&self, to: &str, envelope: Envelope) -> FlowResult<()> {
        let routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        if routes.isolated.contains(to) || routes.isolated.contains(&envelope.sender) {
            debug!(
                from = %envelope.sender,
                %to,
                subject = %envelope.subject,
                correlation_id = envelope.correlation_id,
                "message dropped by partition"
            );
            return Ok(());
        }
        let inbox = routes
            .inboxes
            .get(to)
            .ok_or_else(|| FlowError::Transport(format!("unknown replica {to}")))?;
        inbox
            .send(envelope)
            .map_err(|_| FlowError::Transport(format!("replica {to} is not receiving")))
    }
}
