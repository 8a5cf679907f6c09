//! Dispatcher: drains a replica's inbox.
//!
//! Responses complete pending calls on the `RpcClient`. Requests and
//! notifications are handed to the replica's `MessageHandler`, each on its
//! own task so a slow device never stalls the inbox.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::message::{Envelope, MessageKind};
use crate::rpc::RpcClient;

/// Server side of the cluster RPC layer.
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle a request and return the encoded reply payload.
    fn on_request(&self, request: Envelope) -> impl Future<Output = Vec<u8>> + Send;

    /// Handle a fire-and-forget notification.
    fn on_notification(&self, notification: Envelope) -> impl Future<Output = ()> + Send;
}

/// Spawn the inbox loop for one replica. Runs until the inbox closes or
/// `shutdown` flips.
pub fn spawn_dispatcher<H: MessageHandler>(
    handler: Arc<H>,
    client: Arc<RpcClient>,
    mut inbox: mpsc::UnboundedReceiver<Envelope>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let replica = client.replica_id().to_string();
        info!(%replica, "dispatcher started");
        loop {
            tokio::select! {
                message = inbox.recv() => {
                    let Some(envelope) = message else {
                        debug!(%replica, "inbox closed");
                        break;
                    };
                    dispatch(&handler, &client, envelope);
                }
                _ = shutdown.changed() => {
                    info!(%replica, "dispatcher shutting down");
                    break;
                }
            }
        }
    })
}

fn dispatch<H: MessageHandler>(handler: &Arc<H>, client: &Arc<RpcClient>, envelope: Envelope) {
    match envelope.kind {
        MessageKind::Response => client.complete(envelope),
        MessageKind::Request => {
            let handler = handler.clone();
            let client = client.clone();
            tokio::spawn(async move {
                let payload = handler.on_request(envelope.clone()).await;
                if let Err(e) = client.respond(&envelope, payload) {
                    warn!(
                        to = %envelope.sender,
                        subject = %envelope.subject,
                        error = %e,
                        "failed to send response"
                    );
                }
            });
        }
        MessageKind::Notification => {
            let handler = handler.clone();
            tokio::spawn(async move {
                handler.on_notification(envelope).await;
            });
        }
    }
}
