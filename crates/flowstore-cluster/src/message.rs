//! Cluster message subjects, envelopes and typed payloads.
//!
//! Every payload is JSON inside an `Envelope`. Requests and their responses
//! share a correlation id; notifications expect no response.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use flowstore_core::{
    BatchOperation, BatchResult, DeviceId, Epoch, FlowEntry, FlowEntryId, FlowError, FlowResult,
    FlowTable, LogicalTableId, ReplicaId,
};
use flowstore_state::DeviceSnapshot;

/// RPC kinds on the cluster transport. New subjects are only ever added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageSubject {
    ApplyBatchFlows,
    GetFlowEntry,
    GetDeviceFlowEntries,
    GetDeviceFlowTables,
    RemoveFlowEntry,
    RemoveFlowTable,
    ApplyCompleted,
    FlowTableBackup,
}

impl MessageSubject {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageSubject::ApplyBatchFlows => "apply-batch-flows",
            MessageSubject::GetFlowEntry => "get-flow-entry",
            MessageSubject::GetDeviceFlowEntries => "get-device-flow-entries",
            MessageSubject::GetDeviceFlowTables => "get-device-flow-tables",
            MessageSubject::RemoveFlowEntry => "remove-flow-entry",
            MessageSubject::RemoveFlowTable => "remove-flow-table",
            MessageSubject::ApplyCompleted => "apply-completed",
            MessageSubject::FlowTableBackup => "flow-table-backup",
        }
    }

    /// Subjects that are fire-and-forget.
    pub fn is_notification(&self) -> bool {
        matches!(self, MessageSubject::ApplyCompleted)
    }
}

impl fmt::Display for MessageSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
    Notification,
}

/// One message on the cluster transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub correlation_id: u64,
    pub subject: MessageSubject,
    pub sender: ReplicaId,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new<T: Serialize>(
        kind: MessageKind,
        subject: MessageSubject,
        sender: &str,
        correlation_id: u64,
        body: &T,
    ) -> FlowResult<Self> {
        Ok(Self {
            correlation_id,
            subject,
            sender: sender.to_string(),
            kind,
            payload: encode(body)?,
        })
    }

    /// Decode the payload as `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> FlowResult<T> {
        serde_json::from_slice(&self.payload).map_err(|e| {
            FlowError::Transport(format!("malformed {} payload: {e}", self.subject))
        })
    }
}

pub fn encode<T: Serialize>(body: &T) -> FlowResult<Vec<u8>> {
    serde_json::to_vec(body).map_err(|e| FlowError::Transport(format!("encode: {e}")))
}

/// Response body: the outcome plus the responder's mastership epoch for
/// the device, so callers can detect answers from a superseded master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply<T> {
    pub epoch: Epoch,
    pub result: Result<T, FlowError>,
}

impl<T> Reply<T> {
    pub fn new(epoch: Epoch, result: FlowResult<T>) -> Self {
        Self { epoch, result }
    }
}

/// A typed request with a fixed subject and response type.
pub trait Rpc: Serialize + DeserializeOwned + Send + Sync + 'static {
    const SUBJECT: MessageSubject;
    type Response: Serialize + DeserializeOwned + Send + 'static;

    fn device_id(&self) -> &DeviceId;
}

// ── Requests ───────────────────────────────────────────────────────

/// Apply one device's batch on its master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyBatchRequest {
    pub device_id: DeviceId,
    pub correlation_id: u64,
    /// Epoch the sender believes is current.
    pub epoch: Epoch,
    pub operations: Vec<BatchOperation>,
}

impl Rpc for ApplyBatchRequest {
    const SUBJECT: MessageSubject = MessageSubject::ApplyBatchFlows;
    type Response = BatchResult;

    fn device_id(&self) -> &DeviceId {
        &self.device_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetFlowEntryRequest {
    pub device_id: DeviceId,
    pub entry_id: FlowEntryId,
}

impl Rpc for GetFlowEntryRequest {
    const SUBJECT: MessageSubject = MessageSubject::GetFlowEntry;
    type Response = FlowEntry;

    fn device_id(&self) -> &DeviceId {
        &self.device_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetDeviceEntriesRequest {
    pub device_id: DeviceId,
}

impl Rpc for GetDeviceEntriesRequest {
    const SUBJECT: MessageSubject = MessageSubject::GetDeviceFlowEntries;
    type Response = Vec<FlowEntry>;

    fn device_id(&self) -> &DeviceId {
        &self.device_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetDeviceTablesRequest {
    pub device_id: DeviceId,
}

impl Rpc for GetDeviceTablesRequest {
    const SUBJECT: MessageSubject = MessageSubject::GetDeviceFlowTables;
    type Response = Vec<FlowTable>;

    fn device_id(&self) -> &DeviceId {
        &self.device_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveFlowEntryRequest {
    pub device_id: DeviceId,
    pub entry_id: FlowEntryId,
    pub epoch: Epoch,
}

impl Rpc for RemoveFlowEntryRequest {
    const SUBJECT: MessageSubject = MessageSubject::RemoveFlowEntry;
    type Response = ();

    fn device_id(&self) -> &DeviceId {
        &self.device_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveFlowTableRequest {
    pub device_id: DeviceId,
    pub table_id: LogicalTableId,
    pub epoch: Epoch,
}

impl Rpc for RemoveFlowTableRequest {
    const SUBJECT: MessageSubject = MessageSubject::RemoveFlowTable;
    type Response = ();

    fn device_id(&self) -> &DeviceId {
        &self.device_id
    }
}

/// Full device state shipped from a master to one backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRequest {
    pub snapshot: DeviceSnapshot,
}

/// `stored` is false when the backup already held a newer snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupAck {
    pub stored: bool,
}

impl Rpc for BackupRequest {
    const SUBJECT: MessageSubject = MessageSubject::FlowTableBackup;
    type Response = BackupAck;

    fn device_id(&self) -> &DeviceId {
        &self.snapshot.device_id
    }
}

/// An incoming request, decoded by subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterRequest {
    ApplyBatch(ApplyBatchRequest),
    GetEntry(GetFlowEntryRequest),
    GetDeviceEntries(GetDeviceEntriesRequest),
    GetDeviceTables(GetDeviceTablesRequest),
    RemoveEntry(RemoveFlowEntryRequest),
    RemoveTable(RemoveFlowTableRequest),
    Backup(BackupRequest),
}

impl ClusterRequest {
    pub fn decode(envelope: &Envelope) -> FlowResult<Self> {
        Ok(match envelope.subject {
            MessageSubject::ApplyBatchFlows => ClusterRequest::ApplyBatch(envelope.decode()?),
            MessageSubject::GetFlowEntry => ClusterRequest::GetEntry(envelope.decode()?),
            MessageSubject::GetDeviceFlowEntries => {
                ClusterRequest::GetDeviceEntries(envelope.decode()?)
            }
            MessageSubject::GetDeviceFlowTables => {
                ClusterRequest::GetDeviceTables(envelope.decode()?)
            }
            MessageSubject::RemoveFlowEntry => ClusterRequest::RemoveEntry(envelope.decode()?),
            MessageSubject::RemoveFlowTable => ClusterRequest::RemoveTable(envelope.decode()?),
            MessageSubject::FlowTableBackup => ClusterRequest::Backup(envelope.decode()?),
            MessageSubject::ApplyCompleted => {
                return Err(FlowError::InvalidRequest(format!(
                    "{} is a notification",
                    envelope.subject
                )));
            }
        })
    }
}

/// An incoming notification, decoded by subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterNotification {
    /// A master finished a batch forwarded by this replica.
    ApplyCompleted(BatchResult),
}

impl ClusterNotification {
    pub fn decode(envelope: &Envelope) -> FlowResult<Self> {
        match envelope.subject {
            MessageSubject::ApplyCompleted => {
                Ok(ClusterNotification::ApplyCompleted(envelope.decode()?))
            }
            other => Err(FlowError::InvalidRequest(format!(
                "{other} is not a notification"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowstore_core::{FlowOp, OperationId};

    #[test]
    fn subject_names_are_stable() {
        assert_eq!(MessageSubject::ApplyBatchFlows.as_str(), "apply-batch-flows");
        assert_eq!(MessageSubject::FlowTableBackup.to_string(), "flow-table-backup");
        assert_eq!(
            serde_json::to_string(&MessageSubject::GetDeviceFlowEntries).unwrap(),
            r#""get-device-flow-entries""#
        );
        assert!(MessageSubject::ApplyCompleted.is_notification());
        assert!(!MessageSubject::RemoveFlowEntry.is_notification());
    }

    #[test]
    fn request_decodes_by_subject() {
        let request = RemoveFlowEntryRequest {
            device_id: DeviceId::new("of:1"),
            entry_id: FlowEntryId(7),
            epoch: 2,
        };
        let envelope = Envelope::new(
            MessageKind::Request,
            RemoveFlowEntryRequest::SUBJECT,
            "r1",
            42,
            &request,
        )
        .unwrap();

        match ClusterRequest::decode(&envelope).unwrap() {
            ClusterRequest::RemoveEntry(decoded) => assert_eq!(decoded, request),
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn notification_is_not_a_request() {
        let result = BatchResult {
            device_id: DeviceId::new("of:1"),
            correlation_id: 3,
            epoch: 1,
            results: vec![],
        };
        let envelope = Envelope::new(
            MessageKind::Notification,
            MessageSubject::ApplyCompleted,
            "r1",
            0,
            &result,
        )
        .unwrap();

        assert!(ClusterRequest::decode(&envelope).is_err());
        assert_eq!(
            ClusterNotification::decode(&envelope).unwrap(),
            ClusterNotification::ApplyCompleted(result)
        );
    }

    #[test]
    fn malformed_payload_is_transport_error() {
        let envelope = Envelope {
            correlation_id: 1,
            subject: MessageSubject::ApplyBatchFlows,
            sender: "r1".to_string(),
            kind: MessageKind::Request,
            payload: b"not json".to_vec(),
        };
        assert!(matches!(
            ClusterRequest::decode(&envelope),
            Err(FlowError::Transport(_))
        ));
    }

    #[test]
    fn reply_carries_errors() {
        let reply: Reply<()> = Reply::new(
            4,
            Err(FlowError::DuplicateOperation(OperationId(1))),
        );
        let bytes = encode(&reply).unwrap();
        let back: Reply<()> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, reply);

        let batch = ApplyBatchRequest {
            device_id: DeviceId::new("of:1"),
            correlation_id: 9,
            epoch: 4,
            operations: vec![BatchOperation::new(
                1,
                FlowOp::RemoveFlow {
                    device_id: DeviceId::new("of:1"),
                    entry_id: FlowEntryId(2),
                },
            )],
        };
        assert_eq!(batch.device_id(), &DeviceId::new("of:1"));
    }
}
