use bytes::Bytes;
use uuid::Uuid;

use super::frame::Frame;
use super::metadata::Metadata;
use super::session::{PartitionId, SessionToken};
use super::types::{ConsistencyLevel, OperationType, ResourceType};

/// A logical store request, addressed to a partition rather than a replica.
///
/// The same request may be transmitted to several replicas (fan-out,
/// barrier re-reads); each transmission gets its own activity id from
/// [`StoreRequest::to_frame`] so it can never collide with a request still
/// in flight on a shared channel. `request_id` names the logical request in
/// logs and is never put on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreRequest {
    pub request_id: Uuid,
    pub operation_type: OperationType,
    pub resource_type: ResourceType,
    pub resource_address: String,
    pub partition: PartitionId,
    pub consistency_level: Option<ConsistencyLevel>,
    pub session_token: Option<SessionToken>,
    pub payload: Bytes,
}

impl StoreRequest {
    pub fn new(
        operation_type: OperationType,
        resource_type: ResourceType,
        resource_address: impl Into<String>,
        partition: PartitionId,
    ) -> Self {
        StoreRequest {
            request_id: Uuid::new_v4(),
            operation_type,
            resource_type,
            resource_address: resource_address.into(),
            partition,
            consistency_level: None,
            session_token: None,
            payload: Bytes::new(),
        }
    }

    pub fn read(resource_address: impl Into<String>, partition: PartitionId) -> Self {
        Self::new(OperationType::Read, ResourceType::Document, resource_address, partition)
    }

    pub fn with_consistency(mut self, level: ConsistencyLevel) -> Self {
        self.consistency_level = Some(level);
        self
    }

    pub fn with_session_token(mut self, token: SessionToken) -> Self {
        self.session_token = Some(token);
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn is_write(&self) -> bool {
        self.operation_type.is_write()
    }

    /// Head request used to re-read LSNs from a replica while waiting for
    /// quorum or global commit.
    pub fn barrier(&self) -> StoreRequest {
        StoreRequest {
            request_id: self.request_id,
            operation_type: OperationType::Head,
            resource_type: ResourceType::Collection,
            resource_address: self.resource_address.clone(),
            partition: self.partition.clone(),
            consistency_level: self.consistency_level,
            session_token: None,
            payload: Bytes::new(),
        }
    }

    /// Encodes one transmission of this request under a fresh activity id.
    pub fn to_frame(&self) -> Frame {
        self.to_frame_with_id(Uuid::new_v4())
    }

    pub fn to_frame_with_id(&self, activity_id: Uuid) -> Frame {
        let metadata = Metadata {
            resource_address: Some(self.resource_address.clone()),
            partition_key_range_id: Some(self.partition.partition_key_range_id.clone()),
            consistency_level: self.consistency_level,
            session_token: self
                .session_token
                .as_ref()
                .filter(|t| !t.is_empty())
                .map(|t| t.to_string()),
            ..Metadata::default()
        };
        Frame::new(
            activity_id,
            self.resource_type,
            self.operation_type,
            metadata,
            self.payload.clone(),
        )
    }
}
