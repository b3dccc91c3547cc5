//! Simulated replica for `rntbd serve` and end-to-end tests.
//!
//! Keeps documents in memory keyed by resource address and stamps every
//! answer with the LSN headers a real replica sends. Single-region: the
//! session token only carries this replica's region.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use rntbd_common::protocol::error::Result;
use rntbd_common::transport::ReplicaServer;
use rntbd_common::{status_codes, sub_status_codes, Frame, Metadata, OperationType, SessionToken};
use tokio::sync::RwLock;

const READ_CHARGE: f64 = 1.0;
const WRITE_CHARGE: f64 = 5.0;

#[derive(Debug, Clone)]
pub struct ReplicaSettings {
    pub region: u32,
    pub initial_lsn: i64,
    pub write_quorum: u32,
    pub read_regions: u32,
}

impl Default for ReplicaSettings {
    fn default() -> Self {
        Self {
            region: 1,
            initial_lsn: 1,
            write_quorum: 1,
            read_regions: 0,
        }
    }
}

pub struct SimulatedReplica {
    settings: ReplicaSettings,
    lsn: AtomicI64,
    documents: RwLock<HashMap<String, Bytes>>,
}

impl SimulatedReplica {
    pub fn new(settings: ReplicaSettings) -> Self {
        Self {
            lsn: AtomicI64::new(settings.initial_lsn),
            settings,
            documents: RwLock::new(HashMap::new()),
        }
    }

    pub fn lsn(&self) -> i64 {
        self.lsn.load(Ordering::Acquire)
    }

    /// Preloads a document without advancing the LSN.
    pub async fn insert(&self, address: impl Into<String>, document: Bytes) {
        self.documents.write().await.insert(address.into(), document);
    }

    /// Answers frames from `server` until the listener fails.
    pub async fn serve(self: Arc<Self>, server: ReplicaServer) -> Result<()> {
        server
            .run_with_handler(move |frame: Frame| {
                let replica = self.clone();
                async move { replica.handle(frame).await }
            })
            .await
    }

    pub async fn handle(&self, frame: Frame) -> Result<Frame> {
        let request = frame.metadata();
        let address = request.resource_address.clone().unwrap_or_default();

        let requested = match request.session_token.as_deref() {
            Some(text) => text.parse::<SessionToken>()?,
            None => SessionToken::new(),
        };
        let current = self.lsn();
        if let Some(wanted) = requested.lsn(self.settings.region) {
            if wanted > current && !frame.operation_type().is_write() {
                tracing::debug!(%address, wanted, current, "session not yet available");
                let metadata = Metadata {
                    sub_status_code: Some(sub_status_codes::READ_SESSION_NOT_AVAILABLE),
                    ..self.metadata(status_codes::NOT_FOUND, current, READ_CHARGE)
                };
                return Ok(Frame::response(&frame, metadata, Bytes::new()));
            }
        }

        let op = frame.operation_type();
        let (status, payload, charge) = if op.is_write() {
            let lsn = self.lsn.fetch_add(1, Ordering::AcqRel) + 1;
            let mut documents = self.documents.write().await;
            let status = match op {
                OperationType::Delete => {
                    documents.remove(&address);
                    status_codes::NO_CONTENT
                }
                OperationType::Create => {
                    documents.insert(address.clone(), frame.payload().clone());
                    status_codes::CREATED
                }
                _ => {
                    documents.insert(address.clone(), frame.payload().clone());
                    status_codes::OK
                }
            };
            tracing::debug!(%address, ?op, lsn, "applied write");
            (status, Bytes::new(), WRITE_CHARGE)
        } else if matches!(op, OperationType::Head | OperationType::HeadFeed) {
            (status_codes::OK, Bytes::new(), 0.0)
        } else {
            match self.documents.read().await.get(&address) {
                Some(document) => (status_codes::OK, document.clone(), READ_CHARGE),
                None => (status_codes::NOT_FOUND, Bytes::new(), READ_CHARGE),
            }
        };

        let metadata = self.metadata(status, self.lsn(), charge);
        Ok(Frame::response(&frame, metadata, payload))
    }

    fn metadata(&self, status: u32, lsn: i64, charge: f64) -> Metadata {
        Metadata {
            status_code: Some(status),
            lsn: Some(lsn),
            quorum_acked_lsn: Some(lsn),
            global_committed_lsn: Some(lsn),
            number_of_read_regions: Some(self.settings.read_regions),
            write_quorum: Some(self.settings.write_quorum),
            request_charge: Some(charge),
            session_token: Some(SessionToken::new().with(self.settings.region, lsn).to_string()),
            ..Metadata::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rntbd_common::{PartitionId, StoreRequest};

    fn partition() -> PartitionId {
        PartitionId::new("coll", "0")
    }

    fn replica() -> SimulatedReplica {
        SimulatedReplica::new(ReplicaSettings::default())
    }

    fn upsert(address: &str, body: &'static [u8]) -> Frame {
        StoreRequest::new(
            OperationType::Upsert,
            rntbd_common::ResourceType::Document,
            address,
            partition(),
        )
        .with_payload(Bytes::from_static(body))
        .to_frame()
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let replica = replica();
        let written = replica.handle(upsert("docs/a", b"{\"a\":1}")).await.unwrap();
        assert_eq!(written.metadata().status_code, Some(200));
        assert_eq!(written.metadata().lsn, Some(2));
        assert_eq!(written.metadata().session_token.as_deref(), Some("1=2"));

        let read = replica
            .handle(StoreRequest::read("docs/a", partition()).to_frame())
            .await
            .unwrap();
        assert_eq!(read.metadata().status_code, Some(200));
        assert_eq!(read.payload().as_ref(), b"{\"a\":1}");
    }

    #[tokio::test]
    async fn test_missing_document_is_not_found() {
        let read = replica()
            .handle(StoreRequest::read("docs/missing", partition()).to_frame())
            .await
            .unwrap();
        assert_eq!(read.metadata().status_code, Some(404));
        assert_eq!(read.metadata().lsn, Some(1));
    }

    #[tokio::test]
    async fn test_future_session_is_not_available() {
        let request = StoreRequest::read("docs/a", partition()).with_session_token(SessionToken::new().with(1, 9));
        let read = replica().handle(request.to_frame()).await.unwrap();
        assert_eq!(read.metadata().status_code, Some(404));
        assert_eq!(read.metadata().sub_status_code, Some(sub_status_codes::READ_SESSION_NOT_AVAILABLE));
    }

    #[tokio::test]
    async fn test_head_reports_lsn_without_charge() {
        let replica = replica();
        replica.handle(upsert("docs/a", b"{}")).await.unwrap();

        let head = replica
            .handle(StoreRequest::read("docs/a", partition()).barrier().to_frame())
            .await
            .unwrap();
        assert_eq!(head.metadata().lsn, Some(2));
        assert_eq!(head.metadata().request_charge, Some(0.0));
        assert!(head.payload().is_empty());
    }
}
