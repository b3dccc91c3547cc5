use std::sync::Arc;

use async_trait::async_trait;
use rntbd_common::protocol::error::{Result, RntbdError};
use rntbd_common::StoreRequest;

use crate::endpoint::EndpointManager;
use crate::store_result::StoreResult;

/// Sends one request to one replica and classifies the answer.
///
/// Replica-level failures (not found, gone, stale routing, timeout, lost
/// connection) come back as a [`StoreResult`]. Only codec corruption,
/// invariant violations, endpoint saturation and shutdown are `Err`.
#[async_trait]
pub trait StoreInvoker: Send + Sync {
    async fn invoke(&self, request: &StoreRequest, address: &str) -> Result<StoreResult>;

    /// Releases whatever is held for an address that left its replica set.
    async fn retire(&self, _address: &str) {}
}

/// [`StoreInvoker`] over pooled RNTBD channels.
pub struct ReplicaInvoker {
    endpoints: Arc<EndpointManager>,
}

impl ReplicaInvoker {
    pub fn new(endpoints: Arc<EndpointManager>) -> Self {
        Self { endpoints }
    }

    pub fn endpoints(&self) -> &Arc<EndpointManager> {
        &self.endpoints
    }
}

fn is_connection_loss(error: &RntbdError) -> bool {
    matches!(
        error,
        RntbdError::ChannelClosed(_) | RntbdError::Connection(_) | RntbdError::Io(_)
    )
}

#[async_trait]
impl StoreInvoker for ReplicaInvoker {
    async fn invoke(&self, request: &StoreRequest, address: &str) -> Result<StoreResult> {
        let lease = match self.endpoints.acquire(address).await {
            Ok(lease) => lease,
            Err(e) if is_connection_loss(&e) => {
                tracing::debug!(%address, error = %e, "replica unreachable, treating as gone");
                return Ok(StoreResult::gone(address, &e));
            }
            Err(e) => return Err(e),
        };

        let frame = request.to_frame();
        let activity_id = frame.activity_id();
        tracing::trace!(request_id = %request.request_id, %activity_id, %address, "sending to replica");
        match lease.send(frame).await {
            Ok(response) => {
                let result = StoreResult::from_frame(response, address);
                tracing::trace!(%activity_id, %result, "replica responded");
                Ok(result)
            }
            Err(RntbdError::Timeout { timeout_ms, .. }) => {
                tracing::debug!(%address, request_id = %request.request_id, %activity_id, timeout_ms, "replica request timed out");
                Ok(StoreResult::timeout(address, timeout_ms))
            }
            Err(e) if is_connection_loss(&e) => {
                tracing::debug!(%address, request_id = %request.request_id, %activity_id, error = %e, "connection lost, treating as gone");
                Ok(StoreResult::gone(address, &e))
            }
            Err(e) => Err(e),
        }
    }

    async fn retire(&self, address: &str) {
        if self.endpoints.retire(address).await {
            tracing::debug!(%address, "retired endpoint for departed replica");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DirectConfig;
    use bytes::Bytes;
    use rntbd_common::transport::ReplicaServer;
    use rntbd_common::{Frame, Metadata, PartitionId};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config() -> DirectConfig {
        DirectConfig {
            request_timeout_ms: 200,
            timer_resolution_ms: 10,
            ..DirectConfig::default()
        }
    }

    async fn spawn_server(metadata: Metadata, delay_ms: u64) -> String {
        let server = ReplicaServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let _ = server
                .run_with_handler(move |frame: Frame| {
                    let metadata = metadata.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        Ok(Frame::response(&frame, metadata, Bytes::from_static(b"doc")))
                    }
                })
                .await;
        });
        addr
    }

    fn invoker() -> ReplicaInvoker {
        ReplicaInvoker::new(Arc::new(EndpointManager::new(config()).unwrap()))
    }

    fn request() -> StoreRequest {
        StoreRequest::read("dbs/d/colls/c/docs/x", PartitionId::new("c", "0"))
    }

    #[tokio::test]
    async fn test_invoke_success() {
        let addr = spawn_server(
            Metadata {
                status_code: Some(200),
                lsn: Some(12),
                ..Metadata::default()
            },
            0,
        )
        .await;

        let result = invoker().invoke(&request(), &addr).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.lsn(), 12);
        assert_eq!(result.store_physical_address(), addr);
    }

    #[tokio::test]
    async fn test_invoke_not_found_is_result() {
        let addr = spawn_server(
            Metadata {
                status_code: Some(404),
                lsn: Some(3),
                ..Metadata::default()
            },
            0,
        )
        .await;

        let result = invoker().invoke(&request(), &addr).await.unwrap();
        assert!(result.is_not_found());
    }

    #[tokio::test]
    async fn test_invoke_timeout_is_result() {
        let addr = spawn_server(
            Metadata {
                status_code: Some(200),
                lsn: Some(1),
                ..Metadata::default()
            },
            1000,
        )
        .await;

        let result = invoker().invoke(&request(), &addr).await.unwrap();
        assert!(result.is_timeout());
        assert!(result.is_valid());
        assert!(!result.has_valid_lsn());
    }

    #[tokio::test]
    async fn test_invoke_unreachable_is_gone() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = invoker().invoke(&request(), &addr).await.unwrap();
        assert!(result.is_gone());
    }

    #[tokio::test]
    async fn test_retire_drops_endpoint() {
        let addr = spawn_server(
            Metadata {
                status_code: Some(200),
                lsn: Some(1),
                ..Metadata::default()
            },
            0,
        )
        .await;
        let invoker = invoker();
        invoker.invoke(&request(), &addr).await.unwrap();
        assert_eq!(invoker.endpoints().endpoint_count(), 1);

        invoker.retire(&addr).await;
        assert_eq!(invoker.endpoints().endpoint_count(), 0);
    }

    #[tokio::test]
    async fn test_invoke_malformed_propagates() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 128];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(&[0xFF; 8]).await;
            tokio::time::sleep(Duration::from_millis(500)).await;
        });

        let err = invoker().invoke(&request(), &addr).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
