use std::sync::Arc;

use rntbd_client::{DirectConfig, EndpointManager, ReplicaInvoker};
use rntbd_common::protocol::error::Result;
use rntbd_common::{PartitionId, SessionToken, StoreRequest, StoreResponse};

use crate::address::AddressResolver;
use crate::engine::ConsistencyEngine;
use crate::session_store::SessionTokenStore;

/// Direct-mode client: pooled RNTBD channels to every replica plus the
/// consistency engine on top.
pub struct DirectClient {
    endpoints: Arc<EndpointManager>,
    engine: ConsistencyEngine,
}

impl DirectClient {
    pub fn new(config: DirectConfig, resolver: Arc<dyn AddressResolver>) -> Result<Self> {
        let endpoints = Arc::new(EndpointManager::new(config.clone())?);
        let invoker = Arc::new(ReplicaInvoker::new(endpoints.clone()));
        let engine = ConsistencyEngine::new(resolver, invoker, Arc::new(SessionTokenStore::new()), config);
        tracing::info!(
            consistency = %engine.config().consistency_level,
            max_requests_per_endpoint = engine.config().max_requests_per_endpoint,
            "direct client initialized"
        );
        Ok(Self { endpoints, engine })
    }

    pub async fn execute(&self, request: StoreRequest) -> Result<StoreResponse> {
        self.engine.execute(request).await
    }

    /// Session token this client has observed for `partition`.
    pub fn session_token(&self, partition: &PartitionId) -> SessionToken {
        self.engine.sessions().get(partition)
    }

    /// Forgets session state for a deleted collection.
    pub fn remove_collection(&self, collection_rid: &str) -> usize {
        self.engine.sessions().remove_collection(collection_rid)
    }

    pub fn endpoints(&self) -> &Arc<EndpointManager> {
        &self.endpoints
    }

    pub fn engine(&self) -> &ConsistencyEngine {
        &self.engine
    }

    /// Closes every channel and drops all session state. Requests still in
    /// flight fail with `ChannelClosed`.
    pub async fn close(&self) {
        self.engine.sessions().clear();
        self.endpoints.close().await;
        tracing::info!("direct client closed");
    }
}
