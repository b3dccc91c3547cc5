use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use rntbd_common::protocol::error::Result;
use rntbd_common::PartitionId;

/// Maps a partition key range to the physical addresses of its replicas.
///
/// The first address is the primary.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn resolve(&self, partition: &PartitionId) -> Result<Vec<String>>;

    /// Drops any cached addresses for `partition` so the next `resolve`
    /// refreshes them.
    async fn invalidate(&self, partition: &PartitionId);
}

/// Resolver over a fixed address table.
///
/// A replacement address set can be staged with
/// [`stage_refresh`](Self::stage_refresh); it takes effect on the next
/// invalidation, the way a real resolver would pick up a new replica set.
#[derive(Default)]
pub struct StaticAddressResolver {
    addresses: DashMap<PartitionId, Vec<String>>,
    staged: DashMap<PartitionId, Vec<String>>,
    invalidations: AtomicUsize,
}

impl StaticAddressResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_partition(self, partition: PartitionId, addresses: Vec<String>) -> Self {
        self.set(partition, addresses);
        self
    }

    pub fn set(&self, partition: PartitionId, addresses: Vec<String>) {
        self.addresses.insert(partition, addresses);
    }

    pub fn remove(&self, partition: &PartitionId) -> Option<Vec<String>> {
        self.addresses.remove(partition).map(|(_, v)| v)
    }

    pub fn stage_refresh(&self, partition: PartitionId, addresses: Vec<String>) {
        self.staged.insert(partition, addresses);
    }

    /// Total number of `invalidate` calls.
    pub fn invalidation_count(&self) -> usize {
        self.invalidations.load(Ordering::Acquire)
    }
}

#[async_trait]
impl AddressResolver for StaticAddressResolver {
    async fn resolve(&self, partition: &PartitionId) -> Result<Vec<String>> {
        Ok(self
            .addresses
            .get(partition)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn invalidate(&self, partition: &PartitionId) {
        self.invalidations.fetch_add(1, Ordering::AcqRel);
        if let Some((_, addresses)) = self.staged.remove(partition) {
            tracing::debug!(%partition, replicas = addresses.len(), "refreshed replica addresses");
            self.addresses.insert(partition.clone(), addresses);
        }
    }
}
