use dashmap::DashMap;
use rntbd_common::{PartitionId, SessionToken};

/// Highest session token observed per partition.
///
/// Updates for one partition are atomic; different partitions never
/// contend on the same entry.
#[derive(Debug, Default)]
pub struct SessionTokenStore {
    tokens: DashMap<PartitionId, SessionToken>,
}

impl SessionTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `token` into the partition's token. Never lowers a region's
    /// LSN.
    pub fn merge(&self, partition: &PartitionId, token: &SessionToken) {
        if token.is_empty() {
            return;
        }
        self.tokens
            .entry(partition.clone())
            .and_modify(|current| current.merge(token))
            .or_insert_with(|| token.clone());
    }

    /// Token for `partition`; empty if none has been observed.
    pub fn get(&self, partition: &PartitionId) -> SessionToken {
        self.tokens
            .get(partition)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Forgets every partition of a deleted collection. Returns how many
    /// entries were dropped.
    pub fn remove_collection(&self, collection_rid: &str) -> usize {
        let before = self.tokens.len();
        self.tokens.retain(|partition, _| partition.collection_rid != collection_rid);
        before - self.tokens.len()
    }

    pub fn clear(&self) {
        self.tokens.clear();
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
