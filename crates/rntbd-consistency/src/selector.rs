use std::sync::atomic::{AtomicUsize, Ordering};

/// Rotating replica order for reads.
///
/// Each call starts one position further along the replica list so that
/// single-replica reads spread across the replica set instead of always
/// landing on the primary.
#[derive(Debug, Default)]
pub struct ReplicaSelector {
    next: AtomicUsize,
}

impl ReplicaSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every replica, rotated to the next starting position.
    pub fn read_order(&self, replicas: &[String]) -> Vec<String> {
        if replicas.is_empty() {
            return Vec::new();
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed) % replicas.len();
        replicas[start..]
            .iter()
            .chain(replicas[..start].iter())
            .cloned()
            .collect()
    }

    /// Writes always go to the primary first.
    pub fn primary(replicas: &[String]) -> Option<&String> {
        replicas.first()
    }

    pub fn secondaries(replicas: &[String]) -> &[String] {
        replicas.get(1..).unwrap_or(&[])
    }
}
