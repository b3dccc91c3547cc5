//! Session tokens and the partition key they are tracked under.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::{Result, RntbdError};

/// Identifies one partition key range of one collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId {
    pub collection_rid: String,
    pub partition_key_range_id: String,
}

impl PartitionId {
    pub fn new(collection_rid: impl Into<String>, partition_key_range_id: impl Into<String>) -> Self {
        Self {
            collection_rid: collection_rid.into(),
            partition_key_range_id: partition_key_range_id.into(),
        }
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection_rid, self.partition_key_range_id)
    }
}

/// Per-region progress a client has observed, as region id to LSN.
///
/// Textual form is `"<region>=<lsn>#<region>=<lsn>"`; the empty string is
/// the empty token. Merging is a pointwise max, so it is commutative,
/// associative and idempotent, and never lowers a region's LSN.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionToken {
    regions: BTreeMap<u32, i64>,
}

impl SessionToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, keeping the higher LSN if the region exists.
    pub fn with(mut self, region: u32, lsn: i64) -> Self {
        self.observe(region, lsn);
        self
    }

    pub fn observe(&mut self, region: u32, lsn: i64) {
        self.regions
            .entry(region)
            .and_modify(|current| *current = (*current).max(lsn))
            .or_insert(lsn);
    }

    pub fn merge(&mut self, other: &SessionToken) {
        for (&region, &lsn) in &other.regions {
            self.observe(region, lsn);
        }
    }

    pub fn merged(&self, other: &SessionToken) -> SessionToken {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    /// True when this token has reached at least `other`'s LSN in every
    /// region `other` mentions.
    pub fn dominates(&self, other: &SessionToken) -> bool {
        other
            .regions
            .iter()
            .all(|(region, &lsn)| self.regions.get(region).is_some_and(|&own| own >= lsn))
    }

    pub fn lsn(&self, region: u32) -> Option<i64> {
        self.regions.get(&region).copied()
    }

    pub fn max_lsn(&self) -> Option<i64> {
        self.regions.values().copied().max()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, i64)> + '_ {
        self.regions.iter().map(|(&r, &l)| (r, l))
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (region, lsn)) in self.regions.iter().enumerate() {
            if i > 0 {
                f.write_str("#")?;
            }
            write!(f, "{}={}", region, lsn)?;
        }
        Ok(())
    }
}

impl FromStr for SessionToken {
    type Err = RntbdError;

    fn from_str(s: &str) -> Result<Self> {
        let mut token = SessionToken::new();
        if s.trim().is_empty() {
            return Ok(token);
        }

        for segment in s.split('#') {
            let (region, lsn) = segment
                .split_once('=')
                .ok_or_else(|| RntbdError::InvalidSessionToken(format!("missing '=' in '{}'", segment)))?;
            let region = region
                .trim()
                .parse::<u32>()
                .map_err(|e| RntbdError::InvalidSessionToken(format!("bad region '{}': {}", region, e)))?;
            let lsn = lsn
                .trim()
                .parse::<i64>()
                .map_err(|e| RntbdError::InvalidSessionToken(format!("bad lsn '{}': {}", lsn, e)))?;
            token.observe(region, lsn);
        }

        Ok(token)
    }
}

impl Serialize for SessionToken {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SessionToken {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
