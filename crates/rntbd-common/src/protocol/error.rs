use std::fmt;

use thiserror::Error;
use uuid::Uuid;

/// Last replica state observed before a request failed.
///
/// Every terminal failure carries one of these so callers can log the
/// status, address and LSNs that led to the decision.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diagnostics {
    pub status_code: Option<u32>,
    pub sub_status_code: Option<u32>,
    pub address: Option<String>,
    pub partition_key_range_id: Option<String>,
    pub lsn: Option<i64>,
    pub quorum_acked_lsn: Option<i64>,
    pub global_committed_lsn: Option<i64>,
    pub request_charge: Option<f64>,
    pub message: Option<String>,
}

impl Diagnostics {
    pub fn for_address(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Self::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_partition_key_range_id(mut self, range_id: impl Into<String>) -> Self {
        self.partition_key_range_id = Some(range_id.into());
        self
    }
}

fn write_opt<T: fmt::Display>(f: &mut fmt::Formatter<'_>, name: &str, value: &Option<T>) -> fmt::Result {
    match value {
        Some(v) => write!(f, "{}: {}", name, v),
        None => write!(f, "{}: -", name),
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_opt(f, "status", &self.status_code)?;
        write_opt(f, ", subStatus", &self.sub_status_code)?;
        write_opt(f, ", address", &self.address)?;
        write_opt(f, ", partitionKeyRangeId", &self.partition_key_range_id)?;
        write_opt(f, ", lsn", &self.lsn)?;
        write_opt(f, ", quorumAckedLsn", &self.quorum_acked_lsn)?;
        write_opt(f, ", globalCommittedLsn", &self.global_committed_lsn)?;
        write_opt(f, ", requestCharge", &self.request_charge)?;
        if let Some(message) = &self.message {
            write!(f, ", message: {}", message)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum RntbdError {
    /// Codec corruption. The channel that read it is closed.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Request timeout after {timeout_ms}ms ({diagnostics})")]
    Timeout { timeout_ms: u64, diagnostics: Diagnostics },

    #[error("Replica gone ({0})")]
    Gone(Diagnostics),

    #[error("Resource not found ({0})")]
    NotFound(Diagnostics),

    #[error("Partition routing is stale ({0})")]
    InvalidPartition(Diagnostics),

    #[error("Endpoint saturated: {address} reached {limit} concurrent requests")]
    EndpointSaturated { address: String, limit: usize },

    #[error("Quorum not met: {observed} of {required} required replicas agreed ({diagnostics})")]
    QuorumNotMet {
        required: usize,
        observed: usize,
        diagnostics: Diagnostics,
    },

    #[error("No replicas available for partition key range {partition_key_range_id} ({diagnostics})")]
    NoReplicasAvailable {
        partition_key_range_id: String,
        diagnostics: Diagnostics,
    },

    #[error("Read session not available ({0})")]
    SessionNotAvailable(Diagnostics),

    /// Replica answered with a status outside the classified categories.
    #[error("Request failed ({0})")]
    Status(Diagnostics),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Activity id {0} is already in flight on this channel")]
    DuplicateActivityId(Uuid),

    #[error("Invalid session token: {0}")]
    InvalidSessionToken(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Shut down: {0}")]
    Shutdown(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RntbdError {
    /// Codec and invariant violations. These are never folded into a
    /// per-replica result.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RntbdError::MalformedFrame(_) | RntbdError::DuplicateActivityId(_)
        )
    }

    /// Failures a caller may reasonably retry against the same partition.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RntbdError::Timeout { .. }
                | RntbdError::Gone(_)
                | RntbdError::InvalidPartition(_)
                | RntbdError::EndpointSaturated { .. }
                | RntbdError::NoReplicasAvailable { .. }
        )
    }

    pub fn diagnostics(&self) -> Option<&Diagnostics> {
        match self {
            RntbdError::Timeout { diagnostics, .. }
            | RntbdError::QuorumNotMet { diagnostics, .. }
            | RntbdError::NoReplicasAvailable { diagnostics, .. } => Some(diagnostics),
            RntbdError::Gone(d)
            | RntbdError::NotFound(d)
            | RntbdError::InvalidPartition(d)
            | RntbdError::SessionNotAvailable(d)
            | RntbdError::Status(d) => Some(d),
            _ => None,
        }
    }

    pub fn diagnostics_mut(&mut self) -> Option<&mut Diagnostics> {
        match self {
            RntbdError::Timeout { diagnostics, .. }
            | RntbdError::QuorumNotMet { diagnostics, .. }
            | RntbdError::NoReplicasAvailable { diagnostics, .. } => Some(diagnostics),
            RntbdError::Gone(d)
            | RntbdError::NotFound(d)
            | RntbdError::InvalidPartition(d)
            | RntbdError::SessionNotAvailable(d)
            | RntbdError::Status(d) => Some(d),
            _ => None,
        }
    }

    pub fn status_code(&self) -> Option<u32> {
        self.diagnostics().and_then(|d| d.status_code)
    }
}

pub type Result<T> = std::result::Result<T, RntbdError>;
