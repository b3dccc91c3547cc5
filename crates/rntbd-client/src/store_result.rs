//! Classified outcome of one request against one replica.

use std::fmt;

use rntbd_common::protocol::error::{Diagnostics, RntbdError};
use rntbd_common::{status_codes, sub_status_codes, Frame, SessionToken, StoreResponse};

const NAME_CACHE_STALE_MESSAGE: &str = "name cache is stale";

/// Status and message of a replica answer that was not a success.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreError {
    pub status_code: u32,
    pub sub_status_code: u32,
    pub message: String,
    /// Set for timeouts.
    pub timeout_ms: Option<u64>,
}

impl StoreError {
    pub fn new(status_code: u32, sub_status_code: u32, message: impl Into<String>) -> Self {
        Self {
            status_code,
            sub_status_code,
            message: message.into(),
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreOutcome {
    Success(StoreResponse),
    NotFound(StoreError),
    Gone(StoreError),
    InvalidPartition(StoreError),
    Timeout(StoreError),
    Other(StoreError),
}

impl StoreOutcome {
    /// Classifies a replica status. The message is only consulted when no
    /// sub-status was sent.
    pub fn classify(error: StoreError) -> StoreOutcome {
        let sub_status_code = error.sub_status_code;
        match error.status_code {
            status_codes::NOT_FOUND => StoreOutcome::NotFound(error),
            status_codes::GONE => {
                let stale_routing = matches!(
                    sub_status_code,
                    sub_status_codes::NAME_CACHE_IS_STALE
                        | sub_status_codes::PARTITION_KEY_RANGE_GONE
                        | sub_status_codes::COMPLETING_SPLIT
                        | sub_status_codes::COMPLETING_PARTITION_MIGRATION
                );
                let stale_by_message = sub_status_code == sub_status_codes::UNKNOWN
                    && error.message.to_ascii_lowercase().contains(NAME_CACHE_STALE_MESSAGE);
                if stale_routing || stale_by_message {
                    StoreOutcome::InvalidPartition(error)
                } else {
                    StoreOutcome::Gone(error)
                }
            }
            status_codes::REQUEST_TIMEOUT => StoreOutcome::Timeout(error),
            _ => StoreOutcome::Other(error),
        }
    }

    fn error(&self) -> Option<&StoreError> {
        match self {
            StoreOutcome::Success(_) => None,
            StoreOutcome::NotFound(e)
            | StoreOutcome::Gone(e)
            | StoreOutcome::InvalidPartition(e)
            | StoreOutcome::Timeout(e)
            | StoreOutcome::Other(e) => Some(e),
        }
    }
}

/// Running total of request charges across every replica a logical
/// request touched.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RequestChargeTracker {
    total: f64,
}

impl RequestChargeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, charge: f64) {
        self.total += charge;
    }

    pub fn total(&self) -> f64 {
        self.total
    }
}

/// Outcome of invoking one request against one replica.
///
/// LSN fields are -1 when the replica did not report them.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreResult {
    outcome: StoreOutcome,
    lsn: i64,
    quorum_acked_lsn: i64,
    global_committed_lsn: i64,
    item_lsn: i64,
    number_of_read_regions: u32,
    current_replica_set_size: u32,
    current_write_quorum: u32,
    session_token: Option<SessionToken>,
    request_charge: f64,
    partition_key_range_id: Option<String>,
    store_physical_address: String,
    is_valid: bool,
}

impl StoreResult {
    fn empty(outcome: StoreOutcome, address: &str) -> Self {
        Self {
            outcome,
            lsn: -1,
            quorum_acked_lsn: -1,
            global_committed_lsn: -1,
            item_lsn: -1,
            number_of_read_regions: 0,
            current_replica_set_size: 0,
            current_write_quorum: 0,
            session_token: None,
            request_charge: 0.0,
            partition_key_range_id: None,
            store_physical_address: address.to_string(),
            is_valid: true,
        }
    }

    /// Builds a result from a replica's response frame.
    ///
    /// Every classified error answer is valid and carries its error. A
    /// success is valid only when it carries an LSN, and a frame without a
    /// status code never is.
    pub fn from_frame(frame: Frame, address: &str) -> Self {
        let (metadata, payload) = frame.into_parts();

        let session_token = metadata.session_token.as_deref().and_then(|text| {
            text.parse::<SessionToken>()
                .map_err(|e| tracing::debug!(%address, error = %e, "ignoring unparsable session token"))
                .ok()
        });
        let lsn = metadata.lsn.unwrap_or(-1);
        let request_charge = metadata.request_charge.unwrap_or(0.0);
        let sub_status_code = metadata.sub_status_code.unwrap_or(sub_status_codes::UNKNOWN);
        let message = metadata.error_message.clone().unwrap_or_default();

        let outcome = match metadata.status_code {
            Some(status) if (200..300).contains(&status) || status == status_codes::NOT_MODIFIED => {
                StoreOutcome::Success(StoreResponse {
                    status_code: status,
                    sub_status_code,
                    headers: metadata.response_headers.clone(),
                    session_token: session_token.clone(),
                    request_charge,
                    lsn,
                    payload,
                })
            }
            Some(status) => StoreOutcome::classify(StoreError::new(status, sub_status_code, message)),
            None => StoreOutcome::Other(StoreError::new(0, sub_status_code, "response carried no status code")),
        };

        let is_valid = match &outcome {
            StoreOutcome::Success(_) => lsn >= 0,
            StoreOutcome::Other(e) => e.status_code != 0,
            _ => true,
        };

        Self {
            outcome,
            lsn,
            quorum_acked_lsn: metadata.quorum_acked_lsn.unwrap_or(-1),
            global_committed_lsn: metadata.global_committed_lsn.unwrap_or(-1),
            item_lsn: metadata.item_lsn.unwrap_or(-1),
            number_of_read_regions: metadata.number_of_read_regions.unwrap_or(0),
            current_replica_set_size: metadata.replica_set_size.unwrap_or(0),
            current_write_quorum: metadata.write_quorum.unwrap_or(0),
            session_token,
            request_charge,
            partition_key_range_id: metadata.partition_key_range_id,
            store_physical_address: address.to_string(),
            is_valid,
        }
    }

    /// Replica could not be reached or dropped the connection.
    pub fn gone(address: &str, cause: &RntbdError) -> Self {
        Self::empty(
            StoreOutcome::Gone(StoreError::new(status_codes::GONE, sub_status_codes::UNKNOWN, cause.to_string())),
            address,
        )
    }

    pub fn timeout(address: &str, timeout_ms: u64) -> Self {
        let mut error = StoreError::new(
            status_codes::REQUEST_TIMEOUT,
            sub_status_codes::UNKNOWN,
            format!("request timed out after {}ms", timeout_ms),
        );
        error.timeout_ms = Some(timeout_ms);
        Self::empty(StoreOutcome::Timeout(error), address)
    }

    pub fn outcome(&self) -> &StoreOutcome {
        &self.outcome
    }

    pub fn response(&self) -> Option<&StoreResponse> {
        match &self.outcome {
            StoreOutcome::Success(response) => Some(response),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, StoreOutcome::Success(_))
    }

    pub fn is_gone(&self) -> bool {
        matches!(self.outcome, StoreOutcome::Gone(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.outcome, StoreOutcome::NotFound(_))
    }

    pub fn is_invalid_partition(&self) -> bool {
        matches!(self.outcome, StoreOutcome::InvalidPartition(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.outcome, StoreOutcome::Timeout(_))
    }

    /// 410 with sub-status "name cache is stale".
    pub fn is_name_cache_stale(&self) -> bool {
        self.status_code() == status_codes::GONE
            && self.sub_status_code() == sub_status_codes::NAME_CACHE_IS_STALE
    }

    /// 404 with sub-status "read session not available".
    pub fn is_read_session_not_available(&self) -> bool {
        self.status_code() == status_codes::NOT_FOUND
            && self.sub_status_code() == sub_status_codes::READ_SESSION_NOT_AVAILABLE
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    /// The replica reported an LSN this result can be ordered by.
    pub fn has_valid_lsn(&self) -> bool {
        self.lsn >= 0
    }

    pub fn status_code(&self) -> u32 {
        match &self.outcome {
            StoreOutcome::Success(response) => response.status_code,
            _ => self.outcome.error().map(|e| e.status_code).unwrap_or(0),
        }
    }

    pub fn sub_status_code(&self) -> u32 {
        match &self.outcome {
            StoreOutcome::Success(response) => response.sub_status_code,
            _ => self.outcome.error().map(|e| e.sub_status_code).unwrap_or(0),
        }
    }

    pub fn lsn(&self) -> i64 {
        self.lsn
    }

    pub fn quorum_acked_lsn(&self) -> i64 {
        self.quorum_acked_lsn
    }

    pub fn global_committed_lsn(&self) -> i64 {
        self.global_committed_lsn
    }

    pub fn item_lsn(&self) -> i64 {
        self.item_lsn
    }

    pub fn number_of_read_regions(&self) -> u32 {
        self.number_of_read_regions
    }

    pub fn current_replica_set_size(&self) -> u32 {
        self.current_replica_set_size
    }

    pub fn current_write_quorum(&self) -> u32 {
        self.current_write_quorum
    }

    pub fn session_token(&self) -> Option<&SessionToken> {
        self.session_token.as_ref()
    }

    pub fn request_charge(&self) -> f64 {
        self.request_charge
    }

    pub fn partition_key_range_id(&self) -> Option<&str> {
        self.partition_key_range_id.as_deref()
    }

    pub fn store_physical_address(&self) -> &str {
        &self.store_physical_address
    }

    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            status_code: Some(self.status_code()),
            sub_status_code: Some(self.sub_status_code()),
            address: Some(self.store_physical_address.clone()),
            partition_key_range_id: self.partition_key_range_id.clone(),
            lsn: Some(self.lsn),
            quorum_acked_lsn: Some(self.quorum_acked_lsn),
            global_committed_lsn: Some(self.global_committed_lsn),
            request_charge: Some(self.request_charge),
            message: self.outcome.error().map(|e| e.message.clone()),
        }
    }

    /// The error this result stands for.
    pub fn to_error(&self) -> RntbdError {
        let diagnostics = self.diagnostics();
        match &self.outcome {
            StoreOutcome::NotFound(_) => RntbdError::NotFound(diagnostics),
            StoreOutcome::Gone(_) => RntbdError::Gone(diagnostics),
            StoreOutcome::InvalidPartition(_) => RntbdError::InvalidPartition(diagnostics),
            StoreOutcome::Timeout(e) => RntbdError::Timeout {
                timeout_ms: e.timeout_ms.unwrap_or(0),
                diagnostics,
            },
            StoreOutcome::Other(_) => RntbdError::Status(diagnostics),
            StoreOutcome::Success(_) => {
                RntbdError::Status(diagnostics.with_message("response carried no valid LSN"))
            }
        }
    }

    /// Converts into the caller-facing response.
    ///
    /// Invalid results yield their error. With a tracker, the total charge
    /// replaces the replica's own charge on the response, or on the error
    /// diagnostics for valid error answers.
    pub fn into_response(self, tracker: Option<&RequestChargeTracker>) -> Result<StoreResponse, RntbdError> {
        if !self.is_valid {
            return Err(self.to_error());
        }

        let error = match self.outcome {
            StoreOutcome::Success(mut response) => {
                if let Some(tracker) = tracker {
                    response.set_request_charge(tracker.total());
                }
                return Ok(response);
            }
            _ => self.to_error(),
        };

        match (error, tracker) {
            (RntbdError::NotFound(mut d), Some(t)) => {
                d.request_charge = Some(t.total());
                Err(RntbdError::NotFound(d))
            }
            (RntbdError::Status(mut d), Some(t)) => {
                d.request_charge = Some(t.total());
                Err(RntbdError::Status(d))
            }
            (error, _) => Err(error),
        }
    }
}

impl fmt::Display for StoreResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "storePhysicalAddress: {}, lsn: {}, globalCommittedLsn: {}, partitionKeyRangeId: {}, \
             isValid: {}, statusCode: {}, subStatusCode: {}, isGone: {}, isNotFound: {}, \
             isInvalidPartition: {}, requestCharge: {}, itemLSN: {}, sessionToken: {}, exception: {}",
            self.store_physical_address,
            self.lsn,
            self.global_committed_lsn,
            self.partition_key_range_id.as_deref().unwrap_or("null"),
            self.is_valid,
            self.status_code(),
            self.sub_status_code(),
            self.is_gone(),
            self.is_not_found(),
            self.is_invalid_partition(),
            self.request_charge,
            self.item_lsn,
            self.session_token
                .as_ref()
                .map(|t| t.to_string())
                .unwrap_or_else(|| "null".to_string()),
            self.outcome.error().map(|e| e.message.as_str()).unwrap_or("null"),
        )
    }
}
