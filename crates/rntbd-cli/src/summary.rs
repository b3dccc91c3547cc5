use rntbd_common::protocol::error::RntbdError;
use rntbd_common::StoreResponse;
use serde::Serialize;

/// JSON line printed by `rntbd read`.
#[derive(Debug, Serialize)]
pub struct ReadSummary {
    pub status_code: u32,
    pub sub_status_code: u32,
    pub lsn: i64,
    pub request_charge: f64,
    pub session_token: Option<String>,
    pub payload: String,
}

impl From<&StoreResponse> for ReadSummary {
    fn from(response: &StoreResponse) -> Self {
        Self {
            status_code: response.status_code,
            sub_status_code: response.sub_status_code,
            lsn: response.lsn,
            request_charge: response.request_charge,
            session_token: response.session_token.as_ref().map(ToString::to_string),
            payload: String::from_utf8_lossy(&response.payload).into_owned(),
        }
    }
}

/// JSON line printed when the read fails with a replica-level error.
#[derive(Debug, Serialize)]
pub struct ErrorSummary {
    pub error: String,
    pub status_code: Option<u32>,
    pub sub_status_code: Option<u32>,
    pub address: Option<String>,
    pub request_charge: Option<f64>,
}

impl From<&RntbdError> for ErrorSummary {
    fn from(error: &RntbdError) -> Self {
        let diagnostics = error.diagnostics();
        Self {
            error: error.to_string(),
            status_code: diagnostics.and_then(|d| d.status_code),
            sub_status_code: diagnostics.and_then(|d| d.sub_status_code),
            address: diagnostics.and_then(|d| d.address.clone()),
            request_charge: diagnostics.and_then(|d| d.request_charge),
        }
    }
}
