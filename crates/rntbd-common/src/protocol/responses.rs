//! Successful store responses as handed back to callers.

use bytes::Bytes;

use super::session::SessionToken;
use super::types::REQUEST_CHARGE_HEADER;

/// The body and headers of a successful replica response.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreResponse {
    pub status_code: u32,
    pub sub_status_code: u32,
    pub headers: Vec<(String, String)>,
    pub session_token: Option<SessionToken>,
    pub request_charge: f64,
    pub lsn: i64,
    pub payload: Bytes,
}

impl StoreResponse {
    pub fn new(status_code: u32, payload: Bytes) -> Self {
        StoreResponse {
            status_code,
            sub_status_code: 0,
            headers: Vec::new(),
            session_token: None,
            request_charge: 0.0,
            lsn: -1,
            payload,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code) || self.status_code == 304
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replaces an existing header (matched case-insensitively) or appends it.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(slot) => slot.1 = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }

    /// Overwrites the reported charge, header included.
    pub fn set_request_charge(&mut self, charge: f64) {
        self.request_charge = charge;
        self.set_header(REQUEST_CHARGE_HEADER, charge.to_string());
    }
}
