//! Captured request record
//!
//! Represents a single HTTP request/response exchange as seen by the proxy.
//! Records are built incrementally while bytes stream through the engine and
//! are handed to the event sink as owned copies.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A captured HTTP exchange.
///
/// Every exchange produces zero or more partial updates (`partial_update ==
/// true`) followed by exactly one terminal record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    /// Unique identifier for this exchange
    pub id: String,

    /// When the request was first seen (milliseconds since epoch)
    pub started_at: i64,
    /// When the exchange finished (terminal records only)
    pub finished_at: Option<i64>,

    /// HTTP method as sent by the client
    pub method: String,
    /// Full request URL as requested by the client
    pub url: String,
    /// URL actually dialed when a map-remote rule applied
    pub mapped_url: Option<String>,
    /// Whether the exchange was decrypted from a TLS tunnel
    pub is_https: bool,

    // Request data
    pub request_headers: HashMap<String, String>,
    /// Display text of the request body (decompressed, placeholder for binary)
    pub request_body: String,
    /// Raw (decompressed) request bytes, only kept for binary bodies
    pub request_body_raw: Option<Vec<u8>>,

    // Response data
    /// HTTP status code (0 until a response head is known)
    pub status_code: u16,
    pub response_headers: HashMap<String, String>,
    /// Display text of the response body
    pub response_body: String,
    /// Raw (decompressed) response bytes, only kept for binary bodies
    pub response_body_raw: Option<Vec<u8>>,
    /// Response body bytes seen on the wire so far
    pub content_length: u64,

    /// Whether the response came from a mock rule
    pub mocked: bool,
    /// Whether this is a progress update rather than the terminal record
    pub partial_update: bool,
    /// Failure description for exchanges that did not complete normally
    pub error: Option<String>,
}

impl RequestRecord {
    /// Create a new record for an incoming request
    pub fn new(
        id: String,
        method: &str,
        url: &str,
        is_https: bool,
        headers: HashMap<String, String>,
    ) -> Self {
        Self {
            id,
            started_at: Utc::now().timestamp_millis(),
            finished_at: None,
            method: method.to_string(),
            url: url.to_string(),
            mapped_url: None,
            is_https,
            request_headers: headers,
            request_body: String::new(),
            request_body_raw: None,
            status_code: 0,
            response_headers: HashMap::new(),
            response_body: String::new(),
            response_body_raw: None,
            content_length: 0,
            mocked: false,
            partial_update: true,
            error: None,
        }
    }

    /// Snapshot of this record flagged as a progress update.
    pub fn partial(&self) -> Self {
        let mut copy = self.clone();
        copy.partial_update = true;
        copy.finished_at = None;
        copy
    }

    /// Turn this record into the terminal record for its exchange.
    pub fn into_terminal(mut self) -> Self {
        self.partial_update = false;
        self.finished_at = Some(Utc::now().timestamp_millis());
        self
    }

    /// Elapsed time between start and finish, if finished
    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at.map(|end| end - self.started_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_record_clears_partial_flag() {
        let record = RequestRecord::new(
            "abc".into(),
            "GET",
            "http://example.com/",
            false,
            HashMap::new(),
        );
        assert!(record.partial_update);
        assert!(record.partial().partial_update);

        let terminal = record.into_terminal();
        assert!(!terminal.partial_update);
        assert!(terminal.duration_ms().is_some());
    }
}
