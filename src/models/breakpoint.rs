//! Models related to breakpoints and exchange editing.

use crate::models::rules::ExchangePhase;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

/// A body snapshot safe to serialize: text when printable, base64 otherwise.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BodySnapshot {
    pub text: Option<String>,
    pub base64: Option<String>,
    pub length: usize,
}

impl BodySnapshot {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let probe = &bytes[..bytes.len().min(512)];
        let text = if probe.contains(&0) {
            None
        } else {
            std::str::from_utf8(bytes).ok().map(str::to_string)
        };
        let base64 = if text.is_none() && !bytes.is_empty() {
            Some(general_purpose::STANDARD.encode(bytes))
        } else {
            None
        };
        Self {
            text,
            base64,
            length: bytes.len(),
        }
    }
}

/// Serializable view of an exchange paused at a breakpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingBreakpoint {
    /// Breakpoint id used to resolve it
    pub id: String,
    pub rule_id: String,
    /// Id of the captured exchange
    pub request_id: String,
    pub phase: ExchangePhase,
    pub method: String,
    pub url: String,
    pub request_headers: Vec<(String, String)>,
    pub request_body: BodySnapshot,
    /// Present for response-phase breakpoints
    pub status_code: Option<u16>,
    pub response_headers: Option<Vec<(String, String)>>,
    pub response_body: Option<BodySnapshot>,
    /// Milliseconds since epoch when the exchange was paused
    pub created_at: i64,
}

/// Edits applied when forwarding a paused exchange.
///
/// Request fields are honored at request-phase breakpoints, response fields at
/// response-phase breakpoints.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExchangeEdit {
    pub method: Option<String>,
    pub url: Option<String>,
    pub request_headers: Option<Vec<(String, String)>>,
    pub request_body: Option<Vec<u8>>,
    pub status_code: Option<u16>,
    pub response_headers: Option<Vec<(String, String)>>,
    pub response_body: Option<Vec<u8>>,
}

impl ExchangeEdit {
    pub fn is_empty(&self) -> bool {
        self.method.is_none()
            && self.url.is_none()
            && self.request_headers.is_none()
            && self.request_body.is_none()
            && self.status_code.is_none()
            && self.response_headers.is_none()
            && self.response_body.is_none()
    }
}

/// Outcome chosen for a paused exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BreakpointResolution {
    Forward {
        #[serde(default)]
        edit: Option<ExchangeEdit>,
    },
    Drop,
}

impl BreakpointResolution {
    pub fn forward() -> Self {
        BreakpointResolution::Forward { edit: None }
    }

    pub fn forward_with(edit: ExchangeEdit) -> Self {
        BreakpointResolution::Forward { edit: Some(edit) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_encodes_binary_as_base64() {
        let snapshot = BodySnapshot::from_bytes(&[0x00, 0xff, 0x10]);
        assert!(snapshot.text.is_none());
        assert_eq!(snapshot.base64.as_deref(), Some("AP8Q"));
        assert_eq!(snapshot.length, 3);

        let text = BodySnapshot::from_bytes(b"hello");
        assert_eq!(text.text.as_deref(), Some("hello"));
        assert!(text.base64.is_none());
    }

    #[test]
    fn resolution_round_trips_through_json() {
        let json = r#"{"action":"forward","edit":{"status_code":201}}"#;
        let resolution: BreakpointResolution = serde_json::from_str(json).unwrap();
        match resolution {
            BreakpointResolution::Forward { edit: Some(edit) } => {
                assert_eq!(edit.status_code, Some(201));
                assert!(!edit.is_empty());
            }
            other => panic!("unexpected resolution {other:?}"),
        }
    }
}
