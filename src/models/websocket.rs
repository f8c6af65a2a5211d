//! WebSocket message models
//!
//! Represents logical WebSocket messages reassembled by the proxy.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Raw RFC6455 frame opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOpcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl FrameOpcode {
    /// Parse from raw opcode nibble; reserved opcodes yield `None`
    pub fn from_u8(opcode: u8) -> Option<Self> {
        match opcode & 0x0F {
            0x0 => Some(FrameOpcode::Continuation),
            0x1 => Some(FrameOpcode::Text),
            0x2 => Some(FrameOpcode::Binary),
            0x8 => Some(FrameOpcode::Close),
            0x9 => Some(FrameOpcode::Ping),
            0xA => Some(FrameOpcode::Pong),
            _ => None,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(
            self,
            FrameOpcode::Close | FrameOpcode::Ping | FrameOpcode::Pong
        )
    }

    /// Externally visible message type. Continuations have none.
    pub fn message_type(&self) -> Option<WsMessageType> {
        match self {
            FrameOpcode::Continuation => None,
            FrameOpcode::Text => Some(WsMessageType::Text),
            FrameOpcode::Binary => Some(WsMessageType::Binary),
            FrameOpcode::Close => Some(WsMessageType::Close),
            FrameOpcode::Ping => Some(WsMessageType::Ping),
            FrameOpcode::Pong => Some(WsMessageType::Pong),
        }
    }
}

/// Type of a reassembled message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WsMessageType {
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl WsMessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WsMessageType::Text => "text",
            WsMessageType::Binary => "binary",
            WsMessageType::Close => "close",
            WsMessageType::Ping => "ping",
            WsMessageType::Pong => "pong",
        }
    }

    pub fn opcode(&self) -> u8 {
        match self {
            WsMessageType::Text => 0x1,
            WsMessageType::Binary => 0x2,
            WsMessageType::Close => 0x8,
            WsMessageType::Ping => 0x9,
            WsMessageType::Pong => 0xA,
        }
    }
}

/// Direction of a WebSocket message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    /// Client to server
    ClientToServer,
    /// Server to client
    ServerToClient,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageDirection::ClientToServer => "client_to_server",
            MessageDirection::ServerToClient => "server_to_client",
        }
    }
}

/// A single logical WebSocket message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsMessage {
    /// ID of the HTTP exchange that performed the upgrade
    pub connection_id: String,

    pub direction: MessageDirection,

    /// Raw opcode of the initiating frame
    pub opcode: u8,

    #[serde(rename = "type")]
    pub message_type: WsMessageType,

    /// Human readable preview (text truncated, binary as hex or size)
    pub payload: String,

    /// Untruncated payload, only for binary messages
    pub raw: Option<Vec<u8>>,

    /// Payload length in bytes
    pub payload_length: u64,

    /// ws:// or wss:// URL from the upgrade request
    pub url: String,

    /// Capture time in milliseconds since epoch
    pub timestamp: i64,
}

impl WsMessage {
    pub fn new(
        connection_id: String,
        direction: MessageDirection,
        message_type: WsMessageType,
        payload: String,
        raw: Option<Vec<u8>>,
        payload_length: u64,
        url: String,
    ) -> Self {
        Self {
            connection_id,
            direction,
            opcode: message_type.opcode(),
            message_type,
            payload,
            raw,
            payload_length,
            url,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Get payload size as formatted string
    pub fn size_str(&self) -> String {
        let size = self.payload_length;
        if size < 1024 {
            format!("{}B", size)
        } else if size < 1024 * 1024 {
            format!("{:.1}KB", size as f64 / 1024.0)
        } else {
            format!("{:.1}MB", size as f64 / (1024.0 * 1024.0))
        }
    }
}
