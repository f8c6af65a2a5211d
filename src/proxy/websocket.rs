//! WebSocket frame parsing and interception
//!
//! Frames are parsed according to RFC 6455 from a copy of the bytes already
//! forwarded, so parsing never delays or alters the stream itself.

use crate::api::events::{EventDispatcher, ProxyEvent};
use crate::models::{FrameOpcode, MessageDirection, WsMessage, WsMessageType};
use crate::proxy::shaping::TokenBucket;
use std::fmt::Write as _;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Declared payloads above this reset the parser.
pub const MAX_FRAME_PAYLOAD: u64 = 16 * 1024 * 1024;

const TEXT_PREVIEW_BYTES: usize = 8 * 1024;
const HEX_PREVIEW_BYTES: usize = 200;
const READ_BUF_SIZE: usize = 64 * 1024;

/// Parsed WebSocket frame header
#[derive(Debug, Clone)]
pub struct FrameHeader {
    pub fin: bool,
    /// Raw opcode nibble, reserved values included
    pub opcode: u8,
    pub payload_len: u64,
    pub mask_key: Option<[u8; 4]>,
    pub header_len: usize,
}

/// Parse a frame header, or `None` until enough bytes are buffered.
pub fn parse_frame_header(data: &[u8]) -> Option<FrameHeader> {
    if data.len() < 2 {
        return None;
    }

    let fin = (data[0] & 0x80) != 0;
    let opcode = data[0] & 0x0F;
    let masked = (data[1] & 0x80) != 0;
    let mut payload_len = (data[1] & 0x7F) as u64;
    let mut offset = 2;

    if payload_len == 126 {
        let ext = data.get(offset..offset + 2)?;
        payload_len = u16::from_be_bytes([ext[0], ext[1]]) as u64;
        offset += 2;
    } else if payload_len == 127 {
        let ext: [u8; 8] = data.get(offset..offset + 8)?.try_into().ok()?;
        payload_len = u64::from_be_bytes(ext);
        offset += 8;
    }

    let mask_key = if masked {
        let key: [u8; 4] = data.get(offset..offset + 4)?.try_into().ok()?;
        offset += 4;
        Some(key)
    } else {
        None
    };

    Some(FrameHeader {
        fin,
        opcode,
        payload_len,
        mask_key,
        header_len: offset,
    })
}

/// Unmask payload data in place
pub fn unmask_payload(data: &mut [u8], mask_key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask_key[i % 4];
    }
}

/// A complete logical message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    pub message_type: WsMessageType,
    pub payload: Vec<u8>,
}

/// Incremental parser for one direction of a connection.
#[derive(Default)]
pub struct FrameParser {
    buf: Vec<u8>,
    /// Initiating type and payload so far of a fragmented message
    fragment: Option<(WsMessageType, Vec<u8>)>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently waiting for the rest of a frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Feed bytes in wire order and collect every message they complete.
    pub fn push(&mut self, data: &[u8]) -> Vec<ParsedMessage> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();

        while let Some(header) = parse_frame_header(&self.buf) {
            if header.payload_len > MAX_FRAME_PAYLOAD {
                tracing::warn!(
                    "WebSocket frame declares {} bytes, resetting parser",
                    header.payload_len
                );
                self.buf.clear();
                self.fragment = None;
                break;
            }

            let total = header.header_len + header.payload_len as usize;
            if self.buf.len() < total {
                break;
            }

            let mut payload = self.buf[header.header_len..total].to_vec();
            self.buf.drain(..total);
            if let Some(key) = header.mask_key {
                unmask_payload(&mut payload, key);
            }

            if let Some(message) = self.on_frame(&header, payload) {
                out.push(message);
            }
        }

        out
    }

    fn on_frame(&mut self, header: &FrameHeader, payload: Vec<u8>) -> Option<ParsedMessage> {
        let Some(opcode) = FrameOpcode::from_u8(header.opcode) else {
            tracing::debug!("Skipping WebSocket frame with reserved opcode {:#x}", header.opcode);
            return None;
        };

        match opcode {
            FrameOpcode::Continuation => {
                let Some((message_type, mut assembled)) = self.fragment.take() else {
                    tracing::debug!("Dropping orphan WebSocket continuation frame");
                    return None;
                };
                if assembled.len() as u64 + payload.len() as u64 > MAX_FRAME_PAYLOAD {
                    tracing::warn!("Fragmented WebSocket message exceeds limit, dropping");
                    return None;
                }
                assembled.extend_from_slice(&payload);
                if header.fin {
                    Some(ParsedMessage {
                        message_type,
                        payload: assembled,
                    })
                } else {
                    self.fragment = Some((message_type, assembled));
                    None
                }
            }
            // Control frames interleave with fragments and never join them.
            op if op.is_control() || header.fin => Some(ParsedMessage {
                message_type: op.message_type()?,
                payload,
            }),
            op => {
                self.fragment = Some((op.message_type()?, payload));
                None
            }
        }
    }
}

/// Display preview for a message payload.
pub fn preview(message_type: WsMessageType, payload: &[u8]) -> String {
    match message_type {
        WsMessageType::Binary => {
            if payload.len() <= HEX_PREVIEW_BYTES {
                let mut hex = String::with_capacity(payload.len() * 2);
                for byte in payload {
                    let _ = write!(hex, "{byte:02x}");
                }
                hex
            } else {
                format!("[Binary data: {} bytes]", payload.len())
            }
        }
        WsMessageType::Close if payload.len() >= 2 => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            let reason = String::from_utf8_lossy(&payload[2..]);
            if reason.is_empty() {
                code.to_string()
            } else {
                format!("{code} {reason}")
            }
        }
        _ => {
            let end = payload.len().min(TEXT_PREVIEW_BYTES);
            String::from_utf8_lossy(&payload[..end]).into_owned()
        }
    }
}

/// Identity of an upgraded connection.
#[derive(Clone)]
pub struct WsSession {
    /// Id of the upgrade exchange
    pub connection_id: String,
    /// ws:// or wss:// URL
    pub url: String,
    pub events: EventDispatcher,
}

impl WsSession {
    fn publish(&self, direction: MessageDirection, message: ParsedMessage) {
        let length = message.payload.len() as u64;
        let text = preview(message.message_type, &message.payload);
        let raw = (message.message_type == WsMessageType::Binary).then_some(message.payload);
        self.events.publish(ProxyEvent::WebSocket(WsMessage::new(
            self.connection_id.clone(),
            direction,
            message.message_type,
            text,
            raw,
            length,
            self.url.clone(),
        )));
    }
}

/// Relay one direction: forward first, then parse the copy.
async fn relay_direction<R, W>(
    mut reader: R,
    mut writer: W,
    prefix: Vec<u8>,
    bucket: &TokenBucket,
    session: WsSession,
    direction: MessageDirection,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut parser = FrameParser::new();

    if !prefix.is_empty() {
        bucket.acquire(prefix.len()).await;
        writer.write_all(&prefix).await?;
        writer.flush().await?;
        for message in parser.push(&prefix) {
            session.publish(direction, message);
        }
    }

    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        bucket.acquire(n).await;
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        for message in parser.push(&buf[..n]) {
            session.publish(direction, message);
        }
    }

    if parser.buffered() > 0 {
        tracing::debug!(
            "WebSocket {} closed with {} unparsed bytes ({:?})",
            session.connection_id,
            parser.buffered(),
            direction
        );
    }
    let _ = writer.shutdown().await;
    Ok(())
}

/// Relay an upgraded connection in both directions until either side ends.
///
/// `client_prefix` and `upstream_prefix` are bytes already read past the
/// upgrade handshake on each side.
pub async fn websocket_tunnel<C, U>(
    client: C,
    client_prefix: Vec<u8>,
    upstream: U,
    upstream_prefix: Vec<u8>,
    upload: &TokenBucket,
    download: &TokenBucket,
    session: WsSession,
) -> anyhow::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    U: AsyncRead + AsyncWrite + Unpin + Send,
{
    let connection_id = session.connection_id.clone();
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let outbound = relay_direction(
        client_read,
        upstream_write,
        client_prefix,
        upload,
        session.clone(),
        MessageDirection::ClientToServer,
    );
    let inbound = relay_direction(
        upstream_read,
        client_write,
        upstream_prefix,
        download,
        session,
        MessageDirection::ServerToClient,
    );

    tokio::select! {
        result = outbound => {
            if let Err(e) = result {
                tracing::debug!("WebSocket: client to upstream error: {}", e);
            }
        }
        result = inbound => {
            if let Err(e) = result {
                tracing::debug!("WebSocket: upstream to client error: {}", e);
            }
        }
    }

    tracing::info!("WebSocket connection closed: {}", connection_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn frame(fin: bool, opcode: u8, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
        let mut out = vec![(if fin { 0x80 } else { 0 }) | opcode];
        let mask_bit = if mask.is_some() { 0x80 } else { 0 };
        match payload.len() {
            len if len < 126 => out.push(mask_bit | len as u8),
            len if len <= u16::MAX as usize => {
                out.push(mask_bit | 126);
                out.extend_from_slice(&(len as u16).to_be_bytes());
            }
            len => {
                out.push(mask_bit | 127);
                out.extend_from_slice(&(len as u64).to_be_bytes());
            }
        }
        let mut body = payload.to_vec();
        if let Some(key) = mask {
            out.extend_from_slice(&key);
            unmask_payload(&mut body, key);
        }
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn masked_text_frame_survives_any_chunking() {
        let wire = frame(true, 0x1, b"hello world", Some([0x11, 0x22, 0x33, 0x44]));

        for chunk_size in 1..=wire.len() {
            let mut parser = FrameParser::new();
            let mut messages = Vec::new();
            for chunk in wire.chunks(chunk_size) {
                messages.extend(parser.push(chunk));
            }
            assert_eq!(
                messages,
                vec![ParsedMessage {
                    message_type: WsMessageType::Text,
                    payload: b"hello world".to_vec(),
                }],
                "chunk size {chunk_size}"
            );
            assert_eq!(parser.buffered(), 0);
        }
    }

    #[test]
    fn fragments_assemble_under_initiating_type() {
        let mut parser = FrameParser::new();
        let mut wire = frame(false, 0x1, b"hello ", None);
        wire.extend(frame(true, 0x0, b"world", None));

        let messages = parser.push(&wire);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_type, WsMessageType::Text);
        assert_eq!(messages[0].payload, b"hello world");
    }

    #[test]
    fn control_frame_is_emitted_mid_fragment() {
        let mut parser = FrameParser::new();
        let mut wire = frame(false, 0x2, &[1, 2], None);
        wire.extend(frame(true, 0x9, b"ping", None));
        wire.extend(frame(true, 0x0, &[3], None));

        let messages = parser.push(&wire);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].message_type, WsMessageType::Ping);
        assert_eq!(messages[1].message_type, WsMessageType::Binary);
        assert_eq!(messages[1].payload, vec![1, 2, 3]);
    }

    #[test]
    fn extended_lengths_are_decoded() {
        let medium = vec![b'm'; 300];
        let large = vec![b'l'; 70_000];
        let mut parser = FrameParser::new();
        let mut wire = frame(true, 0x1, &medium, None);
        wire.extend(frame(true, 0x2, &large, Some([9, 8, 7, 6])));

        let messages = parser.push(&wire);
        assert_eq!(messages[0].payload.len(), 300);
        assert_eq!(messages[1].payload, large);
    }

    #[test]
    fn oversized_declaration_resets_buffer() {
        let mut parser = FrameParser::new();
        let mut header = vec![0x82, 127];
        header.extend_from_slice(&(MAX_FRAME_PAYLOAD + 1).to_be_bytes());
        assert!(parser.push(&header).is_empty());
        assert_eq!(parser.buffered(), 0);

        let messages = parser.push(&frame(true, 0x1, b"after", None));
        assert_eq!(messages[0].payload, b"after");
    }

    #[test]
    fn orphan_continuation_and_reserved_opcodes_are_skipped() {
        let mut parser = FrameParser::new();
        let mut wire = frame(true, 0x0, b"orphan", None);
        wire.extend(frame(true, 0x3, b"reserved", None));
        wire.extend(frame(true, 0x1, b"kept", None));

        let messages = parser.push(&wire);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, b"kept");
    }

    #[test]
    fn previews_follow_message_type() {
        assert_eq!(preview(WsMessageType::Binary, &[0xde, 0xad]), "dead");
        assert_eq!(
            preview(WsMessageType::Binary, &[0u8; 201]),
            "[Binary data: 201 bytes]"
        );
        assert_eq!(preview(WsMessageType::Text, &vec![b'a'; 10_000]).len(), 8 * 1024);
        let mut close = 1000u16.to_be_bytes().to_vec();
        close.extend_from_slice(b"bye");
        assert_eq!(preview(WsMessageType::Close, &close), "1000 bye");
    }

    #[tokio::test]
    async fn tunnel_forwards_bytes_and_publishes_messages() {
        let (events, mut rx) = EventDispatcher::channel();
        let session = WsSession {
            connection_id: "conn-1".into(),
            url: "ws://example.com/socket".into(),
            events,
        };

        let (proxy_client, mut client) = duplex(4096);
        let (proxy_upstream, mut upstream) = duplex(4096);
        let early = frame(true, 0x1, b"early", Some([1, 2, 3, 4]));
        let tunnel = tokio::spawn({
            let early = early.clone();
            async move {
                let unlimited = TokenBucket::new(0);
                websocket_tunnel(
                    proxy_client,
                    early,
                    proxy_upstream,
                    Vec::new(),
                    &unlimited,
                    &unlimited,
                    session,
                )
                .await
            }
        });

        let mut received = vec![0u8; early.len()];
        upstream.read_exact(&mut received).await.unwrap();
        assert_eq!(received, early);

        let reply = frame(true, 0x2, &[0xca, 0xfe], None);
        upstream.write_all(&reply).await.unwrap();
        let mut echoed = vec![0u8; reply.len()];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, reply);

        let first = match rx.recv().await.unwrap() {
            ProxyEvent::WebSocket(msg) => msg,
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!(first.direction, MessageDirection::ClientToServer);
        assert_eq!(first.payload, "early");
        assert_eq!(first.url, "ws://example.com/socket");

        let second = match rx.recv().await.unwrap() {
            ProxyEvent::WebSocket(msg) => msg,
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!(second.direction, MessageDirection::ServerToClient);
        assert_eq!(second.raw, Some(vec![0xca, 0xfe]));
        assert_eq!(second.payload, "cafe");

        drop(client);
        tunnel.await.unwrap().unwrap();
    }
}
