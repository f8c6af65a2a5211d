//! HTTP/1.1 wire handling: message heads, body framing and forwarding.

use crate::proxy::shaping::TokenBucket;
use anyhow::{anyhow, Context};
use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_HEADER_COUNT: usize = 128;
const READ_CHUNK: usize = 16 * 1024;

pub type HeaderList = Vec<(String, String)>;

#[derive(Debug, Error)]
#[error("body exceeds configured limit of {limit} bytes")]
pub struct BodyTooLarge {
    pub limit: usize,
}

pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Replace the first header called `name`, or append it.
pub fn set_header(headers: &mut HeaderList, name: &str, value: String) {
    match headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
        Some((_, v)) => *v = value,
        None => headers.push((name.to_string(), value)),
    }
}

pub fn remove_header(headers: &mut HeaderList, name: &str) {
    headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
}

/// A stream plus the bytes read from it but not yet consumed.
pub struct WireReader<S> {
    inner: S,
    buf: BytesMut,
}

impl<S> WireReader<S>
where
    S: AsyncRead + Unpin,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Bytes read ahead of what has been consumed so far.
    pub fn take_buffered(&mut self) -> Vec<u8> {
        self.buf.split().to_vec()
    }

    /// Give back the stream and whatever was read ahead.
    pub fn into_parts(self) -> (S, Vec<u8>) {
        (self.inner, self.buf.to_vec())
    }

    async fn fill(&mut self) -> std::io::Result<usize> {
        self.buf.reserve(READ_CHUNK);
        self.inner.read_buf(&mut self.buf).await
    }

    /// Read one message head including the blank line.
    /// `None` means the peer closed before sending anything.
    pub async fn read_head(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
        loop {
            if let Some(end) = find_header_end(&self.buf) {
                return Ok(Some(self.buf.split_to(end).to_vec()));
            }
            if self.buf.len() > MAX_HEADER_BYTES {
                return Err(anyhow!("HTTP headers exceed allowed size"));
            }
            if self.fill().await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(anyhow!("connection closed before headers completed"));
            }
        }
    }

    async fn read_line(&mut self) -> anyhow::Result<Vec<u8>> {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                return Ok(self.buf.split_to(pos + 2).to_vec());
            }
            if self.buf.len() > MAX_HEADER_BYTES {
                return Err(anyhow!("chunk header line too long"));
            }
            if self.fill().await? == 0 {
                return Err(anyhow!("connection closed while reading chunked body"));
            }
        }
    }

    /// Up to `max` bytes; empty at EOF.
    pub async fn read_some(&mut self, max: usize) -> std::io::Result<Vec<u8>> {
        if self.buf.is_empty() && self.fill().await? == 0 {
            return Ok(Vec::new());
        }
        let take = max.min(self.buf.len());
        let out = self.buf[..take].to_vec();
        self.buf.advance(take);
        Ok(out)
    }

    async fn read_exact_vec(&mut self, len: usize) -> anyhow::Result<Vec<u8>> {
        while self.buf.len() < len {
            if self.fill().await? == 0 {
                return Err(anyhow!("connection closed while reading body"));
            }
        }
        Ok(self.buf.split_to(len).to_vec())
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn headers_from_httparse(headers: &[httparse::Header]) -> HeaderList {
    headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).to_string(),
            )
        })
        .collect()
}

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

fn declared_framing(headers: &[(String, String)]) -> anyhow::Result<Option<BodyFraming>> {
    let chunked = header_value(headers, "transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);
    if chunked {
        return Ok(Some(BodyFraming::Chunked));
    }
    match header_value(headers, "content-length") {
        Some(raw) => {
            let len = raw
                .trim()
                .parse::<u64>()
                .with_context(|| format!("invalid Content-Length {raw:?}"))?;
            Ok(Some(BodyFraming::Length(len)))
        }
        None => Ok(None),
    }
}

fn wants_keep_alive(minor_version: u8, headers: &[(String, String)]) -> bool {
    match header_value(headers, "connection") {
        Some(v) if v.to_ascii_lowercase().contains("close") => false,
        Some(v) if v.to_ascii_lowercase().contains("keep-alive") => true,
        _ => minor_version >= 1,
    }
}

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    /// Request target exactly as sent (absolute-form, origin-form or authority)
    pub target: String,
    pub minor_version: u8,
    pub headers: HeaderList,
}

impl RequestHead {
    pub fn parse(raw: &[u8]) -> anyhow::Result<Self> {
        let mut storage = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
        let mut req = httparse::Request::new(&mut storage);
        if req.parse(raw)?.is_partial() {
            return Err(anyhow!("partial HTTP request"));
        }
        Ok(Self {
            method: req.method.unwrap_or("GET").to_string(),
            target: req.path.unwrap_or("/").to_string(),
            minor_version: req.version.unwrap_or(1),
            headers: headers_from_httparse(req.headers),
        })
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    pub fn framing(&self) -> anyhow::Result<BodyFraming> {
        Ok(declared_framing(&self.headers)?.unwrap_or(BodyFraming::Empty))
    }

    pub fn keep_alive(&self) -> bool {
        wants_keep_alive(self.minor_version, &self.headers)
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        header_value(&self.headers, "upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
            && header_value(&self.headers, "connection")
                .map(|v| v.to_ascii_lowercase().contains("upgrade"))
                .unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub minor_version: u8,
    pub status: u16,
    pub reason: String,
    pub headers: HeaderList,
}

impl ResponseHead {
    pub fn parse(raw: &[u8]) -> anyhow::Result<Self> {
        let mut storage = [httparse::EMPTY_HEADER; MAX_HEADER_COUNT];
        let mut res = httparse::Response::new(&mut storage);
        if res.parse(raw)?.is_partial() {
            return Err(anyhow!("partial HTTP response"));
        }
        Ok(Self {
            minor_version: res.version.unwrap_or(1),
            status: res.code.unwrap_or(502),
            reason: res.reason.unwrap_or("").to_string(),
            headers: headers_from_httparse(res.headers),
        })
    }

    pub fn framing(&self, request_method: &str) -> anyhow::Result<BodyFraming> {
        if request_method.eq_ignore_ascii_case("HEAD")
            || (100..200).contains(&self.status)
            || self.status == 204
            || self.status == 304
        {
            return Ok(BodyFraming::Empty);
        }
        Ok(declared_framing(&self.headers)?.unwrap_or(BodyFraming::UntilClose))
    }

    pub fn keep_alive(&self) -> bool {
        wants_keep_alive(self.minor_version, &self.headers)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// Where a request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Origin-form path with query
    pub path: String,
}

impl Target {
    pub fn url(&self) -> String {
        format!("{}://{}{}", self.scheme.as_str(), self.authority(), self.path)
    }

    pub fn ws_url(&self) -> String {
        let scheme = match self.scheme {
            Scheme::Http => "ws",
            Scheme::Https => "wss",
        };
        format!("{}://{}{}", scheme, self.authority(), self.path)
    }

    /// `host[:port]`, port omitted when it is the scheme default
    pub fn authority(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// `host:port` for dialing
    pub fn dial_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Host without IPv6 brackets, for TLS server names
    pub fn server_name(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }

    /// Parse an absolute URL; ws/wss map to http/https.
    pub fn from_url(raw: &str) -> anyhow::Result<Self> {
        let parsed = url::Url::parse(raw).with_context(|| format!("invalid URL {raw:?}"))?;
        let scheme = match parsed.scheme() {
            "http" | "ws" => Scheme::Http,
            "https" | "wss" => Scheme::Https,
            other => return Err(anyhow!("unsupported scheme {other}")),
        };
        let host = parsed
            .host_str()
            .ok_or_else(|| anyhow!("URL {raw:?} has no host"))?
            .to_string();
        let port = parsed.port().unwrap_or(scheme.default_port());
        let mut path = parsed.path().to_string();
        if let Some(query) = parsed.query() {
            path.push('?');
            path.push_str(query);
        }
        Ok(Self {
            scheme,
            host,
            port,
            path,
        })
    }
}

/// Resolve a request target against the Host header and the connection's scheme.
pub fn resolve_target(
    raw_target: &str,
    headers: &[(String, String)],
    default_scheme: Scheme,
) -> anyhow::Result<Target> {
    let lower = raw_target.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Target::from_url(raw_target);
    }

    let host_header = header_value(headers, "host")
        .ok_or_else(|| anyhow!("Missing Host header in HTTP/1.1 request"))?;
    let (host, port) = split_host_and_port(host_header, default_scheme.default_port());
    let path = if raw_target.starts_with('/') {
        raw_target.to_string()
    } else {
        format!("/{raw_target}")
    };

    Ok(Target {
        scheme: default_scheme,
        host,
        port,
        path,
    })
}

pub fn split_host_and_port(input: &str, default_port: u16) -> (String, u16) {
    let input = input.trim();
    if let Some((host, port)) = input.rsplit_once(':') {
        // A bare IPv6 literal has colons but no port.
        if !host.contains(':') || host.ends_with(']') {
            if let Ok(parsed) = port.parse::<u16>() {
                return (host.to_string(), parsed);
            }
        }
    }
    (input.to_string(), default_port)
}

pub async fn write_request_head<W>(
    writer: &mut W,
    method: &str,
    path: &str,
    headers: &[(String, String)],
    upgrade: bool,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = format!("{method} {path} HTTP/1.1\r\n");
    let mut has_connection = false;
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("Proxy-Connection") || name.eq_ignore_ascii_case("Keep-Alive")
        {
            continue;
        }
        if name.eq_ignore_ascii_case("Connection") {
            has_connection = true;
            if !upgrade {
                head.push_str("Connection: close\r\n");
                continue;
            }
        }
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    if !has_connection {
        head.push_str("Connection: close\r\n");
    }
    head.push_str("\r\n");
    writer.write_all(head.as_bytes()).await?;
    Ok(())
}

pub async fn write_response_head<W>(writer: &mut W, head: &ResponseHead) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = format!(
        "HTTP/1.{} {} {}\r\n",
        head.minor_version, head.status, head.reason
    );
    for (name, value) in &head.headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("\r\n");
    writer.write_all(out.as_bytes()).await?;
    Ok(())
}

pub fn reason_phrase(status: u16) -> &'static str {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown")
}

/// Write a complete response with a computed Content-Length.
pub async fn write_full_response<W>(
    writer: &mut W,
    status: u16,
    headers: &[(String, String)],
    body: &[u8],
    close: bool,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head_headers: HeaderList = headers
        .iter()
        .filter(|(k, _)| {
            !k.eq_ignore_ascii_case("content-length")
                && !k.eq_ignore_ascii_case("transfer-encoding")
                && !k.eq_ignore_ascii_case("connection")
        })
        .cloned()
        .collect();
    head_headers.push(("Content-Length".into(), body.len().to_string()));
    if close {
        head_headers.push(("Connection".into(), "close".into()));
    }
    let head = ResponseHead {
        minor_version: 1,
        status,
        reason: reason_phrase(status).to_string(),
        headers: head_headers,
    };
    write_response_head(writer, &head).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn respond_with_status<W>(
    stream: &mut W,
    code: u16,
    message: &str,
    body: &str,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\nContent-Type: text/plain\r\n\r\n{}",
        code,
        message,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Copy one body from `src` to `dst` with its framing intact.
///
/// `on_payload` sees every payload byte (chunk framing stripped) right
/// after it was written. Returns the payload byte count.
pub async fn forward_body<R, W, F>(
    framing: BodyFraming,
    src: &mut WireReader<R>,
    dst: &mut W,
    bucket: &TokenBucket,
    mut on_payload: F,
) -> anyhow::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(&[u8]),
{
    let mut total = 0u64;
    match framing {
        BodyFraming::Empty => {}
        BodyFraming::Length(len) => {
            let mut remaining = len;
            while remaining > 0 {
                let chunk = src.read_some(remaining.min(READ_CHUNK as u64) as usize).await?;
                if chunk.is_empty() {
                    return Err(anyhow!("connection closed with {remaining} body bytes missing"));
                }
                bucket.acquire(chunk.len()).await;
                dst.write_all(&chunk).await?;
                on_payload(&chunk);
                remaining -= chunk.len() as u64;
                total += chunk.len() as u64;
            }
        }
        BodyFraming::UntilClose => loop {
            let chunk = src.read_some(READ_CHUNK).await?;
            if chunk.is_empty() {
                break;
            }
            bucket.acquire(chunk.len()).await;
            dst.write_all(&chunk).await?;
            on_payload(&chunk);
            total += chunk.len() as u64;
        },
        BodyFraming::Chunked => loop {
            let line = src.read_line().await?;
            dst.write_all(&line).await?;
            let size = parse_chunk_size(&line)?;

            if size == 0 {
                // Trailers end with a blank line
                loop {
                    let trailer = src.read_line().await?;
                    dst.write_all(&trailer).await?;
                    if trailer == b"\r\n" {
                        break;
                    }
                }
                break;
            }

            let mut remaining = size;
            while remaining > 0 {
                let chunk = src.read_some(remaining.min(READ_CHUNK as u64) as usize).await?;
                if chunk.is_empty() {
                    return Err(anyhow!("connection closed inside a chunk"));
                }
                bucket.acquire(chunk.len()).await;
                dst.write_all(&chunk).await?;
                on_payload(&chunk);
                remaining -= chunk.len() as u64;
                total += chunk.len() as u64;
            }

            let crlf = src.read_exact_vec(2).await?;
            if crlf != b"\r\n" {
                return Err(anyhow!("invalid chunk terminator"));
            }
            dst.write_all(&crlf).await?;
        },
    }
    dst.flush().await?;
    Ok(total)
}

/// Read a whole body into memory with chunk framing removed.
pub async fn read_body<R>(
    framing: BodyFraming,
    src: &mut WireReader<R>,
    limit: usize,
) -> anyhow::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut body = Vec::new();
    let push = |chunk: &[u8], body: &mut Vec<u8>| -> anyhow::Result<()> {
        if body.len() + chunk.len() > limit {
            return Err(BodyTooLarge { limit }.into());
        }
        body.extend_from_slice(chunk);
        Ok(())
    };

    match framing {
        BodyFraming::Empty => {}
        BodyFraming::Length(len) => {
            if len > limit as u64 {
                return Err(BodyTooLarge { limit }.into());
            }
            let chunk = src.read_exact_vec(len as usize).await?;
            push(&chunk, &mut body)?;
        }
        BodyFraming::UntilClose => loop {
            let chunk = src.read_some(READ_CHUNK).await?;
            if chunk.is_empty() {
                break;
            }
            push(&chunk, &mut body)?;
        },
        BodyFraming::Chunked => loop {
            let line = src.read_line().await?;
            let size = parse_chunk_size(&line)?;
            if size == 0 {
                while src.read_line().await? != b"\r\n" {}
                break;
            }
            if size > limit as u64 {
                return Err(BodyTooLarge { limit }.into());
            }
            let chunk = src.read_exact_vec(size as usize).await?;
            push(&chunk, &mut body)?;
            if src.read_exact_vec(2).await? != b"\r\n" {
                return Err(anyhow!("invalid chunk terminator"));
            }
        },
    }
    Ok(body)
}

fn parse_chunk_size(line: &[u8]) -> anyhow::Result<u64> {
    let text = std::str::from_utf8(line).unwrap_or("");
    let token = text.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(token, 16).map_err(|_| anyhow!("invalid chunk size: {token:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn absolute_and_origin_targets_resolve() {
        let headers = vec![("Host".to_string(), "example.com:8443".to_string())];
        let origin = resolve_target("/a?b=1", &headers, Scheme::Https).unwrap();
        assert_eq!(origin.url(), "https://example.com:8443/a?b=1");

        let absolute = resolve_target("http://api.test/v1/items?id=2", &[], Scheme::Http).unwrap();
        assert_eq!(absolute.host, "api.test");
        assert_eq!(absolute.port, 80);
        assert_eq!(absolute.path, "/v1/items?id=2");
        assert_eq!(absolute.url(), "http://api.test/v1/items?id=2");
        assert_eq!(absolute.ws_url(), "ws://api.test/v1/items?id=2");

        assert!(resolve_target("/missing-host", &[], Scheme::Http).is_err());
    }

    #[test]
    fn host_port_split_handles_ipv6() {
        assert_eq!(split_host_and_port("example.com", 443), ("example.com".into(), 443));
        assert_eq!(split_host_and_port("example.com:8080", 443), ("example.com".into(), 8080));
        assert_eq!(split_host_and_port("[::1]:9000", 80), ("[::1]".into(), 9000));
        assert_eq!(split_host_and_port("::1", 80), ("::1".into(), 80));
    }

    #[test]
    fn response_framing_rules() {
        let head = ResponseHead::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n").unwrap();
        assert_eq!(head.framing("GET").unwrap(), BodyFraming::Length(5));
        assert_eq!(head.framing("HEAD").unwrap(), BodyFraming::Empty);

        let open = ResponseHead::parse(b"HTTP/1.0 200 OK\r\n\r\n").unwrap();
        assert_eq!(open.framing("GET").unwrap(), BodyFraming::UntilClose);
        assert!(!open.keep_alive());

        let none = ResponseHead::parse(b"HTTP/1.1 304 Not Modified\r\n\r\n").unwrap();
        assert_eq!(none.framing("GET").unwrap(), BodyFraming::Empty);
    }

    #[tokio::test]
    async fn pipelined_bytes_stay_buffered() {
        let (mut client, server) = duplex(1024);
        client
            .write_all(b"GET /one HTTP/1.1\r\nHost: a\r\n\r\nGET /two HTTP/1.1\r\nHost: a\r\n\r\n")
            .await
            .unwrap();
        drop(client);

        let mut reader = WireReader::new(server);
        let first = RequestHead::parse(&reader.read_head().await.unwrap().unwrap()).unwrap();
        let second = RequestHead::parse(&reader.read_head().await.unwrap().unwrap()).unwrap();
        assert_eq!(first.target, "/one");
        assert_eq!(second.target, "/two");
        assert!(reader.read_head().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn chunked_body_forwards_verbatim_and_reports_payload() {
        let wire = b"4\r\nRust\r\n6;ext=1\r\nProxy!\r\n0\r\nX-Trailer: yes\r\n\r\nNEXT";
        let mut reader = WireReader::new(&wire[..]);
        let mut out = Vec::new();
        let mut payload = Vec::new();
        let bucket = TokenBucket::new(0);

        let total = forward_body(BodyFraming::Chunked, &mut reader, &mut out, &bucket, |c| {
            payload.extend_from_slice(c)
        })
        .await
        .unwrap();

        assert_eq!(total, 10);
        assert_eq!(payload, b"RustProxy!");
        assert_eq!(out, &wire[..wire.len() - 4]);
        let (_, rest) = reader.into_parts();
        assert_eq!(rest, b"NEXT");
    }

    #[tokio::test]
    async fn read_body_dechunks_and_enforces_limit() {
        let wire = b"4\r\nRust\r\n6\r\nProxy!\r\n0\r\n\r\n";
        let mut reader = WireReader::new(&wire[..]);
        let body = read_body(BodyFraming::Chunked, &mut reader, 1024).await.unwrap();
        assert_eq!(body, b"RustProxy!");

        let mut reader = WireReader::new(&b"0123456789"[..]);
        let err = read_body(BodyFraming::Length(10), &mut reader, 4).await.unwrap_err();
        assert!(err.downcast_ref::<BodyTooLarge>().is_some());
    }

    #[tokio::test]
    async fn request_head_forces_close_except_for_upgrades() {
        let headers = vec![
            ("Host".to_string(), "example.com".to_string()),
            ("Connection".to_string(), "Upgrade".to_string()),
            ("Proxy-Connection".to_string(), "keep-alive".to_string()),
        ];
        let mut plain = Vec::new();
        write_request_head(&mut plain, "GET", "/", &headers, false).await.unwrap();
        let plain = String::from_utf8(plain).unwrap();
        assert!(plain.contains("Connection: close\r\n"));
        assert!(!plain.contains("Proxy-Connection"));

        let mut upgrade = Vec::new();
        write_request_head(&mut upgrade, "GET", "/", &headers, true).await.unwrap();
        assert!(String::from_utf8(upgrade).unwrap().contains("Connection: Upgrade\r\n"));
    }

    #[tokio::test]
    async fn full_response_recomputes_length() {
        let mut out = Vec::new();
        let headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("Content-Length".to_string(), "999".to_string()),
        ];
        write_full_response(&mut out, 201, &headers, b"{}", false).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 201 Created\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(!text.contains("999"));
        assert!(text.ends_with("\r\n\r\n{}"));
    }
}
