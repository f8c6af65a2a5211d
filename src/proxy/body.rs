//! Body capture and display analysis
//!
//! Bytes on the wire are never altered here. The tap mirrors forwarded
//! payload into a bounded buffer; analysis works on a copy, decompressing it
//! for display and flagging binary content.

use std::io::{Cursor, Read};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// A progress update is due after this many more bytes...
pub const PROGRESS_BYTES: u64 = 512 * 1024;
/// ...or after this long, whichever comes first.
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

const BINARY_SNIFF_LEN: usize = 512;
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];
const MAX_DECODED_BYTES: u64 = 100 * 1024 * 1024;

/// Bytes captured from one body once the stream has ended.
#[derive(Debug, Clone, Default)]
pub struct CapturedBody {
    pub bytes: Vec<u8>,
    /// Payload bytes that passed through, captured or not
    pub total_bytes: u64,
    /// Capture stopped at the limit
    pub truncated: bool,
    /// Capture was disabled for this content type
    pub mirror_only: bool,
    pub content_encoding: Option<String>,
}

/// Mirrors forwarded body chunks.
pub struct BodyTap {
    buf: Vec<u8>,
    limit: usize,
    mirror_only: bool,
    truncated: bool,
    total: u64,
    next_progress_bytes: u64,
    last_progress: Instant,
    content_encoding: Option<String>,
    finished: bool,
}

impl BodyTap {
    pub fn new(content_type: Option<&str>, content_encoding: Option<&str>, limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            mirror_only: is_media_type(content_type),
            truncated: false,
            total: 0,
            next_progress_bytes: PROGRESS_BYTES,
            last_progress: Instant::now(),
            content_encoding: content_encoding.map(str::to_string),
            finished: false,
        }
    }

    /// Record a chunk that was just forwarded.
    /// Returns the running byte count when a progress update is due.
    pub fn observe(&mut self, chunk: &[u8]) -> Option<u64> {
        if self.finished || chunk.is_empty() {
            return None;
        }
        self.total += chunk.len() as u64;

        if !self.mirror_only && !self.truncated {
            let room = self.limit.saturating_sub(self.buf.len());
            if chunk.len() > room {
                self.buf.extend_from_slice(&chunk[..room]);
                self.truncated = true;
            } else {
                self.buf.extend_from_slice(chunk);
            }
        }

        let due = self.total >= self.next_progress_bytes
            || self.last_progress.elapsed() >= PROGRESS_INTERVAL;
        if due {
            self.next_progress_bytes = (self.total / PROGRESS_BYTES + 1) * PROGRESS_BYTES;
            self.last_progress = Instant::now();
            Some(self.total)
        } else {
            None
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Terminal result. Only the first call yields it.
    pub fn finish(&mut self) -> Option<CapturedBody> {
        if self.finished {
            return None;
        }
        self.finished = true;
        Some(CapturedBody {
            bytes: std::mem::take(&mut self.buf),
            total_bytes: self.total,
            truncated: self.truncated,
            mirror_only: self.mirror_only,
            content_encoding: self.content_encoding.take(),
        })
    }
}

fn is_media_type(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| {
            let ct = ct.trim().to_ascii_lowercase();
            ct.starts_with("image/") || ct.starts_with("video/") || ct.starts_with("audio/")
        })
        .unwrap_or(false)
}

/// Display form of a captured body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BodyAnalysis {
    pub text: String,
    /// Decompressed bytes, kept only for binary bodies
    pub raw: Option<Vec<u8>>,
    pub is_binary: bool,
}

impl BodyAnalysis {
    fn placeholder(text: String) -> Self {
        Self {
            text,
            raw: None,
            is_binary: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Coding {
    Gzip,
    Deflate,
    Brotli,
    Zstd,
    /// zstd with a shared dictionary negotiated out of band
    ZstdDictionary,
}

impl Coding {
    fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => Some(Coding::Gzip),
            "deflate" => Some(Coding::Deflate),
            "br" | "brotli" => Some(Coding::Brotli),
            "zstd" => Some(Coding::Zstd),
            "zstd/dict_monitor" => Some(Coding::ZstdDictionary),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Coding::Gzip => "gzip",
            Coding::Deflate => "deflate",
            Coding::Brotli => "brotli",
            Coding::Zstd | Coding::ZstdDictionary => "zstd",
        }
    }
}

fn codings_for(raw: &[u8], encoding: Option<&str>) -> Vec<Coding> {
    let hinted: Vec<Coding> = encoding
        .map(|e| e.split(',').filter_map(Coding::parse).collect())
        .unwrap_or_default();
    if hinted.is_empty() && encoding.map(str::trim).unwrap_or("").is_empty() && raw.starts_with(&ZSTD_MAGIC) {
        return vec![Coding::Zstd];
    }
    hinted
}

fn read_capped(reader: impl Read) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    reader.take(MAX_DECODED_BYTES).read_to_end(&mut out)?;
    Ok(out)
}

fn decode(coding: Coding, data: &[u8]) -> std::io::Result<Vec<u8>> {
    match coding {
        Coding::Gzip => read_capped(flate2::read::MultiGzDecoder::new(data)),
        Coding::Deflate => {
            // Servers send both zlib-wrapped and raw deflate under this name.
            read_capped(flate2::read::ZlibDecoder::new(data))
                .or_else(|_| read_capped(flate2::read::DeflateDecoder::new(data)))
        }
        Coding::Brotli => read_capped(brotli::Decompressor::new(Cursor::new(data), 4096)),
        Coding::Zstd | Coding::ZstdDictionary => {
            read_capped(zstd::stream::read::Decoder::new(Cursor::new(data))?)
        }
    }
}

fn looks_binary(bytes: &[u8]) -> bool {
    bytes[..bytes.len().min(BINARY_SNIFF_LEN)].contains(&0)
}

/// Produce the display form of `raw`, decompressing a copy per `encoding`.
///
/// Decode failures yield a placeholder instead of an error.
pub fn analyze(raw: &[u8], encoding: Option<&str>) -> BodyAnalysis {
    if raw.is_empty() {
        return BodyAnalysis::default();
    }

    let codings = codings_for(raw, encoding);
    let mut decoded: Vec<u8> = raw.to_vec();
    for coding in codings.iter().rev() {
        match decode(*coding, &decoded) {
            Ok(out) => decoded = out,
            Err(err) if *coding == Coding::ZstdDictionary => {
                return BodyAnalysis::placeholder(format!(
                    "[zstd body ({} bytes) needs a compression dictionary that is not available: {err}]",
                    raw.len()
                ));
            }
            Err(err) => {
                return BodyAnalysis::placeholder(format!(
                    "[Unable to decode {} body ({} bytes): {err}]",
                    coding.name(),
                    raw.len()
                ));
            }
        }
    }

    if looks_binary(&decoded) {
        return BodyAnalysis {
            text: format!("[Binary data: {} bytes]", decoded.len()),
            raw: Some(decoded),
            is_binary: true,
        };
    }

    BodyAnalysis {
        text: String::from_utf8_lossy(&decoded).into_owned(),
        raw: None,
        is_binary: false,
    }
}

/// Display form of a finished capture, noting skipped or truncated bodies.
pub fn analyze_captured(body: &CapturedBody) -> BodyAnalysis {
    if body.mirror_only {
        return BodyAnalysis::placeholder(format!(
            "[Media body not captured: {} bytes]",
            body.total_bytes
        ));
    }
    if body.truncated && body.content_encoding.is_some() {
        return BodyAnalysis::placeholder(format!(
            "[Compressed body truncated at {} of {} bytes]",
            body.bytes.len(),
            body.total_bytes
        ));
    }
    analyze(&body.bytes, body.content_encoding.as_deref())
}

/// Run `analyze_captured` on the blocking pool.
pub async fn analyze_in_background(body: CapturedBody) -> BodyAnalysis {
    let total = body.total_bytes;
    match tokio::task::spawn_blocking(move || analyze_captured(&body)).await {
        Ok(analysis) => analysis,
        Err(err) => {
            tracing::warn!("Body analysis task failed: {err}");
            BodyAnalysis::placeholder(format!("[Body analysis failed: {total} bytes]"))
        }
    }
}

/// Hand-off of the request body display from the request phase to the
/// terminal record. Consuming `resolve` makes it single-use.
pub struct BodyPromise {
    rx: oneshot::Receiver<BodyAnalysis>,
}

impl BodyPromise {
    /// Start analysing `body` in the background.
    pub fn spawn(body: CapturedBody) -> Self {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = tx.send(analyze_in_background(body).await);
        });
        Self { rx }
    }

    pub fn ready(analysis: BodyAnalysis) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(analysis);
        Self { rx }
    }

    pub fn empty() -> Self {
        Self::ready(BodyAnalysis::default())
    }

    pub async fn resolve(self) -> BodyAnalysis {
        self.rx.await.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn raw_deflate(data: &[u8]) -> Vec<u8> {
        let mut enc =
            flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn brotli(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut writer = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
            writer.write_all(data).unwrap();
        }
        out
    }

    fn zstd(data: &[u8]) -> Vec<u8> {
        zstd::stream::encode_all(Cursor::new(data), 3).unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn decompression_restores_printable_text(text in "[ -~]{1,2000}") {
            let bytes = text.as_bytes();
            prop_assert_eq!(analyze(&gzip(bytes), Some("gzip")).text, text.clone());
            prop_assert_eq!(analyze(&zlib(bytes), Some("deflate")).text, text.clone());
            prop_assert_eq!(analyze(&brotli(bytes), Some("br")).text, text.clone());
            prop_assert_eq!(analyze(&zstd(bytes), Some("zstd")).text, text);
        }
    }

    #[test]
    fn raw_deflate_and_aliases_are_accepted() {
        let text = b"deflate without zlib header";
        assert_eq!(analyze(&raw_deflate(text), Some("deflate")).text, "deflate without zlib header");
        assert_eq!(analyze(&gzip(text), Some("x-gzip")).text, "deflate without zlib header");
        assert_eq!(analyze(&zstd(text), Some("zstd/dict_monitor")).text, "deflate without zlib header");
    }

    #[test]
    fn zstd_detected_by_magic_without_hint() {
        let analysis = analyze(&zstd(b"{\"ok\":true}"), None);
        assert_eq!(analysis.text, "{\"ok\":true}");
    }

    #[test]
    fn stacked_encodings_decode_in_reverse() {
        let inner = gzip(b"layered");
        let outer = brotli(&inner);
        assert_eq!(analyze(&outer, Some("gzip, br")).text, "layered");
    }

    #[test]
    fn nul_byte_marks_binary_and_keeps_raw() {
        let mut payload = b"PNG-ish header".to_vec();
        payload.push(0);
        payload.extend_from_slice(&[1, 2, 3, 255]);

        let plain = analyze(&payload, None);
        assert!(plain.is_binary);
        assert_eq!(plain.raw.as_deref(), Some(payload.as_slice()));
        assert!(plain.text.starts_with("[Binary data"));

        let compressed = analyze(&gzip(&payload), Some("gzip"));
        assert!(compressed.is_binary);
        assert_eq!(compressed.raw.as_deref(), Some(payload.as_slice()));
    }

    #[test]
    fn nul_after_sniff_window_is_text() {
        let mut payload = vec![b'a'; 600];
        payload[550] = 0;
        let analysis = analyze(&payload, None);
        assert!(!analysis.is_binary);
        assert!(analysis.raw.is_none());
    }

    #[test]
    fn corrupt_payload_degrades_to_placeholder() {
        let analysis = analyze(b"definitely not gzip", Some("gzip"));
        assert!(analysis.text.starts_with("[Unable to decode gzip body"));
        assert!(analysis.raw.is_none());

        let dict = analyze(b"not zstd at all", Some("zstd/dict_monitor"));
        assert!(dict.text.contains("dictionary"));
    }

    #[test]
    fn tap_passes_media_through_without_capturing() {
        let mut tap = BodyTap::new(Some("image/png"), None, 1024);
        tap.observe(&[1u8; 100]);
        let body = tap.finish().unwrap();
        assert!(body.mirror_only);
        assert!(body.bytes.is_empty());
        assert_eq!(body.total_bytes, 100);
        assert!(analyze_captured(&body).text.contains("100 bytes"));
    }

    #[test]
    fn tap_truncates_at_limit() {
        let mut tap = BodyTap::new(Some("text/plain"), None, 8);
        tap.observe(b"0123456789");
        tap.observe(b"abc");
        let body = tap.finish().unwrap();
        assert_eq!(body.bytes, b"01234567");
        assert!(body.truncated);
        assert_eq!(body.total_bytes, 13);
    }

    #[test]
    fn tap_finish_is_idempotent() {
        let mut tap = BodyTap::new(None, None, 1024);
        tap.observe(b"hello");
        assert!(tap.finish().is_some());
        assert!(tap.finish().is_none());
        assert_eq!(tap.observe(b"late"), None);
    }

    #[test]
    fn tap_reports_progress_every_512k() {
        let mut tap = BodyTap::new(None, None, usize::MAX);
        let chunk = vec![b'x'; 128 * 1024];
        let mut updates = Vec::new();
        for _ in 0..10 {
            if let Some(total) = tap.observe(&chunk) {
                updates.push(total);
            }
        }
        assert_eq!(updates, vec![512 * 1024, 1024 * 1024]);
    }

    #[tokio::test(start_paused = true)]
    async fn tap_reports_progress_after_interval() {
        let mut tap = BodyTap::new(None, None, 1024);
        assert_eq!(tap.observe(b"a"), None);
        tokio::time::advance(PROGRESS_INTERVAL).await;
        assert_eq!(tap.observe(b"b"), Some(2));
        assert_eq!(tap.observe(b"c"), None);
    }

    #[tokio::test]
    async fn promise_delivers_background_analysis() {
        let body = CapturedBody {
            bytes: gzip(b"request text"),
            total_bytes: 0,
            content_encoding: Some("gzip".into()),
            ..Default::default()
        };
        let analysis = BodyPromise::spawn(body).resolve().await;
        assert_eq!(analysis.text, "request text");
        assert_eq!(BodyPromise::empty().resolve().await, BodyAnalysis::default());
    }
}
