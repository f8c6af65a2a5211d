//! Bandwidth caps and artificial latency shared by every connection of an engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Bucket capacity. Small so throttling takes effect within the first reads.
pub const BURST_BYTES: u64 = 4 * 1024;

const COPY_BUF_SIZE: usize = 16 * 1024;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket releasing `rate` bytes per second. A rate of 0 disables it.
pub struct TokenBucket {
    rate: AtomicU64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            rate: AtomicU64::new(bytes_per_sec),
            state: Mutex::new(BucketState {
                tokens: BURST_BYTES as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn rate(&self) -> u64 {
        self.rate.load(Ordering::Relaxed)
    }

    pub fn set_rate(&self, bytes_per_sec: u64) {
        self.rate.store(bytes_per_sec, Ordering::Relaxed);
    }

    /// Wait until `n` bytes may pass.
    pub async fn acquire(&self, n: usize) {
        let mut remaining = n as u64;
        while remaining > 0 {
            let rate = self.rate();
            if rate == 0 {
                return;
            }
            let want = remaining.min(BURST_BYTES) as f64;

            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * rate as f64).min(BURST_BYTES as f64);
                state.last_refill = now;

                if state.tokens >= want {
                    state.tokens -= want;
                    remaining -= want as u64;
                    None
                } else {
                    Some(Duration::from_secs_f64((want - state.tokens) / rate as f64))
                }
            };

            if let Some(wait) = wait {
                tokio::time::sleep(wait).await;
            }
        }
    }
}

/// Engine-wide traffic shaping: one bucket per direction plus a fixed delay.
pub struct Shaper {
    pub upload: TokenBucket,
    pub download: TokenBucket,
    latency_ms: AtomicU64,
}

impl Shaper {
    pub fn new(upload_bps: u64, download_bps: u64, latency_ms: u64) -> Self {
        Self {
            upload: TokenBucket::new(upload_bps),
            download: TokenBucket::new(download_bps),
            latency_ms: AtomicU64::new(latency_ms),
        }
    }

    pub fn set_limits(&self, upload_bps: u64, download_bps: u64) {
        self.upload.set_rate(upload_bps);
        self.download.set_rate(download_bps);
    }

    pub fn set_latency(&self, ms: u64) {
        self.latency_ms.store(ms, Ordering::Relaxed);
    }

    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms.load(Ordering::Relaxed))
    }

    /// Sleep for the configured latency, if any.
    pub async fn delay(&self) {
        let latency = self.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

/// Copy `src` into `dst` until EOF, paying `bucket` for every chunk.
pub async fn copy_limited<R, W>(src: &mut R, dst: &mut W, bucket: &TokenBucket) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        bucket.acquire(n).await;
        dst.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    dst.flush().await?;
    Ok(total)
}

/// Write an in-memory body in bucket-sized pieces.
pub async fn write_limited<W>(dst: &mut W, data: &[u8], bucket: &TokenBucket) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    for chunk in data.chunks(COPY_BUF_SIZE) {
        bucket.acquire(chunk.len()).await;
        dst.write_all(chunk).await?;
    }
    dst.flush().await
}
