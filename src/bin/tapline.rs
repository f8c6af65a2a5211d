//! Standalone proxy binary.
//!
//! Runs one engine on loopback and logs every captured exchange until Ctrl-C.
//!
//! Usage:
//! ```
//! cargo run --bin tapline -- --port 9090 --storage-path ./tapline_data
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use tapline_core::api::{ProxyEngine, ProxyEvent};
use tapline_core::config::EngineConfig;
use tapline_core::logging::init_logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config, port) = parse_args()?;
    init_logging(config.debug_log.as_deref())?;

    let engine = ProxyEngine::new(config);
    let port = engine.start(port, Arc::new(log_event)).await?;
    tracing::info!("CA certificate: {}", engine.cert_path().display());
    tracing::info!("Point your HTTP(S) proxy at 127.0.0.1:{port}; Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    engine.stop().await;
    Ok(())
}

fn log_event(event: ProxyEvent) {
    match event {
        ProxyEvent::Request(record) if !record.partial_update => {
            let duration = record.duration_ms().unwrap_or_default();
            match &record.error {
                Some(error) => tracing::warn!(
                    "{} {} -> {} ({} ms) {}",
                    record.method,
                    record.url,
                    record.status_code,
                    duration,
                    error
                ),
                None => tracing::info!(
                    "{} {} -> {} ({} bytes, {} ms){}",
                    record.method,
                    record.url,
                    record.status_code,
                    record.content_length,
                    duration,
                    if record.mocked { " [mocked]" } else { "" }
                ),
            }
        }
        ProxyEvent::Request(_) => {}
        ProxyEvent::WebSocket(message) => tracing::info!(
            "ws {} {} {} {}",
            message.direction.as_str(),
            message.message_type.as_str(),
            message.size_str(),
            message.url
        ),
        ProxyEvent::BreakpointHit(info) => tracing::info!(
            "Breakpoint {} paused {} {} (no controller attached; forwards on timeout)",
            info.id,
            info.method,
            info.url
        ),
    }
}

fn parse_number(flag: &str, value: Option<String>) -> anyhow::Result<u64> {
    let value = value.ok_or_else(|| anyhow::anyhow!("{flag} needs a value"))?;
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("{flag} expects a number, got {value:?}"))
}

fn parse_args() -> anyhow::Result<(EngineConfig, u16)> {
    let mut args = std::env::args().skip(1);
    let mut config = EngineConfig::default();
    let mut port: u16 = 9090;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--config needs a path"))?;
                config = EngineConfig::from_json_file(&PathBuf::from(path))?;
            }
            "--port" => {
                port = u16::try_from(parse_number("--port", args.next())?)
                    .map_err(|_| anyhow::anyhow!("--port is out of range"))?;
            }
            "--storage-path" => {
                if let Some(path) = args.next() {
                    config.storage_dir = PathBuf::from(path);
                }
            }
            "--no-mitm" => config.mitm_enabled = false,
            "--no-ws" => config.ws_enabled = false,
            "--latency-ms" => config.latency_ms = parse_number("--latency-ms", args.next())?,
            "--upload-bps" => config.upload_bps = parse_number("--upload-bps", args.next())?,
            "--download-bps" => {
                config.download_bps = parse_number("--download-bps", args.next())?
            }
            "--debug-log" => {
                if let Some(path) = args.next() {
                    config.debug_log = Some(PathBuf::from(path));
                }
            }
            "--help" | "-h" => {
                eprintln!("Tapline intercepting proxy");
                eprintln!();
                eprintln!("Usage: tapline [OPTIONS]");
                eprintln!();
                eprintln!("Options:");
                eprintln!("  --config <FILE>         Load settings from a JSON file (flags after it override)");
                eprintln!("  --port <PORT>           Loopback port to listen on (default: 9090, 0 = any)");
                eprintln!("  --storage-path <PATH>   Directory for the root CA");
                eprintln!("  --no-mitm               Tunnel HTTPS without decrypting");
                eprintln!("  --no-ws                 Refuse WebSocket upgrades");
                eprintln!("  --latency-ms <MS>       Add fixed latency to every connection");
                eprintln!("  --upload-bps <N>        Cap client-to-server bytes/second");
                eprintln!("  --download-bps <N>      Cap server-to-client bytes/second");
                eprintln!("  --debug-log <FILE>      Also write logs to this file");
                eprintln!("  --help, -h              Show this help");
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {arg}");
            }
        }
    }

    Ok((config, port))
}
