//! Proxy server implementation
//!
//! Accepts client connections, serves keep-alive request loops and routes
//! CONNECT tunnels either through TLS interception or a raw byte relay.

use crate::api::events::EventDispatcher;
use crate::models::RequestRecord;
use crate::proxy::cert_manager::CertManager;
use crate::proxy::exchange::{handle_exchange, header_map, Exchange, Flow};
use crate::proxy::http1::{
    header_value, respond_with_status, split_host_and_port, RequestHead, Scheme, Target,
    WireReader,
};
use crate::proxy::shaping::{copy_limited, write_limited, Shaper};
use crate::proxy::state::SharedState;
use crate::proxy::upstream::Dialer;
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_rustls::TlsAcceptor;
use uuid::Uuid;

/// Keep-alive idle timeout in seconds
const KEEP_ALIVE_TIMEOUT_SECS: u64 = 30;

/// Everything a connection task needs, shared across the listener.
pub struct ProxyContext {
    pub shared: Arc<SharedState>,
    pub events: EventDispatcher,
    /// Present once the root CA was loaded; without it CONNECT is always tunneled raw
    pub cert_manager: Option<Arc<CertManager>>,
    pub dialer: Arc<dyn Dialer>,
}

/// Accept connections until `shutdown` fires.
pub async fn run_accept_loop(
    listener: TcpListener,
    ctx: Arc<ProxyContext>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer_addr)) => {
                    tracing::debug!("Connection from {}", peer_addr);
                    let _ = socket.set_nodelay(true);
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(socket, ctx).await {
                            log_connection_error(&e);
                        }
                    });
                }
                Err(e) => tracing::error!("Accept error: {}", e),
            }
        }
    }

    tracing::info!("Proxy server stopped");
}

fn log_connection_error(e: &anyhow::Error) {
    // Handshake EOFs and resets mean the client went away or refused our cert.
    let err_str = format!("{e:#}").to_lowercase();
    if err_str.contains("eof")
        || err_str.contains("broken pipe")
        || err_str.contains("connection reset")
        || err_str.contains("connection closed")
    {
        tracing::debug!("Connection closed by client: {:#}", e);
    } else {
        tracing::error!("Error handling connection: {:#}", e);
    }
}

/// Serve one accepted client connection to completion.
pub async fn serve_connection<S>(stream: S, ctx: Arc<ProxyContext>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut client = WireReader::new(stream);
    if let Served::Connect(head) = serve_requests(&mut client, &ctx, Scheme::Http, None).await? {
        let (stream, leftover) = client.into_parts();
        handle_connect(stream, leftover, head, &ctx).await?;
    }
    Ok(())
}

enum Served {
    Closed,
    /// CONNECT takes over the connection
    Connect(RequestHead),
}

/// Keep-alive loop over requests arriving on one client stream.
///
/// `authority` is the CONNECT target when serving decrypted traffic; it
/// stands in for a missing Host header.
async fn serve_requests<S>(
    client: &mut WireReader<S>,
    ctx: &ProxyContext,
    scheme: Scheme,
    authority: Option<&str>,
) -> anyhow::Result<Served>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut request_count: u32 = 0;

    loop {
        let raw = match tokio::time::timeout(
            Duration::from_secs(KEEP_ALIVE_TIMEOUT_SECS),
            client.read_head(),
        )
        .await
        {
            Ok(Ok(Some(raw))) => raw,
            Ok(Ok(None)) => return Ok(Served::Closed),
            Ok(Err(err)) => {
                // Failures after the first request usually mean the client went away
                if request_count == 0 {
                    tracing::warn!("Failed to read {} request: {err:#}", scheme.as_str());
                    let _ = respond_with_status(
                        client.get_mut(),
                        400,
                        "Bad Request",
                        "Unable to parse HTTP request",
                    )
                    .await;
                } else {
                    tracing::debug!(
                        "Keep-alive connection closed after {} requests: {err:#}",
                        request_count
                    );
                }
                return Ok(Served::Closed);
            }
            Err(_) => {
                tracing::debug!("Keep-alive timeout after {} requests", request_count);
                return Ok(Served::Closed);
            }
        };

        let mut head = match RequestHead::parse(&raw) {
            Ok(head) => head,
            Err(err) => {
                tracing::warn!("Failed to parse request: {err:#}");
                let _ = respond_with_status(
                    client.get_mut(),
                    400,
                    "Bad Request",
                    "Unable to parse HTTP request",
                )
                .await;
                return Ok(Served::Closed);
            }
        };
        request_count += 1;

        if head.is_connect() {
            return Ok(Served::Connect(head));
        }
        if let Some(authority) = authority {
            if header_value(&head.headers, "host").is_none() {
                head.headers.push(("Host".into(), authority.to_string()));
            }
        }

        match handle_exchange(ctx, client, head, scheme).await {
            Ok(Flow::KeepAlive) => continue,
            Ok(Flow::Close) => {
                let _ = client.get_mut().shutdown().await;
                return Ok(Served::Closed);
            }
            Err(err) => {
                tracing::debug!("Request processing error: {err:#}");
                return Ok(Served::Closed);
            }
        }
    }
}

async fn handle_connect<S>(
    client: S,
    leftover: Vec<u8>,
    head: RequestHead,
    ctx: &ProxyContext,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (host, port) = split_host_and_port(&head.target, 443);
    let settings = ctx.shared.snapshot();

    match &ctx.cert_manager {
        Some(cert_manager) if settings.mitm_enabled && !settings.is_bypassed(&host) => {
            if !leftover.is_empty() {
                tracing::debug!(
                    "Discarding {} bytes sent before the CONNECT reply",
                    leftover.len()
                );
            }
            intercept_tls(client, host, port, ctx, cert_manager).await
        }
        _ => {
            tracing::debug!("Tunneling {}:{} without interception", host, port);
            raw_tunnel(client, leftover, host, port, head, ctx).await
        }
    }
}

async fn intercept_tls<S>(
    mut client: S,
    host: String,
    port: u16,
    ctx: &ProxyContext,
    cert_manager: &CertManager,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let server_config = match cert_manager.server_config_for_host(&host) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("Failed to build server config for {host}: {err:#}");
            client.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
            return Ok(());
        }
    };

    client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    client.flush().await?;

    let tls_stream = TlsAcceptor::from(server_config)
        .accept(client)
        .await
        .with_context(|| format!("TLS handshake with client for {host}"))?;

    let authority = if port == Scheme::Https.default_port() {
        host
    } else {
        format!("{host}:{port}")
    };
    let mut client = WireReader::new(tls_stream);
    if let Served::Connect(_) =
        serve_requests(&mut client, ctx, Scheme::Https, Some(&authority)).await?
    {
        tracing::warn!("Rejecting nested CONNECT inside {authority}");
        let _ = respond_with_status(
            client.get_mut(),
            400,
            "Bad Request",
            "CONNECT is not allowed inside an intercepted tunnel",
        )
        .await;
    }
    Ok(())
}

async fn raw_tunnel<S>(
    mut client: S,
    leftover: Vec<u8>,
    host: String,
    port: u16,
    head: RequestHead,
    ctx: &ProxyContext,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut exchange = Exchange::new(
        RequestRecord::new(
            Uuid::new_v4().to_string(),
            &head.method,
            &head.target,
            true,
            header_map(&head.headers),
        ),
        ctx.events.clone(),
    );
    exchange.publish_partial();

    let target = Target {
        scheme: Scheme::Http,
        host,
        port,
        path: "/".into(),
    };
    ctx.shared.shaper.delay().await;
    let upstream = match ctx.dialer.dial(&target).await {
        Ok(upstream) => upstream,
        Err(err) => {
            tracing::error!(
                "Failed to establish CONNECT tunnel to {} - {err:#}",
                target.dial_addr()
            );
            client.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
            exchange.fail(502, format!("{err:#}"));
            return Ok(());
        }
    };

    client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    client.flush().await?;
    exchange.record.status_code = 200;
    exchange.publish_partial();

    if let Err(err) = splice(client, leftover, upstream, &ctx.shared.shaper).await {
        tracing::debug!("Tunnel to {} closed: {err}", target.dial_addr());
    }
    exchange.finish(None);
    Ok(())
}

/// Relay bytes both ways until either side finishes, then close both.
async fn splice<C, U>(
    client: C,
    client_prefix: Vec<u8>,
    upstream: U,
    shaper: &Shaper,
) -> std::io::Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let upload = async {
        if !client_prefix.is_empty() {
            write_limited(&mut upstream_write, &client_prefix, &shaper.upload).await?;
        }
        copy_limited(&mut client_read, &mut upstream_write, &shaper.upload).await?;
        upstream_write.shutdown().await
    };
    let download = async {
        copy_limited(&mut upstream_read, &mut client_write, &shaper.download).await?;
        client_write.shutdown().await
    };

    tokio::select! {
        result = upload => result,
        result = download => result,
    }
}
