//! Outbound connections to origin servers.

use crate::proxy::http1::{Scheme, Target};
use anyhow::{anyhow, Context};
use futures::future::{BoxFuture, FutureExt};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
#[cfg(test)]
use tokio::io::DuplexStream;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use webpki_roots::TLS_SERVER_ROOTS;

pub fn build_tls_client_config() -> ClientConfig {
    let root_store = RootCertStore::from_iter(TLS_SERVER_ROOTS.iter().cloned());
    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config
}

#[allow(clippy::large_enum_variant)]
pub enum UpstreamStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    #[cfg(test)]
    Mock(DuplexStream),
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            UpstreamStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            #[cfg(test)]
            UpstreamStream::Mock(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_write(cx, data),
            UpstreamStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, data),
            #[cfg(test)]
            UpstreamStream::Mock(stream) => Pin::new(stream).poll_write(cx, data),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            UpstreamStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            #[cfg(test)]
            UpstreamStream::Mock(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            UpstreamStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            #[cfg(test)]
            UpstreamStream::Mock(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Opens connections to origins. `https` targets come back TLS-wrapped.
pub trait Dialer: Send + Sync + 'static {
    fn dial<'a>(&'a self, target: &'a Target) -> BoxFuture<'a, anyhow::Result<UpstreamStream>>;
}

/// Dials over TCP and verifies origins against the webpki roots.
pub struct DirectDialer {
    tls: Arc<ClientConfig>,
}

impl DirectDialer {
    pub fn new() -> Self {
        Self {
            tls: Arc::new(build_tls_client_config()),
        }
    }
}

impl Default for DirectDialer {
    fn default() -> Self {
        Self::new()
    }
}

impl Dialer for DirectDialer {
    fn dial<'a>(&'a self, target: &'a Target) -> BoxFuture<'a, anyhow::Result<UpstreamStream>> {
        async move {
            let stream = TcpStream::connect(target.dial_addr())
                .await
                .with_context(|| format!("connecting to upstream {}", target.dial_addr()))?;
            let _ = stream.set_nodelay(true);

            if target.scheme == Scheme::Http {
                return Ok(UpstreamStream::Plain(stream));
            }

            let server_name = ServerName::try_from(target.server_name().to_string())
                .map_err(|_| anyhow!("invalid server name {}", target.host))?;
            let tls = TlsConnector::from(self.tls.clone())
                .connect(server_name, stream)
                .await
                .with_context(|| format!("TLS handshake with {}", target.dial_addr()))?;
            Ok(UpstreamStream::Tls(Box::new(tls)))
        }
        .boxed()
    }
}
