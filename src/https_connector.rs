//! Origin Connector
//!
//! `tower::Service<Uri>` connector for the pooled hyper client. `https` URIs
//! get a rustls session verified against the system roots; `http` URIs (local
//! S3-compatible stores, a co-located transformation backend) stay plain TCP.

use crate::{ProxyError, Result};
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection};
use rustls::pki_types::ServerName;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tower::Service;
use tracing::{debug, warn};

enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Connection handed to hyper; plain or TLS underneath
pub struct OriginStream(MaybeTlsStream);

impl OriginStream {
    pub fn is_tls(&self) -> bool {
        matches!(self.0, MaybeTlsStream::Tls(_))
    }
}

impl Read for OriginStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        mut buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        let mut tokio_buf = tokio::io::ReadBuf::uninit(unsafe { buf.as_mut() });
        match Pin::new(&mut self.0).poll_read(cx, &mut tokio_buf) {
            Poll::Ready(Ok(())) => {
                let filled = tokio_buf.filled().len();
                unsafe {
                    buf.advance(filled);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Write for OriginStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

impl Connection for OriginStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// Build a TLS connector trusting the platform root certificates
pub fn native_tls_connector() -> Result<TlsConnector> {
    let mut root_store = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs()
        .map_err(|e| ProxyError::TlsError(format!("Failed to load native certs: {}", e)))?
    {
        if let Err(e) = root_store.add(cert) {
            debug!("Skipping unusable root certificate: {}", e);
        }
    }
    if root_store.is_empty() {
        return Err(ProxyError::TlsError(
            "No usable root certificates found".to_string(),
        ));
    }

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(tls_config)))
}

/// Connector for origin and transformation backend hosts
#[derive(Clone)]
pub struct OriginConnector {
    tls_connector: TlsConnector,
}

impl OriginConnector {
    pub fn new(tls_connector: TlsConnector) -> Self {
        Self { tls_connector }
    }
}

/// Host, port and TLS flag for a request URI
fn connect_target(uri: &Uri) -> Result<(String, u16, bool)> {
    let host = uri
        .host()
        .ok_or_else(|| ProxyError::ConfigError(format!("No host in URI: {}", uri)))?;
    let tls = match uri.scheme_str() {
        Some("https") | None => true,
        Some("http") => false,
        Some(other) => {
            return Err(ProxyError::ConfigError(format!(
                "Unsupported scheme '{}' in {}",
                other, uri
            )))
        }
    };
    let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
    // IPv6 literals come back bracketed
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    Ok((host, port, tls))
}

impl Service<Uri> for OriginConnector {
    type Response = OriginStream;
    type Error = ProxyError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let tls_connector = self.tls_connector.clone();

        Box::pin(async move {
            let (host, port, tls) = connect_target(&uri)?;

            debug!("[ORIGIN_CONNECTOR] Connecting to {}:{} (tls: {})", host, port, tls);

            let tcp = TcpStream::connect((host.as_str(), port)).await.map_err(|e| {
                warn!("[ORIGIN_CONNECTOR] TCP connection failed to {}:{}: {}", host, port, e);
                ProxyError::ConnectionError(format!("Failed to connect to {}:{}: {}", host, port, e))
            })?;

            // Set TCP_NODELAY to disable Nagle's algorithm for lower latency
            if let Err(e) = tcp.set_nodelay(true) {
                warn!("[ORIGIN_CONNECTOR] Failed to set TCP_NODELAY for {}:{}: {}", host, port, e);
            }

            if !tls {
                return Ok(OriginStream(MaybeTlsStream::Plain(tcp)));
            }

            let server_name = ServerName::try_from(host.clone()).map_err(|e| {
                ProxyError::TlsError(format!("Invalid server name '{}': {}", host, e))
            })?;

            let stream = tls_connector.connect(server_name, tcp).await.map_err(|e| {
                warn!("[ORIGIN_CONNECTOR] TLS handshake failed to {}:{}: {}", host, port, e);
                ProxyError::TlsError(format!("TLS handshake failed to {}:{}: {}", host, port, e))
            })?;

            debug!("[ORIGIN_CONNECTOR] TLS connection established to {}:{}", host, port);

            Ok(OriginStream(MaybeTlsStream::Tls(Box::new(stream))))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_target() {
        let uri: Uri = "https://storage.googleapis.com/b/k".parse().unwrap();
        assert_eq!(
            connect_target(&uri).unwrap(),
            ("storage.googleapis.com".to_string(), 443, true)
        );

        let uri: Uri = "http://localhost:9000/b/k".parse().unwrap();
        assert_eq!(
            connect_target(&uri).unwrap(),
            ("localhost".to_string(), 9000, false)
        );

        let uri: Uri = "http://[::1]/x".parse().unwrap();
        assert_eq!(connect_target(&uri).unwrap(), ("::1".to_string(), 80, false));
    }

    #[test]
    fn test_rejects_unknown_scheme() {
        let uri: Uri = "ftp://example.com/x".parse().unwrap();
        assert!(connect_target(&uri).is_err());
    }

    #[tokio::test]
    async fn test_plain_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        let _ = rustls::crypto::ring::default_provider().install_default();
        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        let mut connector = OriginConnector::new(TlsConnector::from(Arc::new(tls_config)));

        let uri: Uri = format!("http://127.0.0.1:{}/", port).parse().unwrap();
        let stream = connector.call(uri).await.unwrap();
        assert!(!stream.is_tls());
        accept.await.unwrap().unwrap();
    }
}
