//! Byte transport: plain TCP or TLS over TCP.
//!
//! The transport is deliberately dumb — a connected stream with
//! read/write/flush/shutdown plus a `connect` factory that honours the
//! per-attempt `connect_timeout` and the caller's cancellation token.
//! Framing lives in the connection.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ConnConfig, TlsSecurity};
use crate::errors::{Error, Result};

#[derive(Debug)]
pub enum Transport {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    /// Dial the configured endpoint.
    pub async fn connect(config: &ConnConfig, cancel: &CancellationToken) -> Result<Transport> {
        let attempt = Self::connect_inner(config);
        let deadline = tokio::time::timeout(config.connect_timeout, attempt);
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::client_connection("connect cancelled")),
            outcome = deadline => match outcome {
                Ok(result) => result,
                Err(_) => Err(Error::client_connection(format!(
                    "connecting to {}:{} timed out after {:?}",
                    config.host, config.port, config.connect_timeout
                ))),
            },
        }
    }

    async fn connect_inner(config: &ConnConfig) -> Result<Transport> {
        match config.tls_security {
            TlsSecurity::Off => Ok(Transport::Tcp(Self::dial_tcp(config).await?)),
            TlsSecurity::Strict => Self::dial_tls(config).await,
            TlsSecurity::Prefer => match Self::dial_tls(config).await {
                Ok(transport) => Ok(transport),
                Err(err) => {
                    warn!(error = %err, "TLS dial failed, falling back to plain TCP");
                    Ok(Transport::Tcp(Self::dial_tcp(config).await?))
                }
            },
        }
    }

    async fn dial_tcp(config: &ConnConfig) -> Result<TcpStream> {
        let addr = format!("{}:{}", config.host, config.port);
        let stream = TcpStream::connect(&addr).await.map_err(Error::transport)?;
        stream.set_nodelay(true).map_err(Error::transport)?;
        debug!(addr = %addr, "transport connected");
        Ok(stream)
    }

    async fn dial_tls(config: &ConnConfig) -> Result<Transport> {
        let stream = Self::dial_tcp(config).await?;
        let connector = tls_connector(config)?;
        let server_name = rustls::pki_types::ServerName::try_from(config.host.clone())
            .map_err(|_| Error::interface(format!("invalid TLS host name {:?}", config.host)))?;
        let tls = connector
            .connect(server_name, stream)
            .await
            .map_err(Error::transport)?;
        debug!(host = %config.host, "TLS established");
        Ok(Transport::Tls(Box::new(tls)))
    }

    /// Read some bytes into `buf`. Zero means the peer closed the stream.
    pub async fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize> {
        let n = match self {
            Transport::Tcp(s) => s.read_buf(buf).await,
            Transport::Tls(s) => s.read_buf(buf).await,
        }
        .map_err(Error::transport)?;
        Ok(n)
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Transport::Tcp(s) => s.write_all(data).await,
            Transport::Tls(s) => s.write_all(data).await,
        }
        .map_err(Error::transport)
    }

    pub async fn flush(&mut self) -> Result<()> {
        match self {
            Transport::Tcp(s) => s.flush().await,
            Transport::Tls(s) => s.flush().await,
        }
        .map_err(Error::transport)
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        match self {
            Transport::Tcp(s) => s.shutdown().await,
            Transport::Tls(s) => s.shutdown().await,
        }
        .map_err(Error::transport)
    }
}

fn tls_connector(config: &ConnConfig) -> Result<TlsConnector> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = &config.tls_ca_file {
        let pem = std::fs::read(path).map_err(|e| {
            Error::interface(format!("cannot read tls_ca_file {:?}: {}", path, e))
        })?;
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert = cert.map_err(|e| {
                Error::interface(format!("invalid certificate in {:?}: {}", path, e))
            })?;
            roots.add(cert).map_err(|e| {
                Error::interface(format!("unusable certificate in {:?}: {}", path, e))
            })?;
        }
    }

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(tls_config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn loopback_config(port: u16) -> ConnConfig {
        ConnConfig {
            host: "127.0.0.1".to_string(),
            port,
            tls_security: TlsSecurity::Off,
            connect_timeout: Duration::from_secs(1),
            ..ConnConfig::default()
        }
    }

    #[tokio::test]
    async fn connects_to_a_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let cancel = CancellationToken::new();

        let mut transport = Transport::connect(&loopback_config(port), &cancel)
            .await
            .unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        transport.write_all(b"ping").await.unwrap();
        transport.flush().await.unwrap();
        let mut got = [0u8; 4];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ping");
    }

    #[tokio::test]
    async fn refused_connection_is_client_connection_error() {
        // bind-then-drop to get a port with no listener
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let cancel = CancellationToken::new();
        let err = Transport::connect(&loopback_config(port), &cancel)
            .await
            .unwrap_err();
        assert!(err.is(crate::errors::ErrorCode::CLIENT_CONNECTION));
    }

    #[tokio::test]
    async fn cancelled_connect_reports_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = Transport::connect(&loopback_config(1), &cancel)
            .await
            .unwrap_err();
        assert!(err.is(crate::errors::ErrorCode::CLIENT_CONNECTION));
    }
}
