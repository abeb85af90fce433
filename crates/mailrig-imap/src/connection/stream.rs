//! Byte transports for IMAP connections.

#![allow(clippy::missing_errors_doc)]

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::{Error, Result};

/// A duplex byte transport the connection task can drive.
///
/// Implemented by [`ImapStream`] for real sockets and by
/// [`tokio::io::DuplexStream`] for the in-memory pipes the test suite uses.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + Sized + 'static {
    /// Performs an in-place TLS upgrade (STARTTLS).
    fn upgrade(
        self,
        host: &str,
        extra_roots: &[CertificateDer<'static>],
    ) -> impl Future<Output = Result<Self>> + Send;

    /// Returns `true` if the transport is currently TLS-protected.
    fn is_secure(&self) -> bool;

    /// Returns the peer's leaf certificate, when TLS is active.
    fn peer_certificate(&self) -> Option<CertificateDer<'static>>;
}

/// A stream that can be either plaintext or TLS.
pub enum ImapStream {
    /// Plaintext TCP stream.
    Plain(TcpStream),
    /// TLS-encrypted stream (boxed to reduce enum size).
    Tls(Box<TlsStream<TcpStream>>),
}

impl ImapStream {
    /// Creates a new plaintext stream.
    #[must_use]
    pub const fn plain(stream: TcpStream) -> Self {
        Self::Plain(stream)
    }

    /// Creates a new TLS stream.
    #[must_use]
    pub fn tls(stream: TlsStream<TcpStream>) -> Self {
        Self::Tls(Box::new(stream))
    }
}

impl Transport for ImapStream {
    async fn upgrade(self, host: &str, extra_roots: &[CertificateDer<'static>]) -> Result<Self> {
        match self {
            Self::Plain(tcp) => {
                let connector = create_tls_connector(extra_roots)?;
                let server_name = ServerName::try_from(host.to_string())?;
                let tls = connector.connect(server_name, tcp).await?;
                Ok(Self::Tls(Box::new(tls)))
            }
            Self::Tls(_) => Err(Error::InvalidState("Stream is already TLS".to_string())),
        }
    }

    fn is_secure(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    fn peer_certificate(&self) -> Option<CertificateDer<'static>> {
        match self {
            Self::Plain(_) => None,
            Self::Tls(stream) => stream
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|cert| cert.clone().into_owned()),
        }
    }
}

impl AsyncRead for ImapStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ImapStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Scripted transport for unit tests; cannot upgrade to TLS.
#[cfg(test)]
impl Transport for tokio_test::io::Mock {
    async fn upgrade(self, _host: &str, _extra_roots: &[CertificateDer<'static>]) -> Result<Self> {
        Err(Error::InvalidState(
            "scripted transport cannot upgrade to TLS".to_string(),
        ))
    }

    fn is_secure(&self) -> bool {
        false
    }

    fn peer_certificate(&self) -> Option<CertificateDer<'static>> {
        None
    }
}

/// In-memory transport used by the test suite; cannot upgrade to TLS.
impl Transport for tokio::io::DuplexStream {
    async fn upgrade(self, _host: &str, _extra_roots: &[CertificateDer<'static>]) -> Result<Self> {
        Err(Error::InvalidState(
            "in-memory transport cannot upgrade to TLS".to_string(),
        ))
    }

    fn is_secure(&self) -> bool {
        false
    }

    fn peer_certificate(&self) -> Option<CertificateDer<'static>> {
        None
    }
}

/// Creates a TLS connector with the webpki roots plus any extra anchors.
pub fn create_tls_connector(extra_roots: &[CertificateDer<'static>]) -> Result<TlsConnector> {
    let mut root_store = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    for root in extra_roots {
        root_store.add(root.clone())?;
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Connects to a server with TLS from the start.
pub async fn connect_tls(
    host: &str,
    port: u16,
    extra_roots: &[CertificateDer<'static>],
) -> Result<ImapStream> {
    let addr = format!("{host}:{port}");
    let tcp = TcpStream::connect(&addr).await?;

    let connector = create_tls_connector(extra_roots)?;
    let server_name = ServerName::try_from(host.to_string())?;
    let tls = connector.connect(server_name, tcp).await?;

    Ok(ImapStream::Tls(Box::new(tls)))
}

/// Connects to a server without TLS (for STARTTLS or testing).
pub async fn connect_plain(host: &str, port: u16) -> Result<ImapStream> {
    let addr = format!("{host}:{port}");
    let tcp = TcpStream::connect(&addr).await?;
    Ok(ImapStream::Plain(tcp))
}
