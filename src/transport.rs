//! Connection establishment and the byte-stream seam the client runs on.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use color_eyre::eyre::{self, WrapErr};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::settings::{Settings, TlsSettings};

/// Byte stream carrying MQTT frames: TCP, TLS, or an in-memory pipe in
/// tests.
pub trait MqttStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<S: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> MqttStream for S {}

pub type BoxedStream = Box<dyn MqttStream>;

/// Opens the stream a client runs on. The default implementation dials TCP
/// (or TLS) per the settings; tests substitute in-memory pipes.
pub trait Dialer: Send + Sync + 'static {
    fn dial(&self, settings: &Settings) -> DialFuture;
}

pub type DialFuture = Pin<Box<dyn Future<Output = eyre::Result<BoxedStream>> + Send>>;

pub struct TcpDialer;

impl Dialer for TcpDialer {
    fn dial(&self, settings: &Settings) -> DialFuture {
        let settings = settings.clone();
        Box::pin(async move { connect(&settings).await })
    }
}

/// Open a TCP (or TLS) connection to the configured broker.
pub async fn connect(settings: &Settings) -> eyre::Result<BoxedStream> {
    let host = settings.host.as_str();
    let port = settings.port();

    let stream = TcpStream::connect((host, port))
        .await
        .wrap_err_with(|| format!("failed to connect to {host}:{port}"))?;

    // Disable Nagle's algorithm since we always send complete packets.
    // https://en.wikipedia.org/wiki/Nagle's_algorithm
    if let Err(e) = stream.set_nodelay(true) {
        // It's unclear how this could actually fail and what it means when it does.
        tracing::debug!(?e, "error setting TCP_NODELAY on socket");
    }

    match &settings.tls {
        None => Ok(Box::new(stream)),
        Some(tls) => {
            let stream = tls_handshake(stream, host, tls).await?;
            Ok(Box::new(stream))
        }
    }
}

async fn tls_handshake(
    stream: TcpStream,
    host: &str,
    tls: &TlsSettings,
) -> eyre::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let mut roots = RootCertStore::empty();

    let ca_pem = std::fs::read(&tls.ca_file)
        .wrap_err_with(|| format!("error reading {}", tls.ca_file.display()))?;

    for cert in rustls_pemfile::certs(&mut &ca_pem[..]) {
        let cert = cert.wrap_err_with(|| {
            format!("error reading certificate from {}", tls.ca_file.display())
        })?;
        roots
            .add(cert)
            .wrap_err("error adding root certificate to trust store")?;
    }

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let server_name = tls.server_name.clone().unwrap_or_else(|| host.to_string());
    let server_name = ServerName::try_from(server_name.clone())
        .wrap_err_with(|| format!("invalid TLS server name: {server_name}"))?;

    let connector = TlsConnector::from(Arc::new(config));
    connector
        .connect(server_name, stream)
        .await
        .wrap_err("error from TLS handshake")
}
