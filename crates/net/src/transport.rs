//! TCP and TLS transport setup.
//!
//! The connection layer runs over any `AsyncRead + AsyncWrite` byte stream.
//! This module produces those streams: plain TCP, client-side TLS with a
//! [`CertPolicy`], and a server-side [`TlsAcceptor`] built from PEM files.
//!
//! A certificate the client does not trust is reported as
//! [`Error::Certificate`] so the caller can ask the user whether to retry
//! with [`CertPolicy::Insecure`]. Nothing here downgrades on its own.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// How the client treats the server's certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CertPolicy {
    /// Verify against the web PKI roots plus any configured CA.
    #[default]
    Verify,
    /// Accept any certificate. Only after the user explicitly confirmed.
    Insecure,
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Open a TCP connection, giving up after `timeout`.
pub async fn connect_tcp(address: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    debug!(address, port, "Connecting");
    let stream = tokio::time::timeout(timeout, TcpStream::connect((address, port)))
        .await
        .map_err(|_| Error::ConnectTimeout(timeout))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Build a client TLS configuration.
///
/// `ca_file` adds a PEM bundle of extra trust anchors, typically the hub's
/// self-signed certificate.
pub fn client_config(policy: CertPolicy, ca_file: Option<&Path>) -> Result<Arc<ClientConfig>> {
    let provider = provider();
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?;

    let config = match policy {
        CertPolicy::Verify => {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            if let Some(path) = ca_file {
                for cert in load_certs(path)? {
                    roots.add(cert).map_err(|e| Error::Tls(e.to_string()))?;
                }
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        CertPolicy::Insecure => {
            warn!("Certificate verification disabled");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
                .with_no_client_auth()
        }
    };

    Ok(Arc::new(config))
}

/// Run the client TLS handshake over an open TCP stream.
pub async fn connect_tls(
    stream: TcpStream,
    host: &str,
    config: Arc<ClientConfig>,
) -> Result<TlsStream<TcpStream>> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| Error::Tls(format!("invalid server name {}: {}", host, e)))?;

    TlsConnector::from(config)
        .connect(server_name, stream)
        .await
        .map_err(classify_tls_error)
}

/// Map a TLS handshake failure, separating trust failures from the rest.
pub fn classify_tls_error(err: std::io::Error) -> Error {
    if let Some(tls) = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
    {
        return match tls {
            rustls::Error::InvalidCertificate(_) => Error::Certificate {
                reason: tls.to_string(),
            },
            other => Error::Tls(other.to_string()),
        };
    }
    Error::Io(err)
}

/// Build a server-side acceptor from PEM certificate chain and key files.
pub fn acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .and_then(|builder| builder.with_no_client_auth().with_single_cert(certs, key))
        .map_err(|e| Error::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(Error::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| Error::Tls(format!("no private key found in {}", path.display())))
}

/// Verifier behind [`CertPolicy::Insecure`].
///
/// Skips chain and name checks but still checks handshake signatures, so the
/// session is bound to whichever key the server presented.
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
