//! TLS negotiation.
//!
//! PostgreSQL TLS starts in cleartext: the client sends an SSLRequest and the
//! server answers with a single byte, `S` to proceed with a handshake on the
//! same socket or `N` to continue unencrypted.

use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;

use crate::config::SslMode;
use crate::error::{PgError, PgResult};
use crate::logger::Logger;
use crate::protocol::{FrontendMessage, SslRequest};
use crate::stream::PgStream;

/// How the server certificate is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVerification {
    /// Verify the chain and the host name.
    #[default]
    Full,
    /// Accept any certificate. Encrypts but does not authenticate the server.
    None,
}

/// Certificates used for a TLS session. All PEM encoded.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Client certificate chain, for certificate authentication.
    pub client_cert_pem: Option<Vec<u8>>,
    pub client_key_pem: Option<Vec<u8>>,
    /// Trusted roots. The platform store is used when absent.
    pub ca_cert_pem: Option<Vec<u8>>,
    pub verification: TlsVerification,
}

impl TlsConfig {
    /// Load client certificate, key and optional CA bundle from disk.
    pub fn from_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        ca_path: Option<impl AsRef<Path>>,
    ) -> std::io::Result<Self> {
        Ok(Self {
            client_cert_pem: Some(std::fs::read(cert_path)?),
            client_key_pem: Some(std::fs::read(key_path)?),
            ca_cert_pem: ca_path.map(std::fs::read).transpose()?,
            verification: TlsVerification::Full,
        })
    }

    /// Trust only the given CA bundle.
    pub fn with_ca(ca_cert_pem: Vec<u8>) -> Self {
        Self {
            ca_cert_pem: Some(ca_cert_pem),
            ..Self::default()
        }
    }

    pub fn insecure() -> Self {
        Self {
            verification: TlsVerification::None,
            ..Self::default()
        }
    }

    /// Build the rustls client configuration.
    pub fn client_config(&self) -> PgResult<ClientConfig> {
        let builder = match self.verification {
            TlsVerification::Full => ClientConfig::builder().with_root_certificates(self.root_store()?),
            TlsVerification::None => ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier)),
        };

        match (&self.client_cert_pem, &self.client_key_pem) {
            (Some(cert_pem), Some(key_pem)) => {
                let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
                    .collect::<Result<_, _>>()
                    .map_err(|e| PgError::Config(format!("Invalid client certificate: {}", e)))?;
                if certs.is_empty() {
                    return Err(PgError::Config("No certificate found in client PEM".to_string()));
                }
                let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
                    .map_err(|e| PgError::Config(format!("Invalid client key: {}", e)))?
                    .ok_or_else(|| PgError::Config("No private key found in PEM".to_string()))?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| PgError::Config(format!("Invalid client cert/key: {}", e)))
            }
            (None, None) => Ok(builder.with_no_client_auth()),
            _ => Err(PgError::Config(
                "Client certificate and key must be given together".to_string(),
            )),
        }
    }

    fn root_store(&self) -> PgResult<RootCertStore> {
        let mut roots = RootCertStore::empty();
        match &self.ca_cert_pem {
            Some(ca_pem) => {
                for cert in rustls_pemfile::certs(&mut ca_pem.as_slice()) {
                    let cert = cert.map_err(|e| PgError::Config(format!("Invalid CA certificate: {}", e)))?;
                    roots
                        .add(cert)
                        .map_err(|e| PgError::Config(format!("Invalid CA certificate: {}", e)))?;
                }
                if roots.is_empty() {
                    return Err(PgError::Config("No certificate found in CA PEM".to_string()));
                }
            }
            None => {
                // Unparseable platform certificates are skipped
                let native = rustls_native_certs::load_native_certs();
                roots.add_parsable_certificates(native.certs);
            }
        }
        Ok(roots)
    }
}

/// Run the SSLRequest exchange for `mode` and upgrade the socket if agreed.
pub(crate) async fn negotiate(
    mut tcp: TcpStream,
    host: &str,
    mode: SslMode,
    tls: Option<&TlsConfig>,
    logger: &dyn Logger,
) -> PgResult<PgStream> {
    if mode == SslMode::Disable {
        return Ok(PgStream::Tcp(tcp));
    }

    tcp.write_all(&SslRequest.encode()).await?;
    let mut response = [0u8; 1];
    tcp.read_exact(&mut response).await?;

    match (response[0], mode) {
        (b'S', _) => {}
        (b'N', SslMode::Prefer) => {
            logger.info("Server declined TLS; continuing unencrypted");
            return Ok(PgStream::Tcp(tcp));
        }
        (b'N', _) => return Err(PgError::Connection("Server does not support TLS".to_string())),
        (other, _) => {
            return Err(PgError::protocol(format!(
                "Unexpected SSLRequest response byte: {:#04x}",
                other
            )))
        }
    }

    let config = session_tls(tls).client_config()?;
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| PgError::Connection(format!("Invalid hostname for TLS: {}", host)))?;

    let stream = TlsConnector::from(Arc::new(config))
        .connect(server_name, tcp)
        .await
        .map_err(|e| PgError::Connection(format!("TLS handshake failed: {}", e)))?;
    logger.debug("TLS session established");
    Ok(PgStream::Tls(Box::new(stream)))
}

/// Certificates for a session. Without explicit settings the channel is
/// encrypted but the server is not verified, matching libpq's `prefer` and
/// `require`.
fn session_tls(tls: Option<&TlsConfig>) -> TlsConfig {
    tls.cloned().unwrap_or_else(TlsConfig::insecure)
}

/// Accepts any server certificate.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
