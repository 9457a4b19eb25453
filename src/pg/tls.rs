//! TLS negotiation for PostgreSQL connections.
//!
//! PostgreSQL upgrades an already-open TCP socket: the client sends an
//! `SSLRequest`, the server answers a single `S` (go ahead) or `N`
//! (no TLS), and on `S` the TLS handshake runs over the same socket.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use once_cell::sync::OnceCell;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use super::error::{PgError, PgResult};
use super::protocol::{FrontendMessage, SslRequest};

/// Client TLS policy, named after libpq's `sslmode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// Plaintext only.
    Disable,
    /// TLS if the server offers it, without certificate verification.
    Prefer,
    /// TLS mandatory; certificate chain not verified. Managed providers
    /// terminate TLS with certificates that do not chain to a public root.
    Require,
    /// TLS mandatory; certificate verified against the webpki root store.
    VerifyFull,
}

impl TlsMode {
    /// Parse an `sslmode` value. `allow` is treated as `prefer`; `verify-ca`
    /// is upgraded to full verification.
    pub fn parse(value: &str) -> PgResult<Self> {
        match value {
            "disable" => Ok(TlsMode::Disable),
            "allow" | "prefer" => Ok(TlsMode::Prefer),
            "require" => Ok(TlsMode::Require),
            "verify-ca" | "verify-full" => Ok(TlsMode::VerifyFull),
            other => Err(PgError::Config(format!("Unknown sslmode: {}", other))),
        }
    }

    pub fn is_required(self) -> bool {
        matches!(self, TlsMode::Require | TlsMode::VerifyFull)
    }
}

/// Socket that is either plaintext or TLS-wrapped.
pub enum PgStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl PgStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, PgStream::Tls(_))
    }
}

impl AsyncRead for PgStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PgStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            PgStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PgStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            PgStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            PgStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PgStream::Plain(s) => Pin::new(s).poll_flush(cx),
            PgStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PgStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            PgStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Run the SSLRequest exchange and, if agreed, the TLS handshake.
pub async fn negotiate(mut stream: TcpStream, host: &str, mode: TlsMode) -> PgResult<PgStream> {
    if mode == TlsMode::Disable {
        return Ok(PgStream::Plain(stream));
    }

    stream.write_all(&SslRequest.encode()).await?;
    stream.flush().await?;

    let mut answer = [0u8; 1];
    stream.read_exact(&mut answer).await?;

    match answer[0] {
        b'S' => {
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|e| PgError::Tls(format!("Invalid server name '{}': {}", host, e)))?;
            let connector = TlsConnector::from(client_config(mode)?);
            let tls = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| PgError::Tls(format!("handshake failed: {}", e)))?;
            Ok(PgStream::Tls(Box::new(tls)))
        }
        b'N' if mode.is_required() => Err(PgError::Tls(
            "server does not accept TLS connections but sslmode requires it".to_string(),
        )),
        b'N' => Ok(PgStream::Plain(stream)),
        other => Err(PgError::Protocol(format!(
            "Unexpected SSLRequest response: {:#04x}",
            other
        ))),
    }
}

static RELAXED_CONFIG: OnceCell<Arc<ClientConfig>> = OnceCell::new();
static VERIFIED_CONFIG: OnceCell<Arc<ClientConfig>> = OnceCell::new();

/// Client configs are built once per process and shared by every connection.
fn client_config(mode: TlsMode) -> PgResult<Arc<ClientConfig>> {
    match mode {
        TlsMode::VerifyFull => VERIFIED_CONFIG
            .get_or_try_init(build_verified_config)
            .map(Arc::clone),
        _ => RELAXED_CONFIG
            .get_or_try_init(build_relaxed_config)
            .map(Arc::clone),
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn build_verified_config() -> PgResult<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| PgError::Tls(format!("Failed to set TLS versions: {}", e)))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(Arc::new(config))
}

fn build_relaxed_config() -> PgResult<Arc<ClientConfig>> {
    let provider = provider();
    let verifier = AcceptAnyServerCert {
        algorithms: provider.signature_verification_algorithms,
    };

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| PgError::Tls(format!("Failed to set TLS versions: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();

    Ok(Arc::new(config))
}

/// Skips chain validation but still checks handshake signatures, so the
/// session is encrypted to whoever holds the presented certificate's key.
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sslmode() {
        assert_eq!(TlsMode::parse("disable").unwrap(), TlsMode::Disable);
        assert_eq!(TlsMode::parse("allow").unwrap(), TlsMode::Prefer);
        assert_eq!(TlsMode::parse("require").unwrap(), TlsMode::Require);
        assert_eq!(TlsMode::parse("verify-ca").unwrap(), TlsMode::VerifyFull);
        assert!(TlsMode::parse("sometimes").is_err());
    }

    #[test]
    fn test_required_modes() {
        assert!(TlsMode::Require.is_required());
        assert!(TlsMode::VerifyFull.is_required());
        assert!(!TlsMode::Prefer.is_required());
    }

    #[test]
    fn test_client_configs_build() {
        assert!(client_config(TlsMode::Require).is_ok());
        assert!(client_config(TlsMode::VerifyFull).is_ok());
    }
}
