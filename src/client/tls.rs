use crate::helpers::host_name;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// How the collector's certificate is checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsVerification {
    /// Accept any certificate. The collectors are reached through SRV records and have
    /// historically not presented certificates matching those names.
    #[default]
    Insecure,
    /// Verify against the platform trust store
    Webpki,
}

/// Accepts every server certificate while still checking handshake signatures.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
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
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Build the rustls client configuration for the chosen verification mode
pub fn client_config(verification: TlsVerification) -> Result<ClientConfig> {
    let provider = Arc::new(ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .context("no usable TLS protocol versions")?;

    let config = match verification {
        TlsVerification::Insecure => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
            .with_no_client_auth(),
        TlsVerification::Webpki => {
            let mut roots = RootCertStore::empty();
            let native = rustls_native_certs::load_native_certs();
            for err in &native.errors {
                log::warn!("[tls] skipping native certificate: {}", err);
            }
            let (added, ignored) = roots.add_parsable_certificates(native.certs);
            log::debug!("[tls] loaded {} native roots ({} ignored)", added, ignored);
            builder.with_root_certificates(roots).with_no_client_auth()
        }
    };

    Ok(config)
}

/// Byte stream a [`Connection`](super::connection::Connection) can run over
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens the transport to a resolved collector address
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream>;
}

/// Opens TLS connections to collector endpoints.
#[derive(Clone)]
pub struct TlsDialer {
    connector: TlsConnector,
    timeout: Duration,
}

impl TlsDialer {
    pub fn new(verification: TlsVerification, timeout: Duration) -> Result<Self> {
        let config = client_config(verification)?;
        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            timeout,
        })
    }

    /// Connect to `host:port` and complete the TLS handshake within the dial timeout
    pub async fn dial(&self, host: &str, port: u16) -> Result<TlsStream<TcpStream>> {
        let host = host_name(host);
        let address = format!("{}:{}", host, port);
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| anyhow!("invalid server name {}: {}", host, e))?;

        let connect = async {
            let tcp = TcpStream::connect(&address)
                .await
                .with_context(|| format!("failed to connect to {}", address))?;
            tcp.set_nodelay(true)?;
            let tls = self
                .connector
                .connect(server_name, tcp)
                .await
                .with_context(|| format!("TLS handshake with {} failed", address))?;
            Ok::<_, anyhow::Error>(tls)
        };

        tokio::time::timeout(self.timeout, connect)
            .await
            .map_err(|_| anyhow!("timed out connecting to {} after {:?}", address, self.timeout))?
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream> {
        let stream = TlsDialer::dial(self, host, port).await?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_insecure() {
        assert_eq!(TlsVerification::default(), TlsVerification::Insecure);
    }

    #[test]
    fn test_verification_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            mode: TlsVerification,
        }
        let parsed: Wrapper = toml::from_str("mode = \"webpki\"").unwrap();
        assert_eq!(parsed.mode, TlsVerification::Webpki);
        let parsed: Wrapper = toml::from_str("mode = \"insecure\"").unwrap();
        assert_eq!(parsed.mode, TlsVerification::Insecure);
    }

    #[test]
    fn test_insecure_config_builds() {
        assert!(client_config(TlsVerification::Insecure).is_ok());
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dialer = TlsDialer::new(TlsVerification::Insecure, Duration::from_secs(2)).unwrap();
        assert!(dialer.dial("127.0.0.1", port).await.is_err());
    }
}
