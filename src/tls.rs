/// TLS upgrade adapter: an injected capability that performs a server-side
/// TLS handshake over the underlying duplex stream and returns a new duplex
/// stream plus TLS metadata (SNI, client certificate).
///
/// Kept as a trait object so the connection engine stays transport-agnostic
/// and can swap streams after a TLS upgrade without becoming generic over
/// every possible upgraded stream type. A consumer can substitute a test
/// double that never actually handshakes.
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls;
use tokio_rustls::LazyConfigAcceptor;

use crate::config::{TlsConfig, TlsMaterial};
use crate::error::{Error, Result};
use crate::state::TlsInfo;

/// Any bidirectional byte stream the engine can drive: a TCP socket, a Unix
/// socket, an in-memory duplex pair, or anything else a consumer wraps.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Duplex for T {}

pub type BoxDuplex = Box<dyn Duplex>;

#[async_trait]
pub trait TlsAcceptor: Send + Sync {
    async fn accept(
        &self,
        stream: BoxDuplex,
        request_client_cert: bool,
    ) -> Result<(BoxDuplex, TlsInfo)>;
}

/// Production adapter built on `tokio-rustls`. Reads the ClientHello first
/// (exposing SNI) before building the `rustls::ServerConfig`, so a
/// [`TlsConfig::Dynamic`] provider can pick per-hostname certificates.
pub struct RustlsTlsAcceptor {
    config: TlsConfig,
}

impl RustlsTlsAcceptor {
    pub fn new(config: TlsConfig) -> Self {
        RustlsTlsAcceptor { config }
    }

    async fn resolve_material(&self, server_name: Option<String>) -> TlsMaterial {
        match &self.config {
            TlsConfig::Static(material) => material.clone(),
            TlsConfig::Dynamic(provider) => provider(server_name).await,
        }
    }

    fn build_server_config(
        material: &TlsMaterial,
        request_client_cert: bool,
    ) -> Result<rustls::ServerConfig> {
        let certs = rustls_pemfile::certs(&mut &material.cert[..])
            .map_err(|e| Error::Tls(format!("invalid certificate PEM: {}", e)))?
            .into_iter()
            .map(rustls::Certificate)
            .collect::<Vec<_>>();

        let mut keys = rustls_pemfile::pkcs8_private_keys(&mut &material.key[..])
            .map_err(|e| Error::Tls(format!("invalid key PEM: {}", e)))?;
        let key = rustls::PrivateKey(
            keys.pop()
                .ok_or_else(|| Error::Tls("no private key found".into()))?,
        );

        let builder = rustls::ServerConfig::builder().with_safe_defaults();

        let config = if request_client_cert {
            let ca = material
                .ca
                .as_ref()
                .ok_or_else(|| Error::Tls("client cert requested but no CA configured".into()))?;
            let mut roots = rustls::RootCertStore::empty();
            for cert in rustls_pemfile::certs(&mut &ca[..])
                .map_err(|e| Error::Tls(format!("invalid CA PEM: {}", e)))?
            {
                roots
                    .add(&rustls::Certificate(cert))
                    .map_err(|e| Error::Tls(format!("invalid CA certificate: {}", e)))?;
            }
            let verifier = rustls::server::AllowAnyAuthenticatedClient::new(roots);
            builder
                .with_client_cert_verifier(Arc::new(verifier))
                .with_single_cert(certs, key)
                .map_err(|e| Error::Tls(e.to_string()))?
        } else {
            builder
                .with_no_client_auth()
                .with_single_cert(certs, key)
                .map_err(|e| Error::Tls(e.to_string()))?
        };

        Ok(config)
    }
}

#[async_trait]
impl TlsAcceptor for RustlsTlsAcceptor {
    async fn accept(
        &self,
        stream: BoxDuplex,
        request_client_cert: bool,
    ) -> Result<(BoxDuplex, TlsInfo)> {
        let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
        tokio::pin!(acceptor);

        let start = acceptor
            .as_mut()
            .await
            .map_err(|e| Error::Tls(e.to_string()))?;

        let server_name = start
            .client_hello()
            .server_name()
            .map(|s| s.to_string());

        let material = self.resolve_material(server_name.clone()).await;
        let server_config = Self::build_server_config(&material, request_client_cert)?;

        let tls_stream = start
            .into_stream(Arc::new(server_config))
            .await
            .map_err(|e| Error::Tls(e.to_string()))?;

        let (_, conn) = tls_stream.get_ref();
        let client_certificate = if request_client_cert {
            conn.peer_certificates()
                .and_then(|certs| certs.first())
                .map(|c| c.0.clone())
        } else {
            None
        };

        let tls_info = TlsInfo {
            server_name,
            client_certificate,
        };

        Ok((Box::new(tls_stream), tls_info))
    }
}

/// Extracts the subject Common Name from a DER-encoded X.509 certificate,
/// used by the default Client Certificate auth validator.
pub fn common_name_from_der(der: &[u8]) -> Option<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_name_from_der_returns_none_on_garbage() {
        assert_eq!(common_name_from_der(b"not a certificate"), None);
    }
}
