//! TLS upgrade for MySQL connections.
//!
//! MySQL negotiates TLS in-band: the client answers the greeting with a
//! 32-byte SSL request, both sides run a TLS handshake over the same
//! socket, and the handshake response is then sent encrypted.
//!
//! The connection only depends on the [`TlsUpgrade`] trait. With the `tls`
//! feature enabled, [`RustlsUpgrade`] implements it on top of rustls:
//!
//! ```toml
//! [dependencies]
//! sqlwire-mysql = { version = "0.1", features = ["tls"] }
//! ```
//!
//! Certificate handling by mode:
//! - `Preferred`, `Required`: encrypted, certificate not checked
//! - `VerifyCa`: chain checked against the CA bundle, hostname ignored
//! - `VerifyIdentity`: chain and hostname checked

use sqlwire_core::Result;
use sqlwire_core::error::{ConnectionError, ConnectionErrorKind};
use sqlwire_core::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream the connection can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> AsyncStream for T {}

/// Type-erased transport, plain TCP or TLS.
pub type BoxedStream = Box<dyn AsyncStream>;

pub use futures::future::BoxFuture;

/// Turns a plaintext stream into an encrypted one.
pub trait TlsUpgrade: Send + Sync {
    /// Run the TLS handshake over `stream`. `host` is the configured
    /// server host, used for SNI and identity checks.
    fn upgrade<'a>(&'a self, stream: BoxedStream, host: &'a str)
    -> BoxFuture<'a, Result<BoxedStream>>;
}

pub(crate) fn tls_error(
    message: impl Into<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Ssl,
        message: message.into(),
        source,
    })
}

#[cfg(feature = "tls")]
pub use rustls_impl::RustlsUpgrade;

#[cfg(feature = "tls")]
mod rustls_impl {
    use std::fs::File;
    use std::io::BufReader;
    use std::path::Path;
    use std::sync::Arc;

    use rustls::client::WebPkiServerVerifier;
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::CryptoProvider;
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{CertificateError, DigitallySignedStruct, RootCertStore, SignatureScheme};
    use tokio_rustls::TlsConnector;

    use super::{BoxFuture, BoxedStream, TlsUpgrade, tls_error};
    use crate::config::{SslMode, TlsConfig};
    use sqlwire_core::Result;

    /// rustls-backed [`TlsUpgrade`].
    #[derive(Clone)]
    pub struct RustlsUpgrade {
        connector: TlsConnector,
        server_name: Option<String>,
    }

    impl std::fmt::Debug for RustlsUpgrade {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("RustlsUpgrade")
                .field("server_name", &self.server_name)
                .finish_non_exhaustive()
        }
    }

    impl RustlsUpgrade {
        /// Build the client configuration for `mode`.
        ///
        /// Certificate files are read here, so a bad path fails before any
        /// connection is attempted.
        pub fn new(tls: &TlsConfig, mode: SslMode) -> Result<Self> {
            tls.validate()?;
            let provider = Arc::new(rustls::crypto::ring::default_provider());

            let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
                .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
                .map_err(|e| tls_error(format!("failed to set TLS versions: {e}"), None))?;

            let builder = if tls.danger_skip_verify || !mode.verifies_certificate() {
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
            } else {
                let roots = match &tls.ca_cert_path {
                    Some(path) => load_roots(path)?,
                    None => {
                        let mut roots = RootCertStore::empty();
                        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                        roots
                    }
                };
                let webpki = WebPkiServerVerifier::builder_with_provider(
                    Arc::new(roots),
                    provider.clone(),
                )
                .build()
                .map_err(|e| tls_error(format!("invalid CA bundle: {e}"), Some(Box::new(e))))?;

                if mode == SslMode::VerifyCa {
                    builder
                        .dangerous()
                        .with_custom_certificate_verifier(Arc::new(IgnoreHostname(webpki)))
                } else {
                    builder.with_webpki_verifier(webpki)
                }
            };

            let config = match (&tls.client_cert_path, &tls.client_key_path) {
                (Some(cert), Some(key)) => {
                    let certs = load_certs(cert)?;
                    let key = load_key(key)?;
                    builder.with_client_auth_cert(certs, key).map_err(|e| {
                        tls_error(format!("failed to configure client auth: {e}"), None)
                    })?
                }
                _ => builder.with_no_client_auth(),
            };

            Ok(Self {
                connector: TlsConnector::from(Arc::new(config)),
                server_name: tls.server_name.clone(),
            })
        }
    }

    impl TlsUpgrade for RustlsUpgrade {
        fn upgrade<'a>(
            &'a self,
            stream: BoxedStream,
            host: &'a str,
        ) -> BoxFuture<'a, Result<BoxedStream>> {
            Box::pin(async move {
                let name = self.server_name.as_deref().unwrap_or(host);
                let server_name = ServerName::try_from(name.to_string()).map_err(|e| {
                    tls_error(format!("invalid server name '{name}': {e}"), None)
                })?;
                let tls = self
                    .connector
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| {
                        tls_error(format!("TLS handshake failed: {e}"), Some(Box::new(e)))
                    })?;
                Ok(Box::new(tls) as BoxedStream)
            })
        }
    }

    fn open(path: &Path, what: &str) -> Result<BufReader<File>> {
        File::open(path).map(BufReader::new).map_err(|e| {
            tls_error(
                format!("failed to open {what} '{}': {e}", path.display()),
                Some(Box::new(e)),
            )
        })
    }

    fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
        let certs = rustls_pemfile::certs(&mut open(path, "certificate")?)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| tls_error(format!("failed to parse certificate: {e}"), None))?;
        if certs.is_empty() {
            return Err(tls_error(
                format!("no certificates found in '{}'", path.display()),
                None,
            ));
        }
        Ok(certs)
    }

    fn load_roots(path: &Path) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(path)? {
            roots
                .add(cert)
                .map_err(|e| tls_error(format!("failed to add CA certificate: {e}"), None))?;
        }
        Ok(roots)
    }

    fn load_key(path: &Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
        rustls_pemfile::private_key(&mut open(path, "private key")?)
            .map_err(|e| tls_error(format!("failed to parse private key: {e}"), None))?
            .ok_or_else(|| {
                tls_error(format!("no private key found in '{}'", path.display()), None)
            })
    }

    /// Encrypts without authenticating the server.
    #[derive(Debug)]
    struct AcceptAnyCert(Arc<CryptoProvider>);

    impl ServerCertVerifier for AcceptAnyCert {
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
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }

    /// Checks the chain but accepts any hostname.
    #[derive(Debug)]
    struct IgnoreHostname(Arc<WebPkiServerVerifier>);

    impl ServerCertVerifier for IgnoreHostname {
        fn verify_server_cert(
            &self,
            end_entity: &CertificateDer<'_>,
            intermediates: &[CertificateDer<'_>],
            server_name: &ServerName<'_>,
            ocsp_response: &[u8],
            now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, rustls::Error> {
            match self.0.verify_server_cert(
                end_entity,
                intermediates,
                server_name,
                ocsp_response,
                now,
            ) {
                Err(rustls::Error::InvalidCertificate(
                    CertificateError::NotValidForName
                    | CertificateError::NotValidForNameContext { .. },
                )) => Ok(ServerCertVerified::assertion()),
                other => other,
            }
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            self.0.verify_tls12_signature(message, cert, dss)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            self.0.verify_tls13_signature(message, cert, dss)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.supported_verify_schemes()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_builds_for_every_mode() {
            for mode in [
                SslMode::Preferred,
                SslMode::Required,
                SslMode::VerifyCa,
                SslMode::VerifyIdentity,
            ] {
                assert!(RustlsUpgrade::new(&TlsConfig::new(), mode).is_ok(), "{mode:?}");
            }
        }

        #[test]
        fn test_missing_ca_file() {
            let tls = TlsConfig::new().ca_cert("/nonexistent/ca.pem");
            let err = RustlsUpgrade::new(&tls, SslMode::VerifyCa).unwrap_err();
            assert!(matches!(
                err,
                sqlwire_core::Error::Connection(ref c)
                    if c.kind == sqlwire_core::ConnectionErrorKind::Ssl
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Refuse;

    impl TlsUpgrade for Refuse {
        fn upgrade<'a>(
            &'a self,
            _stream: BoxedStream,
            host: &'a str,
        ) -> BoxFuture<'a, Result<BoxedStream>> {
            Box::pin(async move { Err(tls_error(format!("refusing {host}"), None)) })
        }
    }

    #[tokio::test]
    async fn test_upgrade_is_object_safe() {
        let upgrader: Box<dyn TlsUpgrade> = Box::new(Refuse);
        let (client, _server) = tokio::io::duplex(64);
        let err = upgrader
            .upgrade(Box::new(client), "db.internal")
            .await
            .err()
            .expect("upgrade refused");
        assert!(err.to_string().contains("db.internal"));
    }
}
