//! Secure-transport strategy for `wss://` connections.
//!
//! The engine treats the transport as an opaque duplex byte stream; the
//! choice between plain TCP and TLS is made at runtime from the URL scheme
//! via [`MaybeTls`]. The rustls backend lives behind the default-on
//! `tls-rustls` feature.

use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::error::{Error, Result};

/// TLS settings for secure connections.
///
/// All fields are optional; the defaults verify the peer against the
/// bundled webpki roots with no client certificate.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// PEM file with additional trusted root certificates. When set, it
    /// replaces the bundled roots.
    pub ca_file: Option<PathBuf>,
    /// PEM file with the client certificate chain.
    pub client_cert: Option<PathBuf>,
    /// PEM file with the client private key; required with `client_cert`.
    pub client_key: Option<PathBuf>,
    /// Disable peer certificate verification. Only for test setups.
    pub insecure_skip_verify: bool,
}

/// A transport stream that is either plain TCP or TLS over TCP.
pub enum MaybeTls {
    /// Unencrypted TCP (`ws://`).
    Plain(TcpStream),
    /// TLS over TCP (`wss://`).
    #[cfg(feature = "tls-rustls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTls {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "tls-rustls")]
            MaybeTls::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTls {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "tls-rustls")]
            MaybeTls::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "tls-rustls")]
            MaybeTls::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "tls-rustls")]
            MaybeTls::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Wrap `tcp` in a TLS session for `domain` according to `options`.
///
/// # Errors
///
/// Returns [`Error::Tls`] for configuration problems (unreadable files, bad
/// server name) and handshake failures.
#[cfg(feature = "tls-rustls")]
pub async fn connect_tls(options: &TlsOptions, domain: &str, tcp: TcpStream) -> Result<MaybeTls> {
    use std::sync::Arc;

    use rustls::pki_types::ServerName;

    let config = rustls_impl::client_config(options)?;
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

    let server_name = ServerName::try_from(domain.to_string())
        .map_err(|_| Error::Tls(format!("invalid server name: {domain}")))?;

    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| Error::Tls(e.to_string()))?;

    Ok(MaybeTls::Tls(Box::new(stream)))
}

/// Stub used when the crate is built without a TLS backend.
#[cfg(not(feature = "tls-rustls"))]
pub async fn connect_tls(_options: &TlsOptions, _domain: &str, _tcp: TcpStream) -> Result<MaybeTls> {
    Err(Error::Tls(
        "wss:// requires the tls-rustls feature".to_string(),
    ))
}

#[cfg(feature = "tls-rustls")]
mod rustls_impl {
    use std::fs::File;
    use std::io::BufReader;
    use std::path::Path;
    use std::sync::Arc;

    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
    use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

    use super::TlsOptions;
    use crate::error::{Error, Result};

    fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
        let file = File::open(path)
            .map_err(|e| Error::Tls(format!("cannot open {}: {e}", path.display())))?;
        let certs: std::io::Result<Vec<_>> = rustls_pemfile::certs(&mut BufReader::new(file)).collect();
        let certs = certs.map_err(|e| Error::Tls(format!("bad PEM in {}: {e}", path.display())))?;
        if certs.is_empty() {
            return Err(Error::Tls(format!(
                "no certificates found in {}",
                path.display()
            )));
        }
        Ok(certs)
    }

    fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
        let file = File::open(path)
            .map_err(|e| Error::Tls(format!("cannot open {}: {e}", path.display())))?;
        rustls_pemfile::private_key(&mut BufReader::new(file))
            .map_err(|e| Error::Tls(format!("bad PEM in {}: {e}", path.display())))?
            .ok_or_else(|| Error::Tls(format!("no private key found in {}", path.display())))
    }

    pub(super) fn client_config(options: &TlsOptions) -> Result<ClientConfig> {
        let mut roots = RootCertStore::empty();
        match &options.ca_file {
            Some(path) => {
                for cert in load_certs(path)? {
                    roots
                        .add(cert)
                        .map_err(|e| Error::Tls(format!("bad CA certificate: {e}")))?;
                }
            }
            None => {
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            }
        }

        let builder = ClientConfig::builder().with_root_certificates(roots);

        let mut config = match (&options.client_cert, &options.client_key) {
            (Some(cert), Some(key)) => builder
                .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
                .map_err(|e| Error::Tls(format!("client certificate rejected: {e}")))?,
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(Error::Tls(
                    "client certificate and key must be set together".to_string(),
                ));
            }
        };

        if options.insecure_skip_verify {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(AcceptAnyCert));
        }

        Ok(config)
    }

    /// Verifier used with `insecure_skip_verify`: accepts every certificate.
    #[derive(Debug)]
    struct AcceptAnyCert;

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
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ECDSA_NISTP521_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = TlsOptions::default();
        assert!(options.ca_file.is_none());
        assert!(options.client_cert.is_none());
        assert!(options.client_key.is_none());
        assert!(!options.insecure_skip_verify);
    }

    #[cfg(feature = "tls-rustls")]
    #[tokio::test]
    async fn test_missing_ca_file_is_tls_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let tcp = TcpStream::connect(addr).await.unwrap();

        let options = TlsOptions {
            ca_file: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..TlsOptions::default()
        };
        let result = connect_tls(&options, "localhost", tcp).await;
        assert!(matches!(result, Err(Error::Tls(_))));
    }

    #[cfg(feature = "tls-rustls")]
    #[tokio::test]
    async fn test_cert_without_key_is_rejected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let tcp = TcpStream::connect(addr).await.unwrap();

        let options = TlsOptions {
            client_cert: Some(PathBuf::from("/tmp/cert.pem")),
            ..TlsOptions::default()
        };
        let result = connect_tls(&options, "localhost", tcp).await;
        assert!(matches!(result, Err(Error::Tls(_))));
    }
}
