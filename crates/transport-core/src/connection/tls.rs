use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_rustls::rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName};
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};
use tracing::{debug, info};

use crate::config::TlsSettings;
use crate::error::{Error, Result};

/// Client and server TLS configuration shared by every TLS connection
#[derive(Clone)]
pub struct TlsContext {
    connector: TlsConnector,
    acceptor: Option<TlsAcceptor>,
    handshake_timeout: Duration,
}

impl TlsContext {
    /// Build from configured certificate material
    ///
    /// Without `ca_path` the trust store is empty and outbound handshakes
    /// fail verification. Without `cert_path`/`key_path` the context cannot
    /// accept connections.
    pub fn from_settings(settings: &TlsSettings, handshake_timeout: Duration) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        if let Some(ca_path) = &settings.ca_path {
            for cert in load_certs(ca_path)? {
                roots
                    .add(&cert)
                    .map_err(|e| Error::tls(format!("bad CA certificate in {}: {}", ca_path.display(), e)))?;
            }
            info!("Loaded {} trusted CAs from {}", roots.len(), ca_path.display());
        }

        #[allow(unused_mut)]
        let mut client = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth();

        #[cfg(feature = "dev-insecure-tls")]
        if settings.insecure_skip_verify {
            tracing::warn!("TLS server certificate verification is disabled");
            client
                .dangerous()
                .set_certificate_verifier(Arc::new(insecure::NoVerification));
        }

        let server = match (&settings.cert_path, &settings.key_path) {
            (Some(cert_path), Some(key_path)) => {
                let certs = load_certs(cert_path)?;
                let key = load_key(key_path)?;
                let config = ServerConfig::builder()
                    .with_safe_defaults()
                    .with_no_client_auth()
                    .with_single_cert(certs, key)
                    .map_err(|e| Error::tls(format!("invalid certificate/key pair: {}", e)))?;
                Some(config)
            }
            (None, None) => None,
            _ => return Err(Error::config("tls.cert_path and tls.key_path must be set together")),
        };

        Ok(Self::new(client, server, handshake_timeout))
    }

    pub fn new(client: ClientConfig, server: Option<ServerConfig>, handshake_timeout: Duration) -> Self {
        Self {
            connector: TlsConnector::from(Arc::new(client)),
            acceptor: server.map(|config| TlsAcceptor::from(Arc::new(config))),
            handshake_timeout,
        }
    }

    /// True when a server certificate is loaded
    pub fn can_accept(&self) -> bool {
        self.acceptor.is_some()
    }

    /// Client handshake over `stream`; `server_name` defaults to the peer address
    pub(crate) async fn connect(
        &self,
        server_name: Option<&str>,
        remote: SocketAddr,
        stream: TcpStream,
    ) -> Result<client::TlsStream<TcpStream>> {
        let name = match server_name {
            Some(name) => ServerName::try_from(name).map_err(|e| Error::HandshakeFailed {
                remote,
                reason: format!("invalid server name {}: {}", name, e),
            })?,
            None => ServerName::IpAddress(remote.ip()),
        };

        debug!("TLS handshake with {} as {:?}", remote, name);
        match tokio::time::timeout(self.handshake_timeout, self.connector.connect(name, stream)).await {
            Ok(Ok(tls)) => Ok(tls),
            Ok(Err(e)) => Err(Error::HandshakeFailed {
                remote,
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::HandshakeFailed {
                remote,
                reason: format!("timed out after {:?}", self.handshake_timeout),
            }),
        }
    }

    /// Server handshake over an accepted `stream`
    pub(crate) async fn accept(&self, remote: SocketAddr, stream: TcpStream) -> Result<server::TlsStream<TcpStream>> {
        let acceptor = self
            .acceptor
            .as_ref()
            .ok_or_else(|| Error::tls("no server certificate configured"))?;
        match tokio::time::timeout(self.handshake_timeout, acceptor.accept(stream)).await {
            Ok(Ok(tls)) => Ok(tls),
            Ok(Err(e)) => Err(Error::HandshakeFailed {
                remote,
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::HandshakeFailed {
                remote,
                reason: format!("timed out after {:?}", self.handshake_timeout),
            }),
        }
    }
}

fn open(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| Error::tls(format!("cannot open {}: {}", path.display(), e)))
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .map_err(|e| Error::tls(format!("cannot parse certificates in {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(Error::tls(format!("no certificates in {}", path.display())));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

/// First PKCS#8 key in the file, else the first RSA key
fn load_key(path: &Path) -> Result<PrivateKey> {
    let parse_error = |e: std::io::Error| Error::tls(format!("cannot parse key in {}: {}", path.display(), e));

    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut open(path)?).map_err(parse_error)?;
    if keys.is_empty() {
        keys = rustls_pemfile::rsa_private_keys(&mut open(path)?).map_err(parse_error)?;
    }
    keys.into_iter()
        .next()
        .map(PrivateKey)
        .ok_or_else(|| Error::tls(format!("no private key in {}", path.display())))
}

#[cfg(feature = "dev-insecure-tls")]
mod insecure {
    use std::time::SystemTime;

    use tokio_rustls::rustls::client::{ServerCertVerified, ServerCertVerifier};
    use tokio_rustls::rustls::{Certificate, Error, ServerName};

    pub(super) struct NoVerification;

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &Certificate,
            _intermediates: &[Certificate],
            _server_name: &ServerName,
            _scts: &mut dyn Iterator<Item = &[u8]>,
            _ocsp_response: &[u8],
            _now: SystemTime,
        ) -> std::result::Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_client_only_context() {
        let context = TlsContext::from_settings(&TlsSettings::default(), Duration::from_secs(3)).unwrap();
        assert!(!context.can_accept());
    }

    #[test]
    fn test_missing_material_is_tls_error() {
        let settings = TlsSettings {
            cert_path: Some(PathBuf::from("/nonexistent/cert.pem")),
            key_path: Some(PathBuf::from("/nonexistent/key.pem")),
            ..Default::default()
        };
        let err = TlsContext::from_settings(&settings, Duration::from_secs(3)).err().unwrap();
        assert!(matches!(err, Error::Tls(_)));

        let half = TlsSettings {
            cert_path: Some(PathBuf::from("/nonexistent/cert.pem")),
            ..Default::default()
        };
        assert!(matches!(
            TlsContext::from_settings(&half, Duration::from_secs(3)),
            Err(Error::Config(_))
        ));
    }
}
