use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::{
    server::AllowAnyAuthenticatedClient, Certificate, ClientConfig, PrivateKey, RootCertStore,
    ServerConfig, ServerName,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use crate::error::{Error, Result};

/// Paths to one component's PEM material plus the shared trust anchor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
}

impl TlsFiles {
    /// Resolves `<dir>/<name>_cert.pem`, `<dir>/<name>_key.pem` and `<dir>/ca_cert.pem`.
    pub fn in_dir(dir: impl AsRef<Path>, name: &str) -> Self {
        let dir = dir.as_ref();
        TlsFiles {
            cert: dir.join(format!("{name}_cert.pem")),
            key: dir.join(format!("{name}_key.pem")),
            ca: dir.join("ca_cert.pem"),
        }
    }
}

/// Mutual-TLS material for one node: an acceptor for inbound connections and a connector for
/// outbound ones. Both present the node's own certificate and trust only the shared CA.
#[derive(Clone)]
pub struct TlsContext {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
    server_name: ServerName,
}

impl TlsContext {
    /// Loads certificate, key and CA from disk and builds both rustls configurations.
    ///
    /// Every node on the private network is verified against the same `server_name`, which
    /// must appear in the peers' certificates, instead of the address that was dialled.
    ///
    /// # Errors
    ///
    /// Any missing, unreadable or empty PEM file is an `Error::Tls`. Callers treat this as a
    /// startup failure.
    pub fn load(files: &TlsFiles, server_name: &str) -> Result<Self> {
        debug!("Loading tls material from {:?}", files);
        let certs = load_certs(&files.cert)?;
        let key = load_private_key(&files.key)?;
        let roots = load_root_store(&files.ca)?;

        let verifier = AllowAnyAuthenticatedClient::new(roots.clone()).boxed();
        let server_config = ServerConfig::builder()
            .with_safe_defaults()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs.clone(), key.clone())
            .map_err(|err| Error::Tls(format!("failed to build server config: {err}")))?;

        let client_config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .map_err(|err| Error::Tls(format!("failed to build client config: {err}")))?;

        let server_name = ServerName::try_from(server_name)
            .map_err(|err| Error::Tls(format!("invalid server name {server_name:?}: {err}")))?;

        Ok(TlsContext {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            connector: TlsConnector::from(Arc::new(client_config)),
            server_name,
        })
    }

    pub fn acceptor(&self) -> &TlsAcceptor {
        &self.acceptor
    }

    pub fn connector(&self) -> &TlsConnector {
        &self.connector
    }

    pub fn server_name(&self) -> ServerName {
        self.server_name.clone()
    }
}

fn open_pem(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path)
        .map_err(|err| Error::Tls(format!("failed to open {}: {err}", path.display())))?;
    Ok(BufReader::new(file))
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let mut reader = open_pem(path)?;
    let certs: Vec<Certificate> = rustls_pemfile::certs(&mut reader)
        .map_err(|err| Error::Tls(format!("failed to parse {}: {err}", path.display())))?
        .into_iter()
        .map(Certificate)
        .collect();
    if certs.is_empty() {
        return Err(Error::Tls(format!("no certificate found in {}", path.display())));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let mut reader = open_pem(path)?;
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .map_err(|err| Error::Tls(format!("failed to parse {}: {err}", path.display())))?;
    if keys.len() != 1 {
        return Err(Error::Tls(format!(
            "expected exactly one PKCS#8 private key in {}, found {}",
            path.display(),
            keys.len()
        )));
    }
    Ok(PrivateKey(keys.remove(0)))
}

fn load_root_store(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(&cert)
            .map_err(|err| Error::Tls(format!("invalid CA certificate: {err}")))?;
    }
    Ok(roots)
}

// Whether a handshake failure looks like a plaintext peer talking to a TLS listener.
pub(crate) fn is_tls_mismatch_error(err: &std::io::Error) -> bool {
    matches!(
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>()),
        Some(rustls::Error::InvalidMessage(
            rustls::InvalidMessage::InvalidContentType
        ))
    )
}
