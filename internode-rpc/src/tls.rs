//! TLS material for encrypted connections.
//!
//! A [`CredentialsBuilder`] reads PEM files and produces a [`TlsContext`]
//! holding both directions: a rustls connector for outbound dials and an
//! acceptor for inbound listeners. Nodes in a mesh usually share one CA;
//! peers are verified against it, with the node's own certificate doubling
//! as the trust root when no CA is configured.

use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use internode_core::RpcError;

/// Ready-to-use TLS material for one node.
#[derive(Clone)]
pub struct TlsContext {
    /// Connector for outbound dials.
    pub connector: TlsConnector,
    /// Acceptor for inbound listeners.
    pub acceptor: TlsAcceptor,
}

/// Builds a [`TlsContext`] from PEM files on disk.
#[derive(Debug, Clone)]
pub struct CredentialsBuilder {
    cert_path: PathBuf,
    key_path: PathBuf,
    ca_path: Option<PathBuf>,
}

impl CredentialsBuilder {
    /// Builder for a node certificate and private key.
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            ca_path: None,
        }
    }

    /// Trust peers signed by this CA instead of the node certificate.
    pub fn with_ca(mut self, ca_path: impl Into<PathBuf>) -> Self {
        self.ca_path = Some(ca_path.into());
        self
    }

    /// Read the PEM material and build both directions.
    ///
    /// # Errors
    ///
    /// [`RpcError::Io`] when a file is unreadable or the material is
    /// rejected by rustls.
    pub fn build(&self) -> Result<TlsContext, RpcError> {
        let certs = load_certs(&self.cert_path)?;
        let key = load_key(&self.key_path)?;

        let mut roots = RootCertStore::empty();
        let trust_anchors = match &self.ca_path {
            Some(ca) => load_certs(ca)?,
            None => certs.clone(),
        };
        for anchor in trust_anchors {
            roots
                .add(anchor)
                .map_err(|e| tls_error("trust anchor rejected", e))?;
        }

        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs.clone(), key.clone_key())
            .map_err(|e| tls_error("server credentials rejected", e))?;

        let client_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(TlsContext {
            connector: TlsConnector::from(Arc::new(client_config)),
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
        })
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, RpcError> {
    let file = std::fs::File::open(path).map_err(|e| RpcError::Io {
        message: format!("cannot open certificate {}: {}", path.display(), e),
    })?;
    let mut reader = BufReader::new(file);
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut reader).collect();
    let certs = certs.map_err(|e| RpcError::Io {
        message: format!("malformed certificate {}: {}", path.display(), e),
    })?;
    if certs.is_empty() {
        return Err(RpcError::Io {
            message: format!("no certificates in {}", path.display()),
        });
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, RpcError> {
    let file = std::fs::File::open(path).map_err(|e| RpcError::Io {
        message: format!("cannot open private key {}: {}", path.display(), e),
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| RpcError::Io {
            message: format!("malformed private key {}: {}", path.display(), e),
        })?
        .ok_or_else(|| RpcError::Io {
            message: format!("no private key in {}", path.display()),
        })
}

fn tls_error(context: &str, err: impl std::fmt::Display) -> RpcError {
    RpcError::Io {
        message: format!("{}: {}", context, err),
    }
}
