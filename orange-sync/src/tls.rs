//! Mutual-TLS credentials for sync links.
//!
//! Every node is both a TLS server (inbound peers) and a TLS client
//! (outbound scanning). Both directions authenticate against the same shared
//! CA: the server requires a client certificate, and the client verifies the
//! server chain against the CA only, pinned to the fixed [`SERVER_NAME`].
//!
//! Five PEM files are expected in the certificate directory:
//! `ca.crt`, `orange-bot.crt`, `orange-bot.key`, `orange-bot-client.crt`,
//! `orange-bot-client.key`. Failure to load them is fatal at startup.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{self, RootCertStore};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Hostname every node's server certificate is issued for, and the name the
/// client side verifies, regardless of the IP actually dialed.
pub const SERVER_NAME: &str = "orange-bot";

/// Loaded mTLS material, shared by the listener and the outbound scanner.
#[derive(Clone)]
pub struct TlsBundle {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl std::fmt::Debug for TlsBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsBundle")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl TlsBundle {
    /// Load the five PEM files from `dir` and build both directions.
    pub fn load(dir: &Path) -> Result<TlsBundle> {
        // rustls needs an explicit provider selection before any config is built.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let roots = Arc::new(load_roots(&dir.join("ca.crt"))?);

        let server_certs = load_certs(&dir.join("orange-bot.crt"))?;
        let server_key = load_key(&dir.join("orange-bot.key"))?;
        let verifier = WebPkiClientVerifier::builder(Arc::clone(&roots))
            .build()
            .context("failed to build client certificate verifier")?;
        let server_config = rustls::ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(server_certs, server_key)
            .context("invalid server certificate/key pair")?;

        let client_certs = load_certs(&dir.join("orange-bot-client.crt"))?;
        let client_key = load_key(&dir.join("orange-bot-client.key"))?;
        let client_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots.as_ref().clone())
            .with_client_auth_cert(client_certs, client_key)
            .context("invalid client certificate/key pair")?;

        Ok(TlsBundle {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            connector: TlsConnector::from(Arc::new(client_config)),
            server_name: ServerName::try_from(SERVER_NAME)
                .context("pinned server name is not a valid DNS name")?,
        })
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        self.acceptor.clone()
    }

    pub fn connector(&self) -> TlsConnector {
        self.connector.clone()
    }

    /// The pinned server name for outbound verification.
    pub fn server_name(&self) -> ServerName<'static> {
        self.server_name.clone()
    }
}

fn load_roots(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .with_context(|| format!("invalid CA certificate in {}", path.display()))?;
    }
    if roots.is_empty() {
        anyhow::bail!("no CA certificates found in {}", path.display());
    }
    Ok(roots)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)
        .with_context(|| format!("failed to read certificate file {}", path.display()))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse certificates in {}", path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", path.display());
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)
        .with_context(|| format!("failed to read key file {}", path.display()))?;
    rustls_pemfile::private_key(&mut &pem[..])
        .with_context(|| format!("failed to parse private key in {}", path.display()))?
        .with_context(|| format!("no private key found in {}", path.display()))
}
