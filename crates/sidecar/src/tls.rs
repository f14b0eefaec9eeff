//! Mutual-TLS policy between sidecars.
//!
//! Both directions use the same bundle: the leaf certificate is the server
//! identity on the external TLS listener and the client identity when dialing
//! a next hop, and the CA bundle is the single trust root for both.
//!
//! Client certificates are requested but optional on the listener. A peer that
//! presents none is accepted; a peer that presents one not issued by the mesh
//! CA is refused during the handshake.

use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use common::ProxyError;
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

use crate::certs::Certificates;

/// Ready-to-use TLS acceptor and connector built from one [`Certificates`] bundle.
#[derive(Clone)]
pub struct TlsPolicy {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
    server_name: Option<ServerName<'static>>,
}

impl TlsPolicy {
    /// Build both sides of the policy.
    ///
    /// `server_name` overrides the name checked against the next hop's
    /// certificate; by default the dialed host is used.
    ///
    /// # Errors
    ///
    /// Returns an error if any PEM blob cannot be parsed or rustls rejects the
    /// resulting configuration.
    pub fn from_certificates(certs: &Certificates, server_name: Option<&str>) -> Result<Self> {
        let server_name = server_name
            .map(|name| {
                ServerName::try_from(name)
                    .map(|n| n.to_owned())
                    .with_context(|| format!("invalid TLS_SERVER_NAME {name:?}"))
            })
            .transpose()?;

        Ok(Self {
            acceptor: TlsAcceptor::from(build_server_config(certs)?),
            connector: TlsConnector::from(build_client_config(certs)?),
            server_name,
        })
    }

    /// Perform the server-side handshake on an accepted connection.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Handshake`] if the handshake fails, the client
    /// certificate is not trusted, or `limit` elapses.
    pub async fn accept(
        &self,
        stream: TcpStream,
        limit: Duration,
    ) -> Result<server::TlsStream<TcpStream>, ProxyError> {
        match timeout(limit, self.acceptor.accept(stream)).await {
            Ok(Ok(tls)) => Ok(tls),
            Ok(Err(e)) => Err(ProxyError::Handshake(format!("TLS accept failed: {e}"))),
            Err(_) => Err(ProxyError::Handshake("TLS accept timed out".into())),
        }
    }

    /// Perform the client-side handshake towards next hop `host`.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Dial`] if the server name is invalid, the server
    /// certificate is not trusted, or `limit` elapses.
    pub async fn connect(
        &self,
        host: &str,
        stream: TcpStream,
        limit: Duration,
    ) -> Result<client::TlsStream<TcpStream>, ProxyError> {
        let name = match &self.server_name {
            Some(name) => name.clone(),
            None => ServerName::try_from(host)
                .map(|n| n.to_owned())
                .map_err(|e| ProxyError::dial(host, std::io::Error::other(e)))?,
        };

        match timeout(limit, self.connector.connect(name, stream)).await {
            Ok(Ok(tls)) => Ok(tls),
            Ok(Err(e)) => Err(ProxyError::dial(host, e)),
            Err(_) => Err(ProxyError::dial(
                host,
                std::io::Error::new(std::io::ErrorKind::TimedOut, "TLS handshake timed out"),
            )),
        }
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// Build the listener's [`ServerConfig`]: leaf certificate as server identity,
/// optional client authentication against the mesh CA.
///
/// # Errors
///
/// Returns an error if the certificates or key cannot be parsed, or if rustls
/// rejects the configuration.
pub fn build_server_config(certs: &Certificates) -> Result<Arc<ServerConfig>> {
    let chain = parse_certs(&certs.cert).context("failed to parse leaf certificate")?;
    let key = parse_key(&certs.key)?;
    let roots = Arc::new(parse_roots(&certs.ca)?);

    let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider())
        .allow_unauthenticated()
        .build()
        .context("failed to build client certificate verifier")?;

    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .context("failed to select TLS protocol versions")?
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)
        .context("failed to build rustls ServerConfig")?;

    Ok(Arc::new(config))
}

/// Build the dialer's [`ClientConfig`]: mesh CA as the only trust root, leaf
/// certificate as client identity.
///
/// # Errors
///
/// Returns an error if the certificates or key cannot be parsed, or if rustls
/// rejects the configuration.
pub fn build_client_config(certs: &Certificates) -> Result<Arc<ClientConfig>> {
    let chain = parse_certs(&certs.cert).context("failed to parse leaf certificate")?;
    let key = parse_key(&certs.key)?;
    let roots = parse_roots(&certs.ca)?;

    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .context("failed to select TLS protocol versions")?
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)
        .context("failed to build rustls ClientConfig")?;

    Ok(Arc::new(config))
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .context("malformed PEM certificate data")?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in PEM data");
    }
    Ok(certs)
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut BufReader::new(pem))
        .context("failed to read TLS private key")?
        .context("no private key found in PEM data")
}

fn parse_roots(pem: &[u8]) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certs(pem).context("failed to parse CA bundle")? {
        roots.add(cert).context("failed to add CA certificate")?;
    }
    Ok(roots)
}
