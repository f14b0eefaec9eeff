//! Fixtures shared by unit tests: throwaway PKI, echo destination, configs.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use tokio::io;
use tokio::net::TcpListener;

use crate::certs::Certificates;
use crate::proxy::ProxyConfig;
use crate::tls::TlsPolicy;

/// A mesh CA plus one leaf issued for `localhost` / `127.0.0.1`.
pub struct TestPki {
    ca_pem: String,
    leaf_pem: String,
    leaf_key_pem: String,
}

impl TestPki {
    pub fn new() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "mesh test CA");
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let mut leaf_params =
            CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])
                .unwrap();
        leaf_params
            .distinguished_name
            .push(DnType::CommonName, "mesh sidecar");
        leaf_params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let leaf = leaf_params.signed_by(&leaf_key, &ca, &ca_key).unwrap();

        Self {
            ca_pem: ca.pem(),
            leaf_pem: leaf.pem(),
            leaf_key_pem: leaf_key.serialize_pem(),
        }
    }

    pub fn bundle(&self) -> Certificates {
        Certificates {
            ca: self.ca_pem.clone().into_bytes(),
            cert: self.leaf_pem.clone().into_bytes(),
            key: self.leaf_key_pem.clone().into_bytes(),
        }
    }

    fn roots(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        roots.add(first_cert(&self.ca_pem)).unwrap();
        roots
    }

    /// Client that trusts this CA but presents no certificate.
    pub fn anonymous_client_config(&self) -> Arc<ClientConfig> {
        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(self.roots())
        .with_no_client_auth();
        Arc::new(config)
    }

    /// Client presenting this PKI's leaf while trusting `server`'s CA.
    pub fn client_config_trusting(&self, server: &TestPki) -> Arc<ClientConfig> {
        let chain = vec![first_cert(&self.leaf_pem)];
        let key: PrivateKeyDer<'static> =
            rustls_pemfile::private_key(&mut self.leaf_key_pem.as_bytes())
                .unwrap()
                .unwrap();
        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(server.roots())
        .with_client_auth_cert(chain, key)
        .unwrap();
        Arc::new(config)
    }
}

fn first_cert(pem: &str) -> CertificateDer<'static> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .next()
        .unwrap()
        .unwrap()
}

/// Runtime config on loopback: internal `127.0.0.1:18000`, TLS port 18443.
pub fn proxy_config(external_port: u16, tls: Option<TlsPolicy>) -> ProxyConfig {
    ProxyConfig {
        bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        internal_port: 18000,
        external_port,
        external_tls_port: 18443,
        cluster_address: None,
        dial_timeout: Duration::from_secs(5),
        gateway_mode: false,
        tls,
    }
}

/// A destination that echoes every byte back until its peer closes.
pub async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.into_split();
                let _ = io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}
