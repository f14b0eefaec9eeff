//! Proxy bootstrap: runtime configuration and listener-to-persona wiring.
//!
//! ```text
//! workload ──redirect──► internal ──► Outbound ══preamble══► peer external(-tls) ──► Inbound ──► destination
//! ```
//!
//! Each listener runs its own accept loop task; each accepted connection gets
//! its own session task. The only state shared between sessions is the
//! read-only [`ProxyConfig`].

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{lookup_host, TcpListener};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::certs::Certificates;
use crate::config::Config;
use crate::dialer::{Dialer, TcpDialer};
use crate::listener::{self, Role};
use crate::original_dst::OriginalDestination;
use crate::session::{self, Inbound, Outbound};
use crate::tls::TlsPolicy;

/// Immutable runtime configuration shared by every listener and session.
pub struct ProxyConfig {
    /// Resolved bind address of the internal listener.
    pub bind_ip: IpAddr,
    pub internal_port: u16,
    pub external_port: u16,
    pub external_tls_port: u16,
    /// Next-hop override; when unset the destination's own address is used.
    pub cluster_address: Option<String>,
    /// Bound on upstream dials and TLS handshakes.
    pub dial_timeout: Duration,
    /// Skip the internal listener.
    pub gateway_mode: bool,
    /// Present iff certificates were loaded.
    pub tls: Option<TlsPolicy>,
}

/// Address and port of the sidecar an outbound session dials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextHop {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for NextHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.parse::<Ipv6Addr>().is_ok() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl ProxyConfig {
    /// Build the runtime configuration, resolving the bind address and
    /// constructing the TLS policy when `certs` is present.
    ///
    /// # Errors
    ///
    /// Returns an error if the bind address does not resolve or the
    /// certificate material is malformed.
    pub async fn build(cfg: &Config, certs: Option<&Certificates>) -> Result<Self> {
        let bind_ip = resolve_bind_ip(&cfg.bind_address).await?;
        let tls = certs
            .map(|c| TlsPolicy::from_certificates(c, cfg.tls_server_name()))
            .transpose()
            .context("failed to build TLS policy from mesh certificates")?;

        Ok(Self {
            bind_ip,
            internal_port: cfg.internal_port,
            external_port: cfg.external_port,
            external_tls_port: cfg.external_tls_port,
            cluster_address: cfg.next_hop_override().map(str::to_owned),
            dial_timeout: cfg.dial_timeout(),
            gateway_mode: cfg.gateway_mode,
            tls,
        })
    }

    /// Address of this proxy's internal listener.
    pub fn internal_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.internal_port)
    }

    /// Where an outbound session for `dest` connects: the TLS port when
    /// certificates are loaded, the plaintext port otherwise, on the override
    /// host or else the destination's own address.
    pub fn next_hop(&self, dest: &OriginalDestination) -> NextHop {
        let host = match &self.cluster_address {
            Some(addr) => addr.clone(),
            None => dest.ip.to_string(),
        };
        let port = if self.tls.is_some() {
            self.external_tls_port
        } else {
            self.external_port
        };
        NextHop { host, port }
    }
}

async fn resolve_bind_ip(bind_address: &str) -> Result<IpAddr> {
    if let Ok(ip) = bind_address.parse::<IpAddr>() {
        return Ok(ip);
    }
    let resolved = lookup_host((bind_address, 0))
        .await
        .with_context(|| format!("failed to resolve BIND_ADDRESS {bind_address:?}"))?
        .map(|a| a.ip())
        .min_by_key(|ip| ip.is_ipv6())
        .with_context(|| format!("BIND_ADDRESS {bind_address:?} resolved to no addresses"))?;
    Ok(resolved)
}

/// Bind every enabled listener and serve until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if any listener cannot be bound.
pub async fn run(cfg: Arc<ProxyConfig>, shutdown: CancellationToken) -> Result<()> {
    let dialer: Arc<dyn Dialer> = Arc::new(TcpDialer::new(cfg.dial_timeout));
    let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
    let mut loops = Vec::new();

    if cfg.gateway_mode {
        info!("gateway mode: internal listener disabled");
    } else {
        let listener = listener::bind(Role::Internal, cfg.internal_addr()).await?;
        let outbound = Arc::new(Outbound::new(cfg.clone(), dialer.clone()));
        loops.push(serve_internal(listener, outbound, shutdown.clone()));
    }

    let inbound = Arc::new(Inbound::new(cfg.clone(), dialer));

    let listener = listener::bind(Role::External, SocketAddr::new(any, cfg.external_port)).await?;
    loops.push(serve_external(listener, inbound.clone(), shutdown.clone()));

    if let Some(tls) = &cfg.tls {
        let addr = SocketAddr::new(any, cfg.external_tls_port);
        let listener = listener::bind(Role::ExternalTls, addr).await?;
        loops.push(serve_external_tls(
            listener,
            inbound,
            tls.clone(),
            cfg.dial_timeout,
            shutdown.clone(),
        ));
    }

    for handle in loops {
        handle.await.context("accept loop panicked")?;
    }
    Ok(())
}

/// Internal role: each connection goes to the outbound persona.
pub fn serve_internal(
    listener: TcpListener,
    outbound: Arc<Outbound>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(listener::accept_loop(
        Role::Internal,
        listener,
        shutdown,
        move |stream, peer| {
            let outbound = outbound.clone();
            session::spawn(Role::Internal, peer, async move { outbound.handle(stream).await });
        },
    ))
}

/// External plaintext role: each connection goes to the inbound persona.
pub fn serve_external(
    listener: TcpListener,
    inbound: Arc<Inbound>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(listener::accept_loop(
        Role::External,
        listener,
        shutdown,
        move |stream, peer| {
            let inbound = inbound.clone();
            session::spawn(Role::External, peer, async move { inbound.handle(stream).await });
        },
    ))
}

/// External TLS role: the TLS handshake runs first, then the inbound persona
/// sees the decrypted stream. Refused handshakes never reach the persona.
pub fn serve_external_tls(
    listener: TcpListener,
    inbound: Arc<Inbound>,
    tls: TlsPolicy,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(listener::accept_loop(
        Role::ExternalTls,
        listener,
        shutdown,
        move |stream, peer| {
            let inbound = inbound.clone();
            let tls = tls.clone();
            session::spawn(Role::ExternalTls, peer, async move {
                let stream = tls.accept(stream, handshake_timeout).await?;
                inbound.handle(stream).await
            });
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::test_support::{echo_server, proxy_config, TestPki};
    use common::protocol::{self, RENDEZVOUS_BYTE};
    use rustls::pki_types::ServerName;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;
    use tokio_rustls::TlsConnector;

    const WAIT: Duration = Duration::from_secs(5);

    fn dest(ip: [u8; 4], port: u16) -> OriginalDestination {
        OriginalDestination {
            ip: Ipv4Addr::from(ip),
            port,
        }
    }

    #[tokio::test]
    async fn build_resolves_bind_hostname() {
        let cfg = Config {
            bind_address: "localhost".into(),
            ..test_config()
        };
        let proxy = ProxyConfig::build(&cfg, None).await.unwrap();
        assert!(proxy.bind_ip.is_loopback());
        assert!(proxy.tls.is_none());
        assert_eq!(proxy.dial_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn build_rejects_malformed_certificates() {
        let certs = Certificates {
            ca: b"x".to_vec(),
            cert: b"y".to_vec(),
            key: b"z".to_vec(),
        };
        assert!(ProxyConfig::build(&test_config(), Some(&certs)).await.is_err());
    }

    #[test]
    fn internal_addr_formats_as_preamble() {
        let cfg = proxy_config(18001, None);
        assert_eq!(cfg.internal_addr().to_string(), "127.0.0.1:18000");
    }

    #[test]
    fn next_hop_is_destination_sidecar_by_default() {
        let cfg = proxy_config(18001, None);
        let hop = cfg.next_hop(&dest([10, 0, 0, 5], 8080));
        assert_eq!(hop.to_string(), "10.0.0.5:18001");
    }

    #[test]
    fn next_hop_honours_override() {
        let mut cfg = proxy_config(18001, None);
        cfg.cluster_address = Some("node-a".into());
        assert_eq!(cfg.next_hop(&dest([10, 0, 0, 5], 8080)).to_string(), "node-a:18001");
    }

    #[test]
    fn ipv6_override_renders_as_socket_address() {
        let mut cfg = proxy_config(18001, None);
        cfg.cluster_address = Some("fd00::1".into());
        let hop = cfg.next_hop(&dest([10, 0, 0, 5], 8080));

        assert_eq!(hop.host, "fd00::1");
        assert_eq!(hop.to_string(), "[fd00::1]:18001");
        assert!(hop.to_string().parse::<SocketAddr>().is_ok());
    }

    #[test]
    fn next_hop_uses_tls_port_with_certificates() {
        let pki = TestPki::new();
        let tls = TlsPolicy::from_certificates(&pki.bundle(), None).unwrap();
        let mut cfg = proxy_config(18001, Some(tls));
        assert_eq!(cfg.next_hop(&dest([10, 0, 0, 5], 8080)).port, 18443);

        cfg.cluster_address = Some("10.9.9.9".into());
        assert_eq!(cfg.next_hop(&dest([10, 0, 0, 5], 8080)).to_string(), "10.9.9.9:18443");
    }

    #[tokio::test]
    async fn plaintext_hop_between_two_personas() {
        let echo = echo_server().await;
        let shutdown = CancellationToken::new();

        let external = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut cfg = proxy_config(external.local_addr().unwrap().port(), None);
        cfg.cluster_address = Some("127.0.0.1".into());
        let cfg = Arc::new(cfg);
        let dialer: Arc<dyn Dialer> = Arc::new(TcpDialer::new(WAIT));

        let inbound = Arc::new(Inbound::new(cfg.clone(), dialer.clone()));
        let accept = serve_external(external, inbound, shutdown.clone());

        let outbound = Outbound::new(cfg, dialer);
        let (mut workload, proxy_side) = duplex(1024);
        let echo_ip = match echo.ip() {
            IpAddr::V4(v4) => v4.octets(),
            IpAddr::V6(_) => unreachable!("echo server binds IPv4"),
        };
        let session = tokio::spawn(async move {
            outbound.forward(proxy_side, dest(echo_ip, echo.port())).await
        });

        workload.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut echoed = [0u8; 18];
        timeout(WAIT, workload.read_exact(&mut echoed)).await.unwrap().unwrap();
        assert_eq!(&echoed, b"GET / HTTP/1.1\r\n\r\n");

        drop(workload);
        timeout(WAIT, session).await.unwrap().unwrap().unwrap();

        shutdown.cancel();
        timeout(WAIT, accept).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn tls_listener_relays_peer_without_client_certificate() {
        let pki = TestPki::new();
        let tls = TlsPolicy::from_certificates(&pki.bundle(), None).unwrap();
        let echo = echo_server().await;
        let shutdown = CancellationToken::new();

        let external = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = external.local_addr().unwrap();
        let cfg = Arc::new(proxy_config(18001, Some(tls.clone())));
        let dialer: Arc<dyn Dialer> = Arc::new(TcpDialer::new(WAIT));
        let inbound = Arc::new(Inbound::new(cfg, dialer));
        let accept = serve_external_tls(external, inbound, tls, WAIT, shutdown.clone());

        let anonymous = TlsConnector::from(pki.anonymous_client_config());
        let tcp = TcpStream::connect(addr).await.unwrap();
        let name = ServerName::try_from("127.0.0.1").unwrap().to_owned();
        let mut peer = anonymous.connect(name, tcp).await.unwrap();

        protocol::write_preamble(&mut peer, &echo.to_string()).await.unwrap();
        let mut ack = [0u8; 1];
        timeout(WAIT, peer.read_exact(&mut ack)).await.unwrap().unwrap();
        assert_eq!(ack[0], RENDEZVOUS_BYTE);

        peer.write_all(b"sealed").await.unwrap();
        peer.flush().await.unwrap();
        let mut echoed = [0u8; 6];
        timeout(WAIT, peer.read_exact(&mut echoed)).await.unwrap().unwrap();
        assert_eq!(&echoed, b"sealed");

        shutdown.cancel();
        timeout(WAIT, accept).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn tls_hop_between_two_personas() {
        let pki = TestPki::new();
        let tls = TlsPolicy::from_certificates(&pki.bundle(), None).unwrap();
        let echo = echo_server().await;
        let shutdown = CancellationToken::new();

        let external = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut cfg = proxy_config(18001, Some(tls.clone()));
        cfg.external_tls_port = external.local_addr().unwrap().port();
        cfg.cluster_address = Some("127.0.0.1".into());
        let cfg = Arc::new(cfg);
        let dialer: Arc<dyn Dialer> = Arc::new(TcpDialer::new(WAIT));

        let inbound = Arc::new(Inbound::new(cfg.clone(), dialer.clone()));
        let accept = serve_external_tls(external, inbound, tls, WAIT, shutdown.clone());

        let outbound = Outbound::new(cfg, dialer);
        let (mut workload, proxy_side) = duplex(1024);
        let echo_ip = match echo.ip() {
            IpAddr::V4(v4) => v4.octets(),
            IpAddr::V6(_) => unreachable!("echo server binds IPv4"),
        };
        let session = tokio::spawn(async move {
            outbound.forward(proxy_side, dest(echo_ip, echo.port())).await
        });

        workload.write_all(b"mtls").await.unwrap();
        let mut echoed = [0u8; 4];
        timeout(WAIT, workload.read_exact(&mut echoed)).await.unwrap().unwrap();
        assert_eq!(&echoed, b"mtls");

        drop(workload);
        timeout(WAIT, session).await.unwrap().unwrap().unwrap();
        shutdown.cancel();
        timeout(WAIT, accept).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn run_fails_when_external_port_is_taken() {
        let taken = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let mut cfg = proxy_config(taken.local_addr().unwrap().port(), None);
        cfg.gateway_mode = true;

        let err = run(Arc::new(cfg), CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("external"));
    }
}
