use std::sync::Arc;

use common::{protocol, ProxyError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::dialer::Dialer;
use crate::original_dst::{self, OriginalDestination};
use crate::proxy::ProxyConfig;
use crate::relay::relay;

/// Outbound persona: carries a redirected workload connection to the sidecar
/// next to its destination.
///
/// Steps, strictly in order: resolve original destination, dial next hop
/// (TLS when certificates are loaded), send preamble, await rendezvous, relay.
pub struct Outbound {
    cfg: Arc<ProxyConfig>,
    dialer: Arc<dyn Dialer>,
}

impl Outbound {
    pub fn new(cfg: Arc<ProxyConfig>, dialer: Arc<dyn Dialer>) -> Self {
        Self { cfg, dialer }
    }

    /// Handle a connection accepted on the internal listener.
    pub async fn handle(&self, client: TcpStream) -> Result<(), ProxyError> {
        let dest = original_dst::resolve(&client)?;
        self.forward(client, dest).await
    }

    /// Everything after destination recovery; `client` may be any stream.
    pub async fn forward<C>(&self, client: C, dest: OriginalDestination) -> Result<(), ProxyError>
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
    {
        let hop = self.cfg.next_hop(&dest);
        let target = dest.to_string();
        let upstream = self.dialer.dial(hop.to_string()).await?;

        match &self.cfg.tls {
            Some(tls) => {
                let upstream = tls.connect(&hop.host, upstream, self.cfg.dial_timeout).await?;
                debug!(next_hop = %hop, %target, tls = true, "connected to next hop");
                exchange(client, upstream, &target).await
            }
            None => {
                debug!(next_hop = %hop, %target, tls = false, "connected to next hop");
                exchange(client, upstream, &target).await
            }
        }
    }
}

async fn exchange<C, U>(client: C, mut upstream: U, target: &str) -> Result<(), ProxyError>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    protocol::write_preamble(&mut upstream, target).await?;
    protocol::await_rendezvous(&mut upstream).await?;
    relay(client, upstream).await
}
