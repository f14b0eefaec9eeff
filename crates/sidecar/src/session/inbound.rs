use std::sync::Arc;

use common::{protocol, ProxyError};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::dialer::Dialer;
use crate::proxy::ProxyConfig;
use crate::relay::relay;

/// Inbound persona: terminates a peer sidecar's session and connects it to the
/// real destination.
///
/// Transport-agnostic; the TLS listener hands over an already-decrypted stream.
pub struct Inbound {
    cfg: Arc<ProxyConfig>,
    dialer: Arc<dyn Dialer>,
}

impl Inbound {
    pub fn new(cfg: Arc<ProxyConfig>, dialer: Arc<dyn Dialer>) -> Self {
        Self { cfg, dialer }
    }

    /// Read preamble, refuse loops, dial destination, send rendezvous, relay.
    pub async fn handle<S>(&self, mut stream: S) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let target = protocol::read_preamble(&mut stream).await?;

        let own = self.cfg.internal_addr().to_string();
        if target == own {
            return Err(ProxyError::LoopbackDetected(target));
        }

        let upstream = self.dialer.dial(target.clone()).await?;
        protocol::write_rendezvous(&mut stream).await?;
        debug!(%target, "connected to destination");

        relay(stream, upstream).await
    }
}
