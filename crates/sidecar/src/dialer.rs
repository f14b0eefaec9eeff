//! Upstream TCP dialing with a bounded connect time.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use common::ProxyError;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

pub type DialFuture = Pin<Box<dyn Future<Output = Result<TcpStream, ProxyError>> + Send>>;

/// Opens upstream connections for a session. Each call is a single attempt.
#[cfg_attr(test, mockall::automock)]
pub trait Dialer: Send + Sync {
    /// Connect to `target` (`"<host>:<port>"`).
    fn dial(&self, target: String) -> DialFuture;
}

/// Plain TCP dialer giving up after `timeout`.
#[derive(Debug, Clone, Copy)]
pub struct TcpDialer {
    timeout: Duration,
}

impl TcpDialer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Dialer for TcpDialer {
    fn dial(&self, target: String) -> DialFuture {
        let limit = self.timeout;
        Box::pin(async move {
            match timeout(limit, TcpStream::connect(target.as_str())).await {
                Ok(Ok(stream)) => {
                    // Relay latency matters more than segment coalescing.
                    let _ = stream.set_nodelay(true);
                    debug!(%target, "upstream connected");
                    Ok(stream)
                }
                Ok(Err(e)) => Err(ProxyError::dial(target, e)),
                Err(_) => Err(ProxyError::dial(
                    target,
                    std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("no connection within {limit:?}"),
                    ),
                )),
            }
        })
    }
}
