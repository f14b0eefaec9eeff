//! Per-connection session handling.
//!
//! A session is owned by exactly one task from accept to close. Which persona
//! handles it is fixed by the listener that accepted it:
//! - [`Outbound`]: internal listener, workload traffic redirected by the kernel.
//! - [`Inbound`]: external listeners (plaintext or TLS), traffic from a peer sidecar.

mod inbound;
mod outbound;

pub use inbound::Inbound;
pub use outbound::Outbound;

use std::future::Future;
use std::net::SocketAddr;

use common::ProxyError;
use tokio::task::JoinHandle;
use tracing::{debug, info_span, warn, Instrument};

use crate::listener::Role;

/// Run one session on its own task, reporting its outcome inside a
/// `session{role, peer}` span. Errors never leave the task.
pub fn spawn<F>(role: Role, peer: SocketAddr, session: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), ProxyError>> + Send + 'static,
{
    let span = info_span!("session", %role, %peer);
    tokio::spawn(
        async move {
            match session.await {
                Ok(()) => debug!("session closed"),
                Err(e) => report(&e),
            }
        }
        .instrument(span),
    )
}

fn report(err: &ProxyError) {
    match err {
        ProxyError::LoopbackDetected(_) => {
            warn!(kind = err.kind(), error = %err, "refusing session; check next-hop configuration");
        }
        e if e.is_normal_termination() => debug!(kind = e.kind(), error = %e, "session closed"),
        e => warn!(kind = e.kind(), error = %e, "session failed"),
    }
}
