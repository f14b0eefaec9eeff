//! Listener roles and the shared accept loop.

use std::fmt;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Which listener accepted a connection. Decides the session persona.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Kernel-redirected workload traffic → outbound persona.
    Internal,
    /// Peer sidecars over plaintext → inbound persona.
    External,
    /// Peer sidecars over TLS → inbound persona after the TLS handshake.
    ExternalTls,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Internal => "internal",
            Role::External => "external",
            Role::ExternalTls => "external-tls",
        })
    }
}

/// Bind the socket for `role`.
///
/// # Errors
///
/// Returns an error if the address cannot be bound. This is fatal at startup.
pub async fn bind(role: Role, addr: SocketAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {role} listener on {addr}"))?;
    info!(%role, addr = %listener.local_addr().unwrap_or(addr), pid = std::process::id(), "listening");
    Ok(listener)
}

/// Accept connections until `shutdown` is cancelled, handing each one to
/// `dispatch` without waiting for it.
///
/// Accept errors are logged and the loop continues. The listener is dropped,
/// and therefore closed, when the loop returns.
pub async fn accept_loop<F>(
    role: Role,
    listener: TcpListener,
    shutdown: CancellationToken,
    mut dispatch: F,
) where
    F: FnMut(TcpStream, SocketAddr),
{
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!(%role, "listener closed");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(
                        %role,
                        %peer,
                        local = %stream.local_addr().map(|a| a.to_string()).unwrap_or_default(),
                        "accepted connection"
                    );
                    dispatch(stream, peer);
                }
                Err(e) => error!(%role, error = %e, "accept error"),
            }
        }
    }
}
