//! Common error types shared across crates.

use std::io;

use thiserror::Error;

/// Failure of a single proxied session.
///
/// Every variant is terminal for the session that produced it and is never
/// surfaced beyond that session's task. Variants map to log severities:
/// - [`ProxyError::LoopbackDetected`] → `warn` (configuration problem)
/// - [`ProxyError::Relay`] → `debug` (normal end of a connection)
/// - everything else → `warn`
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The pre-redirection destination could not be recovered from the socket.
    #[error("original destination unavailable: {0}")]
    Resolution(String),

    /// The next hop or the real destination could not be reached in time.
    #[error("failed to dial {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },

    /// Preamble or rendezvous exchange failed, or the TLS handshake was refused.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A relay direction failed after the handshake completed.
    #[error("relay terminated: {0}")]
    Relay(#[source] io::Error),

    /// The preamble named this proxy's own internal listener.
    #[error("loopback detected: preamble targets own internal listener {0}")]
    LoopbackDetected(String),
}

impl ProxyError {
    /// Short machine-readable label used as the `kind` log field.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Resolution(_) => "resolution",
            ProxyError::Dial { .. } => "dial",
            ProxyError::Handshake(_) => "handshake",
            ProxyError::Relay(_) => "relay",
            ProxyError::LoopbackDetected(_) => "loopback",
        }
    }

    /// Convenience constructor for [`ProxyError::Dial`].
    pub fn dial(target: impl Into<String>, source: io::Error) -> Self {
        ProxyError::Dial {
            target: target.into(),
            source,
        }
    }

    /// Whether this error is the ordinary way a relayed connection ends.
    pub fn is_normal_termination(&self) -> bool {
        matches!(self, ProxyError::Relay(_))
    }
}
