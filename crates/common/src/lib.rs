//! Shared error taxonomy and the sidecar-to-sidecar wire handshake.

pub mod error;
pub mod protocol;

pub use error::ProxyError;
