//! Preamble / rendezvous handshake exchanged between two sidecars.
//!
//! The sender (outbound side) writes the true destination as a bare UTF-8
//! `"<host>:<port>"` string, with no length prefix and no terminator. The
//! receiver (inbound side) reads it with a single read of at most
//! [`PREAMBLE_MAX_LEN`] bytes, dials the destination, and answers with the
//! single [`RENDEZVOUS_BYTE`]. Relay bytes only flow after that byte.
//!
//! ```text
//! outbound                      inbound
//!    ── "10.0.0.5:8080" ──────────►
//!                                  dial 10.0.0.5:8080
//!    ◄───────────────── 'Y' ───────
//!    ◄════════ relay ═════════════►
//! ```
//!
//! Hostnames containing `:` cannot be carried without a framing change.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProxyError;

/// Upper bound on the preamble length, and the size of the receive buffer.
pub const PREAMBLE_MAX_LEN: usize = 256;

/// Byte sent by the inbound side once the real destination is connected.
pub const RENDEZVOUS_BYTE: u8 = b'Y';

// ---------------------------------------------------------------------------
// Sender side
// ---------------------------------------------------------------------------

/// Write the destination preamble in one write and flush it.
///
/// # Errors
///
/// Returns [`ProxyError::Handshake`] if `target` is not a valid preamble or
/// the write fails.
pub async fn write_preamble<W>(writer: &mut W, target: &str) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin,
{
    validate_target(target)?;
    writer
        .write_all(target.as_bytes())
        .await
        .map_err(|e| ProxyError::Handshake(format!("failed to send preamble: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| ProxyError::Handshake(format!("failed to flush preamble: {e}")))
}

/// Wait for the peer's rendezvous byte.
///
/// Reads exactly one byte, so relay bytes the peer sends right after the
/// rendezvous are left in the stream.
///
/// # Errors
///
/// Returns [`ProxyError::Handshake`] if the peer closes first or answers with
/// anything other than [`RENDEZVOUS_BYTE`].
pub async fn await_rendezvous<R>(reader: &mut R) -> Result<(), ProxyError>
where
    R: AsyncRead + Unpin,
{
    let mut ack = [0u8; 1];
    reader
        .read_exact(&mut ack)
        .await
        .map_err(|e| ProxyError::Handshake(format!("peer closed before rendezvous: {e}")))?;
    if ack[0] != RENDEZVOUS_BYTE {
        return Err(ProxyError::Handshake(format!(
            "unexpected rendezvous byte 0x{:02x}",
            ack[0]
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Receiver side
// ---------------------------------------------------------------------------

/// Read the destination preamble with a single bounded read.
///
/// # Errors
///
/// Returns [`ProxyError::Handshake`] if the read fails, the peer sent
/// nothing, or the bytes are not a `"<host>:<port>"` string.
pub async fn read_preamble<R>(reader: &mut R) -> Result<String, ProxyError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; PREAMBLE_MAX_LEN];
    let n = reader
        .read(&mut buf)
        .await
        .map_err(|e| ProxyError::Handshake(format!("failed to read preamble: {e}")))?;
    if n == 0 {
        return Err(ProxyError::Handshake("empty preamble".into()));
    }

    let target = std::str::from_utf8(&buf[..n])
        .map_err(|_| ProxyError::Handshake("preamble is not valid UTF-8".into()))?;
    validate_target(target)?;
    Ok(target.to_owned())
}

/// Send the rendezvous byte, releasing the sender into relay mode.
///
/// # Errors
///
/// Returns [`ProxyError::Handshake`] if the write fails.
pub async fn write_rendezvous<W>(writer: &mut W) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(&[RENDEZVOUS_BYTE])
        .await
        .map_err(|e| ProxyError::Handshake(format!("failed to send rendezvous: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| ProxyError::Handshake(format!("failed to flush rendezvous: {e}")))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Check that `target` is a `"<host>:<port>"` string that fits one preamble.
///
/// # Errors
///
/// Returns [`ProxyError::Handshake`] describing the first problem found.
pub fn validate_target(target: &str) -> Result<(), ProxyError> {
    if target.len() > PREAMBLE_MAX_LEN {
        return Err(ProxyError::Handshake(format!(
            "preamble exceeds {PREAMBLE_MAX_LEN} bytes"
        )));
    }
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| ProxyError::Handshake(format!("malformed preamble {target:?}")))?;
    if host.is_empty() || host.contains(':') {
        return Err(ProxyError::Handshake(format!("malformed preamble host {target:?}")));
    }
    port.parse::<u16>()
        .map_err(|_| ProxyError::Handshake(format!("malformed preamble port {target:?}")))?;
    Ok(())
}
