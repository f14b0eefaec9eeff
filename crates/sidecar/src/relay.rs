//! Bidirectional byte relay between two established streams.
//!
//! The client→upstream direction runs on a spawned task, upstream→client runs
//! in the caller. As soon as either direction ends (EOF or error) the other is
//! cancelled and both streams are dropped, so each peer observes the close.
//! Bytes are never inspected or transformed.

use common::ProxyError;
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Relay `client` ↔ `upstream` until either side finishes.
///
/// # Errors
///
/// Returns [`ProxyError::Relay`] if the direction that finished first failed
/// with an I/O error. A clean EOF is `Ok(())`.
pub async fn relay<C, U>(client: C, upstream: U) -> Result<(), ProxyError>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = io::split(client);
    let (upstream_read, upstream_write) = io::split(upstream);

    let mut forward = tokio::spawn(copy_half(client_read, upstream_write, "client→upstream"));
    let backward = copy_half(upstream_read, client_write, "upstream→client");

    let result = tokio::select! {
        res = backward => {
            forward.abort();
            // Wait for the aborted task so its halves are dropped before we return.
            let _ = (&mut forward).await;
            res
        }
        res = &mut forward => match res {
            Ok(res) => res,
            Err(join) => Err(io::Error::other(join)),
        },
    };

    result.map_err(ProxyError::Relay)
}

/// Copy bytes from `reader` to `writer`, then half-close `writer`.
async fn copy_half<R, W>(mut reader: R, mut writer: W, label: &'static str) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let bytes = io::copy(&mut reader, &mut writer).await?;
    let _ = writer.shutdown().await;
    debug!(label, bytes, "half-close");
    Ok(())
}
