//! Debug trace tap: streams the kernel trace pipe into the log.
//!
//! Purely diagnostic. Opening or reading failures are logged and never affect
//! the proxy.

use tokio::fs::File;
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Spawn the tap on `path`; it stops at EOF or when `shutdown` is cancelled.
pub fn spawn(path: String, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let file = match File::open(&path).await {
            Ok(f) => f,
            Err(e) => {
                warn!(%path, error = %e, "unable to open trace pipe");
                return;
            }
        };
        info!(%path, "trace tap started");
        match pump_lines(BufReader::new(file), shutdown).await {
            Ok(lines) => info!(%path, lines, "trace tap stopped"),
            Err(e) => warn!(%path, error = %e, "trace tap read failed"),
        }
    })
}

/// Emit every line of `reader` as an event. Returns the number of lines seen.
async fn pump_lines<R>(reader: R, shutdown: CancellationToken) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut seen = 0;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(seen),
            next = lines.next_line() => match next? {
                Some(line) => {
                    seen += 1;
                    info!(target: "trace_tap", "{line}");
                }
                None => return Ok(seen),
            }
        }
    }
}
