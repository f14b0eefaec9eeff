//! `sidecar` — transparent mesh proxy binary entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`config::Config`] from environment variables.
//! 2. Initialise structured JSON logging.
//! 3. Load mesh certificates; their absence disables TLS.
//! 4. Optionally start the debug trace tap.
//! 5. Bind the listeners and serve until SIGINT/SIGTERM.

mod certs;
mod config;
mod dialer;
mod listener;
mod original_dst;
mod proxy;
mod relay;
mod session;
mod telemetry;
mod tls;
mod trace_tap;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = config::Config::from_env().map_err(|e| {
        eprintln!("ERROR: sidecar configuration invalid: {e}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init(&cfg.log_level)?;
    info!(?cfg, "starting mesh sidecar");

    // -----------------------------------------------------------------------
    // 3. Certificates and runtime config
    // -----------------------------------------------------------------------
    let bundle = certs::load(&cfg);
    let proxy_cfg = Arc::new(proxy::ProxyConfig::build(&cfg, bundle.as_ref()).await?);

    // -----------------------------------------------------------------------
    // 4. Shutdown wiring and trace tap
    // -----------------------------------------------------------------------
    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    if cfg.trace_tap {
        trace_tap::spawn(cfg.trace_pipe_path.clone(), shutdown.clone());
    }

    // -----------------------------------------------------------------------
    // 5. Proxy
    // -----------------------------------------------------------------------
    proxy::run(proxy_cfg, shutdown).await?;
    info!("sidecar stopped");
    Ok(())
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable; waiting for ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown signal received");
    shutdown.cancel();
}
