//! Telemetry initialisation for the mesh sidecar.
//!
//! Structured JSON logs to stdout only. Session events carry the fields of
//! their enclosing `session{role, peer}` span flattened into `span`; the full
//! span list is omitted since sessions never nest. Trace tap lines are
//! distinguishable by their `trace_tap` target. Certificate and key material
//! never appears in any log field.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Filter used when neither `RUST_LOG` nor `LOG_LEVEL` parses.
const FALLBACK_DIRECTIVE: &str = "info";

/// Initialise the tracing subscriber.
///
/// `RUST_LOG` takes precedence over `log_level` when set.
///
/// # Errors
///
/// Returns an error if the subscriber has already been set.
pub fn init(log_level: &str) -> Result<()> {
    let filter = filter_for(log_level, std::env::var("RUST_LOG").ok().as_deref());

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_target(true)
        .with_current_span(true)
        .with_span_list(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialise sidecar tracing subscriber: {e}"))
}

fn filter_for(log_level: &str, rust_log: Option<&str>) -> EnvFilter {
    rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_new(log_level).ok())
        .unwrap_or_else(|| EnvFilter::new(FALLBACK_DIRECTIVE))
}
