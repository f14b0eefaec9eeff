//! Configuration loading and validation for the mesh sidecar.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Validated sidecar configuration, as read from the environment.
#[derive(Clone, Deserialize)]
pub struct Config {
    /// Address the internal listener binds to. May be a hostname; it is
    /// resolved once at startup.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Port of the internal listener receiving kernel-redirected connections.
    #[serde(default = "default_internal_port")]
    pub internal_port: u16,

    /// Port of the external plaintext listener.
    #[serde(default = "default_external_port")]
    pub external_port: u16,

    /// Port of the external TLS listener (only bound when certificates exist).
    #[serde(default = "default_external_tls_port")]
    pub external_tls_port: u16,

    /// Force all next-hop traffic to this address.
    #[serde(default)]
    pub cluster_address: Option<String>,

    /// Node name injected by the orchestrator. Overrides `cluster_address`.
    #[serde(default)]
    pub kube_node_name: Option<String>,

    /// Run without the internal listener (external roles only).
    #[serde(default)]
    pub gateway_mode: bool,

    /// Bound on every upstream dial and TLS handshake.
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,

    /// Inline PEM CA bundle.
    #[serde(default)]
    pub mesh_ca: Option<String>,

    /// Inline PEM leaf certificate.
    #[serde(default)]
    pub mesh_cert: Option<String>,

    /// Inline PEM private key.
    #[serde(default)]
    pub mesh_key: Option<String>,

    /// Mounted secret directory holding `ca.crt`, `cert.crt` and `key.crt`.
    #[serde(default)]
    pub cert_dir: Option<String>,

    /// Name checked against the next hop's server certificate. Defaults to the
    /// dialed host.
    #[serde(default)]
    pub tls_server_name: Option<String>,

    /// Enable the kernel trace tap.
    #[serde(default)]
    pub trace_tap: bool,

    /// File read by the trace tap.
    #[serde(default = "default_trace_pipe_path")]
    pub trace_pipe_path: String,

    /// Tracing log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_bind_address() -> String {
    "127.0.0.1".into()
}
fn default_internal_port() -> u16 {
    18000
}
fn default_external_port() -> u16 {
    18001
}
fn default_external_tls_port() -> u16 {
    18443
}
fn default_dial_timeout_secs() -> u64 {
    5
}
fn default_trace_pipe_path() -> String {
    "/sys/kernel/debug/tracing/trace_pipe".into()
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed or validation fails.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build sidecar configuration")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise sidecar configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// The next-hop override, if any. `KUBE_NODE_NAME` wins over
    /// `CLUSTER_ADDRESS`.
    pub fn next_hop_override(&self) -> Option<&str> {
        non_empty(&self.kube_node_name).or_else(|| non_empty(&self.cluster_address))
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    /// Inline certificate material as `(ca, cert, key)`, when all three are set.
    pub fn inline_certificates(&self) -> Option<(&str, &str, &str)> {
        Some((
            non_empty(&self.mesh_ca)?,
            non_empty(&self.mesh_cert)?,
            non_empty(&self.mesh_key)?,
        ))
    }

    pub fn cert_dir(&self) -> Option<&str> {
        non_empty(&self.cert_dir)
    }

    pub fn tls_server_name(&self) -> Option<&str> {
        non_empty(&self.tls_server_name)
    }

    fn validate(&self) -> Result<()> {
        if self.bind_address.trim().is_empty() {
            anyhow::bail!("BIND_ADDRESS must not be empty");
        }

        let ports = [
            ("INTERNAL_PORT", self.internal_port),
            ("EXTERNAL_PORT", self.external_port),
            ("EXTERNAL_TLS_PORT", self.external_tls_port),
        ];
        for (name, port) in ports {
            if port == 0 {
                anyhow::bail!("{name} must be a non-zero port");
            }
        }
        for (i, (a_name, a)) in ports.iter().enumerate() {
            for (b_name, b) in &ports[i + 1..] {
                if a == b {
                    anyhow::bail!("{a_name} and {b_name} must differ (both are {a})");
                }
            }
        }

        if self.dial_timeout_secs == 0 {
            anyhow::bail!("DIAL_TIMEOUT_SECS must be > 0");
        }

        let inline = [&self.mesh_ca, &self.mesh_cert, &self.mesh_key]
            .into_iter()
            .filter(|v| non_empty(v).is_some())
            .count();
        if inline != 0 && inline != 3 {
            anyhow::bail!("MESH_CA, MESH_CERT and MESH_KEY must be set together");
        }
        Ok(())
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("internal_port", &self.internal_port)
            .field("external_port", &self.external_port)
            .field("external_tls_port", &self.external_tls_port)
            .field("next_hop_override", &self.next_hop_override())
            .field("gateway_mode", &self.gateway_mode)
            .field("dial_timeout_secs", &self.dial_timeout_secs)
            .field("inline_certificates", &self.inline_certificates().is_some())
            .field("cert_dir", &self.cert_dir)
            .field("trace_tap", &self.trace_tap)
            .field("log_level", &self.log_level)
            .finish_non_exhaustive()
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        bind_address: default_bind_address(),
        internal_port: default_internal_port(),
        external_port: default_external_port(),
        external_tls_port: default_external_tls_port(),
        cluster_address: None,
        kube_node_name: None,
        gateway_mode: false,
        dial_timeout_secs: default_dial_timeout_secs(),
        mesh_ca: None,
        mesh_cert: None,
        mesh_key: None,
        cert_dir: None,
        tls_server_name: None,
        trace_tap: false,
        trace_pipe_path: default_trace_pipe_path(),
        log_level: default_log_level(),
    }
}
