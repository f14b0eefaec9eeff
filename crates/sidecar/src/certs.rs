//! Sourcing of the mesh certificate bundle.
//!
//! Material is read once at startup: inline PEM from the environment first,
//! then the mounted secret directory. Rotation happens out-of-band and only
//! takes effect on restart.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::Config;

/// File names expected inside `CERT_DIR`.
pub const CA_FILE: &str = "ca.crt";
pub const CERT_FILE: &str = "cert.crt";
pub const KEY_FILE: &str = "key.crt";

/// PEM-encoded {CA bundle, leaf certificate, private key}.
#[derive(Clone)]
pub struct Certificates {
    pub ca: Vec<u8>,
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

impl std::fmt::Debug for Certificates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificates")
            .field("ca_len", &self.ca.len())
            .field("cert_len", &self.cert.len())
            .field("key", &"<redacted>")
            .finish()
    }
}

impl Certificates {
    /// Read the bundle from `dir/{ca.crt,cert.crt,key.crt}`.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first file that cannot be read.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let read = |name: &str| {
            let path = dir.join(name);
            std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))
        };
        Ok(Self {
            ca: read(CA_FILE)?,
            cert: read(CERT_FILE)?,
            key: read(KEY_FILE)?,
        })
    }
}

/// Locate certificate material according to `cfg`.
///
/// Returns `None` when no source yields a complete bundle; the caller then
/// runs plaintext-only.
pub fn load(cfg: &Config) -> Option<Certificates> {
    if let Some((ca, cert, key)) = cfg.inline_certificates() {
        info!(source = "environment", "mesh certificates loaded");
        return Some(Certificates {
            ca: ca.as_bytes().to_vec(),
            cert: cert.as_bytes().to_vec(),
            key: key.as_bytes().to_vec(),
        });
    }

    if let Some(dir) = cfg.cert_dir() {
        match Certificates::from_dir(Path::new(dir)) {
            Ok(certs) => {
                info!(source = "directory", dir, "mesh certificates loaded");
                return Some(certs);
            }
            Err(e) => warn!(dir, error = %e, "unable to read mesh certificates"),
        }
    }

    info!("no mesh certificates found; external TLS disabled");
    None
}
