//! TOML configuration loading.
//!
//! Every field has a default, so a config file only needs the keys it
//! overrides. Discovery walks `$ACCEL_CFG`, then `~/accel.toml`, then
//! `/etc/accel.toml`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AccelError, AccelResult};
use crate::exec::DEFAULT_ATTEMPTS;
use crate::fleet::DEFAULT_VERSION;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "ACCEL_CFG";

/// Default ledger location, relative to `$HOME`.
const DEFAULT_LEDGER: &str = "~/.accel_ledger";

/// Fleet configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host environment provider id (`gcp`, `shell`, `fixed`).
    pub provider: String,
    /// Host identity override; otherwise asked from the environment.
    pub host: Option<String>,
    /// Zone override; otherwise asked from the environment.
    pub zone: Option<String>,
    /// Claim ledger location.
    pub ledger: Option<PathBuf>,
    /// Default accelerator version for acquisition.
    pub accelerator_version: String,
    /// Pin the pod software version instead of probing TensorFlow.
    pub software_version: Option<String>,
    /// Request preemptible pods by default.
    pub preemptible: bool,
    /// Provider mutation attempt budget.
    pub attempts: u32,
    /// Provider CLI root the pod subcommands are appended to.
    pub pod_cli: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: "gcp".to_string(),
            host: None,
            zone: None,
            ledger: None,
            accelerator_version: DEFAULT_VERSION.to_string(),
            software_version: None,
            preemptible: true,
            attempts: DEFAULT_ATTEMPTS,
            pod_cli: vec![
                "gcloud".to_string(),
                "compute".to_string(),
                "tpus".to_string(),
            ],
        }
    }
}

impl Config {
    /// Parse the TOML file at `path`.
    ///
    /// # Errors
    /// Returns [`AccelError::Config`] when the file cannot be read or
    /// parsed.
    pub fn load(path: &Path) -> AccelResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AccelError::Config(format!("Failed to read config {}: {e}", path.display()))
        })?;
        toml::from_str(&raw).map_err(|e| {
            AccelError::Config(format!("Failed to parse config {}: {e}", path.display()))
        })
    }

    /// Locate the config file, walking the search chain.
    #[must_use]
    pub fn discover() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(path);
            if path.is_file() {
                return Some(path);
            }
            debug!(path = %path.display(), "No config file at the configured path");
        }

        if let Ok(home) = std::env::var("HOME") {
            let path = Path::new(&home).join("accel.toml");
            if path.is_file() {
                return Some(path);
            }
        }

        let path = PathBuf::from("/etc/accel.toml");
        if path.is_file() {
            return Some(path);
        }
        None
    }

    /// Resolved ledger path, expanding a leading `~/` against `$HOME`.
    #[must_use]
    pub fn ledger_path(&self) -> PathBuf {
        let raw = self
            .ledger
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LEDGER));
        expand_home(&raw)
    }
}

fn expand_home(path: &Path) -> PathBuf {
    let Some(raw) = path.to_str() else {
        return path.to_path_buf();
    };
    if let Some(rest) = raw.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
        return Path::new(&home).join(rest);
    }
    path.to_path_buf()
}
