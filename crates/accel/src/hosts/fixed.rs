//! Config-pinned host environment.

use async_trait::async_trait;

use super::HostEnv;
use crate::config::Config;
use crate::error::{AccelError, AccelResult};

/// Host environment whose answers come straight from the config file.
///
/// Useful off-cloud, in containers with opaque hostnames, or when managing
/// a fleet that belongs to a different machine.
pub struct FixedEnv {
    name: String,
    zone: Option<String>,
}

impl FixedEnv {
    #[must_use]
    pub fn new(name: impl Into<String>, zone: Option<String>) -> Self {
        Self {
            name: name.into(),
            zone,
        }
    }

    /// Build from the loaded config.
    ///
    /// # Errors
    /// Returns [`AccelError::Config`] when no host name is configured.
    pub fn from_config(config: &Config) -> AccelResult<Self> {
        let name = config.host.clone().ok_or_else(|| {
            AccelError::Config("Provider 'fixed' requires a 'host' entry in the config".to_string())
        })?;
        Ok(Self::new(name, config.zone.clone()))
    }
}

#[async_trait]
impl HostEnv for FixedEnv {
    fn provider(&self) -> &'static str {
        "fixed"
    }

    async fn host_name(&self) -> AccelResult<String> {
        Ok(self.name.clone())
    }

    async fn zone(&self) -> AccelResult<Option<String>> {
        Ok(self.zone.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_config_copies_identity() {
        let config = Config {
            host: Some("host1".to_string()),
            zone: Some("us-central1-b".to_string()),
            ..Config::default()
        };
        let env = FixedEnv::from_config(&config).unwrap();
        assert_eq!(env.host_name().await.unwrap(), "host1");
        assert_eq!(env.zone().await.unwrap().as_deref(), Some("us-central1-b"));
    }

    #[test]
    fn test_from_config_requires_host() {
        let config = Config {
            host: None,
            ..Config::default()
        };
        assert!(matches!(
            FixedEnv::from_config(&config),
            Err(AccelError::Config(_))
        ));
    }
}
