//! Host environments.
//!
//! A [`HostEnv`] answers two questions about the machine the fleet runs on:
//! what is this host called, and which zone does it live in. Pod names embed
//! the host name, so the answers decide which rows of the provider's listing
//! belong to this machine.

pub mod fixed;
pub mod gcp;
pub mod shell;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Config;
use crate::error::{AccelError, AccelResult};
use crate::exec::CommandRunner;

pub use fixed::FixedEnv;
pub use gcp::GcpEnv;
pub use shell::ShellEnv;

/// Where the fleet manager is running.
#[async_trait]
pub trait HostEnv: Send + Sync {
    /// Provider id this environment answers for.
    fn provider(&self) -> &'static str;

    /// Name of the local host. Pods belonging to this host carry it in
    /// their names.
    ///
    /// # Errors
    /// Returns an error when the environment cannot be queried.
    async fn host_name(&self) -> AccelResult<String>;

    /// Zone the host lives in, when the environment knows one.
    ///
    /// # Errors
    /// Returns an error when the environment cannot be queried.
    async fn zone(&self) -> AccelResult<Option<String>>;
}

/// Builds a host environment from the loaded config.
pub type EnvFactory =
    Box<dyn Fn(&Config, &Arc<dyn CommandRunner>) -> AccelResult<Arc<dyn HostEnv>> + Send + Sync>;

/// Host environment factories, keyed by provider id.
pub struct EnvRegistry {
    factories: HashMap<String, EnvFactory>,
}

impl EnvRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry preloaded with the built-in environments (`gcp`, `shell`,
    /// `fixed`).
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            "gcp",
            Box::new(|_, _| Ok(Arc::new(GcpEnv::new()?) as Arc<dyn HostEnv>)),
        );
        registry.register(
            "shell",
            Box::new(|_, runner| {
                Ok(Arc::new(ShellEnv::new(Arc::clone(runner))) as Arc<dyn HostEnv>)
            }),
        );
        registry.register(
            "fixed",
            Box::new(|config, _| {
                FixedEnv::from_config(config).map(|env| Arc::new(env) as Arc<dyn HostEnv>)
            }),
        );
        registry
    }

    /// Register a factory under `provider`, replacing any existing one.
    pub fn register(&mut self, provider: impl Into<String>, factory: EnvFactory) {
        self.factories.insert(provider.into(), factory);
    }

    /// Build the environment named by `config.provider`.
    ///
    /// # Errors
    /// Returns [`AccelError::Config`] for an unknown provider id; factory
    /// failures propagate as-is.
    pub fn create(
        &self,
        config: &Config,
        runner: &Arc<dyn CommandRunner>,
    ) -> AccelResult<Arc<dyn HostEnv>> {
        let factory = self.factories.get(&config.provider).ok_or_else(|| {
            AccelError::Config(format!(
                "Unknown provider '{}' (registered: {})",
                config.provider,
                self.providers().join(", ")
            ))
        })?;
        factory(config, runner)
    }

    /// Registered provider ids, sorted.
    #[must_use]
    pub fn providers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.factories.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for EnvRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ShellRunner;

    fn runner() -> Arc<dyn CommandRunner> {
        Arc::new(ShellRunner)
    }

    #[test]
    fn test_defaults_register_builtins() {
        let registry = EnvRegistry::with_defaults();
        assert_eq!(registry.providers(), vec!["fixed", "gcp", "shell"]);
    }

    #[test]
    fn test_unknown_provider_is_rejected() {
        let registry = EnvRegistry::with_defaults();
        let config = Config {
            provider: "aws".to_string(),
            ..Config::default()
        };
        let err = registry.create(&config, &runner()).map(|_| ()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("aws"), "{message}");
        assert!(message.contains("gcp"), "{message}");
    }

    #[test]
    fn test_custom_factory_wins() {
        let mut registry = EnvRegistry::new();
        registry.register(
            "fixed",
            Box::new(|_, _| {
                Ok(Arc::new(FixedEnv::new("pinned", None)) as Arc<dyn HostEnv>)
            }),
        );
        let config = Config {
            provider: "fixed".to_string(),
            ..Config::default()
        };
        let env = registry.create(&config, &runner()).unwrap();
        assert_eq!(env.provider(), "fixed");
    }

    #[test]
    fn test_fixed_factory_requires_host() {
        let registry = EnvRegistry::with_defaults();
        let config = Config {
            provider: "fixed".to_string(),
            host: None,
            ..Config::default()
        };
        assert!(registry.create(&config, &runner()).is_err());
    }
}
