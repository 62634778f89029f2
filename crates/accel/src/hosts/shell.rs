//! Hostname-based host environment.

use std::sync::Arc;

use async_trait::async_trait;

use super::HostEnv;
use crate::error::AccelResult;
use crate::exec::{run_checked, CommandRunner};

/// Host environment that asks the OS for its identity.
///
/// Fallback for machines without a metadata service. The zone stays
/// unknown, so zone-qualified provider commands need a config override.
pub struct ShellEnv {
    runner: Arc<dyn CommandRunner>,
}

impl ShellEnv {
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl HostEnv for ShellEnv {
    fn provider(&self) -> &'static str {
        "shell"
    }

    async fn host_name(&self) -> AccelResult<String> {
        let argv = vec!["hostname".to_string()];
        let output = run_checked(self.runner.as_ref(), &argv).await?;
        Ok(output.stdout.trim().to_string())
    }

    async fn zone(&self) -> AccelResult<Option<String>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandOutput;

    struct StaticRunner {
        stdout: &'static str,
    }

    #[async_trait]
    impl CommandRunner for StaticRunner {
        async fn run(&self, _argv: &[String]) -> AccelResult<CommandOutput> {
            Ok(CommandOutput {
                code: 0,
                stdout: self.stdout.to_string(),
                stderr: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_host_name_trims_output() {
        let env = ShellEnv::new(Arc::new(StaticRunner { stdout: "host1\n" }));
        assert_eq!(env.host_name().await.unwrap(), "host1");
        assert_eq!(env.zone().await.unwrap(), None);
    }
}
