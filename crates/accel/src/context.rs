//! Shared state threaded through the fleet manager and its pods.

use std::sync::Arc;

use crate::error::AccelResult;
use crate::exec::{run_checked, CommandRunner, RetryPolicy};
use crate::ledger::ClaimLedger;

/// Everything a pod needs to talk to the provider and the claim ledger.
///
/// Built once at program entry from the resolved configuration and host
/// environment, then shared between the [`FleetManager`](crate::FleetManager)
/// and every pod it tracks. Nothing in here is process-global.
pub struct FleetContext {
    /// Executes provider CLI commands.
    pub runner: Arc<dyn CommandRunner>,
    /// Cross-process claim registry.
    pub ledger: ClaimLedger,
    /// Host identity substring; pod names are scoped by containing it.
    pub host: String,
    /// Provider zone for list/describe/lifecycle calls, when known.
    pub zone: Option<String>,
    /// Software version baked into newly created pods.
    pub software_version: String,
    /// Provider CLI root, e.g. `gcloud compute tpus`.
    pub cli_root: Vec<String>,
    /// Retry schedule for provider mutations.
    pub retry: RetryPolicy,
}

impl FleetContext {
    /// Base argv for a pod subcommand.
    pub(crate) fn pod_command(&self, action: &str) -> Vec<String> {
        let mut argv = self.cli_root.clone();
        argv.push(action.to_string());
        argv
    }

    /// The `--zone` flag for this context, when a zone is pinned.
    pub(crate) fn zone_flag(&self) -> Option<String> {
        self.zone.as_ref().map(|zone| format!("--zone={zone}"))
    }

    /// Names of every pod the provider reports for this host.
    ///
    /// The provider prints a header row followed by one row per pod with the
    /// name in the first column; only names containing the host identity
    /// substring are kept.
    ///
    /// # Errors
    /// Returns an error if the list command fails.
    pub async fn list_pod_names(&self) -> AccelResult<Vec<String>> {
        let mut argv = self.pod_command("list");
        if let Some(flag) = self.zone_flag() {
            argv.push(flag);
        }
        let output = run_checked(self.runner.as_ref(), &argv).await?;
        Ok(parse_pod_table(&output.stdout, &self.host))
    }
}

/// Extract the name column from tabular `list` output, keeping only rows
/// whose name contains `host`. The first row is a header.
fn parse_pod_table(stdout: &str, host: &str) -> Vec<String> {
    stdout
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .filter(|name| name.contains(host))
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
NAME          ZONE           ACCELERATOR_TYPE  NETWORK  RANGE        STATUS
host1-abcde   us-central1-b  v3-8              default  10.4.2.0/29  READY
host1-fghij   us-central1-b  v2-8              default  10.7.9.0/29  STOPPED
other-klmno   us-central1-b  v3-8              default  10.9.1.0/29  READY
";

    #[test]
    fn test_parse_skips_header_and_filters_host() {
        let names = parse_pod_table(LISTING, "host1");
        assert_eq!(names, vec!["host1-abcde", "host1-fghij"]);
    }

    #[test]
    fn test_parse_tolerates_blank_lines() {
        let names = parse_pod_table("NAME  ZONE\n\nhost1-abcde  us-central1-b\n\n", "host1");
        assert_eq!(names, vec!["host1-abcde"]);
    }

    #[test]
    fn test_parse_header_only_output() {
        assert!(parse_pod_table("Listed 0 items.\n", "host1").is_empty());
    }
}
