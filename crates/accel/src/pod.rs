//! One leased accelerator pod and its provider-reported state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::context::FleetContext;
use crate::error::{AccelError, AccelResult};
use crate::exec::{run_checked, run_with_retry};

/// Provider-reported pod state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodState {
    Creating,
    Ready,
    Running,
    Starting,
    Restarting,
    Reimaging,
    Stopping,
    Stopped,
    Deleting,
    Repairing,
    Preempted,
    Terminated,
    /// Anything the provider reports that we do not model.
    Unknown,
}

impl PodState {
    /// Map a raw provider state string, falling back to [`Self::Unknown`].
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "CREATING" => Self::Creating,
            "READY" => Self::Ready,
            "RUNNING" => Self::Running,
            "STARTING" => Self::Starting,
            "RESTARTING" => Self::Restarting,
            "REIMAGING" => Self::Reimaging,
            "STOPPING" => Self::Stopping,
            "STOPPED" => Self::Stopped,
            "DELETING" => Self::Deleting,
            "REPAIRING" => Self::Repairing,
            "PREEMPTED" => Self::Preempted,
            "TERMINATED" => Self::Terminated,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for PodState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Creating => "CREATING",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Starting => "STARTING",
            Self::Restarting => "RESTARTING",
            Self::Reimaging => "REIMAGING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Deleting => "DELETING",
            Self::Repairing => "REPAIRING",
            Self::Preempted => "PREEMPTED",
            Self::Terminated => "TERMINATED",
            Self::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

/// Provider-reported pod health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodHealth {
    Healthy,
    Timeout,
    UnhealthyTensorflow,
    UnhealthyMaintenance,
    Unknown,
}

impl PodHealth {
    /// Map a raw provider health string, falling back to [`Self::Unknown`].
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "HEALTHY" => Self::Healthy,
            "TIMEOUT" => Self::Timeout,
            "UNHEALTHY_TENSORFLOW" => Self::UnhealthyTensorflow,
            "UNHEALTHY_MAINTENANCE" => Self::UnhealthyMaintenance,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for PodHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Healthy => "HEALTHY",
            Self::Timeout => "TIMEOUT",
            Self::UnhealthyTensorflow => "UNHEALTHY_TENSORFLOW",
            Self::UnhealthyMaintenance => "UNHEALTHY_MAINTENANCE",
            Self::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

/// Snapshot of a pod's describe output.
///
/// Snapshots go stale immediately; callers re-fetch before destructive
/// decisions.
#[derive(Debug, Clone)]
pub struct PodDetails {
    /// Typed state, when the output carried a `state` key.
    pub state: Option<PodState>,
    /// Typed health, when the output carried a `health` key.
    pub health: Option<PodHealth>,
    /// Every `key: value` pair from the describe output.
    pub raw: BTreeMap<String, String>,
    /// When this snapshot was taken.
    pub fetched_at: DateTime<Utc>,
}

impl PodDetails {
    /// Parse newline-delimited `key: value` pairs from describe output.
    ///
    /// Lines without exactly one `": "` separator are ignored.
    #[must_use]
    pub fn parse(stdout: &str) -> Self {
        let mut raw = BTreeMap::new();
        for line in stdout.lines() {
            let parts: Vec<&str> = line.split(": ").collect();
            if parts.len() != 2 {
                continue;
            }
            raw.insert(parts[0].trim().to_string(), parts[1].trim().to_string());
        }

        let state = raw.get("state").map(|s| PodState::parse(s));
        let health = raw.get("health").map(|h| PodHealth::parse(h));

        Self {
            state,
            health,
            raw,
            fetched_at: Utc::now(),
        }
    }

    /// Look up a raw describe field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.raw.get(key).map(String::as_str)
    }

    /// Whether the reported state accepts work.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self.state, Some(PodState::Ready | PodState::Running))
    }

    /// Whether the pod reports healthy. An absent health field counts as
    /// healthy; the provider omits it while a pod is starting.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        match self.health {
            None | Some(PodHealth::Healthy) => true,
            Some(_) => false,
        }
    }
}

/// One leased accelerator pod.
///
/// The name is the stable identity; everything else is a cached view of the
/// provider plus the local claim flag. The claim flag tracks this process
/// only; cross-process claims live in the ledger.
pub struct Accelerator {
    name: String,
    ip: Option<String>,
    version: Option<String>,
    preemptible: bool,
    claimed: AtomicBool,
    ctx: Arc<FleetContext>,
}

// Manual impl: the shared context holds a trait-object runner without Debug.
impl std::fmt::Debug for Accelerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accelerator")
            .field("name", &self.name)
            .field("ip", &self.ip)
            .field("version", &self.version)
            .field("preemptible", &self.preemptible)
            .field("claimed", &self.claimed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Accelerator {
    /// Adopt an existing pod, eagerly fetching its details.
    ///
    /// # Errors
    /// Returns [`AccelError::NotFound`] when the provider does not list the
    /// name at all, or the describe failure itself otherwise.
    pub async fn fetch(ctx: Arc<FleetContext>, name: &str) -> AccelResult<Self> {
        let mut pod = Self {
            name: name.to_string(),
            ip: None,
            version: None,
            preemptible: false,
            claimed: AtomicBool::new(false),
            ctx,
        };

        let details = match pod.details().await {
            Ok(details) => details,
            Err(e) => {
                if let Ok(names) = pod.ctx.list_pod_names().await {
                    if !names.iter().any(|n| n == &pod.name) {
                        return Err(AccelError::NotFound { name: pod.name });
                    }
                }
                return Err(e);
            }
        };
        pod.ip = details.get("ipAddress").map(ToString::to_string);
        pod.preemptible = details.get("preemptible") == Some("true");
        pod.version = details.get("acceleratorType").map(ToString::to_string);
        Ok(pod)
    }

    /// Provider-assigned name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Assigned network address, when the provider reported one.
    #[must_use]
    pub fn ip(&self) -> Option<&str> {
        self.ip.as_deref()
    }

    /// Accelerator generation/topology string, e.g. `v3-8`.
    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Whether the pod was created preemptible.
    #[must_use]
    pub fn preemptible(&self) -> bool {
        self.preemptible
    }

    /// Whether this process holds the pod.
    #[must_use]
    pub fn claimed(&self) -> bool {
        self.claimed.load(Ordering::SeqCst)
    }

    /// Fetch a fresh describe snapshot. Never cached between calls.
    ///
    /// # Errors
    /// Returns [`AccelError::CommandFailed`] on a nonzero describe exit.
    pub async fn details(&self) -> AccelResult<PodDetails> {
        let mut argv = self.ctx.pod_command("describe");
        argv.push(self.name.clone());
        if let Some(flag) = self.ctx.zone_flag() {
            argv.push(flag);
        }
        let output = run_checked(self.ctx.runner.as_ref(), &argv).await?;
        Ok(PodDetails::parse(&output.stdout))
    }

    /// Whether the provider still lists this pod.
    ///
    /// # Errors
    /// Returns an error if the list command fails.
    pub async fn still_exists(&self) -> AccelResult<bool> {
        let names = self.ctx.list_pod_names().await?;
        Ok(names.iter().any(|n| n == &self.name))
    }

    /// Whether the pod can accept work: present provider-side, in a running
    /// state, and not reporting unhealthy.
    ///
    /// A failing describe counts as not usable, so reconciliation sweeps
    /// keep going when the provider hiccups on one pod.
    ///
    /// # Errors
    /// Returns an error if the list command fails.
    pub async fn usable(&self) -> AccelResult<bool> {
        if !self.still_exists().await? {
            debug!(pod = %self.name, "Pod no longer exists");
            return Ok(false);
        }

        let details = match self.details().await {
            Ok(details) => details,
            Err(e) => {
                warn!(pod = %self.name, error = %e, "Describe failed, treating pod as unusable");
                return Ok(false);
            }
        };
        let running = details.is_running();
        let healthy = details.is_healthy();

        if !running {
            debug!(pod = %self.name, state = ?details.state, "Pod is not running");
        }
        if !healthy {
            debug!(pod = %self.name, health = ?details.health, "Pod is not healthy");
        }

        Ok(running && healthy)
    }

    /// Whether no process claims the pod, locally or in the ledger.
    ///
    /// # Errors
    /// Returns an error if the ledger cannot be read.
    pub fn free(&self) -> AccelResult<bool> {
        if self.claimed.load(Ordering::SeqCst) {
            return Ok(false);
        }
        Ok(!self.ctx.ledger.check_if_in_use(&self.name)?)
    }

    /// Claim the pod for this process.
    ///
    /// The ledger entry is written first; a rejected claim leaves the local
    /// flag untouched.
    ///
    /// # Errors
    /// Returns [`AccelError::AlreadyClaimed`] when another live process
    /// holds the pod.
    pub fn claim(&self) -> AccelResult<()> {
        self.ctx.ledger.register_in_use(&self.name)?;
        self.claimed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Release a claim this process holds.
    ///
    /// # Errors
    /// Returns [`AccelError::NotClaimed`] when the pod was never claimed by
    /// this process.
    pub fn release(&self) -> AccelResult<()> {
        if !self.claimed.load(Ordering::SeqCst) {
            return Err(AccelError::NotClaimed {
                name: self.name.clone(),
            });
        }
        self.claimed.store(false, Ordering::SeqCst);
        self.ctx.ledger.register_free(&self.name)
    }

    /// Start the pod. `background` asks the provider to return without
    /// waiting for completion.
    ///
    /// # Errors
    /// Returns an error once the retry budget is spent.
    pub async fn up(&self, background: bool) -> AccelResult<()> {
        info!(pod = %self.name, "Starting pod");
        self.lifecycle("start", background).await
    }

    /// Stop the pod.
    ///
    /// # Errors
    /// Returns an error once the retry budget is spent.
    pub async fn down(&self, background: bool) -> AccelResult<()> {
        info!(pod = %self.name, "Stopping pod");
        self.lifecycle("stop", background).await
    }

    /// Delete the pod provider-side.
    ///
    /// A pod the provider no longer lists is left alone. Detaching from the
    /// fleet collection is the manager's job.
    ///
    /// # Errors
    /// Returns an error once the retry budget is spent.
    pub async fn delete_remote(&self, background: bool) -> AccelResult<()> {
        info!(pod = %self.name, "Deleting pod");
        if !self.still_exists().await? {
            debug!(pod = %self.name, "Pod already gone, nothing to delete");
            return Ok(());
        }

        let mut argv = self.ctx.pod_command("delete");
        argv.push(self.name.clone());
        if let Some(flag) = self.ctx.zone_flag() {
            argv.push(flag);
        }
        if background {
            argv.push("--async".to_string());
        }
        // suppress the provider's interactive confirmation
        argv.push("--quiet".to_string());

        run_with_retry(self.ctx.runner.as_ref(), &self.ctx.retry, || argv.clone()).await?;
        Ok(())
    }

    async fn lifecycle(&self, action: &str, background: bool) -> AccelResult<()> {
        let mut argv = self.ctx.pod_command(action);
        argv.push(self.name.clone());
        if let Some(flag) = self.ctx.zone_flag() {
            argv.push(flag);
        }
        if background {
            argv.push("--async".to_string());
        }

        run_with_retry(self.ctx.runner.as_ref(), &self.ctx.retry, || argv.clone()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{CommandOutput, CommandRunner, RetryPolicy};
    use crate::ledger::ClaimLedger;
    use async_trait::async_trait;
    use tempfile::TempDir;

    const DESCRIBE_OUTPUT: &str = "\
acceleratorType: v3-8
apiVersion: V1
cidrBlock: 10.2.3.0/29
health: HEALTHY
ipAddress: 10.2.3.2
name: projects/p/locations/us-central1-b/nodes/host1-abcde
networkEndpoints:
- ipAddress: 10.2.3.2
port: '8470'
preemptible: true
state: READY
";

    #[test]
    fn test_parse_describe_output() {
        let details = PodDetails::parse(DESCRIBE_OUTPUT);
        assert_eq!(details.state, Some(PodState::Ready));
        assert_eq!(details.health, Some(PodHealth::Healthy));
        assert_eq!(details.get("ipAddress"), Some("10.2.3.2"));
        assert_eq!(details.get("acceleratorType"), Some("v3-8"));
        assert_eq!(details.get("preemptible"), Some("true"));
        assert!(details.is_running());
        assert!(details.is_healthy());
    }

    #[test]
    fn test_parse_skips_malformed_lines() {
        let details = PodDetails::parse("bare line\nk: a: b\nstate: STOPPED\n");
        assert_eq!(details.raw.len(), 1);
        assert_eq!(details.state, Some(PodState::Stopped));
        assert!(!details.is_running());
    }

    #[test]
    fn test_absent_health_counts_as_healthy() {
        let details = PodDetails::parse("state: RUNNING\n");
        assert_eq!(details.health, None);
        assert!(details.is_healthy());
        assert!(details.is_running());
    }

    #[test]
    fn test_unhealthy_states() {
        let details = PodDetails::parse("state: READY\nhealth: TIMEOUT\n");
        assert!(details.is_running());
        assert!(!details.is_healthy());

        let details = PodDetails::parse("state: PREEMPTED\nhealth: HEALTHY\n");
        assert!(!details.is_running());
        assert!(details.is_healthy());
    }

    #[test]
    fn test_unknown_state_is_not_running() {
        let details = PodDetails::parse("state: HIDING\n");
        assert_eq!(details.state, Some(PodState::Unknown));
        assert!(!details.is_running());
    }

    #[test]
    fn test_state_parse_and_display_roundtrip() {
        for raw in ["CREATING", "READY", "STOPPED", "PREEMPTED"] {
            assert_eq!(PodState::parse(raw).to_string(), raw);
        }
        assert_eq!(PodState::parse("whatever").to_string(), "UNKNOWN");
    }

    #[test]
    fn test_empty_output_has_no_state() {
        let details = PodDetails::parse("");
        assert_eq!(details.state, None);
        assert!(!details.is_running());
        assert!(details.is_healthy());
    }

    struct NullRunner;

    #[async_trait]
    impl CommandRunner for NullRunner {
        async fn run(&self, _argv: &[String]) -> AccelResult<CommandOutput> {
            Ok(CommandOutput {
                code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    fn stub_pod(dir: &TempDir) -> Accelerator {
        let ledger = ClaimLedger::open(dir.path().join("ledger.json")).unwrap();
        let ctx = Arc::new(FleetContext {
            runner: Arc::new(NullRunner),
            ledger,
            host: "host1".to_string(),
            zone: None,
            software_version: "1.15".to_string(),
            cli_root: vec!["pods".to_string()],
            retry: RetryPolicy::default(),
        });
        Accelerator {
            name: "host1-abcde".to_string(),
            ip: Some("10.2.3.2".to_string()),
            version: Some("v3-8".to_string()),
            preemptible: true,
            claimed: AtomicBool::new(false),
            ctx,
        }
    }

    #[test]
    fn test_debug_output_names_the_pod() {
        let dir = TempDir::new().unwrap();
        let pod = stub_pod(&dir);

        let dump = format!("{pod:?}");
        assert!(dump.contains("host1-abcde"), "{dump}");
        assert!(dump.contains("10.2.3.2"), "{dump}");
        assert!(!dump.contains("FleetContext"), "{dump}");
    }
}
