//! Per-host fleet: tracking, reconciliation, and acquisition of pods.

use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;
use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::context::FleetContext;
use crate::error::{AccelError, AccelResult};
use crate::exec::{run_checked, CommandRunner, DEFAULT_ATTEMPTS};
use crate::pod::Accelerator;

/// Default accelerator generation/topology requested by callers.
pub const DEFAULT_VERSION: &str = "v3-8";

/// Fallback software version when framework detection fails.
const FALLBACK_SOFTWARE_VERSION: &str = "1.15";

/// Length of the random pod name suffix.
const NAME_SUFFIX_LEN: usize = 5;

/// What a caller wants from [`FleetManager::get`].
///
/// A request either names a specific pod or describes an acceptable one by
/// version. Naming a pod bypasses the usability and freeness checks; the
/// ledger still arbitrates the claim.
#[derive(Debug, Clone)]
pub struct AcquireRequest {
    /// Exact pod name to acquire, when the caller knows it.
    pub name: Option<String>,
    /// Accelerator generation/topology, e.g. `v3-8`.
    pub version: String,
    /// Request a preemptible pod if one has to be created.
    pub preemptible: bool,
    /// Zone override for a pod that has to be created.
    pub zone: Option<String>,
}

impl Default for AcquireRequest {
    fn default() -> Self {
        Self {
            name: None,
            version: DEFAULT_VERSION.to_string(),
            preemptible: true,
            zone: None,
        }
    }
}

impl AcquireRequest {
    /// Request a specific pod by name.
    #[must_use]
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Request any usable, free pod of this version.
    #[must_use]
    pub fn by_version(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            ..Self::default()
        }
    }

    /// Set the zone used when provisioning on a miss.
    #[must_use]
    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    /// Set whether a provisioned pod may be preemptible.
    #[must_use]
    pub fn with_preemptible(mut self, preemptible: bool) -> Self {
        self.preemptible = preemptible;
        self
    }

    fn selector(&self) -> AccelResult<Selector> {
        validate_version(&self.version)?;
        match &self.name {
            Some(name) => Ok(Selector::ByName(name.clone())),
            None => Ok(Selector::ByVersion(self.version.clone())),
        }
    }

    fn into_provision(self) -> ProvisionRequest {
        ProvisionRequest {
            // a fresh pod gets a generated name even when the request named
            // one; the requested name simply failed to resolve
            name: None,
            ip: None,
            version: self.version,
            preemptible: self.preemptible,
            zone: self.zone,
            background: false,
            attempts: DEFAULT_ATTEMPTS,
        }
    }
}

/// The acquisition path, resolved once at the call boundary.
enum Selector {
    ByName(String),
    ByVersion(String),
}

/// Parameters for provisioning a brand-new pod.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    /// Pod name; generated from the host prefix when absent.
    pub name: Option<String>,
    /// Address range; a fresh one is rolled per attempt when absent.
    pub ip: Option<String>,
    /// Accelerator generation/topology, e.g. `v3-8`.
    pub version: String,
    pub preemptible: bool,
    /// Zone override for the create call; the context zone applies when
    /// unset.
    pub zone: Option<String>,
    /// Ask the provider to return without waiting for readiness.
    pub background: bool,
    /// Create attempts before giving up.
    pub attempts: u32,
}

impl Default for ProvisionRequest {
    fn default() -> Self {
        Self {
            name: None,
            ip: None,
            version: DEFAULT_VERSION.to_string(),
            preemptible: true,
            zone: None,
            background: false,
            attempts: DEFAULT_ATTEMPTS,
        }
    }
}

impl ProvisionRequest {
    /// Pin the pod name instead of generating one.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Request this accelerator version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set the zone passed to the create call.
    #[must_use]
    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    /// Set whether the pod is created preemptible.
    #[must_use]
    pub fn with_preemptible(mut self, preemptible: bool) -> Self {
        self.preemptible = preemptible;
        self
    }

    /// Create in the background (provider returns before readiness).
    #[must_use]
    pub fn with_background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    /// Override the create attempt budget.
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

/// Source of candidate pod names and address ranges.
///
/// Candidates may collide with what the fleet already tracks; the manager
/// keeps drawing until one is collision-free.
pub trait CandidateSource: Send + Sync {
    /// A fresh lowercase name suffix.
    fn suffix(&self) -> String;

    /// A fresh `10.x.y.0` address range.
    fn ip_range(&self) -> String;
}

/// Thread-local randomness, the default candidate source.
#[derive(Debug, Clone, Default)]
pub struct RandomCandidates;

impl CandidateSource for RandomCandidates {
    fn suffix(&self) -> String {
        random_suffix(NAME_SUFFIX_LEN)
    }

    fn ip_range(&self) -> String {
        let mut rng = rand::thread_rng();
        format!("10.{}.{}.0", rng.gen_range(1..=98), rng.gen_range(1..=98))
    }
}

/// Tracks and reconciles the accelerator pods belonging to one host.
///
/// The collection is insertion-ordered and unique by name. It reflects
/// provider ground truth only after a [`refresh`](Self::refresh) pass;
/// between passes it may hold pods the provider has since deleted.
pub struct FleetManager {
    ctx: Arc<FleetContext>,
    resources: Vec<Arc<Accelerator>>,
    candidates: Arc<dyn CandidateSource>,
}

impl FleetManager {
    /// A manager with no tracked pods. Call [`refresh`](Self::refresh) to
    /// adopt what the provider already has.
    #[must_use]
    pub fn new(ctx: Arc<FleetContext>) -> Self {
        Self {
            ctx,
            resources: Vec::new(),
            candidates: Arc::new(RandomCandidates),
        }
    }

    /// Draw pod names and address ranges from `source` instead of
    /// thread-local randomness.
    #[must_use]
    pub fn with_candidates(mut self, source: Arc<dyn CandidateSource>) -> Self {
        self.candidates = source;
        self
    }

    /// Shared context handle.
    #[must_use]
    pub fn context(&self) -> &Arc<FleetContext> {
        &self.ctx
    }

    /// Tracked pods, in insertion order.
    #[must_use]
    pub fn pods(&self) -> &[Arc<Accelerator>] {
        &self.resources
    }

    /// Names of every tracked pod.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.resources
            .iter()
            .map(|pod| pod.name().to_string())
            .collect()
    }

    /// Known pod addresses; pods without a reported address are skipped.
    #[must_use]
    pub fn ips(&self) -> Vec<String> {
        self.resources
            .iter()
            .filter_map(|pod| pod.ip().map(ToString::to_string))
            .collect()
    }

    /// Tracked pod with exactly this name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<Arc<Accelerator>> {
        self.resources
            .iter()
            .find(|pod| pod.name() == name)
            .cloned()
    }

    /// Track an already constructed pod. A pod with the same name is
    /// already tracked once; the existing handle is returned.
    pub fn add(&mut self, pod: Accelerator) -> Arc<Accelerator> {
        if let Some(existing) = self.find(pod.name()) {
            return existing;
        }
        let pod = Arc::new(pod);
        self.resources.push(Arc::clone(&pod));
        pod
    }

    /// Adopt a pod by name, fetching its details from the provider.
    ///
    /// # Errors
    /// Returns an error if the describe call fails.
    pub async fn add_named(&mut self, name: &str) -> AccelResult<Arc<Accelerator>> {
        let pod = Accelerator::fetch(Arc::clone(&self.ctx), name).await?;
        Ok(self.add(pod))
    }

    /// Stop tracking `name`. Returns the detached pod, if it was tracked.
    pub fn remove(&mut self, name: &str) -> Option<Arc<Accelerator>> {
        let idx = self.resources.iter().position(|pod| pod.name() == name)?;
        Some(self.resources.remove(idx))
    }

    /// Two-phase reconciliation: adopt unknown pods, then prune.
    ///
    /// # Errors
    /// Returns an error if the provider cannot be listed or a pruned pod
    /// cannot be deleted.
    pub async fn refresh(&mut self, background: bool) -> AccelResult<()> {
        self.collect_existing().await?;
        self.clean(background).await
    }

    /// Adopt every provider-reported pod not yet tracked.
    ///
    /// A pod whose describe fails during adoption is logged and skipped;
    /// the next refresh retries it.
    ///
    /// # Errors
    /// Returns an error if the list command fails.
    pub async fn collect_existing(&mut self) -> AccelResult<()> {
        let names = self.ctx.list_pod_names().await?;
        let known = self.names();

        for name in names {
            if known.contains(&name) {
                continue;
            }
            match Accelerator::fetch(Arc::clone(&self.ctx), &name).await {
                Ok(pod) => {
                    debug!(pod = %name, "Found pod");
                    self.resources.push(Arc::new(pod));
                }
                Err(e) => {
                    warn!(pod = %name, error = %e, "Failed to adopt pod");
                }
            }
        }
        Ok(())
    }

    /// Drop every pod that is no longer usable, deleting it provider-side.
    ///
    /// A pod the provider no longer lists is simply dropped; the delete
    /// call no-ops for it.
    ///
    /// # Errors
    /// Returns an error if the list command fails or a delete call
    /// exhausts its retries.
    pub async fn clean(&mut self, background: bool) -> AccelResult<()> {
        let mut doomed = Vec::new();
        for pod in &self.resources {
            if !pod.usable().await? {
                doomed.push(Arc::clone(pod));
            }
        }

        for pod in doomed {
            self.remove(pod.name());
            pod.delete_remote(background).await?;
        }
        Ok(())
    }

    /// Acquire a pod: reuse a tracked one when the request allows it,
    /// provision otherwise, and claim it either way.
    ///
    /// By-name requests return the named pod regardless of its health; the
    /// scan path takes the first tracked pod matching the version that is
    /// usable and free. Misses provision a new pod, which always carries a
    /// freshly generated name even when the request named one.
    ///
    /// # Errors
    /// Returns [`AccelError::InvalidVersion`] for a malformed version,
    /// [`AccelError::AlreadyClaimed`] when the claim loses to a live
    /// process, or [`AccelError::ProvisioningFailed`] when creation runs
    /// out of attempts.
    pub async fn get(&mut self, req: AcquireRequest) -> AccelResult<Arc<Accelerator>> {
        let selector = req.selector()?;

        let found = match &selector {
            Selector::ByName(name) => self.find(name),
            Selector::ByVersion(version) => self.first_usable(version).await?,
        };

        let pod = match found {
            Some(pod) => pod,
            None => {
                debug!("No tracked pod satisfies the request, provisioning");
                self.up(req.into_provision()).await?
            }
        };

        pod.claim()?;
        Ok(pod)
    }

    /// Provision a new pod, retrying with fresh address ranges.
    ///
    /// The name is fixed for the whole call; the address range is re-rolled
    /// every attempt unless the request pins one.
    ///
    /// # Errors
    /// Returns [`AccelError::ProvisioningFailed`] with the last attempt's
    /// stderr once the budget is spent.
    pub async fn up(&mut self, req: ProvisionRequest) -> AccelResult<Arc<Accelerator>> {
        let name = match req.name.clone() {
            Some(name) => name,
            None => self.new_name(),
        };
        let attempts = req.attempts.max(1);
        let mut delay = self.ctx.retry.initial_delay;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let ip = match req.ip.clone() {
                Some(ip) => ip,
                None => self.new_ip(),
            };
            info!(pod = %name, ip = %ip, attempt, "Trying to acquire pod");

            match self.provision(&name, &ip, &req).await {
                Ok(()) => {
                    let pod = Arc::new(Accelerator::fetch(Arc::clone(&self.ctx), &name).await?);
                    self.resources.push(Arc::clone(&pod));
                    return Ok(pod);
                }
                Err(e) => {
                    debug!(pod = %name, error = %e, "Provisioning attempt failed");
                    if attempt >= attempts {
                        let stderr = match e {
                            AccelError::CommandFailed { stderr, .. } => stderr,
                            other => other.to_string(),
                        };
                        return Err(AccelError::ProvisioningFailed {
                            name,
                            attempts,
                            stderr,
                        });
                    }
                    tokio::time::sleep(delay).await;
                    delay = self.ctx.retry.next_delay(delay);
                }
            }
        }
    }

    /// Stop every tracked pod, isolating per-pod failures.
    pub async fn down(&self, background: bool) {
        for pod in &self.resources {
            if let Err(e) = pod.down(background).await {
                error!(pod = %pod.name(), error = %e, "Failed to shut down pod");
            }
        }
    }

    /// Delete every tracked pod and empty the collection, isolating
    /// per-pod failures.
    pub async fn delete(&mut self, background: bool) {
        let doomed = std::mem::take(&mut self.resources);
        for pod in doomed {
            if let Err(e) = pod.delete_remote(background).await {
                error!(pod = %pod.name(), error = %e, "Failed to delete pod");
            }
        }
    }

    async fn first_usable(&mut self, version: &str) -> AccelResult<Option<Arc<Accelerator>>> {
        let mut vanished = Vec::new();
        let mut found = None;

        for pod in &self.resources {
            debug!(pod = %pod.name(), "Considering pod");
            if pod.version() != Some(version) {
                continue;
            }
            if !pod.still_exists().await? {
                debug!(pod = %pod.name(), "Pod vanished provider-side, dropping");
                vanished.push(pod.name().to_string());
                continue;
            }
            if pod.usable().await? && pod.free()? {
                found = Some(Arc::clone(pod));
                break;
            }
        }

        for name in vanished {
            self.remove(&name);
        }
        Ok(found)
    }

    async fn provision(&self, name: &str, ip: &str, req: &ProvisionRequest) -> AccelResult<()> {
        let mut argv = self.ctx.pod_command("create");
        argv.push(name.to_string());
        argv.push(format!("--range={ip}"));
        argv.push(format!("--accelerator-type={}", req.version));
        argv.push(format!("--software-version={}", self.ctx.software_version));
        let zone_flag = req
            .zone
            .as_ref()
            .map(|zone| format!("--zone={zone}"))
            .or_else(|| self.ctx.zone_flag());
        if let Some(flag) = zone_flag {
            argv.push(flag);
        }
        if req.preemptible {
            argv.push("--preemptible".to_string());
        }
        if req.background {
            argv.push("--async".to_string());
        }

        run_checked(self.ctx.runner.as_ref(), &argv).await?;
        Ok(())
    }

    fn new_name(&self) -> String {
        let taken = self.names();
        loop {
            let name = format!("{}-{}", self.ctx.host, self.candidates.suffix());
            if !taken.contains(&name) {
                return name;
            }
        }
    }

    fn new_ip(&self) -> String {
        let taken = self.ips();
        loop {
            let ip = self.candidates.ip_range();
            if !taken.contains(&ip) {
                return ip;
            }
        }
    }
}

/// Accelerator versions look like `v3-8`: generation digit, dash, core count.
fn validate_version(version: &str) -> AccelResult<()> {
    let pattern = Regex::new(r"^v\d-\d+").map_err(|e| AccelError::Config(e.to_string()))?;
    if pattern.is_match(version) {
        Ok(())
    } else {
        Err(AccelError::InvalidVersion {
            version: version.to_string(),
        })
    }
}

/// `len` distinct random lowercase letters.
fn random_suffix(len: usize) -> String {
    let mut letters: Vec<char> = ('a'..='z').collect();
    letters.shuffle(&mut rand::thread_rng());
    letters.into_iter().take(len).collect()
}

/// Probe the locally installed TensorFlow for the software version new pods
/// should run.
///
/// Nightly builds map to `nightly`. Stable builds keep the `major.minor`
/// form while it parses at or below 2.3 and use the full version otherwise.
/// Detection failure falls back to "1.15" with a warning.
pub async fn detect_software_version(runner: &dyn CommandRunner) -> String {
    let argv = vec![
        "python3".to_string(),
        "-c".to_string(),
        "import tensorflow as tf; print(tf.__version__)".to_string(),
    ];

    let reported = match runner.run(&argv).await {
        Ok(output) if output.success() => output.stdout.trim().to_string(),
        _ => String::new(),
    };

    match software_version_from(&reported) {
        Some(version) => {
            if version == "nightly" {
                info!("Found TensorFlow nightly, using software version: nightly");
            }
            version
        }
        None => {
            warn!("Unable to determine TensorFlow version, assuming {FALLBACK_SOFTWARE_VERSION}");
            FALLBACK_SOFTWARE_VERSION.to_string()
        }
    }
}

/// Map a framework version string to a pod software version.
fn software_version_from(reported: &str) -> Option<String> {
    let pattern = Regex::new(r"(\d+\.\d+)\.\d+").ok()?;
    let caps = pattern.captures(reported)?;
    if reported.contains("dev") {
        return Some("nightly".to_string());
    }
    let core = caps.get(1)?.as_str();
    let numeric: f64 = core.parse().ok()?;
    // float compare, so "2.12" stays at or below 2.3 and keeps the short form
    if numeric <= 2.3 {
        Some(core.to_string())
    } else {
        Some(caps.get(0)?.as_str().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_software_version_mapping() {
        assert_eq!(software_version_from("1.15.5"), Some("1.15".to_string()));
        assert_eq!(software_version_from("2.3.4"), Some("2.3".to_string()));
        assert_eq!(software_version_from("2.4.1"), Some("2.4.1".to_string()));
        assert_eq!(software_version_from("2.12.0"), Some("2.12".to_string()));
        assert_eq!(
            software_version_from("2.5.0.dev20210101"),
            Some("nightly".to_string())
        );
        assert_eq!(software_version_from("not a version"), None);
        assert_eq!(software_version_from("weird-dev-build"), None);
        assert_eq!(software_version_from(""), None);
    }

    #[test]
    fn test_validate_version() {
        assert!(validate_version("v3-8").is_ok());
        assert!(validate_version("v2-256").is_ok());
        assert!(validate_version("3-8").is_err());
        assert!(validate_version("v38").is_err());
        assert!(validate_version("").is_err());
    }

    #[test]
    fn test_random_suffix_is_distinct_lowercase() {
        for _ in 0..50 {
            let suffix = random_suffix(5);
            assert_eq!(suffix.len(), 5);
            assert!(suffix.chars().all(|c| c.is_ascii_lowercase()));
            let mut chars: Vec<char> = suffix.chars().collect();
            chars.sort_unstable();
            chars.dedup();
            assert_eq!(chars.len(), 5);
        }
    }

    #[test]
    fn test_random_ip_range_shape() {
        let source = RandomCandidates;
        for _ in 0..50 {
            let range = source.ip_range();
            let octets: Vec<&str> = range.split('.').collect();
            assert_eq!(octets.len(), 4);
            assert_eq!(octets[0], "10");
            assert_eq!(octets[3], "0");
            for octet in &octets[1..3] {
                let value: u8 = octet.parse().unwrap();
                assert!((1..=98).contains(&value));
            }
        }
    }

    #[test]
    fn test_acquire_request_defaults() {
        let req = AcquireRequest::default();
        assert_eq!(req.version, "v3-8");
        assert!(req.preemptible);
        assert!(req.name.is_none());

        let req = AcquireRequest::by_name("host1-abcde").with_preemptible(false);
        assert_eq!(req.name.as_deref(), Some("host1-abcde"));
        assert!(!req.preemptible);
    }

    #[test]
    fn test_provision_request_builder() {
        let req = ProvisionRequest::default()
            .with_version("v2-8")
            .with_zone("us-central1-b")
            .with_background(true)
            .with_attempts(2);
        assert_eq!(req.version, "v2-8");
        assert_eq!(req.zone.as_deref(), Some("us-central1-b"));
        assert!(req.background);
        assert_eq!(req.attempts, 2);
    }
}
