//! Provider command execution.
//!
//! All provider interaction happens through external CLI invocations. The
//! [`CommandRunner`] trait is the seam between the fleet logic and the
//! operating system: production code uses [`ShellRunner`], tests substitute
//! scripted outputs.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{AccelError, AccelResult};

/// Default number of attempts for provider mutations.
pub const DEFAULT_ATTEMPTS: u32 = 5;

/// Captured output of one provider command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Process exit code (`-1` when terminated by a signal).
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Executes provider commands.
///
/// A nonzero exit is an `Ok` output with `code != 0`; only failures to run
/// the command at all surface as `Err`.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `argv` to completion and capture its output.
    ///
    /// # Errors
    /// Returns an error when the command cannot be run at all.
    async fn run(&self, argv: &[String]) -> AccelResult<CommandOutput>;
}

/// Runs commands as real OS processes.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, argv: &[String]) -> AccelResult<CommandOutput> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| AccelError::Config("empty command line".to_string()))?;

        debug!(command = %argv.join(" "), "Executing provider command");

        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| AccelError::Spawn {
                command: program.clone(),
                source: e,
            })?;

        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Run `argv` and require a zero exit.
///
/// # Errors
/// Returns [`AccelError::CommandFailed`] on a nonzero exit.
pub async fn run_checked(
    runner: &dyn CommandRunner,
    argv: &[String],
) -> AccelResult<CommandOutput> {
    let output = runner.run(argv).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(AccelError::CommandFailed {
            command: argv.join(" "),
            code: output.code,
            stderr: output.stderr.trim().to_string(),
        })
    }
}

/// Retry schedule for provider mutations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts.
    pub attempts: u32,
    /// Initial delay between attempts.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy with a custom attempt budget and default delays.
    #[must_use]
    pub fn with_attempts(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            ..Self::default()
        }
    }

    /// The delay to use after `current`, capped at `max_delay`.
    #[must_use]
    pub fn next_delay(&self, current: Duration) -> Duration {
        std::cmp::min(
            self.max_delay,
            Duration::from_secs_f64(current.as_secs_f64() * self.backoff_multiplier),
        )
    }
}

/// Re-invoke a command until it exits zero or the attempt budget runs out.
///
/// `make_argv` is called before every attempt so callers can vary the
/// command between tries. Returns the argv that finally succeeded together
/// with its output.
///
/// # Errors
/// Returns [`AccelError::RetriesExhausted`] carrying the last attempt's
/// output once the budget is spent; spawn failures propagate immediately.
pub async fn run_with_retry<F>(
    runner: &dyn CommandRunner,
    policy: &RetryPolicy,
    mut make_argv: F,
) -> AccelResult<(Vec<String>, CommandOutput)>
where
    F: FnMut() -> Vec<String>,
{
    let attempts = policy.attempts.max(1);
    let mut delay = policy.initial_delay;
    let mut attempt = 0;

    loop {
        attempt += 1;
        let argv = make_argv();
        let output = runner.run(&argv).await?;

        if output.success() {
            debug!(command = %argv.join(" "), "Provider command succeeded");
            return Ok((argv, output));
        }

        debug!(
            command = %argv.join(" "),
            code = output.code,
            attempt,
            attempts,
            "Provider command failed, retrying"
        );

        if attempt >= attempts {
            return Err(AccelError::RetriesExhausted {
                command: argv.join(" "),
                attempts,
                stdout: output.stdout.trim().to_string(),
                stderr: output.stderr.trim().to_string(),
            });
        }

        tokio::time::sleep(delay).await;
        delay = policy.next_delay(delay);
    }
}
