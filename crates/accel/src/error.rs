//! Error types for accelerator fleet management.

use thiserror::Error;

/// Errors that can occur while managing accelerator pods.
#[derive(Error, Debug)]
pub enum AccelError {
    /// A single provider command exited nonzero.
    #[error("Command `{command}` exited with code {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    /// A retried provider command never succeeded.
    #[error("Command `{command}` failed {attempts} times; stdout: {stdout}; stderr: {stderr}")]
    RetriesExhausted {
        command: String,
        attempts: u32,
        stdout: String,
        stderr: String,
    },

    /// Every provisioning attempt for a new pod failed.
    #[error("Provisioning pod '{name}' failed after {attempts} attempts: {stderr}")]
    ProvisioningFailed {
        name: String,
        attempts: u32,
        stderr: String,
    },

    /// Another live process holds the claim ledger entry for this pod.
    #[error("Pod '{name}' is already claimed by process {pid}")]
    AlreadyClaimed { name: String, pid: u32 },

    /// Release was called on a pod this process never claimed.
    #[error("Pod '{name}' is not claimed by this process")]
    NotClaimed { name: String },

    /// No tracked pod matches the requested name.
    #[error("Pod '{name}' not found")]
    NotFound { name: String },

    /// Accelerator version string does not look like a generation/topology pair.
    #[error("Invalid accelerator version '{version}' (expected the form 'v3-8')")]
    InvalidVersion { version: String },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The command binary could not be started at all.
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Ledger (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Metadata server request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for fleet operations.
pub type AccelResult<T> = Result<T, AccelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failed_display() {
        let err = AccelError::CommandFailed {
            command: "gcloud compute tpus describe tpu-a".to_string(),
            code: 1,
            stderr: "not found".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Command `gcloud compute tpus describe tpu-a` exited with code 1: not found"
        );
    }

    #[test]
    fn test_already_claimed_display() {
        let err = AccelError::AlreadyClaimed {
            name: "host1-abcde".to_string(),
            pid: 4242,
        };
        assert_eq!(
            err.to_string(),
            "Pod 'host1-abcde' is already claimed by process 4242"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing ledger");
        let err: AccelError = io_err.into();
        assert!(matches!(err, AccelError::Io(_)));
    }
}
