//! File-backed claim registry shared across processes.
//!
//! The ledger is a JSON object mapping pod name to the process id that
//! claims it, stored in one file with a companion `.lock` file. Every
//! operation takes a blocking exclusive `flock` on the companion, reads the
//! whole mapping, applies its change, and rewrites the file atomically.
//! Entries pointing at dead processes are stale and get reclaimed.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{AccelError, AccelResult};

/// Cross-process claim registry for accelerator pods.
pub struct ClaimLedger {
    path: PathBuf,
    lock_path: PathBuf,
}

impl ClaimLedger {
    /// Open (and create if absent) the ledger at `path`.
    ///
    /// # Errors
    /// Returns an error if the parent directory cannot be created or the
    /// ledger files cannot be touched.
    pub fn open(path: impl Into<PathBuf>) -> AccelResult<Self> {
        let path = path.into();
        let lock_path = PathBuf::from(format!("{}.lock", path.display()));

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        if !path.exists() {
            File::create(&path)?;
        }
        if !lock_path.exists() {
            File::create(&lock_path)?;
        }

        Ok(Self { path, lock_path })
    }

    /// Path of the ledger file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Claim `name` for the calling process.
    ///
    /// A claim this process already holds is a no-op. An entry held by a
    /// dead process is overwritten with a warning.
    ///
    /// # Errors
    /// Returns [`AccelError::AlreadyClaimed`] when another live process
    /// holds the entry.
    pub fn register_in_use(&self, name: &str) -> AccelResult<()> {
        let _lock = LedgerLock::acquire(&self.lock_path)?;
        let mut entries = self.read_entries()?;
        let own_pid = std::process::id();

        if let Some(&holder) = entries.get(name) {
            if holder == own_pid {
                return Ok(());
            }
            if is_pid_alive(holder) {
                return Err(AccelError::AlreadyClaimed {
                    name: name.to_string(),
                    pid: holder,
                });
            }
            warn!(
                pod = %name,
                pid = holder,
                "Forcefully acquiring pod from dead process"
            );
        }

        entries.insert(name.to_string(), own_pid);
        self.write_entries(&entries)
    }

    /// Drop the entry for `name` if present.
    ///
    /// # Errors
    /// Returns an error if the ledger file cannot be read or rewritten.
    pub fn register_free(&self, name: &str) -> AccelResult<()> {
        let _lock = LedgerLock::acquire(&self.lock_path)?;
        let mut entries = self.read_entries()?;
        if entries.remove(name).is_some() {
            self.write_entries(&entries)?;
        }
        Ok(())
    }

    /// Whether a live process claims `name`.
    ///
    /// An entry held by a dead process is pruned with a warning and counts
    /// as free.
    ///
    /// # Errors
    /// Returns an error if the ledger file cannot be read or rewritten.
    pub fn check_if_in_use(&self, name: &str) -> AccelResult<bool> {
        let _lock = LedgerLock::acquire(&self.lock_path)?;
        let mut entries = self.read_entries()?;

        match entries.get(name).copied() {
            Some(pid) if is_pid_alive(pid) => Ok(true),
            Some(pid) => {
                warn!(pod = %name, pid, "Removing pod entry held by dead process");
                entries.remove(name);
                self.write_entries(&entries)?;
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// The full name-to-pid mapping, read under the lock.
    ///
    /// # Errors
    /// Returns an error if the ledger file cannot be read or parsed.
    pub fn snapshot(&self) -> AccelResult<BTreeMap<String, u32>> {
        let _lock = LedgerLock::acquire(&self.lock_path)?;
        self.read_entries()
    }

    fn read_entries(&self) -> AccelResult<BTreeMap<String, u32>> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) if raw.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_entries(&self, entries: &BTreeMap<String, u32>) -> AccelResult<()> {
        let tmp = PathBuf::from(format!("{}.tmp", self.path.display()));
        std::fs::write(&tmp, serde_json::to_string(entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// RAII guard for the companion lock file.
///
/// Acquisition blocks until the lock is granted; dropping the guard (or the
/// process dying) releases it.
struct LedgerLock {
    file: File,
}

impl LedgerLock {
    fn acquire(path: &Path) -> AccelResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        // SAFETY: flock is a plain POSIX call on a descriptor owned by
        // `file` for the lifetime of the guard.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(AccelError::Io(io::Error::last_os_error()));
        }

        debug!(lock = %path.display(), "Acquired ledger lock");
        Ok(Self { file })
    }
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        // SAFETY: unlocking a descriptor this guard still owns. Closing the
        // descriptor would release the lock anyway.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Whether `pid` refers to a live process.
///
/// Uses `kill(pid, 0)`, which probes for existence without delivering a
/// signal. `EPERM` means the process exists under another uid and counts as
/// alive.
#[must_use]
pub fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let Ok(pid_i32) = i32::try_from(pid) else {
        return false;
    };
    // SAFETY: kill with signal 0 only checks for process existence.
    let rc = unsafe { libc::kill(pid_i32, 0) };
    if rc == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Pid 1 is init and always alive; this one is far beyond pid_max.
    const DEAD_PID: u32 = 999_999_999;

    fn ledger_in(dir: &TempDir) -> ClaimLedger {
        ClaimLedger::open(dir.path().join("registry")).unwrap()
    }

    #[test]
    fn test_own_pid_is_alive() {
        assert!(is_pid_alive(std::process::id()));
        assert!(!is_pid_alive(DEAD_PID));
        assert!(!is_pid_alive(0));
    }

    #[test]
    fn test_claim_release_roundtrip() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);

        ledger.register_in_use("host1-abcde").unwrap();
        assert!(ledger.check_if_in_use("host1-abcde").unwrap());

        let snapshot = ledger.snapshot().unwrap();
        assert_eq!(snapshot.get("host1-abcde"), Some(&std::process::id()));

        ledger.register_free("host1-abcde").unwrap();
        assert!(!ledger.check_if_in_use("host1-abcde").unwrap());
        assert!(ledger.snapshot().unwrap().is_empty());
    }

    #[test]
    fn test_reclaim_is_noop_for_own_pid() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);

        ledger.register_in_use("host1-abcde").unwrap();
        ledger.register_in_use("host1-abcde").unwrap();
        assert_eq!(ledger.snapshot().unwrap().len(), 1);
    }

    #[test]
    fn test_live_foreign_claim_is_rejected() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);
        std::fs::write(ledger.path(), r#"{"host1-abcde": 1}"#).unwrap();

        let err = ledger.register_in_use("host1-abcde").unwrap_err();
        match err {
            AccelError::AlreadyClaimed { name, pid } => {
                assert_eq!(name, "host1-abcde");
                assert_eq!(pid, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(ledger.check_if_in_use("host1-abcde").unwrap());
    }

    #[test]
    fn test_dead_pid_entry_is_overwritten() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);
        std::fs::write(ledger.path(), format!(r#"{{"host1-abcde": {DEAD_PID}}}"#)).unwrap();

        ledger.register_in_use("host1-abcde").unwrap();
        assert_eq!(
            ledger.snapshot().unwrap().get("host1-abcde"),
            Some(&std::process::id())
        );
    }

    #[test]
    fn test_dead_pid_entry_is_pruned_on_check() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);
        std::fs::write(ledger.path(), format!(r#"{{"host1-abcde": {DEAD_PID}}}"#)).unwrap();

        assert!(!ledger.check_if_in_use("host1-abcde").unwrap());
        assert!(ledger.snapshot().unwrap().is_empty());
    }

    #[test]
    fn test_empty_file_reads_as_empty_mapping() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);

        assert!(ledger.snapshot().unwrap().is_empty());
        assert!(!ledger.check_if_in_use("anything").unwrap());
    }

    #[test]
    fn test_free_unknown_name_is_noop() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);
        ledger.register_free("never-registered").unwrap();
    }

    #[test]
    fn test_other_entries_survive_mutation() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);
        std::fs::write(ledger.path(), r#"{"host1-other": 1}"#).unwrap();

        ledger.register_in_use("host1-mine").unwrap();
        ledger.register_free("host1-mine").unwrap();

        let snapshot = ledger.snapshot().unwrap();
        assert_eq!(snapshot.get("host1-other"), Some(&1));
    }
}
