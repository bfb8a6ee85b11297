//! Single-instance lock
//!
//! Two invocations must never probe the host at the same time: they would
//! double-book provider connections and race on queue edits. The lock file
//! under `<tempdir>/completion/` holds the host's `ServerTime` at creation,
//! which lets a new invocation tell a live run from a leftover of a host
//! restart or a crashed run.

use crate::error::Result;
use crate::report::Reporter;
use std::fs;
use std::path::{Path, PathBuf};

/// A lock older than this is assumed to belong to a crashed run
const STALE_AFTER_SECS: i64 = 30 * 60;

/// What an existing (or absent) lock stamp means for this invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockDisposition {
    /// No live owner: take the lock
    Acquire,
    /// Owner crashed mid-run: take the lock and undo its host pause
    AcquireAfterCrash,
    /// Another invocation is live right now
    Busy,
}

/// Classify an existing lock stamp against the host clock
///
/// A stamp from before the host's last restart is stale (the owning run
/// died with the host). A stamp older than 30 minutes on a host that has
/// been up longer than that belongs to a crashed run.
pub fn evaluate(stamp: Option<i64>, server_time: i64, up_time_sec: i64) -> LockDisposition {
    match stamp {
        None => LockDisposition::Acquire,
        Some(ts) if server_time - up_time_sec > ts => LockDisposition::Acquire,
        Some(ts) if server_time - STALE_AFTER_SECS > ts => LockDisposition::AcquireAfterCrash,
        Some(_) => LockDisposition::Busy,
    }
}

/// Result of trying to take the lock
#[derive(Debug)]
pub enum LockOutcome {
    /// Lock taken
    Acquired(LockFile),
    /// Lock taken over from a crashed run; caller must resume host downloads
    AcquiredAfterCrash(LockFile),
    /// A live run holds the lock; exit without action
    Busy,
}

/// Held lock; release deletes the file
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Lock file location under the host temp directory
    pub fn path_for(temp_dir: &Path) -> PathBuf {
        temp_dir.join("completion").join("completion.lock")
    }

    /// Try to take the single-instance lock
    pub fn acquire(
        temp_dir: &Path,
        server_time: i64,
        up_time_sec: i64,
        reporter: &Reporter,
    ) -> Result<LockOutcome> {
        let path = Self::path_for(temp_dir);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let stamp = match fs::read_to_string(&path) {
            Ok(content) => {
                let stamp = content.lines().next().and_then(|l| l.trim().parse().ok());
                reporter.verbose(format!(
                    "time_stamp from completion.lock file= {}",
                    stamp.map_or_else(|| "invalid".to_string(), |s: i64| s.to_string())
                ));
                // an unreadable stamp cannot belong to a live run
                stamp
            }
            Err(_) => None,
        };
        let existed = path.is_file();

        match evaluate(stamp.filter(|_| existed), server_time, up_time_sec) {
            LockDisposition::Acquire => {
                fs::write(&path, server_time.to_string())?;
                if existed {
                    reporter.verbose("Old completion.lock file overwritten.");
                } else {
                    reporter.verbose(format!("server_time= {server_time}"));
                    reporter.verbose("New completion.lock file created.");
                }
                Ok(LockOutcome::Acquired(LockFile { path }))
            }
            LockDisposition::AcquireAfterCrash => {
                reporter.error(
                    "Script seems to be running for more than 30 minutes and has most \
                     likely crashed. Check your logs and report the log and errors at \
                     https://github.com/nzbgetcom/Extension-Completion/issues",
                );
                fs::write(&path, server_time.to_string())?;
                reporter.verbose("Existing completion.lock file overwritten.");
                Ok(LockOutcome::AcquiredAfterCrash(LockFile { path }))
            }
            LockDisposition::Busy => {
                reporter.verbose("Script is already running, check canceled.");
                Ok(LockOutcome::Busy)
            }
        }
    }

    /// Delete the lock at normal end of the run
    pub fn release(self, reporter: &Reporter) {
        if fs::remove_file(&self.path).is_ok() {
            reporter.verbose("completion.lock file deleted");
        }
    }
}
