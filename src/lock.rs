// ABOUTME: Single-instance guard - a PID file next to the sync state
// ABOUTME: A second forwarder on the same state file refuses to start

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Check if a process with the given PID is running.
#[cfg(unix)]
fn is_process_running(pid: i32) -> bool {
    // Send signal 0 to check if process exists
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Without a cheap liveness probe a recorded PID is assumed alive.
#[cfg(not(unix))]
fn is_process_running(_pid: i32) -> bool {
    true
}

/// Path of the PID file belonging to a state file.
pub fn pid_file_for(state_path: &Path) -> PathBuf {
    state_path.with_extension("pid")
}

/// Read the PID from a PID file, if it exists.
pub fn read_pid(pid_file: &Path) -> Result<Option<i32>> {
    if !pid_file.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(pid_file)
        .with_context(|| format!("Failed to read PID file: {:?}", pid_file))?;

    let pid: i32 = content
        .trim()
        .parse()
        .with_context(|| format!("Invalid PID in file: {}", content.trim()))?;

    Ok(Some(pid))
}

/// Status of the forwarder owning a state file.
#[derive(Debug, PartialEq, Eq)]
pub struct LockStatus {
    pub running: bool,
    pub pid: Option<i32>,
    pub pid_file_exists: bool,
}

pub fn check_status(state_path: &Path) -> Result<LockStatus> {
    let pid_file = pid_file_for(state_path);
    let pid_file_exists = pid_file.exists();

    let (running, pid) = match read_pid(&pid_file) {
        Ok(Some(pid)) => (is_process_running(pid), Some(pid)),
        Ok(None) => (false, None),
        Err(e) => {
            tracing::warn!("Ignoring unreadable PID file: {:?}", e);
            (false, None)
        }
    };

    Ok(LockStatus {
        running,
        pid,
        pid_file_exists,
    })
}

/// Held for the lifetime of a forwarder run; removes the PID file on drop.
#[derive(Debug)]
pub struct InstanceLock {
    pid_file: PathBuf,
}

impl InstanceLock {
    /// Take the lock for `state_path`. A stale PID file (process gone) is
    /// replaced.
    pub fn acquire(state_path: &Path) -> Result<Self> {
        let pid_file = pid_file_for(state_path);
        let status = check_status(state_path)?;
        let own_pid = std::process::id() as i32;

        if status.running && status.pid != Some(own_pid) {
            bail!(
                "Another forwarder (PID {}) is using {:?}. Stop it first or remove {:?}.",
                status.pid.unwrap_or_default(),
                state_path,
                pid_file
            );
        }
        if status.pid_file_exists && !status.running {
            tracing::warn!("Removing stale PID file {:?}", pid_file);
        }

        if let Some(parent) = pid_file.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }
        fs::write(&pid_file, own_pid.to_string())
            .with_context(|| format!("Failed to write PID file: {:?}", pid_file))?;

        Ok(Self { pid_file })
    }

    pub fn path(&self) -> &Path {
        &self.pid_file
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.pid_file) {
            tracing::warn!("Failed to remove PID file {:?}: {}", self.pid_file, e);
        }
    }
}
