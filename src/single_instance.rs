use std::fs;
use std::path::PathBuf;
use sysinfo::{Pid, System};
use tokio_util::sync::CancellationToken;

use crate::errors::{AppError, AppResult};

/// Held for the lifetime of the process; removes the lock file on drop.
#[derive(Debug)]
pub struct InstanceGuard {
    lock_file: PathBuf,
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        cleanup_lock_file(&self.lock_file);
    }
}

/// Fails when another tubecast process already owns the state store.
pub fn acquire() -> AppResult<InstanceGuard> {
    acquire_at(get_lock_file_path())
}

fn acquire_at(lock_file: PathBuf) -> AppResult<InstanceGuard> {
    if lock_file.exists() {
        if let Ok(pid_str) = fs::read_to_string(&lock_file) {
            if let Ok(pid) = pid_str.trim().parse::<u32>() {
                if pid != std::process::id() && is_tubecast_process(pid) {
                    return Err(AppError::Config(format!(
                        "Another tubecast process (PID {}) is running. Wait for it to finish or remove {}",
                        pid,
                        lock_file.display()
                    )));
                }
            }
        }

        // Lock file exists but its process is dead
        log::debug!("Removing stale lock file {}", lock_file.display());
        let _ = fs::remove_file(&lock_file);
    }

    let current_pid = std::process::id();
    fs::write(&lock_file, current_pid.to_string())?;
    log::debug!("Created lock file with PID: {}", current_pid);

    Ok(InstanceGuard { lock_file })
}

fn is_tubecast_process(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes();

    system
        .process(Pid::from_u32(pid))
        .map(|process| process.name().to_lowercase().contains("tubecast"))
        .unwrap_or(false)
}

fn get_lock_file_path() -> PathBuf {
    std::env::temp_dir().join("tubecast.lock")
}

fn cleanup_lock_file(lock_file: &PathBuf) {
    if lock_file.exists() {
        if let Err(e) = fs::remove_file(lock_file) {
            log::warn!("Failed to remove lock file: {}", e);
        } else {
            log::debug!("Cleaned up lock file");
        }
    }
}

/// Ctrl+C cancels `token` once; a second Ctrl+C exits immediately.
pub fn register_cancel_handler(token: CancellationToken) -> AppResult<()> {
    ctrlc::set_handler(move || {
        if token.is_cancelled() {
            log::warn!("Second interrupt, exiting without cleanup");
            std::process::exit(130);
        }
        log::info!("Received Ctrl+C, finishing the current step and stopping...");
        token.cancel();
    })
    .map_err(|e| AppError::Internal(format!("Error setting Ctrl-C handler: {}", e)))
}
