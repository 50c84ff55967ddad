// Finalize and retention jobs.
//
// Both interact with the ring's on-disk contract from the outside and
// must never touch the live recording path:
// - The finalize runner invokes an external command (ffmpeg remux wrapped
//   in a script) that converts closed in-progress segments into their
//   player-compatible names. Output is captured and logged on failure.
// - The retention sweep deletes any segment file older than the full ring
//   span plus a grace period, recovering orphans from crashed processes
//   that the ring's own reuse never reclaimed.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use tokio::fs;
use tokio::process::Command;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Only ever touch files that look like segment files, in case the base
/// path is misconfigured.
fn is_segment_filename(name: &str) -> bool {
    name.ends_with(".mp4")
}

pub struct FinalizeRunner {
    command: String,
    base_path: PathBuf,
    interval: Duration,
}

impl FinalizeRunner {
    #[must_use]
    pub fn new(command: impl Into<String>, base_path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            command: command.into(),
            base_path: base_path.into(),
            interval,
        }
    }

    /// Run the finalize command once, capturing combined output.
    pub async fn run_once(&self) -> std::io::Result<()> {
        let output = Command::new(&self.command)
            .arg(&self.base_path)
            .output()
            .await?;

        if output.status.success() {
            debug!(command = %self.command, "finalize command completed");
        } else {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            error!(
                command = %self.command,
                status = %output.status,
                output = %combined,
                "finalize command failed"
            );
        }
        Ok(())
    }

    /// Drive the runner on its fixed interval until cancelled.
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            error!(command = %self.command, "failed to run finalize command: {e}");
                        }
                    }
                    () = cancel.cancelled() => break,
                }
            }
        })
    }
}

pub struct RetentionSweep {
    base_path: PathBuf,
    older_than: Duration,
    interval: Duration,
}

impl RetentionSweep {
    #[must_use]
    pub fn new(base_path: impl Into<PathBuf>, older_than: Duration, interval: Duration) -> Self {
        Self {
            base_path: base_path.into(),
            older_than,
            interval,
        }
    }

    /// Walk the base path and delete segment files past the retention
    /// window, regardless of any ring's bookkeeping.
    pub async fn run_once(&self) -> std::io::Result<usize> {
        if !fs::try_exists(&self.base_path).await.unwrap_or(false) {
            debug!(base = %self.base_path.display(), "sweep base path does not exist");
            return Ok(0);
        }

        let cutoff = SystemTime::now() - self.older_than;
        let mut deleted = 0usize;
        let mut pending = vec![self.base_path.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let Ok(file_type) = entry.file_type().await else {
                    continue;
                };
                if file_type.is_dir() {
                    pending.push(entry.path());
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }

                let name = entry.file_name();
                if !is_segment_filename(&name.to_string_lossy()) {
                    continue;
                }

                let Ok(metadata) = fs::metadata(entry.path()).await else {
                    continue;
                };
                let Ok(modified) = metadata.modified() else {
                    continue;
                };
                if modified < cutoff {
                    match fs::remove_file(entry.path()).await {
                        Ok(()) => {
                            deleted += 1;
                            debug!(path = %entry.path().display(), "swept stale segment file");
                        }
                        Err(e) => {
                            warn!(path = %entry.path().display(), "failed to sweep file: {e}");
                        }
                    }
                }
            }
        }

        if deleted > 0 {
            info!(
                base = %self.base_path.display(),
                deleted,
                older_than = ?self.older_than,
                "retention sweep removed stale segment files"
            );
        }
        Ok(deleted)
    }

    /// Drive the sweep on its fixed interval until cancelled. The first
    /// tick fires immediately, so crash orphans go away at startup.
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            error!(base = %self.base_path.display(), "retention sweep failed: {e}");
                        }
                    }
                    () = cancel.cancelled() => break,
                }
            }
        })
    }
}
