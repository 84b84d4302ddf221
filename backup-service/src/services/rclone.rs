//! Presence check and one-shot installation of the `rclone` binary needed
//! by rclone-backed repositories.

use crate::error::{BackupError, Result};
use crate::models::format_ts;
use crate::services::backup_engine::BackupService;
use crate::services::command_runner::{Invocation, UserIdentity};
use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const INSTALL_TIMEOUT: Duration = Duration::from_secs(20 * 60);
const VERSION_OUTPUT_LIMIT: usize = 64 * 1024;
const INSTALL_OUTPUT_LIMIT: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RcloneState {
    Available,
    Missing,
    Installing,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RcloneStatus {
    pub status: RcloneState,
    pub installed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
}

impl RcloneStatus {
    fn available(version: Option<String>, message: &str) -> Self {
        Self {
            status: RcloneState::Available,
            installed: true,
            version,
            message: message.to_string(),
            started_at: None,
            finished_at: None,
        }
    }

    fn missing() -> Self {
        Self {
            status: RcloneState::Missing,
            installed: false,
            version: None,
            message: "rclone is not installed.".to_string(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// Package installs run with full privileges.
fn superuser() -> UserIdentity {
    UserIdentity { name: "root".into(), home: PathBuf::from("/root"), uid: 0, gid: 0 }
}

impl BackupService {
    /// Current rclone availability. An install in flight, or the failure of
    /// the last one, is reported until the binary shows up.
    pub async fn rclone_status(&self) -> Result<RcloneStatus> {
        let installed = self.runner.locate("rclone");
        let version = if installed { self.rclone_version().await } else { None };

        let mut state = self.rclone.lock().await;
        if let Some(current) = state.as_ref() {
            match current.status {
                RcloneState::Installing => {
                    let mut current = current.clone();
                    if installed {
                        current.installed = true;
                        current.version = version;
                    }
                    return Ok(current);
                }
                RcloneState::Failed if !installed => return Ok(current.clone()),
                _ => {}
            }
        }

        let status = if installed {
            RcloneStatus::available(version, "rclone is installed and ready.")
        } else {
            RcloneStatus::missing()
        };
        *state = Some(status.clone());
        Ok(status)
    }

    /// Starts a background `apt-get install rclone`. A second call while one
    /// is running is a `Conflict`.
    pub async fn install_rclone(self: &Arc<Self>) -> Result<RcloneStatus> {
        let mut state = self.rclone.lock().await;
        if state.as_ref().is_some_and(|s| s.status == RcloneState::Installing) {
            return Err(BackupError::Conflict("rclone installation is already running".into()));
        }

        if self.runner.locate("rclone") {
            let status = RcloneStatus::available(self.rclone_version().await, "rclone is installed and ready.");
            *state = Some(status.clone());
            return Ok(status);
        }

        let started_at = format_ts(Utc::now());
        let status = RcloneStatus {
            status: RcloneState::Installing,
            installed: false,
            version: None,
            message: "Installing rclone...".to_string(),
            started_at: Some(started_at.clone()),
            finished_at: None,
        };
        *state = Some(status.clone());
        drop(state);
        tracing::info!("rclone installation started");

        let service = self.clone();
        self.tasks.spawn(async move {
            let result = tokio::time::timeout(INSTALL_TIMEOUT, service.run_rclone_install())
                .await
                .unwrap_or_else(|_| Err(BackupError::execution("rclone installation timed out")));

            let finished_at = Some(format_ts(Utc::now()));
            let next = match result {
                Ok(version) => {
                    tracing::info!(version = ?version, "rclone installed");
                    RcloneStatus {
                        started_at: Some(started_at),
                        finished_at,
                        ..RcloneStatus::available(version, "rclone installed successfully.")
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "rclone installation failed");
                    RcloneStatus {
                        status: RcloneState::Failed,
                        installed: false,
                        version: None,
                        message: e.to_string(),
                        started_at: Some(started_at),
                        finished_at,
                    }
                }
            };
            *service.rclone.lock().await = Some(next);
        });

        Ok(status)
    }

    async fn run_rclone_install(&self) -> Result<Option<String>> {
        let root = superuser();
        for (step, args) in [
            ("failed to update apt indexes", vec!["apt-get", "update", "-qq"]),
            ("failed to install rclone", vec!["apt-get", "install", "-y", "-qq", "rclone"]),
        ] {
            let invocation = Invocation::argv(args)
                .env("DEBIAN_FRONTEND", "noninteractive")
                .env("NEEDRESTART_SUSPEND", "1")
                .limited(INSTALL_OUTPUT_LIMIT);
            self.runner
                .run(&root, &invocation)
                .await?
                .into_result("apt-get")
                .map_err(|e| e.context(step))?;
        }

        if !self.runner.locate("rclone") {
            return Err(BackupError::execution("rclone installation finished but binary is still not available"));
        }
        Ok(self.rclone_version().await)
    }

    /// First line of `rclone version`, if it runs.
    async fn rclone_version(&self) -> Option<String> {
        let invocation = Invocation::argv(["rclone", "version"]).limited(VERSION_OUTPUT_LIMIT);
        match self.runner.run(&superuser(), &invocation).await {
            Ok(output) if output.success() => output
                .stdout
                .lines()
                .next()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string),
            Ok(output) => {
                tracing::debug!(output = %output.combined(), "rclone version failed");
                None
            }
            Err(e) => {
                tracing::debug!(error = %e, "rclone version failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{failure, success, Fixture};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_status_reports_missing_binary() {
        let fx = Fixture::new();
        fx.runner.set_missing("rclone");

        let status = fx.service.rclone_status().await.unwrap();
        assert_eq!(status.status, RcloneState::Missing);
        assert!(!status.installed);
        assert_eq!(fx.runner.calls_matching("rclone version"), 0);
    }

    #[tokio::test]
    async fn test_status_reports_version() {
        let fx = Fixture::new();
        fx.runner.on("rclone version", success("rclone v1.66.0\n- os/version: debian 12\n"));

        let status = fx.service.rclone_status().await.unwrap();
        assert_eq!(status.status, RcloneState::Available);
        assert_eq!(status.version.as_deref(), Some("rclone v1.66.0"));
    }

    #[tokio::test]
    async fn test_install_when_present_is_a_no_op() {
        let fx = Fixture::new();
        let status = fx.service.install_rclone().await.unwrap();
        assert_eq!(status.status, RcloneState::Available);
        assert_eq!(fx.runner.calls_matching("apt-get"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_second_install_conflicts_while_running() {
        let fx = Fixture::new();
        fx.runner.set_missing("rclone");
        let release = Arc::new(AtomicBool::new(false));
        {
            let release = release.clone();
            fx.runner.on_with(
                "apt-get update",
                success(""),
                Arc::new(move |_| {
                    while !release.load(Ordering::SeqCst) {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                }),
            );
        }

        let accepted = fx.service.install_rclone().await.unwrap();
        assert_eq!(accepted.status, RcloneState::Installing);
        assert!(accepted.started_at.is_some());

        let err = fx.service.install_rclone().await.unwrap_err();
        assert!(matches!(err, BackupError::Conflict(_)), "{err}");
        let status = fx.service.rclone_status().await.unwrap();
        assert_eq!(status.status, RcloneState::Installing);

        release.store(true, Ordering::SeqCst);
        fx.service.wait_idle().await;

        // The fake still reports the binary missing after apt-get.
        let status = fx.service.rclone_status().await.unwrap();
        assert_eq!(status.status, RcloneState::Failed);
        assert!(status.message.contains("still not available"), "{}", status.message);
        assert!(status.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_install_failure_keeps_apt_output() {
        let fx = Fixture::new();
        fx.runner.set_missing("rclone");
        fx.runner.on("apt-get install", failure(100, "E: Unable to locate package rclone"));

        fx.service.install_rclone().await.unwrap();
        fx.service.wait_idle().await;

        let status = fx.service.rclone_status().await.unwrap();
        assert_eq!(status.status, RcloneState::Failed);
        assert!(status.message.starts_with("failed to install rclone"), "{}", status.message);
        assert!(status.message.contains("Unable to locate package"));

        let commands = fx.runner.commands();
        assert_eq!(commands[0], "apt-get update -qq");
        assert_eq!(commands[1], "apt-get install -y -qq rclone");
        let env = &fx.runner.invocations()[1].env;
        assert!(env.contains(&("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string())));
    }
}
