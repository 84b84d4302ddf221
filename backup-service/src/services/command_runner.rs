//! Process execution under a hosting user's identity.
//!
//! Every external tool (restic, mysqldump, rsync, ...) is started through a
//! [`CommandRunner`]. The production [`ProcessRunner`] clears the environment,
//! runs in the user's home, and drops to the user's uid/gid when the service
//! itself runs as root.

use crate::error::{BackupError, Result};
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// Ceiling for captured stdout/stderr of commands whose output is only
/// used for diagnostics.
pub const MAX_CAPTURED_OUTPUT: usize = 1024 * 1024;

pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

const SAFE_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub name: String,
    pub home: PathBuf,
    pub uid: u32,
    pub gid: u32,
}

/// Resolves hosting usernames to system identities.
pub trait UserDirectory: Send + Sync {
    fn lookup(&self, username: &str) -> Result<UserIdentity>;
}

/// Looks users up in the system account database.
pub struct SystemUsers;

#[cfg(unix)]
impl UserDirectory for SystemUsers {
    fn lookup(&self, username: &str) -> Result<UserIdentity> {
        let user = nix::unistd::User::from_name(username)
            .map_err(|e| BackupError::Internal(anyhow::anyhow!("user lookup for {username} failed: {e}")))?
            .ok_or_else(|| BackupError::NotFound(format!("system user {username} not found")))?;
        Ok(UserIdentity {
            name: user.name,
            home: user.dir,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
        })
    }
}

#[cfg(not(unix))]
impl UserDirectory for SystemUsers {
    fn lookup(&self, username: &str) -> Result<UserIdentity> {
        Err(BackupError::PermissionDenied(format!(
            "cannot resolve system user {username}: per-user execution requires a POSIX host"
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Program {
    /// Executed directly, no shell involved.
    Argv(Vec<String>),
    /// Executed as `bash -lc "set -euo pipefail; <script>"`. Only for pipelines.
    Shell(String),
}

#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: Program,
    pub env: Vec<(String, String)>,
    pub output_limit: Option<usize>,
}

impl Invocation {
    pub fn argv<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: Program::Argv(args.into_iter().map(Into::into).collect()),
            env: Vec::new(),
            output_limit: None,
        }
    }

    pub fn shell(script: impl Into<String>) -> Self {
        Self {
            program: Program::Shell(script.into()),
            env: Vec::new(),
            output_limit: None,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn envs(mut self, vars: &[(String, String)]) -> Self {
        self.env.extend(vars.iter().cloned());
        self
    }

    pub fn limited(mut self, max_bytes: usize) -> Self {
        self.output_limit = Some(max_bytes);
        self
    }

    /// Name used in error messages.
    pub fn program_name(&self) -> &str {
        match &self.program {
            Program::Argv(args) => args.first().map(String::as_str).unwrap_or(""),
            Program::Shell(_) => "bash",
        }
    }

    pub fn args(&self) -> &[String] {
        match &self.program {
            Program::Argv(args) => args,
            Program::Shell(_) => &[],
        }
    }
}

/// Renders the command line for logs. Environment values are never shown.
impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.program {
            Program::Argv(args) => write!(f, "{}", args.join(" ")),
            Program::Shell(script) => write!(f, "bash -lc {}", shell_quote(script)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Trimmed stdout and stderr joined for diagnostics.
    pub fn combined(&self) -> String {
        let out = self.stdout.trim();
        let err = self.stderr.trim();
        match (out.is_empty(), err.is_empty()) {
            (true, _) => err.to_string(),
            (_, true) => out.to_string(),
            _ => format!("{out}\n{err}"),
        }
    }

    pub fn into_result(self, program: &str) -> Result<CommandOutput> {
        if self.success() {
            return Ok(self);
        }
        Err(BackupError::CommandFailed {
            program: program.to_string(),
            status: self.status.unwrap_or(-1),
            output: self.combined(),
        })
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs to completion as `user`. A non-zero exit is an `Ok` output;
    /// `Err` means the process could not be started at all.
    async fn run(&self, user: &UserIdentity, invocation: &Invocation) -> Result<CommandOutput>;

    /// Whether `program` is on the fixed `PATH`.
    fn locate(&self, program: &str) -> bool;
}

/// Quotes one word for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }
    format!("'{}'", value.replace('\'', r#"'"'"'"#))
}

pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, user: &UserIdentity, invocation: &Invocation) -> Result<CommandOutput> {
        let mut cmd = match &invocation.program {
            Program::Argv(args) => {
                let (program, rest) = args
                    .split_first()
                    .ok_or_else(|| BackupError::Internal(anyhow::anyhow!("empty argument vector")))?;
                let mut cmd = Command::new(program);
                cmd.args(rest);
                cmd
            }
            Program::Shell(script) => {
                let mut cmd = Command::new("bash");
                cmd.arg("-lc").arg(format!("set -euo pipefail; {script}"));
                cmd
            }
        };

        cmd.env_clear()
            .env("HOME", &user.home)
            .env("USER", &user.name)
            .env("LOGNAME", &user.name)
            .env("PATH", SAFE_PATH)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&user.home)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        run_as(&mut cmd, user)?;

        tracing::debug!(user = %user.name, command = %invocation, "Running command");
        let mut child = cmd.spawn().map_err(|e| {
            BackupError::Execution(format!("failed to start {}: {e}", invocation.program_name()))
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let limit = invocation.output_limit;
        let (stdout, stderr, status) = tokio::join!(
            read_capped(stdout, limit),
            read_capped(stderr, limit),
            child.wait()
        );

        Ok(CommandOutput {
            status: status?.code(),
            stdout: stdout?,
            stderr: stderr?,
        })
    }

    fn locate(&self, program: &str) -> bool {
        which::which_in(program, Some(SAFE_PATH), "/").is_ok()
    }
}

#[cfg(unix)]
fn run_as(cmd: &mut Command, user: &UserIdentity) -> Result<()> {
    use nix::unistd::{geteuid, User};

    let euid = geteuid();
    if euid.is_root() {
        cmd.uid(user.uid).gid(user.gid);
        return Ok(());
    }
    let current = User::from_uid(euid)
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_default();
    if current != user.name {
        return Err(BackupError::PermissionDenied(format!(
            "cannot switch to user {} without root privileges",
            user.name
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn run_as(_cmd: &mut Command, user: &UserIdentity) -> Result<()> {
    Err(BackupError::PermissionDenied(format!(
        "cannot run commands as {}: identity switching requires a POSIX host",
        user.name
    )))
}

/// Reads a pipe to EOF, keeping at most `limit` bytes. The rest is drained
/// so the child never blocks on a full pipe.
async fn read_capped<R>(reader: Option<R>, limit: Option<usize>) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(String::new());
    };
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        match limit {
            Some(max) if kept.len() + n > max => {
                kept.extend_from_slice(&chunk[..max - kept.len()]);
                truncated = true;
            }
            _ => kept.extend_from_slice(&chunk[..n]),
        }
    }
    let mut text = String::from_utf8_lossy(&kept).into_owned();
    if truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::current_identity;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("it's"), r#"'it'"'"'s'"#);
        assert_eq!(shell_quote("a b; rm -rf /"), "'a b; rm -rf /'");
    }

    #[test]
    fn test_display_hides_environment() {
        let inv = Invocation::argv(["restic", "snapshots"]).env("RESTIC_PASSWORD", "hunter2");
        assert_eq!(inv.to_string(), "restic snapshots");
        assert!(!format!("{inv}").contains("hunter2"));
    }

    #[test]
    fn test_combined_output() {
        let out = CommandOutput { status: Some(1), stdout: " a \n".into(), stderr: "b\n".into() };
        assert_eq!(out.combined(), "a\nb");
        let err = out.into_result("restic").unwrap_err();
        assert_eq!(err.to_string(), "restic exited with status 1: a\nb");
    }

    #[tokio::test]
    async fn test_read_capped_truncates_and_drains() {
        let data = vec![b'x'; 20_000];
        let text = read_capped(Some(&data[..]), Some(1024)).await.unwrap();
        assert!(text.ends_with(TRUNCATION_MARKER));
        assert_eq!(text.len(), 1024 + TRUNCATION_MARKER.len());

        let text = read_capped(Some(&data[..]), None).await.unwrap();
        assert_eq!(text.len(), 20_000);
    }

    #[tokio::test]
    async fn test_process_runner_captures_output_in_home() {
        let home = tempfile::tempdir().unwrap();
        let user = current_identity(home.path());

        let out = ProcessRunner
            .run(&user, &Invocation::argv(["pwd"]))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(
            std::fs::canonicalize(out.stdout.trim()).unwrap(),
            std::fs::canonicalize(home.path()).unwrap()
        );
    }

    #[tokio::test]
    async fn test_process_runner_pipeline_and_env() {
        let home = tempfile::tempdir().unwrap();
        let user = current_identity(home.path());

        let inv = Invocation::shell("printf '%s' \"$GREETING\" | tr a-z A-Z").env("GREETING", "hello");
        let out = ProcessRunner.run(&user, &inv).await.unwrap();
        assert_eq!(out.stdout, "HELLO");

        // pipefail: a failing producer fails the pipeline.
        let out = ProcessRunner.run(&user, &Invocation::shell("false | cat")).await.unwrap();
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_process_runner_caps_output() {
        let home = tempfile::tempdir().unwrap();
        let user = current_identity(home.path());

        let inv = Invocation::shell("head -c 5000 /dev/zero | tr '\\0' a").limited(100);
        let out = ProcessRunner.run(&user, &inv).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, format!("{}{}", "a".repeat(100), TRUNCATION_MARKER));
    }

    #[tokio::test]
    async fn test_process_runner_refuses_foreign_user_without_root() {
        if nix::unistd::geteuid().is_root() {
            return;
        }
        let home = tempfile::tempdir().unwrap();
        let mut user = current_identity(home.path());
        user.name = "somebody-else".into();

        let err = ProcessRunner.run(&user, &Invocation::argv(["true"])).await.unwrap_err();
        assert!(matches!(err, BackupError::PermissionDenied(_)));
    }
}
