//! restic client bound to one hosting user and one repository.
//!
//! Commands are always argument vectors. Mutating verbs get one automatic
//! `unlock` + retry when restic reports the repository as locked, which is
//! what a crashed earlier run leaves behind.

use crate::error::{BackupError, Result};
use crate::models::backup_config::{BackendType, BackupConfigRecord, Retention, DEFAULT_S3_BUCKET_LOOKUP};
use crate::models::format_ts;
use crate::services::command_runner::{CommandOutput, CommandRunner, Invocation, UserIdentity, MAX_CAPTURED_OUTPUT};
use crate::services::manifest::{self, Manifest, NodeKind, MANIFEST_SUFFIX};
use crate::services::secrets::SecretCodec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

pub const RETRY_LOCK: &str = "2m";

/// Tag carried by every snapshot this service creates.
pub const SNAPSHOT_TAG: &str = "fastcp";
pub const SNAPSHOT_HOST: &str = "fastcp";

/// Verbs that take an exclusive repository lock.
const LOCKING_VERBS: &[&str] = &["backup", "forget", "prune", "restore"];

const MAX_SNAPSHOT_ID_LEN: usize = 64;

/// Repository coordinates resolved from a stored config: global options
/// and the environment restic reads credentials from.
#[derive(Clone)]
pub struct ResticTarget {
    global_args: Vec<String>,
    env: Vec<(String, String)>,
}

impl ResticTarget {
    pub fn from_config(cfg: &BackupConfigRecord, codec: &dyn SecretCodec) -> Result<Self> {
        let password = codec
            .decrypt(&cfg.password_enc)
            .map_err(|_| BackupError::execution("failed to decrypt repository password"))?;

        let mut global_args = vec!["--retry-lock".to_string(), RETRY_LOCK.to_string()];
        let mut env = vec![
            ("RESTIC_REPOSITORY".to_string(), cfg.repository.clone()),
            ("RESTIC_PASSWORD".to_string(), password),
        ];

        if cfg.backend_type == BackendType::S3 {
            let region = cfg.s3_region.trim();
            if !region.is_empty() {
                global_args.extend(["-o".to_string(), format!("s3.region={region}")]);
            }
            let lookup = match cfg.s3_bucket_lookup.trim() {
                "" => DEFAULT_S3_BUCKET_LOOKUP,
                other => other,
            };
            global_args.extend(["-o".to_string(), format!("s3.bucket-lookup={lookup}")]);
            if cfg.s3_list_objects_v1 {
                global_args.extend(["-o".to_string(), "s3.list-objects-v1=true".to_string()]);
            }

            if cfg.s3_access_key_enc.trim().is_empty() || cfg.s3_secret_key_enc.trim().is_empty() {
                return Err(BackupError::config("s3 credentials are not configured"));
            }
            let access_key = codec
                .decrypt(&cfg.s3_access_key_enc)
                .map_err(|_| BackupError::execution("failed to decrypt s3 access key"))?;
            let secret_key = codec
                .decrypt(&cfg.s3_secret_key_enc)
                .map_err(|_| BackupError::execution("failed to decrypt s3 secret key"))?;
            env.push(("AWS_ACCESS_KEY_ID".to_string(), access_key));
            env.push(("AWS_SECRET_ACCESS_KEY".to_string(), secret_key));

            if !cfg.s3_session_token_enc.trim().is_empty() {
                let token = codec
                    .decrypt(&cfg.s3_session_token_enc)
                    .map_err(|_| BackupError::execution("failed to decrypt s3 session token"))?;
                if !token.trim().is_empty() {
                    env.push(("AWS_SESSION_TOKEN".to_string(), token));
                }
            }
            if !region.is_empty() {
                env.push(("AWS_DEFAULT_REGION".to_string(), region.to_string()));
            }
        }

        Ok(Self { global_args, env })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    #[serde(default)]
    pub total_size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub short_id: String,
    #[serde(default)]
    pub time: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<SnapshotSummary>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub total_size: u64,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

pub struct ResticClient {
    runner: Arc<dyn CommandRunner>,
    user: UserIdentity,
    target: ResticTarget,
}

impl ResticClient {
    pub fn new(runner: Arc<dyn CommandRunner>, user: UserIdentity, target: ResticTarget) -> Self {
        Self { runner, user, target }
    }

    pub fn user(&self) -> &UserIdentity {
        &self.user
    }

    async fn exec(&self, args: &[String], limit: Option<usize>) -> Result<CommandOutput> {
        let mut argv = Vec::with_capacity(1 + self.target.global_args.len() + args.len());
        argv.push("restic".to_string());
        argv.extend(self.target.global_args.iter().cloned());
        argv.extend(args.iter().cloned());

        let mut invocation = Invocation::argv(argv).envs(&self.target.env);
        if let Some(max) = limit {
            invocation = invocation.limited(max);
        }
        self.runner.run(&self.user, &invocation).await
    }

    /// Runs a restic command, recovering once from a stale repository lock.
    pub async fn run(&self, args: Vec<String>, limit: Option<usize>) -> Result<CommandOutput> {
        let first = self.exec(&args, limit).await?;
        if first.success() {
            return Ok(first);
        }

        let verb = args.first().map(String::as_str).unwrap_or_default();
        if !LOCKING_VERBS.contains(&verb) || !is_lock_error(&first.combined()) {
            return first.into_result("restic");
        }

        tracing::warn!(user = %self.user.name, verb = %verb, "Repository is locked, removing stale locks and retrying");
        let unlock = self.exec(&["unlock".to_string()], Some(MAX_CAPTURED_OUTPUT)).await?;
        if !unlock.success() {
            let original = first.into_result("restic").err().map(|e| e.to_string()).unwrap_or_default();
            return Err(BackupError::Execution(format!(
                "{original} (stale-lock recovery failed: {})",
                unlock.combined()
            )));
        }

        self.exec(&args, limit).await?.into_result("restic")
    }

    /// `cat config`: succeeds only when the repository exists and the
    /// password opens it.
    pub async fn probe_config(&self) -> Result<()> {
        self.run(strings(["cat", "config"]), Some(MAX_CAPTURED_OUTPUT)).await?;
        Ok(())
    }

    pub async fn ensure_initialized(&self) -> Result<()> {
        if self.probe_config().await.is_ok() {
            return Ok(());
        }
        tracing::info!(user = %self.user.name, "Initializing restic repository");
        self.run(strings(["init"]), Some(MAX_CAPTURED_OUTPUT))
            .await
            .map_err(|e| e.context("failed to initialize restic repository"))?;
        Ok(())
    }

    /// Creates a snapshot and returns restic's JSON message stream.
    pub async fn backup(&self, paths: &[String], tags: &[String], excludes: &[String]) -> Result<String> {
        let mut args = strings(["backup", "--host", SNAPSHOT_HOST, "--json"]);
        for tag in tags {
            args.push("--tag".to_string());
            args.push(tag.clone());
        }
        for exclude in excludes {
            args.push("--exclude".to_string());
            args.push(exclude.clone());
        }
        args.extend(paths.iter().cloned());

        let output = self
            .run(args, None)
            .await
            .map_err(|e| e.context("restic backup failed"))?;
        Ok(output.stdout)
    }

    pub async fn forget_retention(&self, retention: &Retention) -> Result<()> {
        let mut args = strings(["forget", "--group-by", "", "--tag", SNAPSHOT_TAG]);
        for (flag, count) in [
            ("--keep-last", retention.keep_last),
            ("--keep-daily", retention.keep_daily),
            ("--keep-weekly", retention.keep_weekly),
            ("--keep-monthly", retention.keep_monthly),
        ] {
            if count > 0 {
                args.push(flag.to_string());
                args.push(count.to_string());
            }
        }
        self.run(args, Some(MAX_CAPTURED_OUTPUT))
            .await
            .map_err(|e| e.context("restic retention failed"))?;
        Ok(())
    }

    pub async fn forget_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let args = strings(["forget", "--group-by", "", snapshot_id]);
        self.run(args, Some(MAX_CAPTURED_OUTPUT)).await?;
        Ok(())
    }

    pub async fn prune(&self) -> Result<()> {
        self.run(strings(["prune"]), Some(MAX_CAPTURED_OUTPUT))
            .await
            .map_err(|e| e.context("restic prune failed"))?;
        Ok(())
    }

    pub async fn snapshots(&self, tag: Option<&str>, latest: usize) -> Result<Vec<Snapshot>> {
        let mut args = strings(["snapshots", "--json"]);
        if let Some(tag) = tag {
            args.push("--tag".to_string());
            args.push(tag.to_string());
        }
        args.push("--latest".to_string());
        args.push(latest.to_string());

        let output = self.run(args, Some(MAX_CAPTURED_OUTPUT)).await?;
        parse_snapshots(&output.stdout)
    }

    pub async fn latest_snapshot_id(&self) -> Result<Option<String>> {
        let snapshots = self.snapshots(Some(SNAPSHOT_TAG), 1).await?;
        Ok(snapshots.into_iter().map(|s| s.id).find(|id| !id.trim().is_empty()))
    }

    /// `ls --json`. Output is kept whole: it is parsed, never displayed.
    pub async fn ls(&self, snapshot_id: &str) -> Result<String> {
        let output = self
            .run(strings(["ls", "--json", snapshot_id]), None)
            .await
            .map_err(|e| e.context("failed to list snapshot contents"))?;
        Ok(output.stdout)
    }

    pub async fn dump(&self, snapshot_id: &str, path: &str) -> Result<String> {
        let output = self.run(strings(["dump", snapshot_id, path]), None).await?;
        Ok(output.stdout)
    }

    /// Reads the snapshot's manifest and returns it with its in-snapshot path.
    pub async fn load_manifest(&self, snapshot_id: &str) -> Result<(Manifest, String)> {
        let listing = self.ls(snapshot_id).await?;
        let path = manifest::resolve_path_by_suffix(&listing, MANIFEST_SUFFIX, NodeKind::File)
            .map_err(|e| e.context("failed to locate snapshot manifest"))?;
        let raw = self
            .dump(snapshot_id, &path)
            .await
            .map_err(|e| e.context("failed to read snapshot manifest"))?;
        Ok((Manifest::decode(&raw)?, path))
    }

    pub async fn restore_size(&self, snapshot_id: &str) -> Result<u64> {
        let args = strings(["stats", "--json", "--mode", "restore-size", snapshot_id]);
        let output = self
            .run(args, Some(MAX_CAPTURED_OUTPUT))
            .await
            .map_err(|e| e.context("failed to read snapshot restore size"))?;
        parse_restore_size(&output.stdout)
    }

    /// Restores only `includes` (absolute in-snapshot paths) below `target`.
    pub async fn restore(&self, snapshot_id: &str, target: &Path, includes: &[String]) -> Result<()> {
        let mut args = strings(["restore", snapshot_id, "--target"]);
        args.push(target.to_string_lossy().into_owned());
        for path in includes {
            args.push("--include".to_string());
            args.push(path.clone());
        }
        self.run(args, Some(MAX_CAPTURED_OUTPUT)).await?;
        Ok(())
    }
}

fn strings<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn is_lock_error(text: &str) -> bool {
    text.to_lowercase().contains("already locked")
}

/// Output of `cat config` against a location with no repository yet.
pub fn is_repository_missing(output: &str) -> bool {
    let text = output.trim().to_lowercase();
    text.contains("is there a repository at the following location")
        || text.contains("config file does not exist")
        || text.contains("unable to open config file")
}

/// Trims and checks a user-supplied snapshot id. Ids go straight into argv,
/// so only restic's own alphabet is accepted.
pub fn validate_snapshot_id(raw: &str) -> Result<String> {
    let id = raw.trim();
    if id.is_empty() {
        return Err(BackupError::config("snapshot_id is required"));
    }
    if id.len() > MAX_SNAPSHOT_ID_LEN || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(BackupError::config("invalid snapshot id"));
    }
    Ok(id.to_string())
}

#[derive(Deserialize)]
struct BackupMessage {
    #[serde(default)]
    message_type: String,
    #[serde(default)]
    snapshot_id: String,
}

/// Snapshot id from `backup --json`: the `summary` message wins, otherwise
/// the first message that carries an id.
pub fn parse_snapshot_id(output: &str) -> Option<String> {
    let mut fallback = None;
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Ok(msg) = serde_json::from_str::<BackupMessage>(line) else {
            continue;
        };
        let id = msg.snapshot_id.trim();
        if id.is_empty() {
            continue;
        }
        if msg.message_type == "summary" {
            return Some(id.to_string());
        }
        if fallback.is_none() {
            fallback = Some(id.to_string());
        }
    }
    fallback
}

#[derive(Deserialize)]
struct SnapshotsEnvelope {
    #[serde(default)]
    snapshots: Vec<Snapshot>,
}

/// Parses `snapshots --json` in every shape restic versions have produced:
/// a plain array, an object with `snapshots`, an array surrounded by noise,
/// or one object per line.
pub fn parse_snapshots(output: &str) -> Result<Vec<Snapshot>> {
    let clean = output.trim();
    if clean.is_empty() {
        return Ok(Vec::new());
    }

    let parsed = serde_json::from_str::<Vec<Snapshot>>(clean)
        .ok()
        .or_else(|| {
            serde_json::from_str::<SnapshotsEnvelope>(clean)
                .ok()
                .map(|e| e.snapshots)
                .filter(|s| !s.is_empty())
        })
        .or_else(|| {
            let start = clean.find('[')?;
            let end = clean.rfind(']')?;
            if end <= start {
                return None;
            }
            serde_json::from_str::<Vec<Snapshot>>(&clean[start..=end]).ok()
        })
        .or_else(|| {
            let mut found = Vec::new();
            for line in clean.lines().map(str::trim) {
                if line.is_empty() || line == "[" || line == "]" {
                    continue;
                }
                let line = line.trim_end_matches(',');
                if let Ok(one) = serde_json::from_str::<Snapshot>(line) {
                    if !one.id.trim().is_empty() {
                        found.push(one);
                        continue;
                    }
                }
                if let Ok(envelope) = serde_json::from_str::<SnapshotsEnvelope>(line) {
                    found.extend(envelope.snapshots);
                }
            }
            (!found.is_empty()).then_some(found)
        });

    match parsed {
        Some(snapshots) => Ok(snapshots.into_iter().map(normalize_snapshot).collect()),
        None => {
            let snippet: String = clean.chars().take(180).collect();
            Err(BackupError::Execution(format!("invalid snapshots JSON output: {snippet:?}")))
        }
    }
}

fn normalize_snapshot(mut snapshot: Snapshot) -> Snapshot {
    if let Ok(ts) = DateTime::parse_from_rfc3339(snapshot.time.trim()) {
        snapshot.time = format_ts(ts.with_timezone(&Utc));
    }
    if snapshot.total_size == 0 {
        if let Some(summary) = &snapshot.summary {
            snapshot.total_size = summary.total_size;
        }
    }
    snapshot
}

pub fn parse_restore_size(output: &str) -> Result<u64> {
    #[derive(Deserialize)]
    struct Stats {
        #[serde(default)]
        total_size: u64,
    }
    let stats: Stats = serde_json::from_str(output.trim())
        .map_err(|e| BackupError::Execution(format!("failed to parse restic stats output: {e}")))?;
    Ok(stats.total_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::secrets::AesGcmCodec;
    use crate::test_support::{failure, success, FakeRunner};

    fn client(runner: Arc<FakeRunner>) -> ResticClient {
        let codec = AesGcmCodec::from_passphrase("test").unwrap();
        let mut cfg = BackupConfigRecord::default_for("alice");
        cfg.backend_type = BackendType::Local;
        cfg.repository = "/srv/restic".into();
        cfg.password_enc = codec.encrypt("pw").unwrap();
        let target = ResticTarget::from_config(&cfg, &codec).unwrap();
        let home = std::env::temp_dir();
        ResticClient::new(runner, crate::test_support::current_identity(&home), target)
    }

    #[tokio::test]
    async fn test_lock_error_is_recovered_transparently() {
        let runner = Arc::new(FakeRunner::new());
        runner.on(" backup ", failure(1, "Fatal: unable to create lock: repository is already locked by PID 7"));
        runner.on(" backup ", success(r#"{"message_type":"summary","snapshot_id":"abc123"}"#));

        let out = client(runner.clone())
            .backup(&["/home/alice/apps/a".into()], &["fastcp".into()], &[])
            .await
            .unwrap();
        assert_eq!(parse_snapshot_id(&out).as_deref(), Some("abc123"));

        let calls = runner.commands();
        assert_eq!(calls.len(), 3);
        assert!(calls[1].ends_with(" unlock"));
    }

    #[tokio::test]
    async fn test_other_failures_never_unlock() {
        let runner = Arc::new(FakeRunner::new());
        runner.on(" backup ", failure(1, "Fatal: wrong password or no key found"));

        let err = client(runner.clone()).backup(&["/x".into()], &[], &[]).await.unwrap_err();
        assert!(err.to_string().contains("wrong password"));
        assert!(runner.commands().iter().all(|c| !c.contains("unlock")));
    }

    #[tokio::test]
    async fn test_read_only_verbs_are_not_retried() {
        let runner = Arc::new(FakeRunner::new());
        runner.on(" snapshots ", failure(1, "repository is already locked exclusively"));

        assert!(client(runner.clone()).snapshots(Some(SNAPSHOT_TAG), 5).await.is_err());
        assert_eq!(runner.commands().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_unlock_reports_both_errors() {
        let runner = Arc::new(FakeRunner::new());
        runner.on(" prune", failure(1, "repository is already locked"));
        runner.on(" unlock", failure(1, "permission denied"));

        let err = client(runner).prune().await.unwrap_err().to_string();
        assert!(err.contains("already locked"));
        assert!(err.contains("stale-lock recovery failed: permission denied"));
    }

    #[tokio::test]
    async fn test_invocation_shape_and_secrets_in_env() {
        let runner = Arc::new(FakeRunner::new());
        let c = client(runner.clone());
        c.forget_retention(&Retention { keep_last: 3, keep_daily: 0, keep_weekly: 2, keep_monthly: 0 })
            .await
            .unwrap();

        let inv = runner.invocations().pop().unwrap();
        assert_eq!(
            inv.args(),
            [
                "restic", "--retry-lock", "2m", "forget", "--group-by", "", "--tag", "fastcp",
                "--keep-last", "3", "--keep-weekly", "2"
            ]
        );
        assert!(inv.env.contains(&("RESTIC_PASSWORD".to_string(), "pw".to_string())));
        assert!(!inv.to_string().contains("pw "));
    }

    #[test]
    fn test_s3_target_requires_credentials() {
        let codec = AesGcmCodec::from_passphrase("test").unwrap();
        let mut cfg = BackupConfigRecord::default_for("alice");
        cfg.backend_type = BackendType::S3;
        cfg.repository = "s3:s3.amazonaws.com/bucket".into();
        cfg.password_enc = codec.encrypt("pw").unwrap();
        cfg.s3_region = "eu-west-1".into();
        let err = ResticTarget::from_config(&cfg, &codec).err().unwrap();
        assert_eq!(err.to_string(), "s3 credentials are not configured");

        cfg.s3_access_key_enc = codec.encrypt("AKIA").unwrap();
        cfg.s3_secret_key_enc = codec.encrypt("secret").unwrap();
        let target = ResticTarget::from_config(&cfg, &codec).unwrap();
        assert!(target.global_args.contains(&"s3.region=eu-west-1".to_string()));
        assert!(target.global_args.contains(&"s3.bucket-lookup=auto".to_string()));
        assert!(target.env.contains(&("AWS_DEFAULT_REGION".to_string(), "eu-west-1".to_string())));
        assert!(!target.env.iter().any(|(k, _)| k == "AWS_SESSION_TOKEN"));
    }

    #[test]
    fn test_parse_snapshot_id_prefers_summary() {
        let out = [
            r#"{"message_type":"status","percent_done":0.5}"#,
            r#"{"message_type":"verbose_status","snapshot_id":"early"}"#,
            "garbage",
            r#"{"message_type":"summary","snapshot_id":"final"}"#,
        ]
        .join("\n");
        assert_eq!(parse_snapshot_id(&out).as_deref(), Some("final"));
        assert_eq!(
            parse_snapshot_id(r#"{"message_type":"status","snapshot_id":" only "}"#).as_deref(),
            Some("only")
        );
        assert_eq!(parse_snapshot_id(r#"{"message_type":"status"}"#), None);
    }

    #[test]
    fn test_parse_snapshots_shapes() {
        let array = r#"[{"id":"a1","time":"2024-05-01T04:00:03.5+02:00","summary":{"total_size":42}}]"#;
        let parsed = parse_snapshots(array).unwrap();
        assert_eq!(parsed[0].time, "2024-05-01T02:00:03Z");
        assert_eq!(parsed[0].total_size, 42);

        let envelope = r#"{"snapshots":[{"id":"b1","time":"x"}]}"#;
        assert_eq!(parse_snapshots(envelope).unwrap()[0].id, "b1");

        let noisy = "warning: cache is old\n[{\"id\":\"c1\",\"time\":\"\"}]\n";
        assert_eq!(parse_snapshots(noisy).unwrap()[0].id, "c1");

        let lines = "{\"id\":\"d1\"},\n{\"id\":\"d2\"}\n";
        assert_eq!(parse_snapshots(lines).unwrap().len(), 2);

        assert!(parse_snapshots("").unwrap().is_empty());
        assert!(parse_snapshots("not json at all").is_err());
    }

    #[test]
    fn test_validate_snapshot_id() {
        assert_eq!(validate_snapshot_id(" abc123 ").unwrap(), "abc123");
        assert!(validate_snapshot_id("").is_err());
        assert!(validate_snapshot_id("--target=/").is_err());
        assert!(validate_snapshot_id(&"a".repeat(65)).is_err());
    }

    #[test]
    fn test_repository_missing_detection() {
        assert!(is_repository_missing(
            "Fatal: unable to open config file: stat /srv/restic/config: no such file or directory\nIs there a repository at the following location?"
        ));
        assert!(!is_repository_missing("Fatal: wrong password or no key found"));
        assert!(!is_repository_missing(""));
    }

    #[test]
    fn test_parse_restore_size() {
        assert_eq!(parse_restore_size(r#"{"total_size":1048576,"total_file_count":3}"#).unwrap(), 1048576);
        assert!(parse_restore_size("oops").is_err());
    }
}
