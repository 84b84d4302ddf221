//! Per-user backup orchestration: the due-run poller, claims, the backup
//! run itself, and the config/snapshot operations behind the API.

use crate::db::connection::{with_conn, DbPool};
use crate::error::{BackupError, Result};
use crate::models::backup_config::{self, BackendType, BackupConfigRecord, ClaimOutcome};
use crate::models::backup_job::{self, BackupJob, JobStatus, JobType};
use crate::models::inventory;
use crate::models::{format_ts, now_ts};
use crate::services::command_runner::{
    shell_quote, CommandRunner, Invocation, UserDirectory, UserIdentity, MAX_CAPTURED_OUTPUT,
};
use crate::services::concurrency::WorkerGate;
use crate::services::manifest::{Manifest, ManifestDatabase, ManifestSite};
use crate::services::rclone::RcloneStatus;
use crate::services::repository_config::{
    self, BackupConfigView, Catalog, SaveConfigRequest, TestConfigResponse,
};
use crate::services::restic::{self, ResticClient, ResticTarget, Snapshot, SNAPSHOT_TAG};
use crate::services::schedule::{self, DEFAULT_SCHEDULE};
use crate::services::secrets::SecretCodec;
use crate::services::user_fs;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const POLL_INTERVAL: Duration = Duration::from_secs(30);
const DUE_BATCH: usize = 20;
const BACKUP_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

const DEFAULT_JOB_LIMIT: usize = 50;
const MAX_JOB_LIMIT: usize = 200;
const DEFAULT_SNAPSHOT_LIMIT: usize = 30;
const MAX_SNAPSHOT_LIMIT: usize = 100;

fn prune_interval() -> chrono::Duration {
    chrono::Duration::hours(24)
}

/// Reply for operations that continue in the background.
#[derive(Debug, Clone, Serialize)]
pub struct JobAccepted {
    pub job_id: String,
    pub status: &'static str,
    pub message: String,
}

impl JobAccepted {
    pub fn running(job_id: String, message: &str) -> Self {
        Self { job_id, status: "running", message: message.to_string() }
    }
}

pub struct BackupService {
    pub(super) db: DbPool,
    pub(super) codec: Arc<dyn SecretCodec>,
    pub(super) runner: Arc<dyn CommandRunner>,
    pub(super) users: Arc<dyn UserDirectory>,
    pub(super) gate: WorkerGate,
    pub(super) tasks: TaskTracker,
    pub(super) rclone: Mutex<Option<RcloneStatus>>,
    started: AtomicBool,
}

/// Runs blocking filesystem work off the async workers.
pub(super) async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BackupError::Internal(anyhow::anyhow!(e)))?
}

impl BackupService {
    pub fn new(
        db: DbPool,
        codec: Arc<dyn SecretCodec>,
        runner: Arc<dyn CommandRunner>,
        users: Arc<dyn UserDirectory>,
        gate: WorkerGate,
    ) -> Self {
        tracing::info!(workers = gate.size(), "Backup service initialized");
        Self {
            db,
            codec,
            runner,
            users,
            gate,
            tasks: TaskTracker::new(),
            rclone: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Starts the due-run poller. Later calls are no-ops.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let service = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => service.run_due_backups().await,
                }
            }
            tracing::info!("Backup scheduler stopped");
        });
    }

    /// Waits for every background job to finish.
    pub async fn shutdown(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        tracing::info!("Backup workers drained");
    }

    /// Waits for the jobs started so far while still accepting new ones.
    pub async fn wait_idle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    pub async fn run_due_backups(self: &Arc<Self>) {
        let now = Utc::now();
        let due = match with_conn(&self.db, move |conn| backup_config::due_usernames(conn, now, DUE_BATCH)).await {
            Ok(due) => due,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load due backups");
                return;
            }
        };

        for username in due {
            match self.trigger_backup(&username, JobType::Scheduled, false).await {
                Ok(job_id) => tracing::info!(username = %username, job_id = %job_id, "Scheduled backup started"),
                Err(BackupError::Conflict(msg)) => {
                    tracing::debug!(username = %username, reason = %msg, "Scheduled backup skipped")
                }
                Err(e) => tracing::warn!(username = %username, error = %e, "Scheduled backup not started"),
            }
        }
    }

    /// Claims the user's backup slot and runs the backup in the background.
    pub async fn trigger_backup(
        self: &Arc<Self>,
        username: &str,
        job_type: JobType,
        allow_disabled: bool,
    ) -> Result<String> {
        let user = username.to_string();
        let outcome = with_conn(&self.db, move |conn| {
            backup_config::claim_run(conn, &user, job_type, allow_disabled, Utc::now())
        })
        .await?;

        let (job_id, cfg) = match outcome {
            ClaimOutcome::Claimed { job_id, config } => (job_id, *config),
            ClaimOutcome::NotConfigured(msg) => return Err(BackupError::config(msg)),
            ClaimOutcome::Disabled => return Err(BackupError::config("backups are disabled for this user")),
            ClaimOutcome::AlreadyRunning { .. } => {
                return Err(BackupError::Conflict("backup already running".into()))
            }
        };

        let service = self.clone();
        let username = username.to_string();
        let jid = job_id.clone();
        self.tasks.spawn(async move {
            let result: Result<(String, String)> = async {
                let _permit = service.gate.acquire_worker().await?;
                tracing::info!(username = %username, job_id = %jid, job_type = job_type.as_str(), "Backup running");
                tokio::time::timeout(BACKUP_TIMEOUT, service.run_backup(&username, &cfg))
                    .await
                    .unwrap_or_else(|_| Err(BackupError::execution("backup timed out")))
            }
            .await;

            let (status, snapshot_id, message) = match result {
                Ok((snapshot_id, message)) => {
                    tracing::info!(username = %username, job_id = %jid, snapshot_id = %snapshot_id, "Backup completed");
                    (JobStatus::Success, snapshot_id, message)
                }
                Err(e) => {
                    tracing::warn!(username = %username, job_id = %jid, error = %e, "Backup failed");
                    (JobStatus::Failed, String::new(), e.to_string())
                }
            };
            service.finish_backup(&username, &jid, status, &snapshot_id, &message).await;
        });

        Ok(job_id)
    }

    async fn finish_backup(&self, username: &str, job_id: &str, status: JobStatus, snapshot_id: &str, message: &str) {
        let (user, jid) = (username.to_string(), job_id.to_string());
        let (snap, msg) = (snapshot_id.to_string(), message.to_string());
        match with_conn(&self.db, move |conn| {
            backup_config::finish_run(conn, &user, &jid, status, &snap, &msg, Utc::now())
        })
        .await
        {
            Ok(true) => {}
            Ok(false) => tracing::warn!(username = %username, job_id = %job_id, "Backup slot was reclaimed before the run finished"),
            Err(e) => tracing::error!(username = %username, job_id = %job_id, error = %e, "Failed to record backup result"),
        }
    }

    /// Manual backup; allowed while scheduled backups are disabled.
    pub async fn run_now(self: &Arc<Self>, username: &str) -> Result<String> {
        self.trigger_backup(username, JobType::Manual, true).await
    }

    pub async fn trigger_manual_backup(self: &Arc<Self>, username: &str) -> Result<JobAccepted> {
        let job_id = self.run_now(username).await?;
        Ok(JobAccepted::running(job_id, "Backup job started."))
    }

    /// One backup run against the settings captured by the claim. Returns
    /// the snapshot id (possibly empty) and the summary message.
    async fn run_backup(&self, username: &str, cfg: &BackupConfigRecord) -> Result<(String, String)> {
        if !self.runner.locate("restic") {
            return Err(BackupError::config("restic is not installed on this server"));
        }
        let user = self.users.lookup(username)?;
        let client = self.client(cfg, user.clone())?;
        let home = user.home.clone();

        let dump_dir = user_fs::dump_dir(&home);
        let manifest_path = user_fs::manifest_path(&home);
        {
            let (user, dump_dir) = (user.clone(), dump_dir.clone());
            blocking(move || {
                user_fs::ensure_user_dir(&user, &user_fs::backup_root(&user.home))?;
                user_fs::ensure_user_dir(&user, &dump_dir)?;
                user_fs::clean_stale_dumps(&dump_dir)
                    .map_err(|e| e.context("failed to clean old database dumps"))
            })
            .await?;
        }

        let owner = username.to_string();
        let (sites, databases) = with_conn(&self.db, move |conn| {
            Ok((
                inventory::sites_for_user(conn, &owner)?,
                inventory::databases_for_user(conn, &owner)?,
            ))
        })
        .await?;

        let excluded_sites: HashSet<&str> = cfg.exclude_site_ids.iter().map(String::as_str).collect();
        let excluded_dbs: HashSet<&str> = cfg.exclude_database_ids.iter().map(String::as_str).collect();

        let mut manifest = Manifest::new(username, now_ts());
        let mut tags = vec![SNAPSHOT_TAG.to_string(), format!("user:{username}")];
        let mut site_tags = Vec::new();
        let mut roots: Vec<String> = Vec::new();

        let apps = home.join("apps");
        for site in sites.iter().filter(|s| !excluded_sites.contains(s.id.as_str())) {
            let Some(root) = user_fs::site_root(&site.document_root)
                .map(|p| crate::services::manifest::normalize_path_for_match(&p.to_string_lossy()))
            else {
                continue;
            };
            let root_path = Path::new(&root);
            if !root_path.starts_with(&apps) || root_path == apps {
                tracing::debug!(username = %username, site = %site.domain, root = %root, "Site outside ~/apps skipped");
                continue;
            }
            if roots.contains(&root) {
                continue;
            }
            roots.push(root.clone());
            manifest.sites.push(ManifestSite { domain: site.domain.clone(), root_path: root });
            site_tags.push(format!("site:{}", site.id));
            let domain = site.domain.trim().to_lowercase();
            if !domain.is_empty() {
                site_tags.push(format!("site-domain:{domain}"));
            }
        }

        let mut db_tags = Vec::new();
        for db in databases.iter().filter(|d| !excluded_dbs.contains(d.id.as_str())) {
            if db.db_password_enc.trim().is_empty() {
                tracing::debug!(username = %username, database = %db.db_name, "Database without stored credentials skipped");
                continue;
            }
            let password = match self.codec.decrypt(&db.db_password_enc) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(username = %username, database = %db.db_name, error = %e, "Database credentials unreadable, skipped");
                    continue;
                }
            };

            let dump_path = dump_dir.join(format!("{}.sql.gz", db.db_name));
            let script = format!(
                "mysqldump --single-transaction --quick --lock-tables=false -h 127.0.0.1 -u {} {} | gzip -c > {}",
                shell_quote(&db.db_user),
                shell_quote(&db.db_name),
                shell_quote(&dump_path.to_string_lossy()),
            );
            let invocation = Invocation::shell(script)
                .env("MYSQL_PWD", password)
                .limited(MAX_CAPTURED_OUTPUT);
            self.runner
                .run(&user, &invocation)
                .await?
                .into_result("mysqldump")
                .map_err(|e| e.context(&format!("failed to dump database {}", db.db_name)))?;

            manifest.databases.push(ManifestDatabase {
                db_name: db.db_name.clone(),
                dump_path: dump_path.to_string_lossy().into_owned(),
            });
            db_tags.push(format!("db:{}", db.id));
            let name = db.db_name.trim().to_lowercase();
            if !name.is_empty() {
                db_tags.push(format!("db-name:{name}"));
            }
        }

        let dump_count = manifest.databases.len();
        if roots.is_empty() && dump_count == 0 {
            return Err(BackupError::execution("nothing to back up (all sites/databases are excluded)"));
        }

        let encoded = manifest.encode()?;
        {
            let (user, path) = (user.clone(), manifest_path.clone());
            blocking(move || {
                user_fs::write_user_file(&user, &path, encoded.as_bytes())
                    .map_err(|e| e.context("failed to write backup manifest"))
            })
            .await?;
        }

        // Only the runtime directories at each site root; nested temp/logs are kept.
        let excludes: Vec<String> = roots
            .iter()
            .flat_map(|root| [format!("{root}/temp"), format!("{root}/logs")])
            .collect();
        let mut paths = roots.clone();
        paths.push(manifest_path.to_string_lossy().into_owned());
        if dump_count > 0 {
            paths.push(dump_dir.to_string_lossy().into_owned());
        }
        tags.extend(site_tags);
        tags.extend(db_tags);

        client.ensure_initialized().await?;
        let output = client.backup(&paths, &tags, &excludes).await?;
        let mut snapshot_id = restic::parse_snapshot_id(&output).unwrap_or_default();
        if snapshot_id.is_empty() {
            tracing::warn!(username = %username, "Snapshot id not found in backup output");
        }

        if cfg.retention.is_active() {
            client.forget_retention(&cfg.retention).await?;

            let now = Utc::now();
            if backup_config::prune_due(cfg, now, prune_interval()) {
                client.prune().await?;
                let owner = username.to_string();
                if let Err(e) = with_conn(&self.db, move |conn| backup_config::set_last_prune(conn, &owner, now)).await {
                    tracing::warn!(username = %username, error = %e, "Failed to record prune time");
                }
            }
        }

        if snapshot_id.is_empty() {
            match client.latest_snapshot_id().await {
                Ok(Some(id)) => snapshot_id = id,
                Ok(None) => {}
                Err(e) => tracing::warn!(username = %username, error = %e, "Failed to read latest snapshot"),
            }
        }

        let message = format!(
            "Backed up {} site(s) and {} database dump(s).",
            roots.len(),
            dump_count
        );
        Ok((snapshot_id, message))
    }

    /// The user's config, if it names a repository and a password.
    pub(super) async fn configured(&self, username: &str) -> Result<BackupConfigRecord> {
        self.load_config(username)
            .await?
            .filter(BackupConfigRecord::is_configured)
            .ok_or_else(|| BackupError::config("backup repository is not configured"))
    }

    async fn load_config(&self, username: &str) -> Result<Option<BackupConfigRecord>> {
        let user = username.to_string();
        Ok(with_conn(&self.db, move |conn| backup_config::get(conn, &user)).await?)
    }

    pub(super) fn client(&self, cfg: &BackupConfigRecord, user: UserIdentity) -> Result<ResticClient> {
        let target = ResticTarget::from_config(cfg, self.codec.as_ref())?;
        Ok(ResticClient::new(self.runner.clone(), user, target))
    }

    pub(super) async fn create_job(&self, username: &str, job_type: JobType, message: &str) -> Result<String> {
        let (user, msg) = (username.to_string(), message.to_string());
        Ok(with_conn(&self.db, move |conn| {
            backup_job::insert_running(conn, &user, job_type, &msg, &now_ts())
        })
        .await?)
    }

    pub(super) async fn finish_job(&self, job_id: &str, status: JobStatus, snapshot_id: &str, message: &str) {
        let (jid, snap, msg) = (job_id.to_string(), snapshot_id.to_string(), message.to_string());
        if let Err(e) = with_conn(&self.db, move |conn| {
            backup_job::finish(conn, &jid, status, &snap, &msg, &now_ts())
        })
        .await
        {
            tracing::error!(job_id = %job_id, error = %e, "Failed to record job result");
        }
    }

    pub async fn list_jobs(&self, username: &str, limit: Option<usize>) -> Result<Vec<BackupJob>> {
        let limit = match limit {
            Some(n) if (1..=MAX_JOB_LIMIT).contains(&n) => n,
            _ => DEFAULT_JOB_LIMIT,
        };
        let user = username.to_string();
        Ok(with_conn(&self.db, move |conn| backup_job::list_by_username(conn, &user, limit)).await?)
    }

    /// Latest snapshots, tagged ones first. Repositories written before
    /// tagging get an untagged listing.
    pub async fn list_snapshots(&self, username: &str, limit: Option<usize>) -> Result<Vec<Snapshot>> {
        let limit = match limit {
            Some(n) if (1..=MAX_SNAPSHOT_LIMIT).contains(&n) => n,
            _ => DEFAULT_SNAPSHOT_LIMIT,
        };
        let Some(cfg) = self.load_config(username).await?.filter(BackupConfigRecord::is_configured) else {
            return Ok(Vec::new());
        };
        let user = self.users.lookup(username)?;
        let client = self.client(&cfg, user)?;

        match client.snapshots(Some(SNAPSHOT_TAG), limit).await {
            Ok(snapshots) if !snapshots.is_empty() => return Ok(snapshots),
            Ok(_) => {}
            Err(e) => tracing::warn!(username = %username, error = %e, "Tagged snapshot listing failed"),
        }
        client
            .snapshots(None, limit)
            .await
            .map_err(|e| e.context("failed to list snapshots"))
    }

    pub async fn delete_snapshot(self: &Arc<Self>, username: &str, snapshot_id: &str) -> Result<JobAccepted> {
        let cfg = self.configured(username).await?;
        let snapshot_id = restic::validate_snapshot_id(snapshot_id)?;
        let user = self.users.lookup(username)?;
        let client = self.client(&cfg, user)?;

        const STARTED: &str = "Snapshot delete started.";
        let job_id = self.create_job(username, JobType::DeleteSnapshot, STARTED).await?;

        let service = self.clone();
        let jid = job_id.clone();
        let username = username.to_string();
        self.tasks.spawn(async move {
            let result: Result<()> = async {
                let _permit = service.gate.acquire_worker().await?;
                client.forget_snapshot(&snapshot_id).await
            }
            .await;
            match result {
                Ok(()) => {
                    tracing::info!(username = %username, job_id = %jid, snapshot_id = %snapshot_id, "Snapshot deleted");
                    service
                        .finish_job(
                            &jid,
                            JobStatus::Success,
                            &snapshot_id,
                            "Snapshot deleted. Space will be reclaimed during prune.",
                        )
                        .await;
                }
                Err(e) => {
                    tracing::warn!(username = %username, job_id = %jid, error = %e, "Snapshot delete failed");
                    service
                        .finish_job(&jid, JobStatus::Failed, &snapshot_id, &format!("Snapshot delete failed: {e}"))
                        .await;
                }
            }
        });

        Ok(JobAccepted::running(job_id, STARTED))
    }

    pub async fn get_catalog(&self, username: &str) -> Result<Catalog> {
        let user = username.to_string();
        let (sites, databases) = with_conn(&self.db, move |conn| {
            Ok((
                inventory::sites_for_user(conn, &user)?,
                inventory::databases_for_user(conn, &user)?,
            ))
        })
        .await?;
        Ok(repository_config::build_catalog(&sites, &databases))
    }

    pub async fn get_config(&self, username: &str) -> Result<BackupConfigView> {
        let cfg = self
            .load_config(username)
            .await?
            .unwrap_or_else(|| BackupConfigRecord::default_for(username));
        let catalog = self.get_catalog(username).await?;
        Ok(BackupConfigView::new(&cfg, catalog))
    }

    pub async fn save_config(&self, username: &str, req: SaveConfigRequest) -> Result<BackupConfigView> {
        let schedule_cron = match req.schedule_cron.trim() {
            "" => DEFAULT_SCHEDULE.to_string(),
            expr => expr.to_string(),
        };
        schedule::parse_schedule(&schedule_cron)
            .map_err(|e| BackupError::config(format!("invalid backup schedule: {e}")))?;
        let retention = req.retention();
        if retention.keep_last < 0 || retention.keep_daily < 0 || retention.keep_weekly < 0 || retention.keep_monthly < 0
        {
            return Err(BackupError::config("retention values must be zero or greater"));
        }

        let existing = self.load_config(username).await?;
        let mut cfg = repository_config::resolve_backend(existing.as_ref(), &req, username, self.codec.as_ref())?;

        let has_repository = !cfg.repository.trim().is_empty();
        let has_password = !cfg.password_enc.trim().is_empty();
        if req.enabled && !has_repository {
            return Err(BackupError::config("repository is required when backups are enabled"));
        }
        if req.enabled && !has_password {
            return Err(BackupError::config("repository password is required when backups are enabled"));
        }
        if has_repository && has_password && (req.enabled || cfg.backend_type == BackendType::Rclone) {
            self.test_connection(username, &cfg).await?;
        }

        let now = Utc::now();
        cfg.enabled = req.enabled;
        cfg.schedule_cron = schedule_cron;
        cfg.exclude_site_ids = backup_config::normalize_ids(&req.exclude_site_ids);
        cfg.exclude_database_ids = backup_config::normalize_ids(&req.exclude_database_ids);
        cfg.retention = retention;
        cfg.next_run_at = if cfg.enabled {
            let next = schedule::next_run_after(&cfg.schedule_cron, now)
                .map_err(|e| BackupError::config(format!("invalid backup schedule: {e}")))?;
            Some(format_ts(next))
        } else {
            None
        };

        let record = cfg.clone();
        with_conn(&self.db, move |conn| backup_config::upsert(conn, &record)).await?;
        tracing::info!(username = %username, backend = cfg.backend_type.as_str(), enabled = cfg.enabled, "Backup config saved");

        self.get_config(username).await
    }

    /// Resolves the form like `save_config` would and probes the result.
    pub async fn test_config(&self, username: &str, req: SaveConfigRequest) -> Result<TestConfigResponse> {
        let existing = self.load_config(username).await?;
        let cfg = repository_config::resolve_backend(existing.as_ref(), &req, username, self.codec.as_ref())?;
        if cfg.repository.trim().is_empty() {
            return Err(BackupError::config("repository is required"));
        }
        let message = self.test_connection(username, &cfg).await?;
        Ok(TestConfigResponse { status: "success", message })
    }

    async fn test_connection(&self, username: &str, cfg: &BackupConfigRecord) -> Result<String> {
        if cfg.password_enc.trim().is_empty() {
            return Err(BackupError::config("repository password is required"));
        }
        if cfg.backend_type == BackendType::Rclone && !self.runner.locate("rclone") {
            return Err(BackupError::config("rclone is not installed on this server"));
        }
        if !self.runner.locate("restic") {
            return Err(BackupError::config("restic is not installed on this server"));
        }
        let user = self.users.lookup(username)?;
        let client = self.client(cfg, user)?;

        match client.probe_config().await {
            Ok(()) => Ok("Backup backend connection is valid.".to_string()),
            Err(e) if restic::is_repository_missing(&e.to_string()) => Ok(
                "Connection is valid, but the repository is not initialized yet (it will be initialized on first backup run)."
                    .to_string(),
            ),
            Err(e) => Err(BackupError::config(format!("backup backend validation failed: {e}"))),
        }
    }
}

/// Joins `rel` (a snapshot path) below `root` without letting it escape.
pub(super) fn scratch_path(root: &Path, rel: &str) -> PathBuf {
    let clean = crate::services::manifest::normalize_path_for_match(rel);
    root.join(clean.trim_start_matches('/'))
}
