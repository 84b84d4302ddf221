use crate::models::backup_job::{self, JobStatus, JobType};
use crate::models::{format_ts, parse_ts};
use crate::services::schedule::{self, DEFAULT_SCHEDULE};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};

/// Age after which a `running_job_id` is treated as abandoned.
pub const STALE_RUN_HOURS: i64 = 24;

pub const DEFAULT_SFTP_PORT: i64 = 22;
pub const DEFAULT_S3_BUCKET_LOOKUP: &str = "auto";

const BACKUP_STARTED: &str = "Backup started.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Local,
    Sftp,
    S3,
    Rclone,
}

impl BackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Local => "local",
            BackendType::Sftp => "sftp",
            BackendType::S3 => "s3",
            BackendType::Rclone => "rclone",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.trim().to_ascii_lowercase().as_str() {
            "local" => BackendType::Local,
            "sftp" => BackendType::Sftp,
            "s3" => BackendType::S3,
            "rclone" => BackendType::Rclone,
            _ => return None,
        })
    }
}

sql_text_enum!(BackendType);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retention {
    pub keep_last: i64,
    pub keep_daily: i64,
    pub keep_weekly: i64,
    pub keep_monthly: i64,
}

impl Retention {
    /// Retention is applied only when at least one count is positive.
    pub fn is_active(&self) -> bool {
        self.keep_last > 0 || self.keep_daily > 0 || self.keep_weekly > 0 || self.keep_monthly > 0
    }
}

impl Default for Retention {
    fn default() -> Self {
        Self { keep_last: 7, keep_daily: 7, keep_weekly: 4, keep_monthly: 6 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackupConfigRecord {
    pub username: String,
    pub repository: String,
    pub password_enc: String,
    pub backend_type: BackendType,
    pub sftp_username: String,
    pub sftp_host: String,
    pub sftp_port: i64,
    pub sftp_path: String,
    pub s3_endpoint: String,
    pub s3_bucket: String,
    pub s3_prefix: String,
    pub s3_region: String,
    pub s3_bucket_lookup: String,
    pub s3_list_objects_v1: bool,
    pub s3_access_key_enc: String,
    pub s3_secret_key_enc: String,
    pub s3_session_token_enc: String,
    pub enabled: bool,
    pub schedule_cron: String,
    pub exclude_site_ids: Vec<String>,
    pub exclude_database_ids: Vec<String>,
    pub retention: Retention,
    pub last_status: String,
    pub last_message: String,
    pub running_job_id: Option<String>,
    pub running_started_at: Option<String>,
    pub last_run_at: Option<String>,
    pub next_run_at: Option<String>,
    pub last_prune_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl BackupConfigRecord {
    /// What a user sees before saving anything.
    pub fn default_for(username: &str) -> Self {
        let now = format_ts(Utc::now());
        Self {
            username: username.to_string(),
            repository: String::new(),
            password_enc: String::new(),
            backend_type: BackendType::Sftp,
            sftp_username: username.to_string(),
            sftp_host: String::new(),
            sftp_port: DEFAULT_SFTP_PORT,
            sftp_path: String::new(),
            s3_endpoint: String::new(),
            s3_bucket: String::new(),
            s3_prefix: String::new(),
            s3_region: String::new(),
            s3_bucket_lookup: DEFAULT_S3_BUCKET_LOOKUP.to_string(),
            s3_list_objects_v1: false,
            s3_access_key_enc: String::new(),
            s3_secret_key_enc: String::new(),
            s3_session_token_enc: String::new(),
            enabled: false,
            schedule_cron: DEFAULT_SCHEDULE.to_string(),
            exclude_site_ids: Vec::new(),
            exclude_database_ids: Vec::new(),
            retention: Retention::default(),
            last_status: "idle".to_string(),
            last_message: String::new(),
            running_job_id: None,
            running_started_at: None,
            last_run_at: None,
            next_run_at: None,
            last_prune_at: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.repository.trim().is_empty() && !self.password_enc.trim().is_empty()
    }
}

/// Trims ids and drops blanks and duplicates, keeping first-seen order.
pub fn normalize_ids<I, S>(ids: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for id in ids {
        let id = id.as_ref().trim();
        if !id.is_empty() && !out.iter().any(|seen| seen == id) {
            out.push(id.to_string());
        }
    }
    out
}

/// Decodes a stored JSON string array. Malformed values read as empty.
pub fn decode_id_list(raw: &str) -> Vec<String> {
    normalize_ids(serde_json::from_str::<Vec<String>>(raw).unwrap_or_default())
}

fn encode_id_list(ids: &[String]) -> anyhow::Result<String> {
    Ok(serde_json::to_string(&normalize_ids(ids))?)
}

fn row_to_config(row: &Row) -> rusqlite::Result<BackupConfigRecord> {
    Ok(BackupConfigRecord {
        username: row.get("username")?,
        repository: row.get("repository")?,
        password_enc: row.get("password_enc")?,
        backend_type: row.get("backend_type")?,
        sftp_username: row.get("sftp_username")?,
        sftp_host: row.get("sftp_host")?,
        sftp_port: row.get("sftp_port")?,
        sftp_path: row.get("sftp_path")?,
        s3_endpoint: row.get("s3_endpoint")?,
        s3_bucket: row.get("s3_bucket")?,
        s3_prefix: row.get("s3_prefix")?,
        s3_region: row.get("s3_region")?,
        s3_bucket_lookup: row.get("s3_bucket_lookup")?,
        s3_list_objects_v1: row.get("s3_list_objects_v1")?,
        s3_access_key_enc: row.get("s3_access_key_enc")?,
        s3_secret_key_enc: row.get("s3_secret_key_enc")?,
        s3_session_token_enc: row.get("s3_session_token_enc")?,
        enabled: row.get("enabled")?,
        schedule_cron: row.get("schedule_cron")?,
        exclude_site_ids: decode_id_list(&row.get::<_, String>("exclude_site_ids")?),
        exclude_database_ids: decode_id_list(&row.get::<_, String>("exclude_database_ids")?),
        retention: Retention {
            keep_last: row.get("keep_last")?,
            keep_daily: row.get("keep_daily")?,
            keep_weekly: row.get("keep_weekly")?,
            keep_monthly: row.get("keep_monthly")?,
        },
        last_status: row.get("last_status")?,
        last_message: row.get("last_message")?,
        running_job_id: row
            .get::<_, Option<String>>("running_job_id")?
            .filter(|id| !id.trim().is_empty()),
        running_started_at: row.get("running_started_at")?,
        last_run_at: row.get("last_run_at")?,
        next_run_at: row.get("next_run_at")?,
        last_prune_at: row.get("last_prune_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub fn get(conn: &Connection, username: &str) -> anyhow::Result<Option<BackupConfigRecord>> {
    let cfg = conn
        .query_row(
            "SELECT * FROM backup_configs WHERE username = ?",
            params![username],
            row_to_config,
        )
        .optional()?;
    Ok(cfg)
}

/// Inserts or replaces the policy columns of a user's config. Run-state
/// columns other than `next_run_at` are left to claim/finish.
pub fn upsert(conn: &Connection, cfg: &BackupConfigRecord) -> anyhow::Result<()> {
    let now = format_ts(Utc::now());
    let exclude_sites = encode_id_list(&cfg.exclude_site_ids)?;
    let exclude_databases = encode_id_list(&cfg.exclude_database_ids)?;
    conn.execute(
        "INSERT INTO backup_configs (
            username, repository, password_enc, backend_type,
            sftp_username, sftp_host, sftp_port, sftp_path,
            s3_endpoint, s3_bucket, s3_prefix, s3_region, s3_bucket_lookup, s3_list_objects_v1,
            s3_access_key_enc, s3_secret_key_enc, s3_session_token_enc,
            enabled, schedule_cron, exclude_site_ids, exclude_database_ids,
            keep_last, keep_daily, keep_weekly, keep_monthly, next_run_at, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                   ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?27)
         ON CONFLICT(username) DO UPDATE SET
            repository = excluded.repository,
            password_enc = excluded.password_enc,
            backend_type = excluded.backend_type,
            sftp_username = excluded.sftp_username,
            sftp_host = excluded.sftp_host,
            sftp_port = excluded.sftp_port,
            sftp_path = excluded.sftp_path,
            s3_endpoint = excluded.s3_endpoint,
            s3_bucket = excluded.s3_bucket,
            s3_prefix = excluded.s3_prefix,
            s3_region = excluded.s3_region,
            s3_bucket_lookup = excluded.s3_bucket_lookup,
            s3_list_objects_v1 = excluded.s3_list_objects_v1,
            s3_access_key_enc = excluded.s3_access_key_enc,
            s3_secret_key_enc = excluded.s3_secret_key_enc,
            s3_session_token_enc = excluded.s3_session_token_enc,
            enabled = excluded.enabled,
            schedule_cron = excluded.schedule_cron,
            exclude_site_ids = excluded.exclude_site_ids,
            exclude_database_ids = excluded.exclude_database_ids,
            keep_last = excluded.keep_last,
            keep_daily = excluded.keep_daily,
            keep_weekly = excluded.keep_weekly,
            keep_monthly = excluded.keep_monthly,
            next_run_at = excluded.next_run_at,
            updated_at = excluded.updated_at",
        params![
            cfg.username,
            cfg.repository,
            cfg.password_enc,
            cfg.backend_type,
            cfg.sftp_username,
            cfg.sftp_host,
            cfg.sftp_port,
            cfg.sftp_path,
            cfg.s3_endpoint,
            cfg.s3_bucket,
            cfg.s3_prefix,
            cfg.s3_region,
            cfg.s3_bucket_lookup,
            cfg.s3_list_objects_v1,
            cfg.s3_access_key_enc,
            cfg.s3_secret_key_enc,
            cfg.s3_session_token_enc,
            cfg.enabled,
            cfg.schedule_cron,
            exclude_sites,
            exclude_databases,
            cfg.retention.keep_last,
            cfg.retention.keep_daily,
            cfg.retention.keep_weekly,
            cfg.retention.keep_monthly,
            cfg.next_run_at,
            now,
        ],
    )?;
    Ok(())
}

/// Users whose scheduled backup is due, earliest first.
pub fn due_usernames(conn: &Connection, now: DateTime<Utc>, limit: usize) -> anyhow::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT username FROM backup_configs
         WHERE enabled = 1
           AND repository <> ''
           AND next_run_at IS NOT NULL
           AND next_run_at <= ?1
         ORDER BY next_run_at ASC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![format_ts(now), limit as i64], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// Carries the row as it was read under the claim, so the run uses
    /// settings from a single point in time.
    Claimed { job_id: String, config: Box<BackupConfigRecord> },
    NotConfigured(&'static str),
    Disabled,
    AlreadyRunning { job_id: String },
}

fn run_is_live(cfg: &BackupConfigRecord, now: DateTime<Utc>) -> bool {
    if cfg.running_job_id.is_none() {
        return false;
    }
    match cfg.running_started_at.as_deref().and_then(parse_ts) {
        Some(started) => now - started < Duration::hours(STALE_RUN_HOURS),
        None => false,
    }
}

/// Marks the user's backup slot as running and opens a job row, atomically.
///
/// `BEGIN IMMEDIATE` takes the write lock before the read so two claimers
/// can never both observe an idle slot.
pub fn claim_run(
    conn: &mut Connection,
    username: &str,
    job_type: JobType,
    allow_disabled: bool,
    now: DateTime<Utc>,
) -> anyhow::Result<ClaimOutcome> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let Some(mut cfg) = get(&tx, username)? else {
        return Ok(ClaimOutcome::NotConfigured("backup repository is not configured"));
    };
    if cfg.repository.trim().is_empty() {
        return Ok(ClaimOutcome::NotConfigured("backup repository is not configured"));
    }
    if cfg.password_enc.trim().is_empty() {
        return Ok(ClaimOutcome::NotConfigured("backup repository password is not configured"));
    }
    if !cfg.enabled && !allow_disabled {
        return Ok(ClaimOutcome::Disabled);
    }
    if run_is_live(&cfg, now) {
        return Ok(ClaimOutcome::AlreadyRunning {
            job_id: cfg.running_job_id.unwrap_or_default(),
        });
    }

    let ts = format_ts(now);
    let job_id = backup_job::insert_running(&tx, username, job_type, BACKUP_STARTED, &ts)?;
    tx.execute(
        "UPDATE backup_configs
         SET running_job_id = ?1, running_started_at = ?2,
             last_status = 'running', last_message = ?3, updated_at = ?2
         WHERE username = ?4",
        params![job_id, ts, BACKUP_STARTED, username],
    )?;
    tx.commit()?;

    cfg.running_job_id = Some(job_id.clone());
    cfg.running_started_at = Some(ts.clone());
    cfg.last_status = "running".to_string();
    cfg.last_message = BACKUP_STARTED.to_string();
    cfg.updated_at = ts;
    Ok(ClaimOutcome::Claimed { job_id, config: Box::new(cfg) })
}

/// Closes a claimed run: finishes the job row, advances `next_run_at` and
/// releases the slot, but only while the slot still belongs to `job_id`.
pub fn finish_run(
    conn: &mut Connection,
    username: &str,
    job_id: &str,
    status: JobStatus,
    snapshot_id: &str,
    message: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<bool> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let ts = format_ts(now);

    backup_job::finish(&tx, job_id, status, snapshot_id, message, &ts)?;

    let policy: Option<(bool, String)> = tx
        .query_row(
            "SELECT enabled, schedule_cron FROM backup_configs WHERE username = ?",
            params![username],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let next_run_at = match policy {
        Some((true, expr)) => match schedule::next_run_after(&expr, now) {
            Ok(next) => Some(format_ts(next)),
            Err(e) => {
                tracing::warn!(username = %username, schedule = %expr, error = %e, "Cannot compute next backup run");
                None
            }
        },
        _ => None,
    };

    let released = tx.execute(
        "UPDATE backup_configs
         SET running_job_id = NULL, running_started_at = NULL,
             last_status = ?1, last_message = ?2, last_run_at = ?3,
             next_run_at = ?4, updated_at = ?3
         WHERE username = ?5 AND running_job_id = ?6",
        params![status.as_str(), message, ts, next_run_at, username, job_id],
    )?;
    tx.commit()?;

    Ok(released > 0)
}

pub fn set_last_prune(conn: &Connection, username: &str, at: DateTime<Utc>) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE backup_configs SET last_prune_at = ?1 WHERE username = ?2",
        params![format_ts(at), username],
    )?;
    Ok(())
}

/// Whether the prune interval has elapsed since `last_prune_at`.
pub fn prune_due(cfg: &BackupConfigRecord, now: DateTime<Utc>, interval: Duration) -> bool {
    match cfg.last_prune_at.as_deref().and_then(parse_ts) {
        Some(last) => now - last >= interval,
        None => true,
    }
}
