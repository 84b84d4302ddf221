use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Enums ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Scheduled,
    Manual,
    RestoreSite,
    RestoreDatabase,
    DeleteSnapshot,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Scheduled => "scheduled",
            JobType::Manual => "manual",
            JobType::RestoreSite => "restore_site",
            JobType::RestoreDatabase => "restore_database",
            JobType::DeleteSnapshot => "delete_snapshot",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "scheduled" => JobType::Scheduled,
            "manual" => JobType::Manual,
            "restore_site" => JobType::RestoreSite,
            "restore_database" => JobType::RestoreDatabase,
            "delete_snapshot" => JobType::DeleteSnapshot,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "running" => JobStatus::Running,
            "success" => JobStatus::Success,
            "failed" => JobStatus::Failed,
            _ => return None,
        })
    }
}

sql_text_enum!(JobType);
sql_text_enum!(JobStatus);

// ── BackupJob ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJob {
    pub id: String,
    pub username: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub snapshot_id: String,
    pub message: String,
    pub started_at: String,
    pub finished_at: Option<String>,
}

fn row_to_job(row: &Row) -> rusqlite::Result<BackupJob> {
    Ok(BackupJob {
        id: row.get("id")?,
        username: row.get("username")?,
        job_type: row.get("job_type")?,
        status: row.get("status")?,
        snapshot_id: row.get("snapshot_id")?,
        message: row.get("message")?,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
    })
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<BackupJob>> {
    let job = conn
        .query_row("SELECT * FROM backup_jobs WHERE id = ?", params![id], row_to_job)
        .optional()?;
    Ok(job)
}

pub fn list_by_username(conn: &Connection, username: &str, limit: usize) -> anyhow::Result<Vec<BackupJob>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backup_jobs WHERE username = ? ORDER BY started_at DESC, rowid DESC LIMIT ?",
    )?;
    let rows = stmt.query_map(params![username, limit as i64], row_to_job)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Inserts a `running` job and returns its id.
pub fn insert_running(
    conn: &Connection,
    username: &str,
    job_type: JobType,
    message: &str,
    started_at: &str,
) -> anyhow::Result<String> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO backup_jobs (id, username, job_type, status, message, started_at)
         VALUES (?1, ?2, ?3, 'running', ?4, ?5)",
        params![id, username, job_type, message, started_at],
    )?;
    Ok(id)
}

/// Records the terminal state of a job. Finished jobs are never touched again.
pub fn finish(
    conn: &Connection,
    id: &str,
    status: JobStatus,
    snapshot_id: &str,
    message: &str,
    finished_at: &str,
) -> anyhow::Result<bool> {
    let changed = conn.execute(
        "UPDATE backup_jobs SET status = ?1, snapshot_id = ?2, message = ?3, finished_at = ?4
         WHERE id = ?5 AND status = 'running'",
        params![status, snapshot_id, message, finished_at, id],
    )?;
    Ok(changed > 0)
}
