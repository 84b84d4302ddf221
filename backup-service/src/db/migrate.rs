use crate::db::connection::DbPool;
use rusqlite::Connection;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sites (
  id TEXT PRIMARY KEY,
  username TEXT NOT NULL,
  domain TEXT NOT NULL,
  document_root TEXT NOT NULL,
  created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);

CREATE TABLE IF NOT EXISTS databases (
  id TEXT PRIMARY KEY,
  username TEXT NOT NULL,
  db_name TEXT NOT NULL,
  db_user TEXT NOT NULL,
  db_password TEXT NOT NULL DEFAULT '',
  created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);

CREATE TABLE IF NOT EXISTS backup_configs (
  username TEXT PRIMARY KEY,
  repository TEXT NOT NULL DEFAULT '',
  password_enc TEXT NOT NULL DEFAULT '',
  backend_type TEXT NOT NULL DEFAULT 'sftp' CHECK(backend_type IN ('local','sftp','s3','rclone')),
  sftp_username TEXT NOT NULL DEFAULT '',
  sftp_host TEXT NOT NULL DEFAULT '',
  sftp_port INTEGER NOT NULL DEFAULT 22,
  sftp_path TEXT NOT NULL DEFAULT '',
  enabled INTEGER NOT NULL DEFAULT 0,
  schedule_cron TEXT NOT NULL DEFAULT '0 2 * * *',
  exclude_site_ids TEXT NOT NULL DEFAULT '[]',
  exclude_database_ids TEXT NOT NULL DEFAULT '[]',
  keep_last INTEGER NOT NULL DEFAULT 7,
  keep_daily INTEGER NOT NULL DEFAULT 7,
  keep_weekly INTEGER NOT NULL DEFAULT 4,
  keep_monthly INTEGER NOT NULL DEFAULT 6,
  last_status TEXT NOT NULL DEFAULT 'idle',
  last_message TEXT NOT NULL DEFAULT '',
  running_job_id TEXT,
  running_started_at TEXT,
  last_run_at TEXT,
  next_run_at TEXT,
  created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
  updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);

CREATE TABLE IF NOT EXISTS backup_jobs (
  id TEXT PRIMARY KEY,
  username TEXT NOT NULL,
  job_type TEXT NOT NULL CHECK(job_type IN ('scheduled','manual','restore_site','restore_database','delete_snapshot')),
  status TEXT NOT NULL DEFAULT 'running' CHECK(status IN ('running','success','failed')),
  snapshot_id TEXT NOT NULL DEFAULT '',
  message TEXT NOT NULL DEFAULT '',
  started_at TEXT NOT NULL,
  finished_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_sites_username ON sites(username);
CREATE INDEX IF NOT EXISTS idx_databases_username ON databases(username);
CREATE INDEX IF NOT EXISTS idx_backup_configs_due ON backup_configs(enabled, next_run_at);
CREATE INDEX IF NOT EXISTS idx_backup_jobs_username ON backup_jobs(username, started_at DESC);
"#;

/// Columns that arrived after the first release of `backup_configs`.
const LATE_COLUMNS: &[(&str, &str)] = &[
    ("s3_endpoint", "TEXT NOT NULL DEFAULT ''"),
    ("s3_bucket", "TEXT NOT NULL DEFAULT ''"),
    ("s3_prefix", "TEXT NOT NULL DEFAULT ''"),
    ("s3_region", "TEXT NOT NULL DEFAULT ''"),
    ("s3_bucket_lookup", "TEXT NOT NULL DEFAULT 'auto'"),
    ("s3_list_objects_v1", "INTEGER NOT NULL DEFAULT 0"),
    ("s3_access_key_enc", "TEXT NOT NULL DEFAULT ''"),
    ("s3_secret_key_enc", "TEXT NOT NULL DEFAULT ''"),
    ("s3_session_token_enc", "TEXT NOT NULL DEFAULT ''"),
    ("last_prune_at", "TEXT"),
];

fn has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns.iter().any(|c| c == column))
}

pub fn migrate_conn(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(SCHEMA)?;

    for (column, definition) in LATE_COLUMNS {
        if !has_column(conn, "backup_configs", column)? {
            conn.execute_batch(&format!(
                "ALTER TABLE backup_configs ADD COLUMN {column} {definition}"
            ))?;
        }
    }
    Ok(())
}

pub fn migrate(pool: &DbPool) -> anyhow::Result<()> {
    tracing::info!("[DB] Starting database migration...");
    let conn = pool.get()?;
    migrate_conn(&conn)?;
    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_is_idempotent() -> anyhow::Result<()> {
        let conn = Connection::open_in_memory()?;
        migrate_conn(&conn)?;
        migrate_conn(&conn)?;
        assert!(has_column(&conn, "backup_configs", "last_prune_at")?);
        assert!(has_column(&conn, "backup_configs", "s3_session_token_enc")?);
        Ok(())
    }

    /// `backup_configs` as first released, before S3 and prune tracking.
    const FIRST_RELEASE_CONFIGS: &str = "CREATE TABLE backup_configs (
      username TEXT PRIMARY KEY,
      repository TEXT NOT NULL DEFAULT '',
      password_enc TEXT NOT NULL DEFAULT '',
      backend_type TEXT NOT NULL DEFAULT 'sftp' CHECK(backend_type IN ('local','sftp','s3','rclone')),
      sftp_username TEXT NOT NULL DEFAULT '',
      sftp_host TEXT NOT NULL DEFAULT '',
      sftp_port INTEGER NOT NULL DEFAULT 22,
      sftp_path TEXT NOT NULL DEFAULT '',
      enabled INTEGER NOT NULL DEFAULT 0,
      schedule_cron TEXT NOT NULL DEFAULT '0 2 * * *',
      exclude_site_ids TEXT NOT NULL DEFAULT '[]',
      exclude_database_ids TEXT NOT NULL DEFAULT '[]',
      keep_last INTEGER NOT NULL DEFAULT 7,
      keep_daily INTEGER NOT NULL DEFAULT 7,
      keep_weekly INTEGER NOT NULL DEFAULT 4,
      keep_monthly INTEGER NOT NULL DEFAULT 6,
      last_status TEXT NOT NULL DEFAULT 'idle',
      last_message TEXT NOT NULL DEFAULT '',
      running_job_id TEXT,
      running_started_at TEXT,
      last_run_at TEXT,
      next_run_at TEXT,
      created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
      updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
    )";

    #[test]
    fn test_migrate_upgrades_legacy_config_table() -> anyhow::Result<()> {
        use crate::models::backup_config::{self, BackendType};

        let conn = Connection::open_in_memory()?;
        conn.execute_batch(FIRST_RELEASE_CONFIGS)?;
        conn.execute(
            "INSERT INTO backup_configs (username, repository, password_enc, backend_type, sftp_host, enabled)
             VALUES ('alice', 'sftp://alice@backup.example.com:22//srv/alice', 'ciphertext', 'sftp', 'backup.example.com', 1)",
            [],
        )?;
        assert!(!has_column(&conn, "backup_configs", "s3_bucket")?);

        migrate_conn(&conn)?;

        let cfg = backup_config::get(&conn, "alice")?.expect("legacy row survives the upgrade");
        assert_eq!(cfg.backend_type, BackendType::Sftp);
        assert_eq!(cfg.sftp_host, "backup.example.com");
        assert!(cfg.enabled);
        assert_eq!(cfg.s3_bucket_lookup, "auto");
        assert!(!cfg.s3_list_objects_v1);
        assert!(cfg.s3_access_key_enc.is_empty());
        assert!(cfg.last_prune_at.is_none());
        assert!(cfg.is_configured());
        Ok(())
    }
}
