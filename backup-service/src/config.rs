use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub log_level: String,
    pub secret_key: String,
    pub max_workers: Option<usize>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let data_dir = PathBuf::from(
            std::env::var("DATA_DIR").unwrap_or_else(|_| "/var/lib/backup-service".into()),
        );
        let db_path = std::env::var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("panel.db"));

        let secret_key = std::env::var("SECRET_KEY").unwrap_or_default();
        if secret_key.trim().is_empty() {
            anyhow::bail!("SECRET_KEY must be set to decrypt stored repository credentials");
        }

        Ok(Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8087),
            db_path,
            data_dir,
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            secret_key,
            max_workers: std::env::var("MAX_BACKUP_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0),
        })
    }
}
