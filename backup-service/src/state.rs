use crate::config::AppConfig;
use crate::services::backup_engine::BackupService;
use std::sync::Arc;

pub struct AppState {
    pub config: AppConfig,
    pub backups: Arc<BackupService>,
}

impl AppState {
    pub fn new(config: AppConfig, backups: Arc<BackupService>) -> Self {
        Self { config, backups }
    }
}
