use crate::error::AppError;
use crate::models::backup_job::BackupJob;
use crate::services::backup_engine::JobAccepted;
use crate::services::repository_config::{BackupConfigView, Catalog, SaveConfigRequest, TestConfigResponse};
use crate::services::rclone::RcloneStatus;
use crate::services::restic::Snapshot;
use crate::services::restore::{RestoreDatabaseRequest, RestoreSiteRequest};
use crate::services::user_fs;
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::io::ReaderStream;

/// Header carrying the account name, set by the authenticating proxy.
pub const REMOTE_USER_HEADER: &str = "x-remote-user";

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/config", get(get_config).put(save_config))
        .route("/config/test", post(test_config))
        .route("/rclone/status", get(rclone_status))
        .route("/rclone/install", post(install_rclone))
        .route("/catalog", get(get_catalog))
        .route("/jobs", get(list_jobs))
        .route("/snapshots", get(list_snapshots))
        .route("/run", post(run_backup))
        .route("/snapshots/{id}", delete(delete_snapshot))
        .route("/snapshots/{id}/download", get(download_snapshot))
        .route("/restore/site", post(restore_site))
        .route("/restore/database", post(restore_database))
}

/// The hosting account a request acts for.
pub struct RemoteUser(pub String);

impl<S: Send + Sync> FromRequestParts<S> for RemoteUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let name = parts
            .headers
            .get(REMOTE_USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AppError::Unauthorized("authentication required".into()))?;

        let valid = name.len() <= 32
            && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            && !name.starts_with('-');
        if !valid {
            return Err(AppError::BadRequest("invalid username".into()));
        }
        Ok(Self(name.to_string()))
    }
}

#[derive(Deserialize)]
pub struct LimitQuery {
    pub limit: Option<String>,
}

impl LimitQuery {
    /// Unparseable limits fall back to the listing's default.
    fn value(&self) -> Option<usize> {
        self.limit.as_deref().and_then(|v| v.trim().parse().ok())
    }
}

async fn get_config(
    State(state): State<Arc<AppState>>,
    RemoteUser(username): RemoteUser,
) -> Result<Json<BackupConfigView>, AppError> {
    Ok(Json(state.backups.get_config(&username).await?))
}

async fn save_config(
    State(state): State<Arc<AppState>>,
    RemoteUser(username): RemoteUser,
    Json(body): Json<SaveConfigRequest>,
) -> Result<Json<BackupConfigView>, AppError> {
    Ok(Json(state.backups.save_config(&username, body).await?))
}

async fn test_config(
    State(state): State<Arc<AppState>>,
    RemoteUser(username): RemoteUser,
    Json(body): Json<SaveConfigRequest>,
) -> Result<Json<TestConfigResponse>, AppError> {
    Ok(Json(state.backups.test_config(&username, body).await?))
}

async fn rclone_status(
    State(state): State<Arc<AppState>>,
    RemoteUser(_): RemoteUser,
) -> Result<Json<RcloneStatus>, AppError> {
    Ok(Json(state.backups.rclone_status().await?))
}

async fn install_rclone(
    State(state): State<Arc<AppState>>,
    RemoteUser(username): RemoteUser,
) -> Result<(StatusCode, Json<RcloneStatus>), AppError> {
    tracing::info!(username = %username, "rclone installation requested");
    let status = state.backups.install_rclone().await?;
    Ok((StatusCode::ACCEPTED, Json(status)))
}

async fn get_catalog(
    State(state): State<Arc<AppState>>,
    RemoteUser(username): RemoteUser,
) -> Result<Json<Catalog>, AppError> {
    Ok(Json(state.backups.get_catalog(&username).await?))
}

async fn list_jobs(
    State(state): State<Arc<AppState>>,
    RemoteUser(username): RemoteUser,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<BackupJob>>, AppError> {
    Ok(Json(state.backups.list_jobs(&username, query.value()).await?))
}

async fn list_snapshots(
    State(state): State<Arc<AppState>>,
    RemoteUser(username): RemoteUser,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<Snapshot>>, AppError> {
    Ok(Json(state.backups.list_snapshots(&username, query.value()).await?))
}

async fn run_backup(
    State(state): State<Arc<AppState>>,
    RemoteUser(username): RemoteUser,
) -> Result<(StatusCode, Json<JobAccepted>), AppError> {
    let accepted = state.backups.trigger_manual_backup(&username).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

async fn delete_snapshot(
    State(state): State<Arc<AppState>>,
    RemoteUser(username): RemoteUser,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<JobAccepted>), AppError> {
    let accepted = state.backups.delete_snapshot(&username, &id).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

async fn restore_site(
    State(state): State<Arc<AppState>>,
    RemoteUser(username): RemoteUser,
    Json(body): Json<RestoreSiteRequest>,
) -> Result<(StatusCode, Json<JobAccepted>), AppError> {
    let accepted = state.backups.restore_site(&username, body).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

async fn restore_database(
    State(state): State<Arc<AppState>>,
    RemoteUser(username): RemoteUser,
    Json(body): Json<RestoreDatabaseRequest>,
) -> Result<(StatusCode, Json<JobAccepted>), AppError> {
    let accepted = state.backups.restore_database(&username, body).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

/// Removes an export's work directory once the response body is gone,
/// whether it was streamed to the end or the client went away.
struct WorkDirGuard(PathBuf);

impl Drop for WorkDirGuard {
    fn drop(&mut self) {
        user_fs::remove_scratch(&self.0);
    }
}

async fn download_snapshot(
    State(state): State<Arc<AppState>>,
    RemoteUser(username): RemoteUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let export = state.backups.create_snapshot_zip(&username, &id).await?;
    let guard = WorkDirGuard(export.work_dir);

    let file = tokio::fs::File::open(&export.zip_path)
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to open snapshot zip: {}", e)))?;
    let length = file
        .metadata()
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to stat snapshot zip: {}", e)))?
        .len();

    let stream = ReaderStream::new(file).map(move |chunk| {
        let _guard = &guard;
        chunk
    });
    let body = Body::from_stream(stream);

    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_LENGTH, length.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", export.file_name),
            ),
        ],
        body,
    ))
}
