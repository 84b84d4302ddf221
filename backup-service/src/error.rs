use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Failure taxonomy of the backup engine.
///
/// `Config` and `Conflict` are raised synchronously before any job exists.
/// Everything else is what a background run records on its job row.
#[derive(thiserror::Error, Debug)]
pub enum BackupError {
    #[error("{0}")]
    Config(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    PermissionDenied(String),

    #[error("{program} exited with status {status}: {output}")]
    CommandFailed {
        program: String,
        status: i32,
        output: String,
    },

    #[error("{0}")]
    Execution(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BackupError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    /// Prefixes the error text, keeping command output intact.
    pub fn context(self, prefix: &str) -> Self {
        match self {
            Self::Config(m) => Self::Config(format!("{prefix}: {m}")),
            Self::Conflict(m) => Self::Conflict(m),
            Self::NotFound(m) => Self::NotFound(format!("{prefix}: {m}")),
            other => Self::Execution(format!("{prefix}: {other}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unprocessable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<BackupError> for AppError {
    fn from(err: BackupError) -> Self {
        match err {
            BackupError::Config(m) => AppError::BadRequest(m),
            BackupError::Conflict(m) => AppError::Conflict(m),
            BackupError::NotFound(m) => AppError::NotFound(m),
            BackupError::PermissionDenied(m) => AppError::Forbidden(m),
            e @ (BackupError::CommandFailed { .. } | BackupError::Execution(_)) => {
                AppError::Unprocessable(e.to_string())
            }
            BackupError::Internal(e) => AppError::Internal(e),
            other => AppError::Internal(anyhow::Error::new(other)),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            AppError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, m.clone()),
            AppError::Forbidden(m) => (StatusCode::FORBIDDEN, m.clone()),
            AppError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),
            AppError::Unprocessable(m) => (StatusCode::UNPROCESSABLE_ENTITY, m.clone()),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".into())
            }
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}
