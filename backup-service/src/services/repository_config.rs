//! Turning a user's config form into a stored repository config, and the
//! read-only view handed back to the panel.

use crate::error::{BackupError, Result};
use crate::models::backup_config::{
    BackendType, BackupConfigRecord, Retention, DEFAULT_S3_BUCKET_LOOKUP, DEFAULT_SFTP_PORT,
};
use crate::models::inventory::{DatabaseRecord, SiteRecord};
use crate::services::secrets::SecretCodec;
use crate::services::user_fs;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// Body of `PUT /config` and `POST /config/test`. Blank fields keep the
/// stored value; secrets are only replaced when supplied.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SaveConfigRequest {
    pub repository: String,
    pub repository_password: String,
    pub backend_type: String,
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
    pub s3_access_key_id: String,
    pub s3_secret_access_key: String,
    pub s3_session_token: String,
    pub enabled: bool,
    pub schedule_cron: String,
    pub exclude_site_ids: Vec<String>,
    pub exclude_database_ids: Vec<String>,
    pub keep_last: i64,
    pub keep_daily: i64,
    pub keep_weekly: i64,
    pub keep_monthly: i64,
}

impl SaveConfigRequest {
    pub fn retention(&self) -> Retention {
        Retention {
            keep_last: self.keep_last,
            keep_daily: self.keep_daily,
            keep_weekly: self.keep_weekly,
            keep_monthly: self.keep_monthly,
        }
    }
}

fn encrypt(codec: &dyn SecretCodec, what: &str, plain: &str) -> Result<String> {
    codec
        .encrypt(plain)
        .map_err(|e| BackupError::Internal(anyhow::anyhow!("failed to encrypt {what}: {e}")))
}

fn pick(requested: &str, stored: &str) -> String {
    match requested.trim() {
        "" => stored.trim().to_string(),
        value => value.to_string(),
    }
}

/// Resolves the repository half of a request against the stored config:
/// backend, repository URL, connection options and encrypted secrets.
/// Policy fields (schedule, exclusions, retention) are left untouched.
pub fn resolve_backend(
    existing: Option<&BackupConfigRecord>,
    req: &SaveConfigRequest,
    username: &str,
    codec: &dyn SecretCodec,
) -> Result<BackupConfigRecord> {
    let mut cfg = existing
        .cloned()
        .unwrap_or_else(|| BackupConfigRecord::default_for(username));

    let backend = match req.backend_type.trim() {
        "" => existing.map(|c| c.backend_type).unwrap_or(BackendType::Sftp),
        raw => BackendType::parse(raw).ok_or_else(|| BackupError::config("unsupported backup backend type"))?,
    };

    let stored = existing.cloned().unwrap_or_else(|| {
        let mut blank = BackupConfigRecord::default_for(username);
        blank.sftp_username.clear();
        blank.s3_bucket_lookup.clear();
        blank
    });
    let repository = pick(&req.repository, &stored.repository);
    let mut sftp_username = pick(&req.sftp_username, &stored.sftp_username);
    let sftp_host = pick(&req.sftp_host, &stored.sftp_host);
    let sftp_port = match (req.sftp_port, stored.sftp_port) {
        (0, 0) => DEFAULT_SFTP_PORT,
        (0, port) => port,
        (port, _) => port,
    };
    let sftp_path = pick(&req.sftp_path, &stored.sftp_path);
    let s3_endpoint = pick(&req.s3_endpoint, &stored.s3_endpoint);
    let s3_bucket = pick(&req.s3_bucket, &stored.s3_bucket);
    let s3_prefix = pick(&req.s3_prefix, &stored.s3_prefix);
    let s3_region = pick(&req.s3_region, &stored.s3_region);
    let s3_bucket_lookup = normalize_bucket_lookup(&pick(&req.s3_bucket_lookup, &stored.s3_bucket_lookup))?;

    if !req.repository_password.trim().is_empty() {
        cfg.password_enc = encrypt(codec, "repository password", &req.repository_password)?;
    }

    cfg.backend_type = backend;
    cfg.sftp_port = DEFAULT_SFTP_PORT;
    cfg.sftp_username.clear();
    cfg.sftp_host.clear();
    cfg.sftp_path.clear();
    if backend != BackendType::S3 {
        cfg.s3_endpoint.clear();
        cfg.s3_bucket.clear();
        cfg.s3_prefix.clear();
        cfg.s3_region.clear();
        cfg.s3_bucket_lookup = DEFAULT_S3_BUCKET_LOOKUP.to_string();
        cfg.s3_list_objects_v1 = false;
    }

    match backend {
        BackendType::Local => {
            cfg.repository = normalize_absolute_path(&repository)
                .map_err(|_| BackupError::config("local backup path is required and must be absolute"))?;
        }
        BackendType::Sftp => {
            if sftp_username.is_empty() {
                sftp_username = username.to_string();
            }
            cfg.repository = build_sftp_repository(&sftp_username, &sftp_host, sftp_port, &sftp_path)?;
            cfg.sftp_username = sftp_username;
            cfg.sftp_host = sftp_host;
            cfg.sftp_port = sftp_port;
            cfg.sftp_path = sftp_path;
        }
        BackendType::S3 => {
            cfg.repository = build_s3_repository(&s3_endpoint, &s3_bucket, &s3_prefix)?;
            cfg.s3_endpoint = s3_endpoint;
            cfg.s3_bucket = s3_bucket;
            cfg.s3_prefix = s3_prefix;
            cfg.s3_region = s3_region;
            cfg.s3_bucket_lookup = s3_bucket_lookup;
            cfg.s3_list_objects_v1 = req.s3_list_objects_v1;

            if !req.s3_access_key_id.trim().is_empty() {
                cfg.s3_access_key_enc = encrypt(codec, "s3 access key", &req.s3_access_key_id)?;
            }
            if !req.s3_secret_access_key.trim().is_empty() {
                cfg.s3_secret_key_enc = encrypt(codec, "s3 secret key", &req.s3_secret_access_key)?;
            }
            if !req.s3_session_token.trim().is_empty() {
                cfg.s3_session_token_enc = encrypt(codec, "s3 session token", &req.s3_session_token)?;
            }
            if cfg.s3_access_key_enc.trim().is_empty() || cfg.s3_secret_key_enc.trim().is_empty() {
                return Err(BackupError::config("s3 access key and secret key are required"));
            }
        }
        BackendType::Rclone => {
            if repository.is_empty() {
                return Err(BackupError::config("rclone repository is required"));
            }
            if !repository.to_ascii_lowercase().starts_with("rclone:") {
                return Err(BackupError::config("rclone repository must start with rclone:"));
            }
            cfg.repository = repository;
        }
    }

    Ok(cfg)
}

fn normalize_bucket_lookup(raw: &str) -> Result<String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "auto" => Ok(DEFAULT_S3_BUCKET_LOOKUP.to_string()),
        v @ ("dns" | "path") => Ok(v.to_string()),
        _ => Err(BackupError::config("s3 bucket lookup must be one of: auto, dns, path")),
    }
}

/// Cleans an absolute path lexically. Relative or empty input is rejected.
pub fn normalize_absolute_path(raw: &str) -> Result<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(BackupError::config("path is required"));
    }
    if !Path::new(raw).is_absolute() {
        return Err(BackupError::config("path must be absolute"));
    }
    let mut clean = PathBuf::from("/");
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::ParentDir => {
                clean.pop();
            }
            _ => {}
        }
    }
    Ok(clean.to_string_lossy().into_owned())
}

fn build_sftp_repository(user: &str, host: &str, port: i64, path: &str) -> Result<String> {
    if user.trim().is_empty() {
        return Err(BackupError::config("sftp username is required"));
    }
    let host = host.trim();
    if host.is_empty() {
        return Err(BackupError::config("sftp host is required"));
    }
    if !(1..=65535).contains(&port) {
        return Err(BackupError::config("sftp port must be between 1 and 65535"));
    }
    let path = normalize_absolute_path(path).map_err(|e| BackupError::config(format!("sftp path: {e}")))?;

    let host_port = if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    Ok(format!(
        "sftp://{}@{host_port}//{}",
        escape_userinfo(user.trim()),
        path.trim_start_matches('/')
    ))
}

fn build_s3_repository(endpoint: &str, bucket: &str, prefix: &str) -> Result<String> {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.is_empty() {
        return Err(BackupError::config("s3 endpoint is required"));
    }
    let bucket = bucket.trim().trim_matches('/');
    if bucket.is_empty() {
        return Err(BackupError::config("s3 bucket is required"));
    }
    let prefix = prefix.trim().trim_matches('/');
    let mut repo = format!("s3:{endpoint}/{bucket}");
    if !prefix.is_empty() {
        repo.push('/');
        repo.push_str(prefix);
    }
    Ok(repo)
}

/// Percent-encodes the user part of an URL authority.
fn escape_userinfo(user: &str) -> String {
    let mut out = String::with_capacity(user.len());
    for byte in user.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => out.push(byte as char),
            b'!' | b'$' | b'&' | b'\'' | b'(' | b')' | b'*' | b'+' | b',' | b';' | b'=' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogSite {
    pub id: String,
    pub domain: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogDatabase {
    pub id: String,
    pub db_name: String,
}

/// What the user can exclude from backups or pick for a restore.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Catalog {
    pub sites: Vec<CatalogSite>,
    pub databases: Vec<CatalogDatabase>,
}

pub fn build_catalog(sites: &[SiteRecord], databases: &[DatabaseRecord]) -> Catalog {
    let mut catalog = Catalog {
        sites: sites
            .iter()
            .map(|s| CatalogSite {
                id: s.id.clone(),
                domain: s.domain.clone(),
                path: user_fs::site_root(&s.document_root)
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            })
            .collect(),
        databases: databases
            .iter()
            .map(|d| CatalogDatabase { id: d.id.clone(), db_name: d.db_name.clone() })
            .collect(),
    };
    catalog.sites.sort_by(|a, b| a.domain.cmp(&b.domain));
    catalog.databases.sort_by(|a, b| a.db_name.cmp(&b.db_name));
    catalog
}

fn is_empty_str(s: &str) -> bool {
    s.is_empty()
}

/// The config as shown to its owner. Secrets are reduced to flags.
#[derive(Debug, Clone, Serialize)]
pub struct BackupConfigView {
    pub username: String,
    pub repository: String,
    pub has_password: bool,
    pub backend_type: BackendType,
    #[serde(skip_serializing_if = "is_empty_str")]
    pub sftp_username: String,
    #[serde(skip_serializing_if = "is_empty_str")]
    pub sftp_host: String,
    pub sftp_port: i64,
    #[serde(skip_serializing_if = "is_empty_str")]
    pub sftp_path: String,
    #[serde(skip_serializing_if = "is_empty_str")]
    pub s3_endpoint: String,
    #[serde(skip_serializing_if = "is_empty_str")]
    pub s3_bucket: String,
    #[serde(skip_serializing_if = "is_empty_str")]
    pub s3_prefix: String,
    #[serde(skip_serializing_if = "is_empty_str")]
    pub s3_region: String,
    pub s3_bucket_lookup: String,
    pub s3_list_objects_v1: bool,
    pub has_s3_credentials: bool,
    pub has_s3_session_token: bool,
    pub enabled: bool,
    pub schedule_cron: String,
    pub exclude_site_ids: Vec<String>,
    pub exclude_database_ids: Vec<String>,
    #[serde(flatten)]
    pub retention: Retention,
    pub last_status: String,
    pub last_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running_job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running_started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<String>,
    pub catalog: Catalog,
}

impl BackupConfigView {
    pub fn new(cfg: &BackupConfigRecord, catalog: Catalog) -> Self {
        Self {
            username: cfg.username.clone(),
            repository: cfg.repository.clone(),
            has_password: !cfg.password_enc.trim().is_empty(),
            backend_type: cfg.backend_type,
            sftp_username: cfg.sftp_username.clone(),
            sftp_host: cfg.sftp_host.clone(),
            sftp_port: cfg.sftp_port,
            sftp_path: cfg.sftp_path.clone(),
            s3_endpoint: cfg.s3_endpoint.clone(),
            s3_bucket: cfg.s3_bucket.clone(),
            s3_prefix: cfg.s3_prefix.clone(),
            s3_region: cfg.s3_region.clone(),
            s3_bucket_lookup: cfg.s3_bucket_lookup.clone(),
            s3_list_objects_v1: cfg.s3_list_objects_v1,
            has_s3_credentials: !cfg.s3_access_key_enc.trim().is_empty()
                && !cfg.s3_secret_key_enc.trim().is_empty(),
            has_s3_session_token: !cfg.s3_session_token_enc.trim().is_empty(),
            enabled: cfg.enabled,
            schedule_cron: cfg.schedule_cron.clone(),
            exclude_site_ids: cfg.exclude_site_ids.clone(),
            exclude_database_ids: cfg.exclude_database_ids.clone(),
            retention: cfg.retention,
            last_status: cfg.last_status.clone(),
            last_message: cfg.last_message.clone(),
            running_job_id: cfg.running_job_id.clone(),
            running_started_at: cfg.running_started_at.clone(),
            last_run_at: cfg.last_run_at.clone(),
            next_run_at: cfg.next_run_at.clone(),
            catalog,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TestConfigResponse {
    pub status: &'static str,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::secrets::AesGcmCodec;

    fn codec() -> AesGcmCodec {
        AesGcmCodec::from_passphrase("test").unwrap()
    }

    #[test]
    fn test_local_backend_normalizes_path() {
        let req = SaveConfigRequest {
            backend_type: "local".into(),
            repository: " /srv/backups/../restic/ ".into(),
            repository_password: "pw".into(),
            ..Default::default()
        };
        let cfg = resolve_backend(None, &req, "alice", &codec()).unwrap();
        assert_eq!(cfg.repository, "/srv/restic");
        assert_eq!(cfg.backend_type, BackendType::Local);
        assert!(cfg.sftp_host.is_empty());
        assert_eq!(codec().decrypt(&cfg.password_enc).unwrap(), "pw");

        let relative = SaveConfigRequest { repository: "restic".into(), ..req };
        let err = resolve_backend(None, &relative, "alice", &codec()).unwrap_err();
        assert_eq!(err.to_string(), "local backup path is required and must be absolute");
    }

    #[test]
    fn test_sftp_repository_url() {
        let req = SaveConfigRequest {
            backend_type: "sftp".into(),
            sftp_host: "backup.example.com".into(),
            sftp_path: "/srv/restic/alice".into(),
            ..Default::default()
        };
        let cfg = resolve_backend(None, &req, "alice", &codec()).unwrap();
        assert_eq!(cfg.repository, "sftp://alice@backup.example.com:22//srv/restic/alice");
        assert_eq!(cfg.sftp_username, "alice");

        let req = SaveConfigRequest {
            sftp_username: "a b@c".into(),
            sftp_host: "2001:db8::1".into(),
            sftp_port: 2222,
            ..req
        };
        let cfg = resolve_backend(None, &req, "alice", &codec()).unwrap();
        assert_eq!(cfg.repository, "sftp://a%20b%40c@[2001:db8::1]:2222//srv/restic/alice");

        let bad_port = SaveConfigRequest { sftp_port: 70000, ..req };
        assert!(resolve_backend(None, &bad_port, "alice", &codec()).is_err());
    }

    #[test]
    fn test_blank_fields_inherit_stored_values() {
        let first = SaveConfigRequest {
            backend_type: "sftp".into(),
            repository_password: "secret".into(),
            sftp_host: "h".into(),
            sftp_port: 2200,
            sftp_path: "/r".into(),
            ..Default::default()
        };
        let stored = resolve_backend(None, &first, "alice", &codec()).unwrap();

        let update = SaveConfigRequest::default();
        let cfg = resolve_backend(Some(&stored), &update, "alice", &codec()).unwrap();
        assert_eq!(cfg.backend_type, BackendType::Sftp);
        assert_eq!(cfg.repository, "sftp://alice@h:2200//r");
        assert_eq!(cfg.password_enc, stored.password_enc);
    }

    #[test]
    fn test_s3_requires_keys_and_valid_lookup() {
        let req = SaveConfigRequest {
            backend_type: "s3".into(),
            s3_endpoint: "s3.amazonaws.com/".into(),
            s3_bucket: "/bucket/".into(),
            s3_prefix: "panel".into(),
            ..Default::default()
        };
        let err = resolve_backend(None, &req, "alice", &codec()).unwrap_err();
        assert_eq!(err.to_string(), "s3 access key and secret key are required");

        let with_keys = SaveConfigRequest {
            s3_access_key_id: "AKIA".into(),
            s3_secret_access_key: "shh".into(),
            ..req.clone()
        };
        let cfg = resolve_backend(None, &with_keys, "alice", &codec()).unwrap();
        assert_eq!(cfg.repository, "s3:s3.amazonaws.com/bucket/panel");
        assert_eq!(cfg.s3_bucket_lookup, "auto");
        assert!(cfg.sftp_host.is_empty());

        let bad_lookup = SaveConfigRequest { s3_bucket_lookup: "virtual".into(), ..with_keys };
        let err = resolve_backend(None, &bad_lookup, "alice", &codec()).unwrap_err();
        assert_eq!(err.to_string(), "s3 bucket lookup must be one of: auto, dns, path");
    }

    #[test]
    fn test_rclone_and_unknown_backends() {
        let req = SaveConfigRequest {
            backend_type: "rclone".into(),
            repository: "gdrive:backups".into(),
            ..Default::default()
        };
        let err = resolve_backend(None, &req, "alice", &codec()).unwrap_err();
        assert_eq!(err.to_string(), "rclone repository must start with rclone:");

        let ok = SaveConfigRequest { repository: "rclone:gdrive:backups".into(), ..req };
        assert_eq!(resolve_backend(None, &ok, "alice", &codec()).unwrap().repository, "rclone:gdrive:backups");

        let unknown = SaveConfigRequest { backend_type: "ftp".into(), ..Default::default() };
        let err = resolve_backend(None, &unknown, "alice", &codec()).unwrap_err();
        assert!(matches!(err, BackupError::Config(_)));
    }

    #[test]
    fn test_view_never_exposes_secrets() {
        let mut cfg = BackupConfigRecord::default_for("alice");
        cfg.password_enc = codec().encrypt("pw").unwrap();
        cfg.s3_access_key_enc = "enc-a".into();
        let view = serde_json::to_value(BackupConfigView::new(&cfg, Catalog::default())).unwrap();

        assert_eq!(view["has_password"], true);
        assert_eq!(view["has_s3_credentials"], false);
        assert_eq!(view["keep_last"], 7);
        let text = view.to_string();
        assert!(!text.contains("password_enc"));
        assert!(!text.contains("enc-a"));
    }

    #[test]
    fn test_catalog_uses_site_root_and_sorts() {
        let sites = vec![
            SiteRecord {
                id: "s2".into(),
                username: "alice".into(),
                domain: "b.com".into(),
                document_root: "/home/alice/apps/b.com/public".into(),
            },
            SiteRecord {
                id: "s1".into(),
                username: "alice".into(),
                domain: "a.com".into(),
                document_root: "/home/alice/apps/a.com/public".into(),
            },
        ];
        let catalog = build_catalog(&sites, &[]);
        assert_eq!(catalog.sites[0].domain, "a.com");
        assert_eq!(catalog.sites[0].path, "/home/alice/apps/a.com");
    }
}
