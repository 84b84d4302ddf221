//! Manifest-guided restores of a single site or database, and whole
//! snapshot export as a zip archive.

use crate::db::connection::with_conn;
use crate::error::{BackupError, Result};
use crate::models::backup_job::{JobStatus, JobType};
use crate::models::inventory;
use crate::services::backup_engine::{blocking, scratch_path, BackupService, JobAccepted};
use crate::services::command_runner::{shell_quote, Invocation, UserIdentity, MAX_CAPTURED_OUTPUT};
use crate::services::manifest::{normalize_path_for_match, Manifest};
use crate::services::restic::{self, ResticClient};
use crate::services::user_fs;
use serde::Deserialize;
use std::collections::{BTreeSet, HashSet};
use std::io::{Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

const RESTORE_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);
const EXPORT_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// Free space required on top of the snapshot's restore size.
const EXPORT_HEADROOM_BYTES: u64 = 256 * 1024 * 1024;
const EXPORT_ID_LEN: usize = 16;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RestoreSiteRequest {
    pub snapshot_id: String,
    pub site_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RestoreDatabaseRequest {
    pub snapshot_id: String,
    pub database_id: String,
}

/// A finished export. `zip_path` lives inside `work_dir`, which the caller
/// removes once the archive has been streamed.
#[derive(Debug)]
pub struct SnapshotExport {
    pub zip_path: PathBuf,
    pub file_name: String,
    pub work_dir: PathBuf,
}

/// One top-level archive member and where its content sits on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ArchiveEntry {
    source: PathBuf,
    name: String,
}

impl BackupService {
    /// Replaces a live site with its copy from `snapshot_id`.
    pub async fn restore_site(self: &Arc<Self>, username: &str, req: RestoreSiteRequest) -> Result<JobAccepted> {
        let cfg = self.configured(username).await?;
        let snapshot_id = restic::validate_snapshot_id(&req.snapshot_id)?;
        let site_id = req.site_id.trim().to_string();
        if site_id.is_empty() {
            return Err(BackupError::config("site_id is required"));
        }

        let owner = username.to_string();
        let site = with_conn(&self.db, move |conn| inventory::find_site(conn, &site_id))
            .await?
            .filter(|s| s.username == owner)
            .ok_or_else(|| BackupError::NotFound("site not found".into()))?;

        let user = self.users.lookup(username)?;
        let apps = user.home.join("apps");
        let live_root = user_fs::site_root(&site.document_root)
            .map(|p| PathBuf::from(normalize_path_for_match(&p.to_string_lossy())))
            .ok_or_else(|| BackupError::NotFound("site not found".into()))?;
        if !live_root.starts_with(&apps) || live_root == apps {
            return Err(BackupError::PermissionDenied(format!(
                "site root {} is outside the apps directory",
                live_root.display()
            )));
        }
        let client = self.client(&cfg, user)?;

        const STARTED: &str = "Website restore started.";
        let job_id = self.create_job(username, JobType::RestoreSite, STARTED).await?;

        let service = self.clone();
        let jid = job_id.clone();
        let username = username.to_string();
        let domain = site.domain;
        self.tasks.spawn(async move {
            let result: Result<()> = async {
                let _permit = service.gate.acquire_worker().await?;
                tracing::info!(username = %username, job_id = %jid, snapshot_id = %snapshot_id, domain = %domain, "Website restore running");
                tokio::time::timeout(
                    RESTORE_TIMEOUT,
                    service.restore_site_files(&client, &jid, &snapshot_id, &domain, &live_root),
                )
                .await
                .unwrap_or_else(|_| Err(BackupError::execution("restore timed out")))
            }
            .await;
            service
                .finish_restore(&username, &jid, JobType::RestoreSite, &snapshot_id, result)
                .await;
        });

        Ok(JobAccepted::running(job_id, STARTED))
    }

    async fn restore_site_files(
        &self,
        client: &ResticClient,
        job_id: &str,
        snapshot_id: &str,
        domain: &str,
        live_root: &Path,
    ) -> Result<()> {
        let user = client.user();
        let scratch = user_fs::restore_dir(&user.home, job_id);
        prepare_scratch(user, &scratch).await?;

        let result: Result<()> = async {
            let (manifest, _) = client.load_manifest(snapshot_id).await?;
            let site_path = normalize_path_for_match(manifest.find_site_path(domain)?);
            client
                .restore(snapshot_id, &scratch, std::slice::from_ref(&site_path))
                .await
                .map_err(|e| e.context("failed to restore site files"))?;

            let source = scratch_path(&scratch, &site_path);
            if !source.is_dir() {
                return Err(BackupError::execution(format!(
                    "restored site path {site_path} is missing from the snapshot"
                )));
            }

            // Trailing slashes: sync the contents, not the directory itself.
            let invocation = Invocation::argv([
                "rsync".to_string(),
                "-a".to_string(),
                "--delete".to_string(),
                format!("{}/", source.display()),
                format!("{}/", live_root.display()),
            ])
            .limited(MAX_CAPTURED_OUTPUT);
            self.runner
                .run(user, &invocation)
                .await?
                .into_result("rsync")
                .map_err(|e| e.context("failed to replace site files"))?;
            Ok(())
        }
        .await;

        discard(scratch).await;
        result
    }

    /// Re-imports one database from its dump in `snapshot_id`.
    pub async fn restore_database(
        self: &Arc<Self>,
        username: &str,
        req: RestoreDatabaseRequest,
    ) -> Result<JobAccepted> {
        let cfg = self.configured(username).await?;
        let snapshot_id = restic::validate_snapshot_id(&req.snapshot_id)?;
        let database_id = req.database_id.trim().to_string();
        if database_id.is_empty() {
            return Err(BackupError::config("database_id is required"));
        }

        let owner = username.to_string();
        let database = with_conn(&self.db, move |conn| inventory::find_database(conn, &database_id))
            .await?
            .filter(|d| d.username == owner)
            .ok_or_else(|| BackupError::NotFound("database not found".into()))?;
        if database.db_password_enc.trim().is_empty() {
            return Err(BackupError::config("database credentials are not available for restore"));
        }
        let password = self
            .codec
            .decrypt(&database.db_password_enc)
            .map_err(|_| BackupError::execution("failed to decrypt database credentials"))?;

        let user = self.users.lookup(username)?;
        let client = self.client(&cfg, user)?;

        const STARTED: &str = "Database restore started.";
        let job_id = self.create_job(username, JobType::RestoreDatabase, STARTED).await?;

        let service = self.clone();
        let jid = job_id.clone();
        let username = username.to_string();
        self.tasks.spawn(async move {
            let result: Result<()> = async {
                let _permit = service.gate.acquire_worker().await?;
                tracing::info!(username = %username, job_id = %jid, snapshot_id = %snapshot_id, database = %database.db_name, "Database restore running");
                tokio::time::timeout(
                    RESTORE_TIMEOUT,
                    service.restore_database_dump(
                        &client,
                        &jid,
                        &snapshot_id,
                        &database.db_name,
                        &database.db_user,
                        &password,
                    ),
                )
                .await
                .unwrap_or_else(|_| Err(BackupError::execution("restore timed out")))
            }
            .await;
            service
                .finish_restore(&username, &jid, JobType::RestoreDatabase, &snapshot_id, result)
                .await;
        });

        Ok(JobAccepted::running(job_id, STARTED))
    }

    async fn restore_database_dump(
        &self,
        client: &ResticClient,
        job_id: &str,
        snapshot_id: &str,
        db_name: &str,
        db_user: &str,
        password: &str,
    ) -> Result<()> {
        let user = client.user();
        let scratch = user_fs::restore_dir(&user.home, job_id);
        prepare_scratch(user, &scratch).await?;

        let result: Result<()> = async {
            let (manifest, _) = client.load_manifest(snapshot_id).await?;
            let dump_path = normalize_path_for_match(manifest.find_database_dump_path(db_name)?);
            client
                .restore(snapshot_id, &scratch, std::slice::from_ref(&dump_path))
                .await
                .map_err(|e| e.context("failed to restore database dump"))?;

            let dump = scratch_path(&scratch, &dump_path);
            if !dump.is_file() {
                return Err(BackupError::execution(format!(
                    "restored database dump {dump_path} is missing from the snapshot"
                )));
            }

            let script = format!(
                "gunzip -c {} | mysql -h 127.0.0.1 -u {} {}",
                shell_quote(&dump.to_string_lossy()),
                shell_quote(db_user),
                shell_quote(db_name),
            );
            let invocation = Invocation::shell(script)
                .env("MYSQL_PWD", password)
                .limited(MAX_CAPTURED_OUTPUT);
            self.runner
                .run(user, &invocation)
                .await?
                .into_result("mysql")
                .map_err(|e| e.context("failed to import database dump"))?;
            Ok(())
        }
        .await;

        discard(scratch).await;
        result
    }

    async fn finish_restore(
        &self,
        username: &str,
        job_id: &str,
        job_type: JobType,
        snapshot_id: &str,
        result: Result<()>,
    ) {
        let (done, failed) = match job_type {
            JobType::RestoreDatabase => ("Database restored successfully.", "Database restore failed"),
            _ => ("Website restored successfully.", "Website restore failed"),
        };
        match result {
            Ok(()) => {
                tracing::info!(username = %username, job_id = %job_id, job_type = job_type.as_str(), "Restore completed");
                self.finish_job(job_id, JobStatus::Success, snapshot_id, done).await;
            }
            Err(e) => {
                tracing::warn!(username = %username, job_id = %job_id, job_type = job_type.as_str(), error = %e, "Restore failed");
                self.finish_job(job_id, JobStatus::Failed, snapshot_id, &format!("{failed}: {e}")).await;
            }
        }
    }

    /// Packs every site and dump listed in the snapshot's manifest into one
    /// zip. Only one export runs at a time; a second caller gets `Conflict`.
    pub async fn create_snapshot_zip(&self, username: &str, snapshot_id: &str) -> Result<SnapshotExport> {
        let _slot = self.gate.try_acquire_export()?;
        let cfg = self.configured(username).await?;
        let snapshot_id = restic::validate_snapshot_id(snapshot_id)?;
        let user = self.users.lookup(username)?;
        let client = self.client(&cfg, user)?;

        let work_dir = user_fs::downloads_dir(&client.user().home).join(Uuid::new_v4().to_string());
        let result = tokio::time::timeout(EXPORT_TIMEOUT, self.export_snapshot(&client, &snapshot_id, &work_dir))
            .await
            .unwrap_or_else(|_| Err(BackupError::execution("snapshot export timed out")));

        match result {
            Ok(export) => {
                tracing::info!(username = %username, snapshot_id = %snapshot_id, zip = %export.zip_path.display(), "Snapshot export ready");
                Ok(export)
            }
            Err(e) => {
                tracing::warn!(username = %username, snapshot_id = %snapshot_id, error = %e, "Snapshot export failed");
                discard(work_dir).await;
                Err(e)
            }
        }
    }

    async fn export_snapshot(&self, client: &ResticClient, snapshot_id: &str, work_dir: &Path) -> Result<SnapshotExport> {
        let user = client.user();
        let downloads = user_fs::downloads_dir(&user.home);
        let target = work_dir.join("restore");
        {
            let (user, downloads, work_dir, target) =
                (user.clone(), downloads.clone(), work_dir.to_path_buf(), target.clone());
            blocking(move || {
                user_fs::ensure_user_dir(&user, &downloads)?;
                user_fs::ensure_user_dir(&user, &work_dir)?;
                user_fs::ensure_user_dir(&user, &target)
            })
            .await?;
        }

        let (manifest, manifest_path) = client
            .load_manifest(snapshot_id)
            .await
            .map_err(|e| e.context("failed to load snapshot manifest for export"))?;

        let required = client.restore_size(snapshot_id).await?.saturating_add(EXPORT_HEADROOM_BYTES);
        let available = {
            let downloads = downloads.clone();
            blocking(move || user_fs::available_bytes(&downloads)).await?
        };
        if required > available {
            return Err(BackupError::execution(format!(
                "not enough free disk space for snapshot export: require at least {required} bytes, available {available} bytes"
            )));
        }

        let includes = export_includes(&manifest, &manifest_path);
        client
            .restore(snapshot_id, &target, &includes)
            .await
            .map_err(|e| e.context("failed to restore snapshot for download"))?;

        let entries = plan_archive(&manifest, &manifest_path, &target);
        let file_name = format!("snapshot-{}.zip", sanitize_snapshot_id_for_file(snapshot_id));
        let zip_path = work_dir.join(&file_name);
        {
            let zip_path = zip_path.clone();
            blocking(move || write_zip(&zip_path, &entries, true))
                .await
                .map_err(|e| e.context("failed to build snapshot zip"))?;
        }
        discard(target).await;
        if let Err(e) = user_fs::chown_to(user, &zip_path) {
            tracing::warn!(zip = %zip_path.display(), error = %e, "Failed to hand snapshot zip to user");
        }

        Ok(SnapshotExport { zip_path, file_name, work_dir: work_dir.to_path_buf() })
    }
}

/// Starts a job's scratch directory empty.
async fn prepare_scratch(user: &UserIdentity, dir: &Path) -> Result<()> {
    let (user, dir) = (user.clone(), dir.to_path_buf());
    blocking(move || {
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        user_fs::ensure_user_dir(&user, &dir)
    })
    .await
}

async fn discard(path: PathBuf) {
    if let Err(e) = blocking(move || {
        user_fs::remove_scratch(&path);
        Ok(())
    })
    .await
    {
        tracing::warn!(error = %e, "Scratch cleanup did not run");
    }
}

/// Snapshot paths an export restores: the manifest and everything it lists.
fn export_includes(manifest: &Manifest, manifest_path: &str) -> Vec<String> {
    let mut includes = BTreeSet::new();
    includes.insert(normalize_path_for_match(manifest_path));
    for site in &manifest.sites {
        includes.insert(normalize_path_for_match(&site.root_path));
    }
    for db in &manifest.databases {
        includes.insert(normalize_path_for_match(&db.dump_path));
    }
    includes.into_iter().filter(|p| !p.is_empty()).collect()
}

/// Maps restored paths below `root` to archive names:
/// `manifest.json`, `websites/<domain>` and `databases/<name>.sql.gz`.
fn plan_archive(manifest: &Manifest, manifest_path: &str, root: &Path) -> Vec<ArchiveEntry> {
    let mut used = HashSet::new();
    let mut seen = HashSet::new();
    let mut entries = vec![ArchiveEntry {
        source: scratch_path(root, manifest_path),
        name: "manifest.json".to_string(),
    }];
    used.insert(entries[0].name.clone());

    for site in &manifest.sites {
        let path = normalize_path_for_match(&site.root_path);
        if path.is_empty() || !seen.insert(path.clone()) {
            continue;
        }
        let base = base_name(&path);
        let fallback = if base.is_empty() { "site" } else { base };
        let segment = sanitize_archive_segment(&site.domain, fallback);
        entries.push(ArchiveEntry {
            source: scratch_path(root, &path),
            name: unique_name(&mut used, "websites/", &segment, ""),
        });
    }

    for db in &manifest.databases {
        let path = normalize_path_for_match(&db.dump_path);
        if path.is_empty() || !seen.insert(path.clone()) {
            continue;
        }
        let base = base_name(&path).trim_end_matches(".sql.gz");
        let fallback = if base.is_empty() { "database" } else { base };
        let segment = sanitize_archive_segment(&db.db_name, fallback);
        entries.push(ArchiveEntry {
            source: scratch_path(root, &path),
            name: unique_name(&mut used, "databases/", &segment, ".sql.gz"),
        });
    }
    entries
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or_default()
}

fn unique_name(used: &mut HashSet<String>, prefix: &str, segment: &str, suffix: &str) -> String {
    let mut candidate = format!("{prefix}{segment}{suffix}");
    let mut n = 2;
    while used.contains(&candidate) {
        candidate = format!("{prefix}{segment}-{n}{suffix}");
        n += 1;
    }
    used.insert(candidate.clone());
    candidate
}

/// One archive path segment: ASCII letters, digits, `.`, `_` and `-` only,
/// runs of anything else collapsed to one `-`.
pub fn sanitize_archive_segment(value: &str, fallback: &str) -> String {
    let raw = match (value.trim(), fallback.trim()) {
        ("", "") => "item",
        ("", fallback) => fallback,
        (value, _) => value,
    };

    let mut out = String::with_capacity(raw.len());
    let mut last_dash = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }

    let clean = out.trim_matches(|c| c == '-' || c == '.');
    if clean.is_empty() {
        "item".to_string()
    } else {
        clean.to_string()
    }
}

/// At most 16 ASCII alphanumerics of the id, for the download file name.
pub fn sanitize_snapshot_id_for_file(snapshot_id: &str) -> String {
    let clean: String = snapshot_id
        .trim()
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(EXPORT_ID_LEN)
        .collect();
    if clean.is_empty() {
        "snapshot".to_string()
    } else {
        clean
    }
}

/// Writes `entries` into a new zip at `zip_path`. With `delete_sources`
/// every file is removed right after it is added, so the scratch tree
/// shrinks while the archive grows. Symlinks are not followed, not even
/// one swapped in after the tree was listed.
fn write_zip(zip_path: &Path, entries: &[ArchiveEntry], delete_sources: bool) -> Result<()> {
    for entry in entries {
        std::fs::symlink_metadata(&entry.source).map_err(|e| {
            BackupError::execution(format!("failed to prepare snapshot zip path {}: {e}", entry.source.display()))
        })?;
    }

    let file = user_fs::create_private_file(zip_path)?;
    let mut zip = ZipWriter::new(file);

    for entry in entries {
        let meta = std::fs::symlink_metadata(&entry.source)?;
        if meta.is_dir() {
            add_tree(&mut zip, &entry.source, &entry.name, delete_sources)?;
            if delete_sources {
                remove_if_present(std::fs::remove_dir_all(&entry.source))?;
            }
        } else if meta.is_file() {
            add_file(&mut zip, &entry.source, &entry.name, &meta)?;
            if delete_sources {
                remove_if_present(std::fs::remove_file(&entry.source))?;
            }
        } else {
            tracing::debug!(path = %entry.source.display(), "Special file left out of snapshot zip");
        }
    }

    zip.finish()?;
    Ok(())
}

fn add_tree<W: Write + Seek>(zip: &mut ZipWriter<W>, root: &Path, prefix: &str, delete_sources: bool) -> Result<()> {
    zip.add_directory(format!("{prefix}/"), SimpleFileOptions::default())?;

    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| BackupError::execution(format!("failed to map {}: {e}", entry.path().display())))?;
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let name = format!("{prefix}/{rel}");

        let file_type = entry.file_type();
        if file_type.is_dir() {
            zip.add_directory(format!("{name}/"), SimpleFileOptions::default())?;
        } else if file_type.is_file() {
            let meta = entry.metadata().map_err(std::io::Error::from)?;
            add_file(zip, entry.path(), &name, &meta)?;
            if delete_sources {
                remove_if_present(std::fs::remove_file(entry.path()))?;
            }
        } else {
            tracing::debug!(path = %entry.path().display(), "Symlink left out of snapshot zip");
        }
    }
    Ok(())
}

fn add_file<W: Write + Seek>(zip: &mut ZipWriter<W>, path: &Path, name: &str, meta: &std::fs::Metadata) -> Result<()> {
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .large_file(meta.len() >= u64::from(u32::MAX));
    #[cfg(unix)]
    let options = {
        use std::os::unix::fs::PermissionsExt;
        options.unix_permissions(meta.permissions().mode() & 0o777)
    };

    zip.start_file(name.to_string(), options)?;
    let mut file = user_fs::open_no_follow(path)?;
    std::io::copy(&mut file, zip)?;
    Ok(())
}

fn remove_if_present(result: std::io::Result<()>) -> Result<()> {
    match result {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}
