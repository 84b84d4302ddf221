//! Per-user working directories below `~/.fastcp/backups` and the
//! filesystem chores around them.

use crate::error::{BackupError, Result};
use crate::services::command_runner::UserIdentity;
use std::path::{Path, PathBuf};

pub fn backup_root(home: &Path) -> PathBuf {
    home.join(".fastcp").join("backups")
}

pub fn dump_dir(home: &Path) -> PathBuf {
    backup_root(home).join("mysql-dumps")
}

pub fn manifest_path(home: &Path) -> PathBuf {
    backup_root(home).join("manifest.json")
}

pub fn restore_dir(home: &Path, job_id: &str) -> PathBuf {
    backup_root(home).join("restore").join(job_id)
}

pub fn downloads_dir(home: &Path) -> PathBuf {
    backup_root(home).join("downloads")
}

/// Site root directory: the parent of the document root
/// (`~/apps/<site>/public` -> `~/apps/<site>`).
pub fn site_root(document_root: &str) -> Option<PathBuf> {
    let trimmed = document_root.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    Path::new(trimmed)
        .parent()
        .filter(|p| !p.as_os_str().is_empty() && *p != Path::new("/"))
        .map(Path::to_path_buf)
}

/// Creates `path` (which must live under the user's home), handing every
/// created directory to the user. The leaf is always reset to 0700.
///
/// Existing components must be real directories: a symlink anywhere
/// between the home and the leaf is refused.
#[cfg(unix)]
pub fn ensure_user_dir(user: &UserIdentity, path: &Path) -> Result<()> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let rel = relative_to_home(user, path)?;
    let mut current = user.home.clone();
    for component in rel.components() {
        current.push(component);
        match std::fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_dir() => continue,
            Ok(_) => return Err(not_a_directory(&current)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                std::fs::create_dir(&current)?;
                chown_to(user, &current)?;
            }
            Err(e) => return Err(e.into()),
        }
    }

    let dir = std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(nix::libc::O_NOFOLLOW | nix::libc::O_DIRECTORY)
        .open(path)
        .map_err(|e| refused_or_io(path, e))?;
    dir.set_permissions(std::fs::Permissions::from_mode(0o700))?;
    fchown_to(user, &dir, path)
}

/// Writes a file readable only by the user. The parent must be a real
/// directory below the home and the file itself must not be a symlink or
/// carry extra hard links.
#[cfg(unix)]
pub fn write_user_file(user: &UserIdentity, path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};

    if let Some(parent) = path.parent() {
        require_real_dirs(user, parent)?;
    }

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .mode(0o600)
        .custom_flags(nix::libc::O_NOFOLLOW)
        .open(path)
        .map_err(|e| refused_or_io(path, e))?;
    let meta = file.metadata()?;
    if !meta.file_type().is_file() || meta.nlink() > 1 {
        return Err(BackupError::PermissionDenied(format!(
            "refusing to write {}: not a private regular file",
            path.display()
        )));
    }

    file.set_len(0)?;
    file.write_all(contents)?;
    file.sync_all()?;
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    fchown_to(user, &file, path)
}

/// Opens an existing regular file for reading without following a
/// symlink at `path`.
#[cfg(unix)]
pub fn open_no_follow(path: &Path) -> Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    let file = std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(nix::libc::O_NOFOLLOW)
        .open(path)
        .map_err(|e| refused_or_io(path, e))?;
    if !file.metadata()?.file_type().is_file() {
        return Err(BackupError::PermissionDenied(format!("{} is not a regular file", path.display())));
    }
    Ok(file)
}

/// Creates a new private file. Fails if anything, symlinks included,
/// already sits at `path`.
#[cfg(unix)]
pub fn create_private_file(path: &Path) -> Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    Ok(std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .custom_flags(nix::libc::O_NOFOLLOW)
        .open(path)?)
}

/// Hands `path` to the user. A symlink is changed itself, never its target.
#[cfg(unix)]
pub fn chown_to(user: &UserIdentity, path: &Path) -> Result<()> {
    std::os::unix::fs::lchown(path, Some(user.uid), Some(user.gid)).map_err(|e| {
        BackupError::PermissionDenied(format!("failed to chown {} to {}: {e}", path.display(), user.name))
    })
}

#[cfg(unix)]
fn fchown_to(user: &UserIdentity, file: &std::fs::File, path: &Path) -> Result<()> {
    std::os::unix::fs::fchown(file, Some(user.uid), Some(user.gid)).map_err(|e| {
        BackupError::PermissionDenied(format!("failed to chown {} to {}: {e}", path.display(), user.name))
    })
}

/// Every component from the home down to `dir` must be a real directory.
#[cfg(unix)]
fn require_real_dirs(user: &UserIdentity, dir: &Path) -> Result<()> {
    let rel = relative_to_home(user, dir)?;
    let mut current = user.home.clone();
    for component in rel.components() {
        current.push(component);
        let meta = std::fs::symlink_metadata(&current)?;
        if !meta.file_type().is_dir() {
            return Err(not_a_directory(&current));
        }
    }
    Ok(())
}

fn relative_to_home<'a>(user: &UserIdentity, path: &'a Path) -> Result<&'a Path> {
    path.strip_prefix(&user.home).map_err(|_| {
        BackupError::PermissionDenied(format!("{} is outside the home of {}", path.display(), user.name))
    })
}

fn not_a_directory(path: &Path) -> BackupError {
    BackupError::PermissionDenied(format!("{} is not a directory (symlinks are refused)", path.display()))
}

#[cfg(unix)]
fn refused_or_io(path: &Path, e: std::io::Error) -> BackupError {
    match e.raw_os_error() {
        Some(code) if code == nix::libc::ELOOP || code == nix::libc::ENOTDIR => {
            BackupError::PermissionDenied(format!("refusing to follow symlink at {}", path.display()))
        }
        _ => e.into(),
    }
}

/// Free bytes available to unprivileged users on the filesystem holding `path`.
#[cfg(unix)]
pub fn available_bytes(path: &Path) -> Result<u64> {
    let stats = nix::sys::statvfs::statvfs(path)
        .map_err(|e| BackupError::execution(format!("failed to check free space on {}: {e}", path.display())))?;
    Ok((stats.blocks_available() as u64).saturating_mul(stats.fragment_size() as u64))
}

#[cfg(not(unix))]
pub fn ensure_user_dir(user: &UserIdentity, _path: &Path) -> Result<()> {
    Err(unsupported(&user.name))
}

#[cfg(not(unix))]
pub fn write_user_file(user: &UserIdentity, _path: &Path, _contents: &[u8]) -> Result<()> {
    Err(unsupported(&user.name))
}

#[cfg(not(unix))]
pub fn open_no_follow(path: &Path) -> Result<std::fs::File> {
    Ok(std::fs::File::open(path)?)
}

#[cfg(not(unix))]
pub fn create_private_file(path: &Path) -> Result<std::fs::File> {
    Ok(std::fs::OpenOptions::new().write(true).create_new(true).open(path)?)
}

#[cfg(not(unix))]
pub fn chown_to(user: &UserIdentity, _path: &Path) -> Result<()> {
    Err(unsupported(&user.name))
}

#[cfg(not(unix))]
pub fn available_bytes(path: &Path) -> Result<u64> {
    Err(BackupError::PermissionDenied(format!(
        "cannot check free space on {}: requires a POSIX host",
        path.display()
    )))
}

#[cfg(not(unix))]
fn unsupported(username: &str) -> BackupError {
    BackupError::PermissionDenied(format!("cannot manage files for {username}: requires a POSIX host"))
}

/// Deletes leftover `*.sql.gz` dumps. Symlinks and directories are left
/// alone, and a `dir` that is itself a symlink is refused.
pub fn clean_stale_dumps(dir: &Path) -> Result<usize> {
    match std::fs::symlink_metadata(dir) {
        Ok(meta) if !meta.file_type().is_dir() => return Err(not_a_directory(dir)),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    }
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if entry.file_name().to_string_lossy().ends_with(".sql.gz") {
            std::fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Best-effort removal of a scratch directory.
pub fn remove_scratch(path: &Path) {
    match std::fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove scratch directory"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::current_identity;

    #[test]
    fn test_layout() {
        let home = Path::new("/home/alice");
        assert_eq!(dump_dir(home), Path::new("/home/alice/.fastcp/backups/mysql-dumps"));
        assert_eq!(manifest_path(home), Path::new("/home/alice/.fastcp/backups/manifest.json"));
        assert_eq!(restore_dir(home, "j1"), Path::new("/home/alice/.fastcp/backups/restore/j1"));
        assert_eq!(site_root("/home/alice/apps/a.com/public/"), Some(PathBuf::from("/home/alice/apps/a.com")));
        assert_eq!(site_root("/public"), None);
        assert_eq!(site_root(""), None);
    }

    #[test]
    fn test_ensure_user_dir_creates_private_tree() {
        use std::os::unix::fs::PermissionsExt;

        let home = tempfile::tempdir().unwrap();
        let user = current_identity(home.path());
        let dir = dump_dir(home.path());

        ensure_user_dir(&user, &dir).unwrap();
        let mode = std::fs::metadata(&dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
        // Idempotent.
        ensure_user_dir(&user, &dir).unwrap();

        let outside = tempfile::tempdir().unwrap();
        let err = ensure_user_dir(&user, outside.path()).unwrap_err();
        assert!(matches!(err, BackupError::PermissionDenied(_)));
    }

    #[test]
    fn test_write_user_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let home = tempfile::tempdir().unwrap();
        let user = current_identity(home.path());
        let path = home.path().join("manifest.json");
        write_user_file(&user, &path, b"{}").unwrap();
        write_user_file(&user, &path, b"[]").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[]");
        assert_eq!(std::fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn test_write_user_file_refuses_planted_symlink() {
        let home = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let user = current_identity(home.path());
        let victim = outside.path().join("shadow");
        std::fs::write(&victim, "ROOT OWNED").unwrap();

        let path = home.path().join("manifest.json");
        std::os::unix::fs::symlink(&victim, &path).unwrap();
        let err = write_user_file(&user, &path, b"{}").unwrap_err();
        assert!(matches!(err, BackupError::PermissionDenied(_)), "{err}");
        assert_eq!(std::fs::read_to_string(&victim).unwrap(), "ROOT OWNED");

        // A symlinked parent directory is refused as well.
        std::fs::create_dir(home.path().join(".fastcp")).unwrap();
        std::os::unix::fs::symlink(outside.path(), home.path().join(".fastcp/backups")).unwrap();
        let err = write_user_file(&user, &manifest_path(home.path()), b"{}").unwrap_err();
        assert!(matches!(err, BackupError::PermissionDenied(_)), "{err}");
        assert!(!outside.path().join("manifest.json").exists());
    }

    #[test]
    fn test_write_user_file_refuses_hard_link() {
        let home = tempfile::tempdir().unwrap();
        let user = current_identity(home.path());
        let original = home.path().join("original");
        std::fs::write(&original, "keep").unwrap();
        let path = home.path().join("manifest.json");
        std::fs::hard_link(&original, &path).unwrap();

        assert!(write_user_file(&user, &path, b"{}").is_err());
        assert_eq!(std::fs::read_to_string(&original).unwrap(), "keep");
    }

    #[test]
    fn test_ensure_user_dir_refuses_symlinked_component() {
        let home = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let user = current_identity(home.path());
        std::os::unix::fs::symlink(outside.path(), home.path().join(".fastcp")).unwrap();

        let err = ensure_user_dir(&user, &dump_dir(home.path())).unwrap_err();
        assert!(matches!(err, BackupError::PermissionDenied(_)), "{err}");
        assert!(!outside.path().join("backups").exists());
    }

    #[test]
    fn test_open_no_follow_refuses_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("real");
        std::fs::write(&target, "x").unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        assert!(open_no_follow(&target).is_ok());
        assert!(matches!(open_no_follow(&link).unwrap_err(), BackupError::PermissionDenied(_)));
        assert!(create_private_file(&link).is_err());
    }

    #[test]
    fn test_clean_stale_dumps_skips_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let victim = outside.path().join("victim.sql.gz");
        std::fs::write(&victim, b"keep").unwrap();

        std::fs::write(dir.path().join("shop.sql.gz"), b"old").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"keep").unwrap();
        std::os::unix::fs::symlink(&victim, dir.path().join("link.sql.gz")).unwrap();

        assert_eq!(clean_stale_dumps(dir.path()).unwrap(), 1);
        assert!(!dir.path().join("shop.sql.gz").exists());
        assert!(dir.path().join("notes.txt").exists());
        assert!(victim.exists());

        assert_eq!(clean_stale_dumps(&dir.path().join("missing")).unwrap(), 0);

        let linked = dir.path().join("linked-dumps");
        std::os::unix::fs::symlink(outside.path(), &linked).unwrap();
        assert!(clean_stale_dumps(&linked).is_err());
        assert!(victim.exists());
    }

    #[test]
    fn test_available_bytes_reports_space() {
        let dir = tempfile::tempdir().unwrap();
        assert!(available_bytes(dir.path()).unwrap() > 0);
    }
}
