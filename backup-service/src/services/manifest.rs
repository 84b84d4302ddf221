//! The manifest stored inside every snapshot.
//!
//! It maps site domains and database names to the paths they were backed
//! up from, so a restore can ask restic for exactly one path instead of
//! walking the whole snapshot tree.

use crate::error::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path};

pub const MANIFEST_VERSION: u32 = 1;

/// Where the manifest lives relative to the user's home, and therefore the
/// suffix used to find it inside a snapshot.
pub const MANIFEST_SUFFIX: &str = ".fastcp/backups/manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSite {
    pub domain: String,
    pub root_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestDatabase {
    pub db_name: String,
    pub dump_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub created_at: String,
    pub username: String,
    #[serde(default)]
    pub sites: Vec<ManifestSite>,
    #[serde(default)]
    pub databases: Vec<ManifestDatabase>,
}

impl Manifest {
    pub fn new(username: &str, created_at: String) -> Self {
        Self {
            version: MANIFEST_VERSION,
            created_at,
            username: username.to_string(),
            sites: Vec::new(),
            databases: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| BackupError::Internal(anyhow::anyhow!("failed to encode manifest: {e}")))
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let manifest: Manifest = serde_json::from_str(raw.trim())
            .map_err(|e| BackupError::execution(format!("invalid snapshot manifest: {e}")))?;
        if manifest.version != MANIFEST_VERSION {
            return Err(BackupError::execution(format!(
                "unsupported snapshot manifest version: {}",
                manifest.version
            )));
        }
        Ok(manifest)
    }

    /// Root path of the site with `domain` (case-insensitive).
    pub fn find_site_path(&self, domain: &str) -> Result<&str> {
        let wanted = domain.trim().to_lowercase();
        if wanted.is_empty() {
            return Err(BackupError::config("site domain is required"));
        }
        let matches: Vec<&ManifestSite> = self
            .sites
            .iter()
            .filter(|s| s.domain.trim().to_lowercase() == wanted)
            .collect();
        match matches.as_slice() {
            [] => Err(BackupError::execution(format!("site {domain} is not present in this snapshot"))),
            [one] if !normalize_path_for_match(&one.root_path).is_empty() => Ok(one.root_path.trim()),
            [_] => Err(BackupError::execution(format!("snapshot manifest has no path for site {domain}"))),
            _ => Err(BackupError::execution(format!(
                "snapshot manifest lists site {domain} more than once"
            ))),
        }
    }

    /// Dump path of the database named `db_name`.
    pub fn find_database_dump_path(&self, db_name: &str) -> Result<&str> {
        let wanted = db_name.trim();
        if wanted.is_empty() {
            return Err(BackupError::config("database name is required"));
        }
        let matches: Vec<&ManifestDatabase> =
            self.databases.iter().filter(|d| d.db_name.trim().eq_ignore_ascii_case(wanted)).collect();
        match matches.as_slice() {
            [] => Err(BackupError::execution(format!(
                "database {db_name} is not present in this snapshot"
            ))),
            [one] if !normalize_path_for_match(&one.dump_path).is_empty() => Ok(one.dump_path.trim()),
            [_] => Err(BackupError::execution(format!(
                "snapshot manifest has no dump path for database {db_name}"
            ))),
            _ => Err(BackupError::execution(format!(
                "snapshot manifest lists database {db_name} more than once"
            ))),
        }
    }
}

/// Canonical form for comparing snapshot paths: cleaned, `/`-rooted,
/// no trailing slash. The root itself and empty input become `""`.
pub fn normalize_path_for_match(raw: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in Path::new(raw.trim()).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().unwrap_or_default()),
            Component::ParentDir => {
                parts.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    if parts.is_empty() {
        return String::new();
    }
    format!("/{}", parts.join("/"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Dir,
}

#[derive(Deserialize)]
struct LsNode {
    #[serde(default)]
    struct_type: String,
    #[serde(default, rename = "type")]
    node_type: String,
    #[serde(default)]
    path: String,
}

/// Finds the single node in `restic ls --json` output whose path equals or
/// ends with `suffix` (whole components only). Zero or several matches is
/// an error, never a guess.
pub fn resolve_path_by_suffix(ls_output: &str, suffix: &str, kind: NodeKind) -> Result<String> {
    let wanted = normalize_path_for_match(suffix);
    if wanted.is_empty() {
        return Err(BackupError::config("path suffix is required"));
    }
    let node_type = match kind {
        NodeKind::File => "file",
        NodeKind::Dir => "dir",
    };

    let mut found: Vec<String> = Vec::new();
    for line in ls_output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Ok(node) = serde_json::from_str::<LsNode>(line) else {
            continue;
        };
        if node.struct_type != "node" || node.node_type != node_type {
            continue;
        }
        let path = normalize_path_for_match(&node.path);
        // `wanted` is `/`-rooted, so this only matches on a component boundary.
        if path.ends_with(&wanted) && !found.contains(&path) {
            found.push(path);
        }
    }

    match found.len() {
        0 => Err(BackupError::execution(format!("path {wanted} not found in snapshot"))),
        1 => Ok(found.remove(0)),
        n => Err(BackupError::execution(format!(
            "path {wanted} is ambiguous in snapshot ({n} matches)"
        ))),
    }
}
