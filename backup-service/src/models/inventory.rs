//! Read access to the panel's site and database inventory.
//!
//! Rows are owned by the site/database management handlers; this service
//! only reads them to decide what goes into a snapshot.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct SiteRecord {
    pub id: String,
    pub username: String,
    pub domain: String,
    pub document_root: String,
}

#[derive(Debug, Clone)]
pub struct DatabaseRecord {
    pub id: String,
    pub username: String,
    pub db_name: String,
    pub db_user: String,
    /// Ciphertext from the secret codec; empty when no credentials are stored.
    pub db_password_enc: String,
}

fn row_to_site(row: &Row) -> rusqlite::Result<SiteRecord> {
    Ok(SiteRecord {
        id: row.get("id")?,
        username: row.get("username")?,
        domain: row.get("domain")?,
        document_root: row.get("document_root")?,
    })
}

fn row_to_database(row: &Row) -> rusqlite::Result<DatabaseRecord> {
    Ok(DatabaseRecord {
        id: row.get("id")?,
        username: row.get("username")?,
        db_name: row.get("db_name")?,
        db_user: row.get("db_user")?,
        db_password_enc: row.get("db_password")?,
    })
}

pub fn sites_for_user(conn: &Connection, username: &str) -> anyhow::Result<Vec<SiteRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, username, domain, document_root FROM sites WHERE username = ? ORDER BY domain",
    )?;
    let rows = stmt.query_map(params![username], row_to_site)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn databases_for_user(conn: &Connection, username: &str) -> anyhow::Result<Vec<DatabaseRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, username, db_name, db_user, db_password FROM databases WHERE username = ? ORDER BY db_name",
    )?;
    let rows = stmt.query_map(params![username], row_to_database)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn find_site(conn: &Connection, id: &str) -> anyhow::Result<Option<SiteRecord>> {
    let site = conn
        .query_row(
            "SELECT id, username, domain, document_root FROM sites WHERE id = ?",
            params![id],
            row_to_site,
        )
        .optional()?;
    Ok(site)
}

pub fn find_database(conn: &Connection, id: &str) -> anyhow::Result<Option<DatabaseRecord>> {
    let db = conn
        .query_row(
            "SELECT id, username, db_name, db_user, db_password FROM databases WHERE id = ?",
            params![id],
            row_to_database,
        )
        .optional()?;
    Ok(db)
}

#[cfg(test)]
pub(crate) fn insert_site(conn: &Connection, id: &str, username: &str, domain: &str, document_root: &str) {
    conn.execute(
        "INSERT INTO sites (id, username, domain, document_root) VALUES (?1, ?2, ?3, ?4)",
        params![id, username, domain, document_root],
    )
    .unwrap();
}

#[cfg(test)]
pub(crate) fn insert_database(conn: &Connection, id: &str, username: &str, db_name: &str, db_user: &str, password_enc: &str) {
    conn.execute(
        "INSERT INTO databases (id, username, db_name, db_user, db_password) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id, username, db_name, db_user, password_enc],
    )
    .unwrap();
}
