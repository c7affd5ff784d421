//! Migration runner.
//!
//! Migrations are plain `*.sql` files applied in lexicographic order. The
//! `_migrations` table records version, checksum, and apply time; re-running
//! an applied set is a no-op, and a changed checksum of an applied file is
//! refused outright.

use std::path::{Path, PathBuf};

use futures_util::FutureExt;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPool;
use sqlx::Row;
use tracing::info;

use crate::error::{DbError, Result};

const MIGRATIONS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS _migrations (
    version TEXT PRIMARY KEY,
    checksum TEXT NOT NULL,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
)"#;

/// One discovered migration file.
#[derive(Debug, Clone)]
pub struct MigrationFile {
    /// File stem, used as the version key.
    pub version: String,
    pub path: PathBuf,
    pub checksum: String,
    pub sql: String,
}

/// Status entry for reporting.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MigrationStatus {
    pub version: String,
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<String>,
}

/// Result of an apply run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MigrationReport {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
}

/// Discover migration files under `dir`, sorted lexicographically.
pub fn discover(dir: &Path) -> Result<Vec<MigrationFile>> {
    if !dir.is_dir() {
        return Err(DbError::invalid(format!(
            "migrations directory does not exist: {}",
            dir.display()
        )));
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("sql") {
            continue;
        }
        let version = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| DbError::invalid(format!("unreadable file name: {}", path.display())))?
            .to_string();
        let sql = std::fs::read_to_string(&path)?;
        let checksum = checksum_of(&sql);
        files.push(MigrationFile {
            version,
            path,
            checksum,
            sql,
        });
    }

    files.sort_by(|a, b| a.version.cmp(&b.version));
    Ok(files)
}

/// Checksum used to detect drift in applied files.
pub fn checksum_of(sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql.as_bytes());
    hex::encode(hasher.finalize())
}

async fn ensure_table(pool: &PgPool) -> Result<()> {
    sqlx::query(MIGRATIONS_TABLE_DDL).execute(pool).await?;
    Ok(())
}

async fn applied_checksums(pool: &PgPool) -> Result<Vec<(String, String)>> {
    let rows = sqlx::query("SELECT version, checksum FROM _migrations ORDER BY version")
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .map(|row| (row.get::<String, _>(0), row.get::<String, _>(1)))
        .collect())
}

/// Apply all pending migrations from `dir`. Applying the same set twice is a
/// no-op; a checksum mismatch on an applied version aborts before anything
/// runs.
pub async fn apply(pool: &PgPool, dir: &Path) -> Result<MigrationReport> {
    let files = discover(dir)?;
    ensure_table(pool).await?;
    let applied = applied_checksums(pool).await?;

    // Verify every applied file first so drift fails the run atomically.
    for file in &files {
        if let Some((_, recorded)) = applied.iter().find(|(v, _)| v == &file.version) {
            if recorded != &file.checksum {
                return Err(DbError::precondition(format!(
                    "migration {} was modified after being applied (checksum {} != {})",
                    file.version, file.checksum, recorded
                )));
            }
        }
    }

    let mut report = MigrationReport {
        applied: Vec::new(),
        skipped: Vec::new(),
    };

    for file in &files {
        if applied.iter().any(|(v, _)| v == &file.version) {
            report.skipped.push(file.version.clone());
            continue;
        }

        let mut tx = pool.begin().await?;
        sqlx::raw_sql(&file.sql).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO _migrations (version, checksum) VALUES ($1, $2)")
            .bind(&file.version)
            .bind(&file.checksum)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!("applied migration {}", file.version);
        report.applied.push(file.version.clone());
    }

    Ok(report)
}

/// Report applied/pending state without applying anything.
pub async fn status(pool: &PgPool, dir: &Path) -> Result<Vec<MigrationStatus>> {
    let files = discover(dir)?;
    ensure_table(pool).await?;

    let rows = sqlx::query("SELECT version, applied_at::text FROM _migrations")
        .fetch_all(pool)
        .await?;
    let applied: Vec<(String, String)> = rows
        .iter()
        .map(|row| (row.get::<String, _>(0), row.get::<String, _>(1)))
        .collect();

    Ok(files
        .iter()
        .map(|file| {
            let found = applied.iter().find(|(v, _)| v == &file.version);
            MigrationStatus {
                version: file.version.clone(),
                applied: found.is_some(),
                applied_at: found.map(|(_, at)| at.clone()),
            }
        })
        .collect())
}
