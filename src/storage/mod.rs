//! Review history persistence — the save hook collaborator.
//!
//! The pipeline itself never touches storage; the gateway calls
//! [`ReviewStore::save`] once per finished report for authenticated
//! callers. The schema stays private to the SQLite adapter: the
//! report travels as one JSON blob plus a few query columns.

use crate::review::types::{CodeSubmission, ReviewReport};
use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

/// A saved review, id plus the full report.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoredReview {
    pub id: i64,
    pub filename: String,
    pub language: String,
    pub created_at: String,
    pub report: ReviewReport,
}

/// Row shape for history listings (no report body).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReviewSummaryRow {
    pub id: i64,
    pub filename: String,
    pub language: String,
    pub score: u8,
    pub grade: String,
    pub created_at: String,
}

pub trait ReviewStore: Send + Sync {
    fn name(&self) -> &str;

    /// Persist a finished report keyed by caller identity. Returns the
    /// storage id, or `None` when this store does not persist.
    fn save(
        &self,
        caller_id: &str,
        submission: &CodeSubmission,
        report: &ReviewReport,
    ) -> Result<Option<i64>>;

    fn list(&self, caller_id: &str, limit: usize) -> Result<Vec<ReviewSummaryRow>>;

    fn get(&self, caller_id: &str, id: i64) -> Result<Option<StoredReview>>;
}

/// Build the configured store.
pub fn create_store(config: &crate::config::StorageConfig) -> Result<Arc<dyn ReviewStore>> {
    if config.enabled {
        Ok(Arc::new(SqliteReviewStore::open(&config.path)?))
    } else {
        Ok(Arc::new(NoopStore))
    }
}

// ── No-op store ──────────────────────────────────────────────────

/// Used when persistence is disabled; saves vanish.
pub struct NoopStore;

impl ReviewStore for NoopStore {
    fn name(&self) -> &str {
        "noop"
    }

    fn save(&self, _: &str, _: &CodeSubmission, _: &ReviewReport) -> Result<Option<i64>> {
        Ok(None)
    }

    fn list(&self, _: &str, _: usize) -> Result<Vec<ReviewSummaryRow>> {
        Ok(Vec::new())
    }

    fn get(&self, _: &str, _: i64) -> Result<Option<StoredReview>> {
        Ok(None)
    }
}

// ── SQLite store ─────────────────────────────────────────────────

/// Single-file history store. One connection behind a mutex is enough
/// for this write path; every operation is a short transaction.
pub struct SqliteReviewStore {
    conn: Mutex<Connection>,
}

impl SqliteReviewStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening review store {}", path.display()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS reviews (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                caller_id   TEXT NOT NULL,
                filename    TEXT NOT NULL,
                language    TEXT NOT NULL,
                score       INTEGER NOT NULL,
                grade       TEXT NOT NULL,
                report_json TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_reviews_caller ON reviews(caller_id, id DESC);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl ReviewStore for SqliteReviewStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn save(
        &self,
        caller_id: &str,
        submission: &CodeSubmission,
        report: &ReviewReport,
    ) -> Result<Option<i64>> {
        let report_json = serde_json::to_string(report)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO reviews (caller_id, filename, language, score, grade, report_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                caller_id,
                submission.filename,
                submission.language,
                i64::from(report.score),
                report.grade,
                report_json,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(Some(conn.last_insert_rowid()))
    }

    fn list(&self, caller_id: &str, limit: usize) -> Result<Vec<ReviewSummaryRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, filename, language, score, grade, created_at
             FROM reviews WHERE caller_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![caller_id, limit as i64], |row| {
                Ok(ReviewSummaryRow {
                    id: row.get(0)?,
                    filename: row.get(1)?,
                    language: row.get(2)?,
                    score: row.get::<_, i64>(3)?.clamp(0, 100) as u8,
                    grade: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn get(&self, caller_id: &str, id: i64) -> Result<Option<StoredReview>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, filename, language, report_json, created_at
                 FROM reviews WHERE caller_id = ?1 AND id = ?2",
                params![caller_id, id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((id, filename, language, report_json, created_at)) => {
                let report: ReviewReport = serde_json::from_str(&report_json)
                    .context("stored report no longer parses")?;
                Ok(Some(StoredReview {
                    id,
                    filename,
                    language,
                    created_at,
                    report,
                }))
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
