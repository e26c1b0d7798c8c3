use crate::db::OptionalRowExt;
use crate::{EngineError, Result};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Queued,
    Complete,
    Interrupted,
}

impl DownloadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadStatus::Queued => "queued",
            DownloadStatus::Complete => "complete",
            DownloadStatus::Interrupted => "interrupted",
        }
    }

    pub fn from_str(value: &str) -> Result<Self> {
        match value {
            "queued" => Ok(DownloadStatus::Queued),
            "complete" => Ok(DownloadStatus::Complete),
            "interrupted" => Ok(DownloadStatus::Interrupted),
            other => Err(EngineError::InvalidInput(format!(
                "unknown download status: {other}"
            ))),
        }
    }
}

/// One row per attempted file transfer.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadRecordRow {
    pub id: String,
    pub post_id: Option<String>,
    pub url: String,
    pub filename: String,
    pub status: DownloadStatus,
    pub byte_count: Option<i64>,
    pub sha256: Option<String>,
    pub error: Option<String>,
    pub created_at_ms: i64,
    pub completed_at_ms: Option<i64>,
}

/// One row per post that ever completed at least one download.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryRow {
    pub post_id: String,
    pub screen_name: Option<String>,
    pub text: Option<String>,
    pub first_downloaded_at_ms: i64,
}

/// Inserts a `queued` record and returns its id.
pub fn record_queued(
    conn: &Connection,
    post_id: Option<&str>,
    url: &str,
    filename: &str,
) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO download_record(id, post_id, url, filename, status, created_at_ms)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
            id,
            post_id,
            url,
            filename,
            DownloadStatus::Queued.as_str(),
            now_ms()
        ],
    )?;
    Ok(id)
}

/// Marks a record complete and upserts the per-post history row.
///
/// The history timestamp keeps its original value on repeat downloads of
/// the same post.
pub fn mark_complete(
    conn: &Connection,
    record_id: &str,
    post_id: Option<&str>,
    screen_name: Option<&str>,
    text: Option<&str>,
    byte_count: i64,
    sha256: &str,
) -> Result<()> {
    let now = now_ms();
    conn.execute(
        "UPDATE download_record
         SET status=?, byte_count=?, sha256=?, completed_at_ms=?
         WHERE id=?",
        params![
            DownloadStatus::Complete.as_str(),
            byte_count,
            sha256,
            now,
            record_id
        ],
    )?;
    if let Some(post_id) = post_id.filter(|p| !p.is_empty()) {
        conn.execute(
            "INSERT INTO download_history(post_id, screen_name, text, first_downloaded_at_ms)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(post_id) DO UPDATE SET
               screen_name=COALESCE(excluded.screen_name, screen_name),
               text=COALESCE(excluded.text, text)",
            params![post_id, screen_name, text, now],
        )?;
    }
    Ok(())
}

pub fn mark_interrupted(conn: &Connection, record_id: &str, error: &str) -> Result<()> {
    conn.execute(
        "UPDATE download_record SET status=?, error=?, completed_at_ms=? WHERE id=?",
        params![
            DownloadStatus::Interrupted.as_str(),
            error,
            now_ms(),
            record_id
        ],
    )?;
    Ok(())
}

/// Whether the post has a completed download on record.
pub fn exists(conn: &Connection, post_id: &str) -> Result<bool> {
    let row: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM download_history WHERE post_id=?",
            [post_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(row.is_some())
}

/// Batch membership probe for a page worth of post ids.
pub fn exists_batch(conn: &Connection, post_ids: &[String]) -> Result<HashSet<String>> {
    let mut found = HashSet::new();
    let mut stmt = conn.prepare("SELECT 1 FROM download_history WHERE post_id=?")?;
    for post_id in post_ids {
        let row: Option<i64> = stmt.query_row([post_id], |row| row.get(0)).optional()?;
        if row.is_some() {
            found.insert(post_id.clone());
        }
    }
    Ok(found)
}

pub fn list_records(conn: &Connection, limit: u32) -> Result<Vec<DownloadRecordRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, post_id, url, filename, status, byte_count, sha256, error,
                created_at_ms, completed_at_ms
         FROM download_record
         ORDER BY created_at_ms DESC
         LIMIT ?",
    )?;
    let mut rows = stmt.query([limit])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let status_raw: String = row.get(4)?;
        out.push(DownloadRecordRow {
            id: row.get(0)?,
            post_id: row.get(1)?,
            url: row.get(2)?,
            filename: row.get(3)?,
            status: DownloadStatus::from_str(&status_raw)?,
            byte_count: row.get(5)?,
            sha256: row.get(6)?,
            error: row.get(7)?,
            created_at_ms: row.get(8)?,
            completed_at_ms: row.get(9)?,
        });
    }
    Ok(out)
}

pub fn history_rows(conn: &Connection, limit: u32) -> Result<Vec<HistoryRow>> {
    let mut stmt = conn.prepare(
        "SELECT post_id, screen_name, text, first_downloaded_at_ms
         FROM download_history
         ORDER BY first_downloaded_at_ms DESC
         LIMIT ?",
    )?;
    let mut rows = stmt.query([limit])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(HistoryRow {
            post_id: row.get(0)?,
            screen_name: row.get(1)?,
            text: row.get(2)?,
            first_downloaded_at_ms: row.get(3)?,
        });
    }
    Ok(out)
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
