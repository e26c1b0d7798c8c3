use crate::paths::AppPaths;
use crate::Result;
use rusqlite::{Connection, OpenFlags};
use std::time::Duration;

pub fn open(paths: &AppPaths) -> Result<Connection> {
    paths.ensure_dirs()?;

    let db_path = paths.db_dir().join("app.sqlite");
    let conn = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
    )?;

    conn.busy_timeout(Duration::from_secs(10))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    Ok(conn)
}

pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS meta (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS download_history (
  post_id TEXT PRIMARY KEY,
  screen_name TEXT,
  text TEXT,
  first_downloaded_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS download_record (
  id TEXT PRIMARY KEY,
  post_id TEXT,
  url TEXT NOT NULL,
  filename TEXT NOT NULL,
  status TEXT NOT NULL,
  byte_count INTEGER,
  sha256 TEXT,
  error TEXT,
  created_at_ms INTEGER NOT NULL,
  completed_at_ms INTEGER
);

CREATE INDEX IF NOT EXISTS idx_download_record_post ON download_record(post_id, created_at_ms);
CREATE INDEX IF NOT EXISTS idx_download_record_created ON download_record(created_at_ms);
"#,
    )?;

    // Backfill older installs that created `download_record` without `sha256`.
    let has_sha256 = {
        let mut stmt = conn.prepare("PRAGMA table_info(download_record)")?;
        let mut rows = stmt.query([])?;
        let mut found = false;
        while let Some(row) = rows.next()? {
            let name: String = row.get(1)?;
            if name == "sha256" {
                found = true;
                break;
            }
        }
        found
    };
    if !has_sha256 {
        conn.execute("ALTER TABLE download_record ADD COLUMN sha256 TEXT", [])?;
    }

    let current_schema_version = 2;
    let existing: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key='schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        Some(v) if v == current_schema_version.to_string() => {}
        _ => {
            conn.execute(
                "INSERT INTO meta(key, value) VALUES('schema_version', ?)
                 ON CONFLICT(key) DO UPDATE SET value=excluded.value",
                [current_schema_version.to_string()],
            )?;
        }
    }

    Ok(())
}

pub fn ensure_schema(paths: &AppPaths) -> Result<()> {
    let conn = open(paths)?;
    migrate(&conn)?;
    Ok(())
}

pub(crate) trait OptionalRowExt<T> {
    fn optional(self) -> rusqlite::Result<Option<T>>;
}

impl<T> OptionalRowExt<T> for rusqlite::Result<T> {
    fn optional(self) -> rusqlite::Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::AppPaths;

    #[test]
    fn migrate_adds_sha256_for_legacy_record_table() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        paths.ensure_dirs().expect("ensure dirs");
        let db_path = paths.db_dir().join("app.sqlite");

        {
            let conn = Connection::open(&db_path).expect("open");
            conn.execute_batch(
                r#"
CREATE TABLE IF NOT EXISTS download_record (
  id TEXT PRIMARY KEY,
  post_id TEXT,
  url TEXT NOT NULL,
  filename TEXT NOT NULL,
  status TEXT NOT NULL,
  byte_count INTEGER,
  error TEXT,
  created_at_ms INTEGER NOT NULL,
  completed_at_ms INTEGER
);
"#,
            )
            .expect("create legacy record table");
        }

        let conn = open(&paths).expect("open migrated");
        migrate(&conn).expect("migrate");

        let mut stmt = conn
            .prepare("PRAGMA table_info(download_record)")
            .expect("table_info");
        let mut rows = stmt.query([]).expect("query table_info");
        let mut has_sha256 = false;
        while let Some(row) = rows.next().expect("next row") {
            let name: String = row.get(1).expect("name");
            if name == "sha256" {
                has_sha256 = true;
                break;
            }
        }
        assert!(has_sha256, "sha256 column should exist after migrate");
    }
}
