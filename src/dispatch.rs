use crate::db;
use crate::history;
use crate::paths::AppPaths;
use crate::reconcile::DownloadTask;
use crate::{EngineError, Result};
use rusqlite::Connection;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36";
const HTTP_TIMEOUT_SECS: u64 = 25;
const TEMP_SUFFIX: &str = ".download";

/// Per-task result; a batch returns one of these per task so a single
/// failure never hides its siblings.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitOutcome {
    pub url: String,
    pub filename: String,
    pub ok: bool,
    pub error: Option<String>,
}

/// Seam between task building and actual transfer. The HTTP implementation
/// below is the default; tests substitute recorders.
pub trait TaskDispatcher {
    fn submit(&mut self, task: &DownloadTask) -> SubmitOutcome;

    fn submit_batch(&mut self, tasks: &[DownloadTask]) -> Vec<SubmitOutcome> {
        tasks.iter().map(|task| self.submit(task)).collect()
    }
}

/// Streams each task's URL to the download directory and records the
/// attempt in the local database.
pub struct HttpDispatcher {
    agent: ureq::Agent,
    conn: Connection,
    download_dir: PathBuf,
}

impl HttpDispatcher {
    pub fn new(paths: &AppPaths) -> Result<Self> {
        let conn = db::open(paths)?;
        db::migrate(&conn)?;
        let download_dir = paths.effective_download_dir()?;
        std::fs::create_dir_all(&download_dir)?;

        let mut config = ureq::Agent::config_builder();
        config = config
            .http_status_as_error(false)
            .timeout_global(Some(Duration::from_secs(HTTP_TIMEOUT_SECS)))
            .user_agent(DEFAULT_USER_AGENT);
        let agent: ureq::Agent = config.build().into();

        Ok(Self {
            agent,
            conn,
            download_dir,
        })
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    fn fetch_to_file(&self, task: &DownloadTask) -> Result<(i64, String)> {
        let mut response = self
            .agent
            .get(&task.url)
            .call()
            .map_err(|e| EngineError::DownloadFailed {
                url: task.url.clone(),
                status: None,
                detail: e.to_string(),
            })?;

        let status = response.status().as_u16();
        if status >= 400 {
            return Err(EngineError::DownloadFailed {
                url: task.url.clone(),
                status: Some(status),
                detail: format!("http status {status}"),
            });
        }

        let expected_len: Option<u64> = response
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());

        let final_path = self.download_dir.join(&task.filename);
        let temp_path = self
            .download_dir
            .join(format!("{}{TEMP_SUFFIX}", task.filename));

        let written = {
            let mut file = std::io::BufWriter::new(std::fs::File::create(&temp_path)?);
            let mut reader = response.body_mut().as_reader();
            let mut hasher = Sha256::new();
            let mut buf = [0_u8; 64 * 1024];
            let mut total: u64 = 0;
            loop {
                let n = match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        drop(file);
                        let _ = std::fs::remove_file(&temp_path);
                        return Err(e.into());
                    }
                };
                hasher.update(&buf[..n]);
                file.write_all(&buf[..n])?;
                total += n as u64;
            }
            file.flush()?;
            (total, hex::encode(hasher.finalize()))
        };
        let (total, digest) = written;

        if let Some(expected) = expected_len {
            if expected != total {
                let _ = std::fs::remove_file(&temp_path);
                return Err(EngineError::SizeMismatch {
                    path: temp_path.display().to_string(),
                    expected,
                    actual: total,
                });
            }
        }

        std::fs::rename(&temp_path, &final_path)?;
        Ok((total as i64, digest))
    }
}

impl TaskDispatcher for HttpDispatcher {
    fn submit(&mut self, task: &DownloadTask) -> SubmitOutcome {
        let record_id = match history::record_queued(
            &self.conn,
            task.post_id.as_deref(),
            &task.url,
            &task.filename,
        ) {
            Ok(id) => id,
            Err(e) => {
                return SubmitOutcome {
                    url: task.url.clone(),
                    filename: task.filename.clone(),
                    ok: false,
                    error: Some(e.to_string()),
                }
            }
        };

        match self.fetch_to_file(task) {
            Ok((byte_count, sha256)) => {
                let outcome = history::mark_complete(
                    &self.conn,
                    &record_id,
                    task.post_id.as_deref(),
                    task.screen_name.as_deref(),
                    task.text.as_deref(),
                    byte_count,
                    &sha256,
                );
                match outcome {
                    Ok(()) => SubmitOutcome {
                        url: task.url.clone(),
                        filename: task.filename.clone(),
                        ok: true,
                        error: None,
                    },
                    Err(e) => SubmitOutcome {
                        url: task.url.clone(),
                        filename: task.filename.clone(),
                        ok: false,
                        error: Some(e.to_string()),
                    },
                }
            }
            Err(e) => {
                let detail = e.to_string();
                let _ = history::mark_interrupted(&self.conn, &record_id, &detail);
                SubmitOutcome {
                    url: task.url.clone(),
                    filename: task.filename.clone(),
                    ok: false,
                    error: Some(detail),
                }
            }
        }
    }
}
