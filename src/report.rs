use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::enrich::BatchSummary;
use crate::errors::AppResult;

const EVENT_NAME: &str = "geocode_run";

/// Appends one JSON line per run so schedulers can track failures over time.
#[derive(Debug, Clone)]
pub struct RunReport {
    path: PathBuf,
}

impl RunReport {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, backend: &str, summary: &BatchSummary) -> AppResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let event = RunEvent {
            name: EVENT_NAME,
            timestamp: Utc::now(),
            backend,
            payload: summary,
        };
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }
}

#[derive(Serialize)]
struct RunEvent<'a> {
    name: &'static str,
    timestamp: DateTime<Utc>,
    backend: &'a str,
    payload: &'a BatchSummary,
}
