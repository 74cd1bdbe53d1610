//! Append-only JSONL journal of finished transfers.
//!
//! Audit trail only: nothing reads it back to rebuild transfer state.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::session::{TransferRequest, TransferStatus};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransferLogEntry {
    pub timestamp: String,
    pub request_id: Uuid,
    pub agent_id: String,
    pub file_name: String,
    pub file_path: Option<PathBuf>,
    pub status: TransferStatus,
    pub bytes_received: u64,
    pub error: Option<String>,
}

impl From<&TransferRequest> for TransferLogEntry {
    fn from(req: &TransferRequest) -> Self {
        TransferLogEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            request_id: req.request_id,
            agent_id: req.agent_id.clone(),
            file_name: req.file_name.clone(),
            file_path: req.file_path.clone(),
            status: req.status,
            bytes_received: req.bytes_received,
            error: req.error.clone(),
        }
    }
}

#[derive(Debug)]
pub struct TransferLog {
    log_file_path: PathBuf,
}

impl TransferLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        TransferLog {
            log_file_path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.log_file_path
    }

    pub fn add_entry(&self, entry: &TransferLogEntry) -> Result<()> {
        if let Some(parent) = self.log_file_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .context("Failed to open transfer journal")?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_log(&self) -> Result<Vec<TransferLogEntry>> {
        if !self.log_file_path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.log_file_path)
            .context("Failed to open transfer journal for reading")?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }
}
