//! Transfer Session Manager: owns every transfer request, issues
//! `download_request`s and reassembles incoming chunks on disk.
//!
//! Request state lives behind a single mutex that is never held across an
//! await. Each transfer's output file sits behind its own async mutex, so
//! disk I/O for one transfer never blocks another or a status read. Status
//! only ever moves forward:
//!
//! ```text
//! pending --(request sent)--> downloading --(complete)--> completed
//!                             downloading --(error | local I/O | conn lost)--> failed
//! ```
//!
//! Events arriving for a request that already reached a terminal state are
//! discarded. After a sink write the status is checked again, since the
//! request may have failed while the write was in flight.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::envelope::{decode_chunk, Envelope};
use crate::error::{Result, TransferError};
use crate::log::{TransferLog, TransferLogEntry};
use crate::protocol_core::{ensure_dir_exists, sink_file_name};
use crate::registry::ConnectionRegistry;

/// Chunk progress is logged every this many chunks.
const PROGRESS_EVERY: u64 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }

    pub fn can_advance_to(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        matches!(
            (self, next),
            (Pending, Downloading) | (Downloading, Completed) | (Downloading, Failed)
        )
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Downloading => "downloading",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub request_id: Uuid,
    pub agent_id: String,
    pub file_name: String,
    pub status: TransferStatus,
    pub bytes_received: u64,
    pub chunks_received: u64,
    pub total_chunks: Option<u64>,
    pub file_path: Option<PathBuf>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Serial of the connection the request went out on
    #[serde(skip)]
    connection: u64,
}

impl TransferRequest {
    fn new(request_id: Uuid, agent_id: &str, file_name: &str, connection: u64) -> Self {
        Self {
            request_id,
            agent_id: agent_id.to_string(),
            file_name: file_name.to_string(),
            status: TransferStatus::Pending,
            bytes_received: 0,
            chunks_received: 0,
            total_chunks: None,
            file_path: None,
            error: None,
            started_at: None,
            completed_at: None,
            connection,
        }
    }

    fn advance(&mut self, next: TransferStatus) -> bool {
        if !self.status.can_advance_to(next) {
            return false;
        }
        self.status = next;
        match next {
            TransferStatus::Downloading => self.started_at = Some(Utc::now()),
            TransferStatus::Completed | TransferStatus::Failed => {
                self.completed_at = Some(Utc::now())
            }
            TransferStatus::Pending => {}
        }
        true
    }

    fn fail(&mut self, msg: impl Into<String>) -> bool {
        let msg = msg.into();
        if !self.advance(TransferStatus::Failed) {
            return false;
        }
        error!(request_id = %self.request_id, agent = %self.agent_id, error = %msg, "transfer failed");
        self.error = Some(msg);
        true
    }
}

/// Output file of one transfer, created on first write.
struct Sink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl Sink {
    fn new(path: PathBuf) -> Self {
        Self { path, writer: None }
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.writer.is_none() {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = File::create(&self.path).await?;
            debug!(path = %self.path.display(), "sink opened");
            self.writer = Some(BufWriter::new(file));
        }
        if let Some(writer) = self.writer.as_mut() {
            writer.write_all(data).await?;
        }
        Ok(())
    }

    /// Flush and release the file. A sink that never saw a write produces
    /// an empty file.
    async fn finish(&mut self) -> Result<()> {
        if self.writer.is_none() {
            self.write(&[]).await?;
        }
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await?;
        }
        Ok(())
    }

    /// Flush whatever was written and release the file.
    async fn abandon(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await?;
        }
        Ok(())
    }
}

type SharedSink = Arc<tokio::sync::Mutex<Sink>>;

#[derive(Default)]
struct SessionState {
    transfers: HashMap<Uuid, TransferRequest>,
    sinks: HashMap<Uuid, SharedSink>,
    /// Connections already torn down; requests must not go out on them.
    closed: HashSet<u64>,
}

pub struct TransferSessionManager {
    registry: Arc<ConnectionRegistry>,
    download_dir: PathBuf,
    journal: Option<Arc<TransferLog>>,
    state: Mutex<SessionState>,
}

impl TransferSessionManager {
    /// Create a manager writing into `download_dir`, creating it if needed.
    pub fn new(registry: Arc<ConnectionRegistry>, download_dir: impl Into<PathBuf>) -> Result<Self> {
        let download_dir = download_dir.into();
        ensure_dir_exists(&download_dir)?;
        Ok(Self {
            registry,
            download_dir,
            journal: None,
            state: Mutex::new(SessionState::default()),
        })
    }

    pub fn with_journal(mut self, journal: TransferLog) -> Self {
        self.journal = Some(Arc::new(journal));
        self
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Ask `agent_id` for `file_name`. The returned id tracks the transfer.
    pub fn request(&self, agent_id: &str, file_name: &str) -> Result<Uuid> {
        let handle = self
            .registry
            .get(agent_id)
            .ok_or_else(|| TransferError::AgentNotConnected(agent_id.to_string()))?;

        let mut state = self.state.lock();
        // The connection may have been torn down since the registry lookup
        if state.closed.contains(&handle.serial()) {
            debug!(agent = agent_id, serial = handle.serial(), "connection already closed");
            return Err(TransferError::AgentNotConnected(agent_id.to_string()));
        }
        let mut request_id = Uuid::new_v4();
        while state.transfers.contains_key(&request_id) {
            request_id = Uuid::new_v4();
        }
        state.transfers.insert(
            request_id,
            TransferRequest::new(request_id, agent_id, file_name, handle.serial()),
        );

        let msg = Envelope::DownloadRequest {
            request_id,
            file_name: file_name.to_string(),
        };
        if let Err(e) = handle.send(msg) {
            // Nothing reached the agent; forget the request entirely.
            state.transfers.remove(&request_id);
            warn!(agent = agent_id, error = %e, "download request not sent");
            return Err(TransferError::AgentNotConnected(agent_id.to_string()));
        }
        if let Some(req) = state.transfers.get_mut(&request_id) {
            req.advance(TransferStatus::Downloading);
        }
        info!(%request_id, agent = agent_id, file = file_name, "download request sent");
        Ok(request_id)
    }

    /// Append one chunk to the request's sink.
    pub async fn handle_chunk(&self, request_id: Uuid, chunk: &str, chunk_index: u64, total_chunks: u64) {
        let (sink, path) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(req) = state.transfers.get_mut(&request_id) else {
                warn!(%request_id, chunk_index, "chunk for unknown transfer dropped");
                return;
            };
            if req.status != TransferStatus::Downloading {
                debug!(%request_id, status = %req.status, chunk_index, "chunk for inactive transfer discarded");
                return;
            }
            let path = self.sink_path(req);
            let sink = state
                .sinks
                .entry(request_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(Sink::new(path.clone()))))
                .clone();
            (sink, path)
        };

        let data = match decode_chunk(chunk) {
            Ok(data) => data,
            Err(e) => {
                self.fail_request(request_id, e.to_string()).await;
                return;
            }
        };

        let written = sink.lock().await.write(&data).await;
        if let Err(e) = written {
            self.fail_request(request_id, e.to_string()).await;
            return;
        }

        let mut state = self.state.lock();
        let Some(req) = state.transfers.get_mut(&request_id) else {
            return;
        };
        if req.status != TransferStatus::Downloading {
            debug!(%request_id, status = %req.status, chunk_index, "transfer ended during write");
            return;
        }
        req.file_path.get_or_insert(path);
        req.bytes_received += data.len() as u64;
        req.chunks_received += 1;
        req.total_chunks = Some(total_chunks);

        let n = chunk_index + 1;
        if n % PROGRESS_EVERY == 0 || n == total_chunks {
            info!(%request_id, chunk = n, total_chunks, bytes = req.bytes_received, "chunk progress");
        }
    }

    /// Close the sink and mark the request completed.
    pub async fn handle_complete(&self, request_id: Uuid) {
        let (sink, path) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(req) = state.transfers.get_mut(&request_id) else {
                warn!(%request_id, "completion for unknown transfer ignored");
                return;
            };
            if req.status != TransferStatus::Downloading {
                debug!(%request_id, status = %req.status, "completion for inactive transfer discarded");
                return;
            }
            let path = self.sink_path(req);
            (state.sinks.remove(&request_id), path)
        };

        // Zero-byte file: no chunk ever opened a sink
        let sink = sink.unwrap_or_else(|| Arc::new(tokio::sync::Mutex::new(Sink::new(path.clone()))));
        let closed = sink.lock().await.finish().await;

        let entry = {
            let mut state = self.state.lock();
            let Some(req) = state.transfers.get_mut(&request_id) else {
                return;
            };
            if req.status != TransferStatus::Downloading {
                debug!(%request_id, status = %req.status, "transfer ended during close");
                return;
            }
            match closed {
                Err(e) => {
                    req.fail(e.to_string());
                }
                Ok(()) => {
                    req.file_path.get_or_insert(path);
                    req.advance(TransferStatus::Completed);
                    info!(
                        %request_id,
                        agent = %req.agent_id,
                        bytes = req.bytes_received,
                        path = ?req.file_path,
                        "download completed"
                    );
                }
            }
            self.journal_entry(req)
        };
        self.record(entry).await;
    }

    /// Agent reported failure: release the sink and record the message.
    pub async fn handle_error(&self, request_id: Uuid, message: &str) {
        {
            let state = self.state.lock();
            match state.transfers.get(&request_id) {
                None => {
                    warn!(%request_id, error = message, "error for unknown transfer ignored");
                    return;
                }
                Some(req) if req.status != TransferStatus::Downloading => {
                    debug!(%request_id, status = %req.status, "error for inactive transfer discarded");
                    return;
                }
                Some(_) => {}
            }
        }
        self.fail_request(request_id, message.to_string()).await;
    }

    /// Fail every in-flight transfer that was issued over the connection
    /// `serial` of `agent_id`, and refuse new requests on it. Returns how
    /// many were failed.
    pub async fn connection_lost(&self, agent_id: &str, serial: u64) -> usize {
        let mut entries = Vec::new();
        let mut sinks = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.closed.insert(serial);
            for req in state.transfers.values_mut() {
                if req.connection != serial || req.status != TransferStatus::Downloading {
                    continue;
                }
                if req.fail("connection lost") {
                    entries.push(self.journal_entry(req));
                    if let Some(sink) = state.sinks.remove(&req.request_id) {
                        sinks.push((req.request_id, sink));
                    }
                }
            }
        }

        let failed = entries.len();
        if failed > 0 {
            warn!(agent = agent_id, failed, "in-flight transfers failed on disconnect");
        }
        for (request_id, sink) in sinks {
            release_sink(request_id, sink).await;
        }
        for entry in entries {
            self.record(entry).await;
        }
        failed
    }

    pub fn get_status(&self, request_id: &Uuid) -> Option<TransferRequest> {
        self.state.lock().transfers.get(request_id).cloned()
    }

    /// Snapshot of all transfers, oldest first.
    pub fn list(&self) -> Vec<TransferRequest> {
        let mut out: Vec<TransferRequest> = self.state.lock().transfers.values().cloned().collect();
        out.sort_by_key(|r| (r.started_at, r.request_id));
        out
    }

    fn sink_path(&self, req: &TransferRequest) -> PathBuf {
        self.download_dir
            .join(sink_file_name(&req.agent_id, &req.file_name))
    }

    /// Move a downloading request to failed and release its sink.
    async fn fail_request(&self, request_id: Uuid, msg: String) -> bool {
        let (entry, sink) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(req) = state.transfers.get_mut(&request_id) else {
                return false;
            };
            if !req.fail(msg) {
                return false;
            }
            (self.journal_entry(req), state.sinks.remove(&request_id))
        };
        if let Some(sink) = sink {
            release_sink(request_id, sink).await;
        }
        self.record(entry).await;
        true
    }

    fn journal_entry(&self, req: &TransferRequest) -> Option<TransferLogEntry> {
        self.journal.as_ref().map(|_| TransferLogEntry::from(req))
    }

    async fn record(&self, entry: Option<TransferLogEntry>) {
        let (Some(journal), Some(entry)) = (self.journal.clone(), entry) else {
            return;
        };
        let writer = journal.clone();
        match tokio::task::spawn_blocking(move || writer.add_entry(&entry)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(path = %journal.path().display(), error = %e, "journal write failed"),
            Err(e) => warn!(path = %journal.path().display(), error = %e, "journal task failed"),
        }
    }
}

async fn release_sink(request_id: Uuid, sink: SharedSink) {
    let mut sink = sink.lock().await;
    if let Err(e) = sink.abandon().await {
        warn!(%request_id, path = %sink.path.display(), error = %e, "sink flush failed");
    }
}
