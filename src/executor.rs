//! Agent Transfer Executor: serves one `download_request` by streaming the
//! file as a sequence of `download_chunk` envelopes.

use std::path::{Path, PathBuf};

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::envelope::{encode_chunk, total_chunks, Envelope};
use crate::error::{Result, TransferError};
use crate::protocol::{CHUNK_SIZE, MAX_CHUNK_SIZE};
use crate::protocol_core::normalize_under_root;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferSummary {
    pub bytes: u64,
    pub chunks: u64,
}

#[derive(Clone, Debug)]
pub struct TransferExecutor {
    base_dir: PathBuf,
    chunk_size: usize,
}

impl TransferExecutor {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            chunk_size: CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.clamp(1, MAX_CHUNK_SIZE);
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Stream `file_name` to `out`, ending with `download_complete`, or with
    /// `download_error` as soon as anything goes wrong.
    ///
    /// `out` is bounded; a full queue suspends the loop until the writer
    /// catches up.
    pub async fn execute(
        &self,
        request_id: Uuid,
        file_name: &str,
        out: &mpsc::Sender<Envelope>,
    ) -> Result<TransferSummary> {
        info!(%request_id, file = file_name, "download requested");
        match self.stream_file(request_id, file_name, out).await {
            Ok(summary) => {
                info!(
                    %request_id,
                    chunks = summary.chunks,
                    bytes = summary.bytes,
                    "transfer complete"
                );
                Ok(summary)
            }
            Err(e) => {
                warn!(%request_id, error = %e, "transfer aborted");
                let msg = Envelope::DownloadError {
                    request_id,
                    error: e.to_string(),
                };
                if out.send(msg).await.is_err() {
                    debug!(%request_id, "connection gone, error not reported");
                }
                Err(e)
            }
        }
    }

    async fn stream_file(
        &self,
        request_id: Uuid,
        file_name: &str,
        out: &mpsc::Sender<Envelope>,
    ) -> Result<TransferSummary> {
        let path = normalize_under_root(&self.base_dir, Path::new(file_name))?;
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TransferError::FileNotFound(file_name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        if !meta.is_file() {
            return Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("not a regular file: {file_name}"),
            )));
        }

        let size = meta.len();
        let total = total_chunks(size, self.chunk_size);
        debug!(%request_id, path = %path.display(), size, total_chunks = total, "sending file");

        let mut file = tokio::fs::File::open(&path).await?;
        let mut buf = vec![0u8; self.chunk_size];
        let mut summary = TransferSummary { bytes: 0, chunks: 0 };

        while summary.chunks < total {
            let n = read_full(&mut file, &mut buf).await?;
            if n == 0 {
                // File shrank since stat; finish with what was there
                break;
            }
            let msg = Envelope::DownloadChunk {
                request_id,
                chunk: encode_chunk(&buf[..n]),
                chunk_index: summary.chunks,
                total_chunks: total,
            };
            send(out, msg).await?;
            summary.chunks += 1;
            summary.bytes += n as u64;

            if summary.chunks % 100 == 0 {
                info!(
                    %request_id,
                    chunk = summary.chunks,
                    total_chunks = total,
                    bytes = summary.bytes,
                    size,
                    "progress"
                );
            }
        }

        send(out, Envelope::DownloadComplete { request_id }).await?;
        Ok(summary)
    }
}

/// Read until `buf` is full or the file ends.
async fn read_full(file: &mut tokio::fs::File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn send(out: &mpsc::Sender<Envelope>, env: Envelope) -> Result<()> {
    out.send(env)
        .await
        .map_err(|e| TransferError::Transport(format!("connection closed while sending {}", e.0.kind())))
}
