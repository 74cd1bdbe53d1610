//! Protocol envelope exchanged over every agent connection.
//!
//! Each message is one flat JSON object whose `type` field selects the
//! variant, e.g. `{"type":"download_request","requestId":"…","fileName":"a.txt"}`.
//! Decoding goes through [`Envelope::decode`], which rejects unknown kinds,
//! missing fields and semantically invalid values before anything is
//! dispatched.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TransferError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Envelope {
    /// Agent → coordinator, first message on a connection.
    ClientInfo { client_id: String },
    /// Coordinator → agent, handshake acknowledgement.
    Connected { client_id: String },
    Ping,
    Pong,
    DownloadRequest { request_id: Uuid, file_name: String },
    DownloadChunk {
        request_id: Uuid,
        /// Base64 encoded file content
        chunk: String,
        chunk_index: u64,
        total_chunks: u64,
    },
    DownloadComplete { request_id: Uuid },
    DownloadError { request_id: Uuid, error: String },
}

impl Envelope {
    /// Parse and validate one envelope from a frame payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let env: Envelope = serde_json::from_slice(payload)
            .map_err(|e| TransferError::protocol(format!("malformed envelope: {e}")))?;
        env.validate()?;
        Ok(env)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| TransferError::protocol(format!("encode {}: {e}", self.kind())))
    }

    fn validate(&self) -> Result<()> {
        match self {
            Envelope::ClientInfo { client_id } | Envelope::Connected { client_id } => {
                if client_id.trim().is_empty() {
                    return Err(TransferError::protocol("empty clientId"));
                }
            }
            Envelope::DownloadRequest { file_name, .. } => {
                if file_name.is_empty() {
                    return Err(TransferError::protocol("empty fileName"));
                }
            }
            Envelope::DownloadChunk {
                chunk_index,
                total_chunks,
                ..
            } => {
                if chunk_index >= total_chunks {
                    return Err(TransferError::protocol(format!(
                        "chunkIndex {chunk_index} out of range (totalChunks {total_chunks})"
                    )));
                }
            }
            Envelope::DownloadError { error, .. } => {
                if error.is_empty() {
                    return Err(TransferError::protocol("empty error text"));
                }
            }
            Envelope::Ping | Envelope::Pong | Envelope::DownloadComplete { .. } => {}
        }
        Ok(())
    }

    /// Wire name of the variant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::ClientInfo { .. } => "client_info",
            Envelope::Connected { .. } => "connected",
            Envelope::Ping => "ping",
            Envelope::Pong => "pong",
            Envelope::DownloadRequest { .. } => "download_request",
            Envelope::DownloadChunk { .. } => "download_chunk",
            Envelope::DownloadComplete { .. } => "download_complete",
            Envelope::DownloadError { .. } => "download_error",
        }
    }
}

pub fn encode_chunk(data: &[u8]) -> String {
    STANDARD.encode(data)
}

pub fn decode_chunk(chunk: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(chunk)
        .map_err(|e| TransferError::protocol(format!("invalid chunk encoding: {e}")))
}

/// Number of chunks needed for `size` bytes: ceil(size / chunk_size).
pub fn total_chunks(size: u64, chunk_size: usize) -> u64 {
    size.div_ceil(chunk_size.max(1) as u64)
}
