//! Shared protocol constants for the filepull framed transport

// Protocol header constants
pub const MAGIC: &[u8; 4] = b"FPUL";
pub const VERSION: u16 = 1;

/// Frame header: MAGIC (4) | VERSION (2) | LENGTH (4)
pub const HEADER_LEN: usize = 10;

// Maximum frame payload size (1MB). A 64KB chunk is ~87KB once base64 encoded
// and wrapped in JSON, so this leaves plenty of headroom while capping
// allocation for a hostile length field.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Bytes of file content carried by one `download_chunk` envelope
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Largest configurable chunk. Base64 grows it by 4/3, which keeps a full
/// `download_chunk` envelope well inside MAX_FRAME_SIZE.
pub const MAX_CHUNK_SIZE: usize = 512 * 1024;

/// File requested when the caller does not name one
pub const DEFAULT_FILE_NAME: &str = "file_to_download.txt";

// Centralized timeout constants
pub mod timeouts {
    // A new connection must identify itself within this window (ms)
    pub const HANDSHAKE_MS: u64 = 10_000;

    // Base timeout for writes (ms)
    pub const WRITE_BASE_MS: u64 = 500;

    // Additional timeout per MB of data (ms)
    pub const PER_MB_MS: u64 = 1;

    // Agent connect attempt timeout (ms)
    pub const CONNECT_MS: u64 = 5_000;

    // Agent heartbeat interval (s)
    pub const HEARTBEAT_SECS: u64 = 30;

    // Fixed delay between agent reconnect attempts (s)
    pub const RECONNECT_SECS: u64 = 5;

    // Calculate write deadline based on payload size (ms)
    // 500ms base + 1ms per 1MB payload (ceil)
    pub fn write_deadline_ms(payload_len: usize) -> u64 {
        let mb = (payload_len as u64).div_ceil(1_048_576);
        WRITE_BASE_MS + mb * PER_MB_MS
    }
}

#[cfg(test)]
mod tests {
    use super::timeouts::*;

    #[test]
    fn write_deadline_grows_per_megabyte() {
        assert_eq!(write_deadline_ms(0), WRITE_BASE_MS);
        assert_eq!(write_deadline_ms(1), WRITE_BASE_MS + 1);
        assert_eq!(write_deadline_ms(1_048_576), WRITE_BASE_MS + 1);
        assert_eq!(write_deadline_ms(1_048_577), WRITE_BASE_MS + 2);
    }
}
