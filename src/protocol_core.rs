//! Frame header handling and filesystem path rules shared by the coordinator
//! and the agent.

use std::path::{Component, Path, PathBuf};

use crate::error::{Result, TransferError};
use crate::protocol::{HEADER_LEN, MAGIC, MAX_FRAME_SIZE, VERSION};

/// Resolve a requested file name to a path that stays under `root`.
///
/// Rejects absolute paths, `..`, root/prefix components and NUL bytes, then
/// canonicalizes existing paths so a symlink cannot lead outside the root.
pub fn normalize_under_root(root: &Path, p: &Path) -> Result<PathBuf> {
    if p.to_string_lossy().contains('\0') {
        return Err(TransferError::protocol("path contains NUL byte"));
    }

    let mut safe = PathBuf::new();
    for component in p.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(s) => {
                #[cfg(windows)]
                if s.to_string_lossy().contains(':') {
                    return Err(TransferError::protocol("path component contains colon"));
                }
                safe.push(s);
            }
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(TransferError::protocol(format!(
                    "path contains disallowed component: {component:?}"
                )));
            }
        }
    }
    if safe.as_os_str().is_empty() {
        return Err(TransferError::protocol("empty path"));
    }

    let joined = root.join(&safe);
    if !joined.exists() {
        // Nothing to resolve; the caller reports the missing file.
        return Ok(joined);
    }
    let canon_root = root.canonicalize()?;
    let canon = joined.canonicalize()?;
    if !canon.starts_with(&canon_root) {
        return Err(TransferError::protocol(format!(
            "path {} escapes root",
            p.display()
        )));
    }
    Ok(canon)
}

/// Output file name for a transfer: `<agent>_<file>`, flattened so that it
/// always lands directly inside the download directory.
pub fn sink_file_name(agent_id: &str, file_name: &str) -> String {
    let flatten = |s: &str| -> String {
        s.chars()
            .map(|c| match c {
                '/' | '\\' | '\0' => '_',
                c => c,
            })
            .collect()
    };
    let name = format!("{}_{}", flatten(agent_id), flatten(file_name));
    // "." and ".." are only special as whole names
    if name.chars().all(|c| c == '.') {
        name.replace('.', "_")
    } else {
        name
    }
}

/// Validate frame payload size against MAX_FRAME_SIZE
pub fn validate_frame_size(size: usize) -> Result<()> {
    if size > MAX_FRAME_SIZE {
        return Err(TransferError::Transport(format!(
            "frame payload too large: {size} bytes (max: {MAX_FRAME_SIZE})"
        )));
    }
    Ok(())
}

/// Build frame header (10 bytes)
/// Format: MAGIC (4) | VERSION (2) | LENGTH (4)
pub fn build_frame_header(payload_len: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_le_bytes());
    header[6..10].copy_from_slice(&payload_len.to_le_bytes());
    header
}

/// Parse frame header, returning the payload length
pub fn parse_frame_header(header: &[u8; HEADER_LEN]) -> Result<usize> {
    if &header[0..4] != MAGIC {
        return Err(TransferError::Transport("invalid magic in frame header".into()));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != VERSION {
        return Err(TransferError::Transport(format!(
            "protocol version mismatch: got {version}, expected {VERSION}"
        )));
    }
    let len = u32::from_le_bytes([header[6], header[7], header[8], header[9]]) as usize;
    validate_frame_size(len)?;
    Ok(len)
}

/// Create directory with parent creation
pub fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}
