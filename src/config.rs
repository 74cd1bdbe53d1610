//! TOML configuration for the coordinator and the agent.
//!
//! Every key is optional; command-line flags override file values.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::{timeouts, CHUNK_SIZE, MAX_CHUNK_SIZE};

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("Filepull");
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("filepull");
    }
    PathBuf::from(".filepull")
}

pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address agents connect to
    pub transport_bind: String,
    /// Address of the HTTP control API
    pub api_bind: String,
    /// Where reassembled files are written
    pub download_dir: PathBuf,
    /// Optional JSONL journal of finished transfers
    pub journal: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport_bind: "0.0.0.0:3001".to_string(),
            api_bind: "127.0.0.1:3000".to_string(),
            download_dir: PathBuf::from("./downloads"),
            journal: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Coordinator transport address (host:port)
    pub server: String,
    pub agent_id: Option<String>,
    /// Directory requested file names are resolved against (default: home)
    pub base_dir: Option<PathBuf>,
    pub heartbeat_secs: u64,
    pub reconnect_secs: u64,
    pub chunk_size: usize,
    /// Encoded chunks allowed to queue ahead of the socket
    pub max_in_flight_chunks: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:3001".to_string(),
            agent_id: None,
            base_dir: None,
            heartbeat_secs: timeouts::HEARTBEAT_SECS,
            reconnect_secs: timeouts::RECONNECT_SECS,
            chunk_size: CHUNK_SIZE,
            max_in_flight_chunks: 16,
        }
    }
}

impl AgentConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_secs)
    }

    /// Configured id, or `<hostname>-<random suffix>`.
    pub fn resolve_agent_id(&self) -> String {
        if let Some(id) = self.agent_id.as_deref().filter(|s| !s.trim().is_empty()) {
            return id.to_string();
        }
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "agent".to_string());
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}", host, &suffix[..6])
    }

    /// Reject settings the transport cannot carry.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            anyhow::bail!(
                "chunk_size must be between 1 and {} bytes (got {})",
                MAX_CHUNK_SIZE,
                self.chunk_size
            );
        }
        if self.max_in_flight_chunks == 0 {
            anyhow::bail!("max_in_flight_chunks must be at least 1");
        }
        Ok(())
    }

    pub fn resolve_base_dir(&self) -> PathBuf {
        self.base_dir
            .clone()
            .or_else(home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Load `path`, or the default file under [`config_dir`] when `path` is
/// `None`. A missing default file yields defaults; a missing explicit file
/// is an error.
pub fn load<T>(path: Option<&Path>, default_name: &str) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let (p, explicit) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (config_dir().join(default_name), false),
    };
    match std::fs::read_to_string(&p) {
        Ok(data) => toml::from_str(&data).with_context(|| format!("parse {}", p.display())),
        Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e).with_context(|| format!("read {}", p.display())),
    }
}
