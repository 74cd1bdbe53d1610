//! Shared CLI helpers and small reusable Clap fragments

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{AgentConfig, ServerConfig};
use crate::protocol::DEFAULT_FILE_NAME;

/// Coordinator daemon options (filepulld)
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "Coordinator: accepts agents and reassembles pulled files")]
pub struct DaemonOpts {
    /// Config file (default: ~/.config/filepull/filepulld.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Agent transport bind address (host:port)
    #[arg(long, env = "FILEPULL_TRANSPORT_BIND")]
    pub bind: Option<String>,

    /// HTTP control API bind address (host:port)
    #[arg(long, env = "FILEPULL_API_BIND")]
    pub api_bind: Option<String>,

    /// Directory for reassembled files
    #[arg(long)]
    pub download_dir: Option<PathBuf>,

    /// Append finished transfers to this JSONL file
    #[arg(long)]
    pub journal: Option<PathBuf>,

    /// Debug-level logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    pub verbose: bool,
}

impl DaemonOpts {
    pub fn apply(&self, mut cfg: ServerConfig) -> ServerConfig {
        if let Some(b) = &self.bind {
            cfg.transport_bind = b.clone();
        }
        if let Some(b) = &self.api_bind {
            cfg.api_bind = b.clone();
        }
        if let Some(d) = &self.download_dir {
            cfg.download_dir = d.clone();
        }
        if self.journal.is_some() {
            cfg.journal = self.journal.clone();
        }
        cfg
    }
}

/// Agent options (filepull-agent)
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "Agent: serves local files to a filepull coordinator")]
pub struct AgentOpts {
    /// Config file (default: ~/.config/filepull/agent.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Coordinator transport address (host:port)
    #[arg(long, env = "FILEPULL_SERVER")]
    pub server: Option<String>,

    /// Agent identity presented at handshake
    #[arg(long, env = "FILEPULL_AGENT_ID")]
    pub id: Option<String>,

    /// Directory requested files are resolved against
    #[arg(long)]
    pub base_dir: Option<PathBuf>,

    /// Heartbeat interval in seconds
    #[arg(long)]
    pub heartbeat_secs: Option<u64>,

    /// Delay between reconnect attempts in seconds
    #[arg(long)]
    pub reconnect_secs: Option<u64>,

    /// Debug-level logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    pub verbose: bool,
}

impl AgentOpts {
    pub fn apply(&self, mut cfg: AgentConfig) -> AgentConfig {
        if let Some(s) = &self.server {
            cfg.server = s.clone();
        }
        if self.id.is_some() {
            cfg.agent_id = self.id.clone();
        }
        if self.base_dir.is_some() {
            cfg.base_dir = self.base_dir.clone();
        }
        if let Some(h) = self.heartbeat_secs {
            cfg.heartbeat_secs = h;
        }
        if let Some(r) = self.reconnect_secs {
            cfg.reconnect_secs = r;
        }
        cfg
    }
}

/// Command-line client for the coordinator's HTTP API (filepull)
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "Control a filepull coordinator")]
pub struct ClientOpts {
    /// Base URL of the coordinator HTTP API
    #[arg(long, env = "FILEPULL_API", default_value = "http://127.0.0.1:3000")]
    pub api: String,

    #[command(subcommand)]
    pub command: ClientCommand,
}

#[derive(Clone, Debug, Subcommand)]
pub enum ClientCommand {
    /// Show connected agents
    ListClients,
    /// Pull a file from an agent
    Download {
        /// Agent id
        #[arg(short, long = "client")]
        client: String,
        /// File name relative to the agent's base directory
        #[arg(short, long = "file", default_value = DEFAULT_FILE_NAME)]
        file: String,
    },
    /// Show one transfer
    Status {
        /// Request id returned by `download`
        request_id: String,
    },
    /// Show all transfers
    ListDownloads,
}
