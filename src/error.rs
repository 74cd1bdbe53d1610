use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("agent {0} not connected")]
    AgentNotConnected(String),
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("transport closed: {0}")]
    Transport(String),
}

impl TransferError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

pub type Result<T, E = TransferError> = std::result::Result<T, E>;
