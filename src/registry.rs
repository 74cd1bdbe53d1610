//! Live agent connections keyed by agent identity.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;

use crate::envelope::Envelope;
use crate::error::{Result, TransferError};

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Sending half of one connection's outbound queue.
///
/// The serial distinguishes two connections that registered the same
/// identity one after the other.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    serial: u64,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Queue an envelope for the connection's writer task.
    pub fn send(&self, env: Envelope) -> Result<()> {
        self.tx
            .send(env)
            .map_err(|e| TransferError::Transport(format!("connection writer gone ({})", e.0.kind())))
    }
}

#[derive(Debug)]
struct Connection {
    handle: ConnectionHandle,
    peer: Option<SocketAddr>,
    connected_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
}

/// Point-in-time view of a registered connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: String,
    pub peer: Option<SocketAddr>,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id`, replacing any previous entry. Returns the displaced handle.
    pub fn add(
        &self,
        id: &str,
        handle: ConnectionHandle,
        peer: Option<SocketAddr>,
    ) -> Option<ConnectionHandle> {
        let now = Utc::now();
        let mut connections = self.connections.lock();
        let previous = connections.insert(
            id.to_string(),
            Connection {
                handle,
                peer,
                connected_at: now,
                last_heartbeat: now,
            },
        );
        info!(agent = id, total = connections.len(), "agent connected");
        previous.map(|c| c.handle)
    }

    /// Remove `id` if present.
    pub fn remove(&self, id: &str) -> bool {
        let mut connections = self.connections.lock();
        let removed = connections.remove(id).is_some();
        if removed {
            info!(agent = id, total = connections.len(), "agent disconnected");
        }
        removed
    }

    /// Remove `id` only while it still refers to the connection with `serial`.
    pub fn remove_connection(&self, id: &str, serial: u64) -> bool {
        let mut connections = self.connections.lock();
        match connections.get(id) {
            Some(c) if c.handle.serial == serial => {
                connections.remove(id);
                info!(agent = id, total = connections.len(), "agent disconnected");
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<ConnectionHandle> {
        self.connections.lock().get(id).map(|c| c.handle.clone())
    }

    pub fn has(&self, id: &str) -> bool {
        self.connections.lock().contains_key(id)
    }

    /// Snapshot of every live connection, ordered by id.
    pub fn list(&self) -> Vec<ConnectionInfo> {
        let connections = self.connections.lock();
        let mut out: Vec<ConnectionInfo> = connections
            .iter()
            .map(|(id, c)| ConnectionInfo {
                id: id.clone(),
                peer: c.peer,
                connected_at: c.connected_at,
                last_heartbeat: c.last_heartbeat,
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn ids(&self) -> Vec<String> {
        self.list().into_iter().map(|c| c.id).collect()
    }

    pub fn update_heartbeat(&self, id: &str) {
        if let Some(c) = self.connections.lock().get_mut(id) {
            c.last_heartbeat = Utc::now();
        }
    }
}
