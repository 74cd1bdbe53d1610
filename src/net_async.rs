//! Tokio transport for the coordinator (`server`) and the agent (`client`).
//!
//! Both ends split the TCP stream: the read half is driven by the connection
//! task, the write half by a writer task draining an outbound queue. Every
//! envelope a connection emits goes through that queue.

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::transport::{read_envelope, write_envelope, Inbound};

pub mod server {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::io::AsyncRead;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tracing::{debug, info, warn};

    use crate::envelope::Envelope;
    use crate::protocol::timeouts::HANDSHAKE_MS;
    use crate::registry::{ConnectionHandle, ConnectionRegistry};
    use crate::session::TransferSessionManager;

    /// Shared coordinator state, cloned into every connection task and the
    /// HTTP API.
    #[derive(Clone)]
    pub struct Coordinator {
        pub registry: Arc<ConnectionRegistry>,
        pub sessions: Arc<TransferSessionManager>,
    }

    impl Coordinator {
        pub fn new(registry: Arc<ConnectionRegistry>, sessions: Arc<TransferSessionManager>) -> Self {
            Self { registry, sessions }
        }
    }

    /// Per-connection context created at handshake and handed to every
    /// handler for that connection.
    struct SessionContext {
        agent_id: String,
        handle: ConnectionHandle,
        peer: SocketAddr,
    }

    pub async fn serve(bind: &str, coordinator: Coordinator) -> Result<()> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("bind {}", bind))?;
        info!(
            bind,
            download_dir = %coordinator.sessions.download_dir().display(),
            "agent transport listening"
        );
        serve_listener(listener, coordinator).await
    }

    pub async fn serve_listener(listener: TcpListener, coordinator: Coordinator) -> Result<()> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            debug!(%peer, "connection accepted");
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, coordinator).await {
                    warn!(%peer, error = %e, "connection error");
                }
            });
        }
    }

    async fn handle_connection(stream: TcpStream, peer: SocketAddr, coordinator: Coordinator) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();

        let agent_id = match timeout(Duration::from_millis(HANDSHAKE_MS), await_handshake(&mut reader, peer)).await {
            Ok(Ok(Some(id))) => id,
            Ok(Ok(None)) => {
                debug!(%peer, "closed before handshake");
                return Ok(());
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => anyhow::bail!("no client_info within {} ms", HANDSHAKE_MS),
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let writer_task = tokio::spawn(async move {
            while let Some(env) = rx.recv().await {
                if let Err(e) = write_envelope(&mut writer, &env).await {
                    warn!(%peer, error = %e, "write failed");
                    break;
                }
            }
        });

        let ctx = SessionContext {
            agent_id,
            handle: ConnectionHandle::new(tx),
            peer,
        };
        if let Some(old) = coordinator
            .registry
            .add(&ctx.agent_id, ctx.handle.clone(), Some(peer))
        {
            warn!(agent = %ctx.agent_id, replaced = old.serial(), "identity re-registered");
        }
        if let Err(e) = ctx.handle.send(Envelope::Connected {
            client_id: ctx.agent_id.clone(),
        }) {
            warn!(agent = %ctx.agent_id, error = %e, "handshake reply not sent");
        }

        let result = read_loop(&mut reader, &ctx, &coordinator).await;

        coordinator
            .registry
            .remove_connection(&ctx.agent_id, ctx.handle.serial());
        // Dropping the queue makes late sends fail instead of vanishing
        writer_task.abort();
        let _ = writer_task.await;
        coordinator
            .sessions
            .connection_lost(&ctx.agent_id, ctx.handle.serial())
            .await;
        result
    }

    async fn await_handshake<R>(reader: &mut R, peer: SocketAddr) -> Result<Option<String>>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            match read_envelope(reader).await? {
                Inbound::Closed => return Ok(None),
                Inbound::Envelope(Envelope::ClientInfo { client_id }) => return Ok(Some(client_id)),
                Inbound::Envelope(other) => {
                    warn!(%peer, kind = other.kind(), "envelope before handshake dropped")
                }
                Inbound::Rejected(e) => warn!(%peer, error = %e, "envelope dropped"),
            }
        }
    }

    async fn read_loop<R>(reader: &mut R, ctx: &SessionContext, coordinator: &Coordinator) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            match read_envelope(reader).await? {
                Inbound::Closed => {
                    debug!(agent = %ctx.agent_id, peer = %ctx.peer, "connection closed");
                    return Ok(());
                }
                Inbound::Rejected(e) => warn!(agent = %ctx.agent_id, error = %e, "envelope dropped"),
                Inbound::Envelope(env) => dispatch(ctx, coordinator, env).await,
            }
        }
    }

    async fn dispatch(ctx: &SessionContext, coordinator: &Coordinator, env: Envelope) {
        match env {
            Envelope::Ping => {
                coordinator.registry.update_heartbeat(&ctx.agent_id);
                if let Err(e) = ctx.handle.send(Envelope::Pong) {
                    debug!(agent = %ctx.agent_id, error = %e, "pong not sent");
                }
            }
            Envelope::DownloadChunk {
                request_id,
                chunk,
                chunk_index,
                total_chunks,
            } => {
                coordinator
                    .sessions
                    .handle_chunk(request_id, &chunk, chunk_index, total_chunks)
                    .await
            }
            Envelope::DownloadComplete { request_id } => {
                coordinator.sessions.handle_complete(request_id).await
            }
            Envelope::DownloadError { request_id, error } => {
                coordinator.sessions.handle_error(request_id, &error).await
            }
            Envelope::ClientInfo { client_id } => {
                debug!(agent = %ctx.agent_id, %client_id, "repeated client_info ignored")
            }
            other => warn!(agent = %ctx.agent_id, kind = other.kind(), "unexpected envelope from agent"),
        }
    }
}

pub mod client {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::task::JoinSet;
    use tracing::{debug, info, warn};

    use crate::config::AgentConfig;
    use crate::envelope::Envelope;
    use crate::executor::TransferExecutor;
    use crate::protocol::timeouts::CONNECT_MS;

    pub struct Agent {
        config: AgentConfig,
        agent_id: String,
        executor: TransferExecutor,
    }

    impl Agent {
        pub fn new(config: AgentConfig) -> Self {
            let agent_id = config.resolve_agent_id();
            let executor =
                TransferExecutor::new(config.resolve_base_dir()).with_chunk_size(config.chunk_size);
            Self {
                config,
                agent_id,
                executor,
            }
        }

        pub fn id(&self) -> &str {
            &self.agent_id
        }

        pub fn base_dir(&self) -> &std::path::Path {
            self.executor.base_dir()
        }

        /// Connect, serve, and reconnect after a fixed delay, forever.
        pub async fn run(&self) -> Result<()> {
            loop {
                match self.connect().await {
                    Ok(stream) => match self.run_session(stream).await {
                        Ok(()) => info!("disconnected"),
                        Err(e) => warn!(error = %e, "session ended"),
                    },
                    Err(e) => warn!(server = %self.config.server, error = %e, "connect failed"),
                }
                let delay = self.config.reconnect_delay();
                info!(delay_secs = delay.as_secs(), "reconnecting");
                tokio::time::sleep(delay).await;
            }
        }

        pub async fn connect(&self) -> Result<TcpStream> {
            let addr = &self.config.server;
            let stream = timeout(Duration::from_millis(CONNECT_MS), TcpStream::connect(addr))
                .await
                .with_context(|| format!("connect {} timed out", addr))?
                .with_context(|| format!("connect {}", addr))?;
            let _ = stream.set_nodelay(true);
            info!(server = %addr, "connected");
            Ok(stream)
        }

        /// Serve one connection until it closes. Transfers still running
        /// when it does are abandoned.
        pub async fn run_session(&self, stream: TcpStream) -> Result<()> {
            let (mut reader, mut writer) = stream.into_split();
            let (tx, mut rx) = mpsc::channel::<Envelope>(self.config.max_in_flight_chunks.max(1));

            let writer_task = tokio::spawn(async move {
                while let Some(env) = rx.recv().await {
                    if let Err(e) = write_envelope(&mut writer, &env).await {
                        warn!(error = %e, "write failed");
                        break;
                    }
                }
            });

            tx.send(Envelope::ClientInfo {
                client_id: self.agent_id.clone(),
            })
            .await
            .context("writer closed before handshake")?;

            let mut tasks = JoinSet::new();
            let heartbeat_tx = tx.clone();
            let interval = self.config.heartbeat_interval();
            tasks.spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                // First tick fires immediately
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if heartbeat_tx.send(Envelope::Ping).await.is_err() {
                        break;
                    }
                }
            });

            let result = loop {
                let inbound = match read_envelope(&mut reader).await {
                    Ok(inbound) => inbound,
                    Err(e) => break Err(anyhow::Error::from(e)),
                };
                match inbound {
                    Inbound::Closed => break Ok(()),
                    Inbound::Rejected(e) => warn!(error = %e, "envelope dropped"),
                    Inbound::Envelope(Envelope::Connected { client_id }) => {
                        info!(agent = %client_id, "registered")
                    }
                    Inbound::Envelope(Envelope::Pong) => debug!("pong"),
                    Inbound::Envelope(Envelope::DownloadRequest {
                        request_id,
                        file_name,
                    }) => {
                        let executor = self.executor.clone();
                        let tx = tx.clone();
                        tasks.spawn(async move {
                            let _ = executor.execute(request_id, &file_name, &tx).await;
                        });
                    }
                    Inbound::Envelope(other) => {
                        warn!(kind = other.kind(), "unexpected envelope from coordinator")
                    }
                }
                // Reap finished transfers
                while tasks.try_join_next().is_some() {}
            };

            tasks.abort_all();
            writer_task.abort();
            result
        }
    }
}
