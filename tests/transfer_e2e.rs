use anyhow::Result;
use filepull::config::AgentConfig;
use filepull::envelope::Envelope;
use filepull::net_async::client::Agent;
use filepull::net_async::server::{self, Coordinator};
use filepull::registry::ConnectionRegistry;
use filepull::session::{TransferRequest, TransferSessionManager, TransferStatus};
use filepull::transport::{read_envelope, write_envelope, Inbound};
use filepull::TransferError;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn write_file(path: &Path, size: usize) -> Result<()> {
    let mut f = std::fs::File::create(path)?;
    let mut val: u8 = 0;
    let data: Vec<u8> = (0..size)
        .map(|_| {
            val = val.wrapping_add(7);
            val
        })
        .collect();
    f.write_all(&data)?;
    Ok(())
}

/// Start a coordinator on an ephemeral loopback port.
async fn start_coordinator(download_dir: &Path) -> Result<(Coordinator, String)> {
    filepull::logger::init_for_tests();
    let registry = Arc::new(ConnectionRegistry::new());
    let sessions = Arc::new(TransferSessionManager::new(registry.clone(), download_dir)?);
    let coordinator = Coordinator::new(registry, sessions);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    let c = coordinator.clone();
    tokio::spawn(async move {
        let _ = server::serve_listener(listener, c).await;
    });
    Ok((coordinator, addr))
}

fn start_agent(server: &str, id: &str, base_dir: &Path) -> tokio::task::JoinHandle<()> {
    let cfg = AgentConfig {
        server: server.to_string(),
        agent_id: Some(id.to_string()),
        base_dir: Some(base_dir.to_path_buf()),
        reconnect_secs: 1,
        ..AgentConfig::default()
    };
    let agent = Agent::new(cfg);
    tokio::spawn(async move {
        let _ = agent.run().await;
    })
}

async fn wait_registered(coordinator: &Coordinator, id: &str) {
    for _ in 0..250u32 {
        if coordinator.registry.has(id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("agent {} never registered", id);
}

async fn wait_terminal(coordinator: &Coordinator, request_id: Uuid) -> TransferRequest {
    for _ in 0..500u32 {
        if let Some(req) = coordinator.sessions.get_status(&request_id) {
            if req.status.is_terminal() {
                return req;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("transfer {} did not finish", request_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn small_file_round_trip() -> Result<()> {
    let downloads = tempfile::tempdir()?;
    let agent_root = tempfile::tempdir()?;
    std::fs::write(agent_root.path().join("notes.txt"), b"hello\nworl")?;

    let (coordinator, addr) = start_coordinator(downloads.path()).await?;
    let agent = start_agent(&addr, "c1", agent_root.path());
    wait_registered(&coordinator, "c1").await;

    let id = coordinator.sessions.request("c1", "notes.txt")?;
    let req = wait_terminal(&coordinator, id).await;
    assert_eq!(req.status, TransferStatus::Completed);
    assert_eq!(req.bytes_received, 10);
    assert_eq!(req.chunks_received, 1);
    assert_eq!(req.total_chunks, Some(1));
    assert!(req.completed_at.is_some());

    let path = req.file_path.expect("completed transfer has a path");
    assert_eq!(path, downloads.path().join("c1_notes.txt"));
    assert_eq!(std::fs::read(&path)?, b"hello\nworl");

    agent.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn multi_chunk_file_is_byte_identical() -> Result<()> {
    let downloads = tempfile::tempdir()?;
    let agent_root = tempfile::tempdir()?;
    write_file(&agent_root.path().join("big.bin"), 200_000)?;

    let (coordinator, addr) = start_coordinator(downloads.path()).await?;
    let agent = start_agent(&addr, "c1", agent_root.path());
    wait_registered(&coordinator, "c1").await;

    let id = coordinator.sessions.request("c1", "big.bin")?;
    let req = wait_terminal(&coordinator, id).await;
    assert_eq!(req.status, TransferStatus::Completed, "error: {:?}", req.error);
    assert_eq!(req.chunks_received, 4);
    assert_eq!(req.total_chunks, Some(4));
    assert_eq!(req.bytes_received, 200_000);

    let got = std::fs::read(downloads.path().join("c1_big.bin"))?;
    let want = std::fs::read(agent_root.path().join("big.bin"))?;
    assert!(got == want, "reassembled file differs");

    agent.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_file_fails_with_agent_message() -> Result<()> {
    let downloads = tempfile::tempdir()?;
    let agent_root = tempfile::tempdir()?;

    let (coordinator, addr) = start_coordinator(downloads.path()).await?;
    let agent = start_agent(&addr, "c1", agent_root.path());
    wait_registered(&coordinator, "c1").await;

    let id = coordinator.sessions.request("c1", "missing.txt")?;
    let req = wait_terminal(&coordinator, id).await;
    assert_eq!(req.status, TransferStatus::Failed);
    let err = req.error.unwrap_or_default();
    assert!(err.contains("file not found"), "unexpected error: {}", err);
    assert_eq!(req.bytes_received, 0);
    assert!(!downloads.path().join("c1_missing.txt").exists());

    agent.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_file_completes_with_empty_sink() -> Result<()> {
    let downloads = tempfile::tempdir()?;
    let agent_root = tempfile::tempdir()?;
    std::fs::write(agent_root.path().join("empty.txt"), b"")?;

    let (coordinator, addr) = start_coordinator(downloads.path()).await?;
    let agent = start_agent(&addr, "c1", agent_root.path());
    wait_registered(&coordinator, "c1").await;

    let id = coordinator.sessions.request("c1", "empty.txt")?;
    let req = wait_terminal(&coordinator, id).await;
    assert_eq!(req.status, TransferStatus::Completed);
    assert_eq!(req.bytes_received, 0);
    assert_eq!(std::fs::metadata(downloads.path().join("c1_empty.txt"))?.len(), 0);

    agent.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_to_absent_agent_is_rejected() -> Result<()> {
    let downloads = tempfile::tempdir()?;
    let (coordinator, _addr) = start_coordinator(downloads.path()).await?;

    let err = coordinator.sessions.request("nobody", "x.txt").unwrap_err();
    assert!(matches!(err, TransferError::AgentNotConnected(ref id) if id == "nobody"));
    assert!(coordinator.sessions.list().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_transfers_on_one_agent() -> Result<()> {
    let downloads = tempfile::tempdir()?;
    let agent_root = tempfile::tempdir()?;
    write_file(&agent_root.path().join("a.bin"), 150_000)?;
    write_file(&agent_root.path().join("b.bin"), 70_000)?;

    let (coordinator, addr) = start_coordinator(downloads.path()).await?;
    let agent = start_agent(&addr, "c1", agent_root.path());
    wait_registered(&coordinator, "c1").await;

    let a = coordinator.sessions.request("c1", "a.bin")?;
    let b = coordinator.sessions.request("c1", "b.bin")?;
    let ra = wait_terminal(&coordinator, a).await;
    let rb = wait_terminal(&coordinator, b).await;
    assert_eq!(ra.status, TransferStatus::Completed);
    assert_eq!(rb.status, TransferStatus::Completed);
    assert_eq!(ra.bytes_received, 150_000);
    assert_eq!(rb.bytes_received, 70_000);
    assert_eq!(
        std::fs::read(downloads.path().join("c1_a.bin"))?,
        std::fs::read(agent_root.path().join("a.bin"))?
    );
    assert_eq!(coordinator.sessions.list().len(), 2);

    agent.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_connection_fails_in_flight_transfer() -> Result<()> {
    let downloads = tempfile::tempdir()?;
    let (coordinator, addr) = start_coordinator(downloads.path()).await?;

    // Hand-driven agent that accepts a request and then vanishes
    let stream = tokio::net::TcpStream::connect(&addr).await?;
    let (mut reader, mut writer) = stream.into_split();
    write_envelope(
        &mut writer,
        &Envelope::ClientInfo {
            client_id: "flaky".into(),
        },
    )
    .await?;
    match read_envelope(&mut reader).await? {
        Inbound::Envelope(Envelope::Connected { client_id }) => assert_eq!(client_id, "flaky"),
        other => panic!("expected connected, got {:?}", other),
    }
    assert!(coordinator.registry.has("flaky"));

    let id = coordinator.sessions.request("flaky", "f.txt")?;
    match read_envelope(&mut reader).await? {
        Inbound::Envelope(Envelope::DownloadRequest { request_id, file_name }) => {
            assert_eq!(request_id, id);
            assert_eq!(file_name, "f.txt");
        }
        other => panic!("expected download_request, got {:?}", other),
    }
    drop(reader);
    drop(writer);

    let req = wait_terminal(&coordinator, id).await;
    assert_eq!(req.status, TransferStatus::Failed);
    assert_eq!(req.error.as_deref(), Some("connection lost"));
    for _ in 0..100u32 {
        if !coordinator.registry.has("flaky") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!coordinator.registry.has("flaky"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ping_refreshes_heartbeat() -> Result<()> {
    let downloads = tempfile::tempdir()?;
    let (coordinator, addr) = start_coordinator(downloads.path()).await?;

    let stream = tokio::net::TcpStream::connect(&addr).await?;
    let (mut reader, mut writer) = stream.into_split();
    write_envelope(
        &mut writer,
        &Envelope::ClientInfo {
            client_id: "hb".into(),
        },
    )
    .await?;
    assert!(matches!(
        read_envelope(&mut reader).await?,
        Inbound::Envelope(Envelope::Connected { .. })
    ));
    let before = coordinator.registry.list()[0].last_heartbeat;

    tokio::time::sleep(Duration::from_millis(10)).await;
    write_envelope(&mut writer, &Envelope::Ping).await?;
    assert!(matches!(
        read_envelope(&mut reader).await?,
        Inbound::Envelope(Envelope::Pong)
    ));
    assert!(coordinator.registry.list()[0].last_heartbeat > before);
    Ok(())
}
