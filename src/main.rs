//! filepull - command-line client for a filepull coordinator's HTTP API

use anyhow::{Context, Result};
use clap::Parser;
use chrono::Local;

use filepull::api_client::ApiClient;
use filepull::cli::{ClientCommand, ClientOpts};
use filepull::session::TransferRequest;

fn main() {
    let opts = ClientOpts::parse();
    if let Err(e) = run(opts) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn run(opts: ClientOpts) -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    let client = ApiClient::new(&opts.api);
    let command = opts.command;

    rt.block_on(async move {
        match command {
            ClientCommand::ListClients => {
                let list = client.list_clients().await?;
                if list.count == 0 {
                    println!("No clients connected");
                    return Ok(());
                }
                println!("\nConnected clients ({}):\n", list.count);
                for c in list.clients {
                    println!("  ID: {}", c.id);
                    if let Some(peer) = c.peer {
                        println!("  Address: {}", peer);
                    }
                    println!("  Connected: {}", c.connected_at.with_timezone(&Local).format("%F %T"));
                    println!("  Last heartbeat: {}", c.last_heartbeat.with_timezone(&Local).format("%F %T"));
                    println!();
                }
            }
            ClientCommand::Download { client: agent, file } => {
                println!("Requesting download from: {agent}");
                println!("File: {file}\n");
                let started = client.request_download(&agent, &file).await?;
                println!("✓ {}", started.message);
                println!("Request ID: {}\n", started.request_id);
                println!("Check status: filepull status {}", started.request_id);
            }
            ClientCommand::Status { request_id } => match client.status(&request_id).await? {
                Some(req) => {
                    println!("\nDownload Status:\n");
                    print_transfer(&req, true);
                }
                None => anyhow::bail!("Download not found"),
            },
            ClientCommand::ListDownloads => {
                let list = client.list_downloads().await?;
                if list.count == 0 {
                    println!("No downloads");
                    return Ok(());
                }
                println!("\nDownloads ({}):\n", list.count);
                for req in &list.downloads {
                    print_transfer(req, false);
                }
            }
        }
        Ok(())
    })
}

fn print_transfer(req: &TransferRequest, detailed: bool) {
    println!("  Request: {}", req.request_id);
    println!("  Client: {}", req.agent_id);
    println!("  File: {}", req.file_name);
    println!("  Status: {}", req.status);
    match req.total_chunks {
        Some(total) => println!("  Bytes: {} ({}/{} chunks)", req.bytes_received, req.chunks_received, total),
        None => println!("  Bytes: {}", req.bytes_received),
    }
    if let Some(path) = &req.file_path {
        println!("  Path: {}", path.display());
    }
    if detailed {
        if let Some(t) = req.started_at {
            println!("  Started: {}", t.with_timezone(&Local).format("%F %T"));
        }
        if let Some(t) = req.completed_at {
            println!("  Completed: {}", t.with_timezone(&Local).format("%F %T"));
        }
    }
    if let Some(err) = &req.error {
        println!("  Error: {err}");
    }
    println!();
}
