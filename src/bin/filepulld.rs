use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};

use filepull::cli::DaemonOpts;
use filepull::config::{self, ServerConfig};
use filepull::log::TransferLog;
use filepull::net_async::server::{self, Coordinator};
use filepull::registry::ConnectionRegistry;
use filepull::session::TransferSessionManager;
use filepull::{api, logger};

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    logger::init(opts.verbose);

    let cfg: ServerConfig = config::load(opts.config.as_deref(), "filepulld.toml")?;
    let cfg = opts.apply(cfg);

    let registry = Arc::new(ConnectionRegistry::new());
    let mut sessions = TransferSessionManager::new(registry.clone(), &cfg.download_dir)
        .with_context(|| format!("Failed to prepare download dir {}", cfg.download_dir.display()))?;
    if let Some(journal) = &cfg.journal {
        info!(path = %journal.display(), "transfer journal enabled");
        sessions = sessions.with_journal(TransferLog::new(journal));
    }
    let coordinator = Coordinator::new(registry, Arc::new(sessions));

    if !cfg.api_bind.starts_with("127.") && !cfg.api_bind.starts_with("localhost") {
        warn!(
            bind = %cfg.api_bind,
            "HTTP API is unauthenticated; anyone who can reach it can pull files from agents"
        );
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async move {
        tokio::select! {
            res = server::serve(&cfg.transport_bind, coordinator.clone()) => res,
            res = api::serve(&cfg.api_bind, coordinator) => res,
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                Ok(())
            }
        }
    })
}
