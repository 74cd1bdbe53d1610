use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use filepull::cli::AgentOpts;
use filepull::config::{self, AgentConfig};
use filepull::logger;
use filepull::net_async::client::Agent;

fn main() -> Result<()> {
    let opts = AgentOpts::parse();
    logger::init(opts.verbose);

    let cfg: AgentConfig = config::load(opts.config.as_deref(), "agent.toml")?;
    let cfg = opts.apply(cfg);
    cfg.validate().context("Invalid agent configuration")?;

    let agent = Agent::new(cfg.clone());
    if !agent.base_dir().is_dir() {
        anyhow::bail!("Base directory does not exist: {}", agent.base_dir().display());
    }
    info!(
        id = agent.id(),
        server = %cfg.server,
        base_dir = %agent.base_dir().display(),
        "starting agent"
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async move {
        tokio::select! {
            res = agent.run() => res,
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                Ok(())
            }
        }
    })
}
