mod cli;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use crate::cli::Cli;
use periscope::{ProxyConfig, ProxyManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to INFO unless the caller asked for something else.
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let mut config = ProxyConfig::new(cli.id, cli.target);
    config.listen_port = cli.port;
    config.bind_address = cli.bind;
    config.buffer_capacity = cli.buffer_size;

    let manager = ProxyManager::new();
    let proxy = manager
        .create(config)
        .await
        .context("failed to start proxy")?;

    if let Some(addr) = proxy.listen_addr() {
        info!(
            "periscope running: open http://{} to browse {} with instrumentation",
            addr,
            proxy.target_url()
        );
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to install ctrl-c handler")?;
    info!("shutting down");
    manager.shutdown().await;
    Ok(())
}
