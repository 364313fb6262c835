use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use hyper::Client;

mod backend;
mod config;
mod frontend;
mod serverpool;

use config::LbConfig;
use frontend::Frontend;
use serverpool::RetentionRouter;

#[derive(Parser)]
#[command(
    name = "tsdb-lb",
    version,
    about = "Retention-aware load balancer for TSDB read queries."
)]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:9030")]
    web_listen_address: SocketAddr,

    /// Path of the cluster pool configuration file.
    #[arg(long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = LbConfig::load(&cli.config).context("could not load the cluster pool configuration")?;
    let pool = Arc::new(config.build_pool(Client::new())?);
    log::info!(
        "pool ready: {} backends across {} clusters",
        pool.all_backends().count(),
        config.clusters.len()
    );

    tokio::spawn(backend::probe_loop(Arc::clone(&pool), config.probe_interval));

    let frontend = Arc::new(Frontend::new(RetentionRouter::new(pool), config.retry_count));
    frontend::run(cli.web_listen_address, frontend).await
}
