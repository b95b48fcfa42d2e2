use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::info;

use rustfs::config::load_config;
use rustfs::master_monitors::{
    spawn_deletion_monitor, spawn_garbage_collector, spawn_health_check, spawn_replication_monitor,
};
use rustfs::master_service::MasterService;
use rustfs::proto::master::master_server::MasterServer;
use rustfs::util::init_tracing;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args.config)?;

    let _guard = init_tracing(
        &config.common.log_level,
        &config.common.log_output,
        "master.log",
    );

    let master = Arc::new(MasterService::new(config.master.clone(), config.common));
    let token = CancellationToken::new();

    spawn_health_check(Arc::clone(&master), token.clone());
    spawn_replication_monitor(Arc::clone(&master), token.clone());
    spawn_deletion_monitor(Arc::clone(&master), token.clone());
    spawn_garbage_collector(Arc::clone(&master), token.clone());

    let addr = master.config.address.parse()?;
    info!("master listening on {}", addr);

    Server::builder()
        .add_service(MasterServer::new(master))
        .serve(addr)
        .await?;

    token.cancel();
    Ok(())
}
