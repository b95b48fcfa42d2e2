use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::info;

use rustfs::chunkserver_service::{spawn_health_report, spawn_lease_monitor, ChunkService};
use rustfs::config::load_config;
use rustfs::proto::chunk::chunk_server::ChunkServer;
use rustfs::proto::master::master_client::MasterClient;
use rustfs::proto::master::RegisterChunkServerRequest;
use rustfs::types::ServerId;
use rustfs::util::init_tracing;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "config.toml")]
    config: String,
    #[arg(long)]
    address: String,
    #[arg(long)]
    master_address: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args.config)?;

    let _guard = init_tracing(
        &config.common.log_level,
        &config.common.log_output,
        "chunkserver.log",
    );

    let mut master_client =
        MasterClient::connect(format!("http://{}", args.master_address)).await?;
    let registration = master_client
        .register_chunk_server(RegisterChunkServerRequest {
            address: args.address.clone(),
        })
        .await?
        .into_inner();
    let id: ServerId = registration.id.parse()?;

    info!("registered with master as {}", id);

    let service = Arc::new(ChunkService::new(
        id,
        args.address.clone(),
        config.chunkserver,
        config.common,
    ));
    tokio::fs::create_dir_all(&service.config.data_path).await?;

    let token = CancellationToken::new();
    spawn_health_report(Arc::clone(&service), args.master_address.clone(), token.clone());
    spawn_lease_monitor(Arc::clone(&service), args.master_address.clone(), token.clone());

    let addr = args.address.parse()?;
    info!("chunk server listening on {}", addr);

    Server::builder()
        .add_service(ChunkServer::new(Arc::clone(&service)))
        .serve(addr)
        .await?;

    token.cancel();
    Ok(())
}
