// End-to-end write path: a real master and two real chunk servers, talking
// over loopback gRPC, driven through the same `FileClient` the `client`
// binary uses. Exercises create -> lease -> push -> commit -> fan-out in
// one pass, the way the teacher's repo never had the tests to confirm.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

use rustfs::chunkserver_service::{spawn_health_report, spawn_lease_monitor, ChunkService};
use rustfs::client_service::FileClient;
use rustfs::config::{ChunkServerConfig, CommonConfig, MasterConfig};
use rustfs::master_service::MasterService;
use rustfs::proto::chunk::chunk_server::ChunkServer;
use rustfs::proto::master::master_client::MasterClient;
use rustfs::proto::master::master_server::MasterServer;
use rustfs::proto::master::RegisterChunkServerRequest;

async fn spawn_master(common: CommonConfig) -> String {
    let master = Arc::new(MasterService::new(MasterConfig::default(), common));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        Server::builder()
            .add_service(MasterServer::new(master))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    addr
}

async fn spawn_chunk_server(
    master_addr: &str,
    data_dir: &std::path::Path,
    common: CommonConfig,
) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let mut master_client = MasterClient::connect(format!("http://{}", master_addr))
        .await
        .unwrap();
    let registration = master_client
        .register_chunk_server(RegisterChunkServerRequest {
            address: addr.clone(),
        })
        .await
        .unwrap()
        .into_inner();
    let id: rustfs::types::ServerId = registration.id.parse().unwrap();

    let service = Arc::new(ChunkService::new(
        id,
        addr.clone(),
        ChunkServerConfig {
            data_path: data_dir.to_string_lossy().to_string(),
            log_path: String::new(),
        },
        common,
    ));

    let token = tokio_util::sync::CancellationToken::new();
    spawn_health_report(Arc::clone(&service), master_addr.to_string(), token.clone());
    spawn_lease_monitor(Arc::clone(&service), master_addr.to_string(), token.clone());

    tokio::spawn(async move {
        Server::builder()
            .add_service(ChunkServer::new(Arc::clone(&service)))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    addr
}

fn contains_bytes(dir: &std::path::Path, needle: &[u8]) -> bool {
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            if contains_bytes(&path, needle) {
                return true;
            }
        } else if let Ok(contents) = std::fs::read(&path) {
            if contents.windows(needle.len()).any(|w| w == needle) {
                return true;
            }
        }
    }
    false
}

#[tokio::test]
async fn create_file_write_and_replicate_to_both_holders() {
    let mut common = CommonConfig::default();
    common.replication_factor = 2;
    common.chunk_size_bytes = 1024;

    let master_addr = spawn_master(common.clone()).await;

    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    spawn_chunk_server(&master_addr, dir_a.path(), common.clone()).await;
    spawn_chunk_server(&master_addr, dir_b.path(), common.clone()).await;

    let client = FileClient::connect(&master_addr, common.clone())
        .await
        .unwrap();
    client.create_file("/greeting", 10).await.unwrap();

    let written = client
        .write_file("/greeting", b"hello there", 0)
        .await
        .unwrap();
    assert_eq!(written, 11);

    // The primary applies the write locally and fans out ApplyMigration to
    // the other holder, so both replicas should end up with the bytes.
    assert!(contains_bytes(dir_a.path(), b"hello there"));
    assert!(contains_bytes(dir_b.path(), b"hello there"));
}

#[tokio::test]
async fn placement_fails_when_fewer_servers_than_replication_factor() {
    let mut common = CommonConfig::default();
    common.replication_factor = 2;

    let master_addr = spawn_master(common.clone()).await;

    let dir_a = tempfile::tempdir().unwrap();
    spawn_chunk_server(&master_addr, dir_a.path(), common.clone()).await;

    let client = FileClient::connect(&master_addr, common.clone())
        .await
        .unwrap();

    let err = client.create_file("/lonely", 10).await.unwrap_err();
    assert!(matches!(err, rustfs::errors::ClientError::Rpc(_)));
}
