// Chunk server state: stored chunks, held leases, and the checksum-keyed
// staging buffer pushed data lands in before `WriteChunk` commits it to
// disk. Background loops (health report, lease-expiry monitor) are spawned
// from `src/bin/chunkserver.rs`, the same split the teacher uses between
// `*_service.rs` state and a `send_heartbeat`-style spawned task.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use lru::LruCache;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{ChunkServerConfig, CommonConfig};
use crate::proto::master::master_client::MasterClient;
use crate::proto::master::{ChunkReport, ReportHealthRequest, RequestLeaseRenewalRequest};
use crate::types::{Chunk, ChunkId, LocalLease, ServerId};

pub type DataBuffer = LruCache<u32, Bytes>;

#[derive(Debug)]
pub struct ChunkService {
    pub id: ServerId,
    pub address: String,
    pub chunks: Arc<RwLock<HashMap<ChunkId, Chunk>>>,
    pub leases: Arc<RwLock<HashMap<ChunkId, LocalLease>>>,
    pub data_buffer: Arc<Mutex<DataBuffer>>,
    pub config: ChunkServerConfig,
    pub common_config: CommonConfig,
}

impl ChunkService {
    pub fn new(
        id: ServerId,
        address: String,
        config: ChunkServerConfig,
        common_config: CommonConfig,
    ) -> Self {
        let capacity = NonZeroUsize::new(common_config.data_buffer_capacity.max(1)).unwrap();
        Self {
            id,
            address,
            chunks: Arc::new(RwLock::new(HashMap::new())),
            leases: Arc::new(RwLock::new(HashMap::new())),
            data_buffer: Arc::new(Mutex::new(LruCache::new(capacity))),
            config,
            common_config,
        }
    }

    /// `{data_path}/{file_path}/{id}-{index}-{version}.chunk` (spec §6,
    /// "On-disk layout"). `file_path` is sanitized to a relative path so a
    /// file path like `/a/b` can't escape `data_path`.
    pub fn chunk_path(&self, file_path: &str, filename: &str) -> std::path::PathBuf {
        let relative = file_path.trim_start_matches('/');
        std::path::Path::new(&self.config.data_path)
            .join(relative)
            .join(filename)
    }
}

/// Periodically reports every locally held chunk to the master so holder
/// sets and liveness stay current (spec §4.2 heartbeat).
pub fn spawn_health_report(
    service: Arc<ChunkService>,
    master_addr: String,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = time::interval(Duration::from_secs(
            service.common_config.heartbeat_interval_secs,
        ));
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("health report loop stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let chunks: Vec<ChunkReport> = {
                let chunks = service.chunks.read().await;
                chunks
                    .values()
                    .map(|c| ChunkReport {
                        chunk_id: c.id.to_string(),
                        version: c.version,
                        index: c.index,
                    })
                    .collect()
            };

            match MasterClient::connect(format!("http://{}", master_addr)).await {
                Ok(mut client) => {
                    let request = ReportHealthRequest {
                        chunk_server_id: service.id.to_string(),
                        chunks,
                    };
                    if let Err(e) = client.report_health(request).await {
                        warn!("ReportHealth failed: {}", e);
                    }
                }
                Err(e) => warn!("failed to connect to master for health report: {}", e),
            }
        }
    });
}

/// Producer/consumer lease-expiry monitor: the producer polls held leases
/// every `lease_monitor_poll_ms`, removes any with `valid_until <= now`,
/// and queues the expired chunk ids; the consumer drains the queue and
/// requests renewal from the master, re-adding the lease on success.
pub fn spawn_lease_monitor(
    service: Arc<ChunkService>,
    master_addr: String,
    token: CancellationToken,
) {
    let (tx, mut rx) = mpsc::channel::<ChunkId>(64);

    {
        let service = Arc::clone(&service);
        let token = token.clone();
        tokio::spawn(async move {
            let mut ticker =
                time::interval(Duration::from_millis(service.common_config.lease_monitor_poll_ms));
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("lease monitor producer stopping");
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                let now = SystemTime::now();

                let expired: Vec<ChunkId> = {
                    let mut leases = service.leases.write().await;
                    let expired_ids: Vec<ChunkId> = leases
                        .values()
                        .filter(|lease| !lease.is_valid_at(now))
                        .map(|lease| lease.chunk_id)
                        .collect();
                    for id in &expired_ids {
                        leases.remove(id);
                    }
                    expired_ids
                };

                for chunk_id in expired {
                    if tx.send(chunk_id).await.is_err() {
                        return;
                    }
                }
            }
        });
    }

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("lease monitor consumer stopping");
                    return;
                }
                chunk_id = rx.recv() => {
                    let Some(chunk_id) = chunk_id else { return };
                    match MasterClient::connect(format!("http://{}", master_addr)).await {
                        Ok(mut client) => {
                            let request = RequestLeaseRenewalRequest {
                                chunk_id: chunk_id.to_string(),
                                chunk_server_id: service.id.to_string(),
                            };
                            match client.request_lease_renewal(request).await {
                                Ok(response) => {
                                    let response = response.into_inner();
                                    if response.granted {
                                        let valid_until = SystemTime::UNIX_EPOCH
                                            + Duration::from_secs(response.valid_until_unix_secs.max(0) as u64);
                                        service
                                            .leases
                                            .write()
                                            .await
                                            .insert(chunk_id, LocalLease { chunk_id, valid_until });
                                        info!("renewed lease for chunk {}", chunk_id);
                                    } else {
                                        warn!("lease renewal for chunk {} was not granted", chunk_id);
                                        service.leases.write().await.remove(&chunk_id);
                                    }
                                }
                                Err(e) => warn!("RequestLeaseRenewal failed for {}: {}", chunk_id, e),
                            }
                        }
                        Err(e) => warn!("failed to connect to master for lease renewal: {}", e),
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> ChunkService {
        ChunkService::new(
            ServerId::new(),
            "127.0.0.1:0".to_string(),
            ChunkServerConfig {
                data_path: "/tmp".to_string(),
                log_path: String::new(),
            },
            CommonConfig::default(),
        )
    }

    #[tokio::test]
    async fn data_buffer_evicts_least_recently_used_checksum() {
        let svc = service();
        let capacity = svc.common_config.data_buffer_capacity;
        let mut buffer = svc.data_buffer.lock().await;
        for i in 0..(capacity as u32 + 1) {
            buffer.put(i, Bytes::from(vec![0u8]));
        }
        assert_eq!(buffer.len(), capacity);
        assert!(!buffer.contains(&0));
    }

    #[tokio::test]
    async fn chunk_path_nests_under_sanitized_file_path() {
        let svc = service();
        let filename = Chunk::filename(ChunkId::new(), 0, 1);
        let path = svc.chunk_path("/a/b.txt", &filename);
        assert_eq!(path, std::path::Path::new("/tmp/a/b.txt").join(&filename));
    }
}
