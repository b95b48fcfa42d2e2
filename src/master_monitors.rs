// Background loops owned by the master: health check, replication monitor,
// deletion monitor, and garbage collector. Each loop is spawned from
// `src/bin/master.rs` and stops when its `CancellationToken` is cancelled,
// mirroring the teacher's `tokio::spawn` + `time::interval` ticker style
// (`master_service.rs::start_heartbeat_checker`) but split one task per
// responsibility instead of one monolithic cron task.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::master_service::MasterService;
use crate::proto::chunk::chunk_client::ChunkClient;
use crate::proto::chunk::{DeleteChunkRequest, ReplicateChunkRequest};
use crate::types::ChunkServerMetadata;

/// Marks chunk servers unhealthy/inactive when they go quiet, per
/// `healthcheck_threshold_secs` / `failed_healthcheck_limit`.
pub fn spawn_health_check(master: Arc<MasterService>, token: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = time::interval(Duration::from_secs(
            master.common_config.healthcheck_interval_secs,
        ));
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("health check loop stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let now = SystemTime::now();
            let threshold =
                Duration::from_secs(master.common_config.healthcheck_threshold_secs);
            let limit = master.common_config.failed_healthcheck_limit;

            let mut servers = master.servers.write().await;
            for server in servers.values_mut() {
                let silent = now
                    .duration_since(server.last_report)
                    .unwrap_or(Duration::ZERO)
                    >= threshold;

                if !silent {
                    continue;
                }

                server.healthy = false;
                server.failed_count += 1;
                if server.failed_count >= limit {
                    if server.active {
                        warn!(
                            "chunk server {} exceeded {} missed health checks, marking inactive",
                            server.id, limit
                        );
                    }
                    server.active = false;
                }
            }
        }
    });
}

/// Restores `replication_factor` for chunks that have fewer healthy holders
/// than required, by replicating from a surviving holder to freshly
/// selected servers.
pub fn spawn_replication_monitor(master: Arc<MasterService>, token: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = time::interval(Duration::from_secs(
            master.common_config.replication_monitor_interval_secs,
        ));
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("replication monitor stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let target = master.common_config.replication_factor;
            let under_replicated: Vec<(crate::types::ChunkId, HashSet<crate::types::ServerId>)> = {
                let chunks = master.chunks.read().await;
                chunks
                    .values()
                    .filter(|c| c.holders.len() < target)
                    .map(|c| (c.id, c.holders.clone()))
                    .collect()
            };

            for (chunk_id, holders) in under_replicated {
                let needed = target - holders.len();
                let source = {
                    let servers = master.servers.read().await;
                    holders
                        .iter()
                        .find_map(|id| servers.get(id).cloned())
                };
                let Some(source) = source else {
                    warn!(
                        "chunk {} is under-replicated with no surviving holder, deferring to gc",
                        chunk_id
                    );
                    continue;
                };

                let destinations = master.select_chunk_servers(needed, &holders).await;
                if destinations.is_empty() {
                    continue;
                }

                match replicate_chunk_rpc(&source, chunk_id, &destinations).await {
                    Ok(()) => {
                        let mut chunks = master.chunks.write().await;
                        if let Some(chunk) = chunks.get_mut(&chunk_id) {
                            for dest in &destinations {
                                chunk.holders.insert(dest.id);
                            }
                        }
                        info!(
                            "replicated chunk {} from {} to {} new holder(s)",
                            chunk_id,
                            source.address,
                            destinations.len()
                        );
                    }
                    Err(e) => warn!(
                        "failed to replicate chunk {} from {}: {}",
                        chunk_id, source.address, e
                    ),
                }
            }
        }
    });
}

/// Permanently drops file metadata for files soft-deleted longer than
/// `deletion_threshold_secs` ago. Chunk metadata is left for the GC.
pub fn spawn_deletion_monitor(master: Arc<MasterService>, token: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = time::interval(Duration::from_secs(
            master.common_config.deletion_monitor_interval_secs,
        ));
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("deletion monitor stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let now = SystemTime::now();
            let threshold = Duration::from_secs(master.common_config.deletion_threshold_secs);

            let mut files = master.files.write().await;
            let expired: Vec<String> = files
                .values()
                .filter(|f| {
                    f.deleted
                        && f.deleted_at
                            .map(|at| now.duration_since(at).unwrap_or(Duration::ZERO) >= threshold)
                            .unwrap_or(false)
                })
                .map(|f| f.path.clone())
                .collect();

            for path in expired {
                files.remove(&path);
                info!("reclaimed file metadata for '{}'", path);
            }
        }
    });
}

/// Deletes chunks whose parent file path no longer exists in the file
/// table — either because the file was fully reclaimed by the deletion
/// monitor, or because the chunk was left behind by a failed
/// `CreateNewFile` fan-out.
pub fn spawn_garbage_collector(master: Arc<MasterService>, token: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = time::interval(Duration::from_secs(master.common_config.gc_interval_secs));
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("garbage collector stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let orphaned: Vec<(crate::types::ChunkId, HashSet<crate::types::ServerId>)> = {
                let files = master.files.read().await;
                let chunks = master.chunks.read().await;
                chunks
                    .values()
                    .filter(|c| is_orphaned(&files, &c.file_path))
                    .map(|c| (c.id, c.holders.clone()))
                    .collect()
            };

            for (chunk_id, holders) in orphaned {
                let server_metadata: Vec<ChunkServerMetadata> = {
                    let servers = master.servers.read().await;
                    holders.iter().filter_map(|id| servers.get(id).cloned()).collect()
                };

                let mut all_deleted = true;
                for server in &server_metadata {
                    if let Err(e) = delete_chunk_rpc(server, chunk_id).await {
                        warn!(
                            "gc: failed to delete chunk {} on {}: {}",
                            chunk_id, server.address, e
                        );
                        all_deleted = false;
                    }
                }

                if all_deleted {
                    master.chunks.write().await.remove(&chunk_id);
                    info!("gc: reclaimed chunk {}", chunk_id);
                }
            }
        }
    });
}

/// A chunk is orphaned iff its parent file path no longer exists in the
/// file table. A soft-deleted-but-still-present file is not orphaned yet —
/// that's the deletion monitor's retention window, not the gc's to shorten.
fn is_orphaned(files: &HashMap<String, crate::types::FileMetadata>, file_path: &str) -> bool {
    !files.contains_key(file_path)
}

async fn replicate_chunk_rpc(
    source: &ChunkServerMetadata,
    chunk_id: crate::types::ChunkId,
    destinations: &[ChunkServerMetadata],
) -> Result<(), crate::errors::MasterError> {
    let mut client = ChunkClient::connect(format!("http://{}", source.address))
        .await
        .map_err(|e| crate::errors::MasterError::Transport(e.to_string()))?;

    client
        .replicate_chunk(ReplicateChunkRequest {
            chunk_id: chunk_id.to_string(),
            destinations: destinations
                .iter()
                .map(|d| crate::proto::chunk::ChunkServerRef {
                    id: d.id.to_string(),
                    address: d.address.clone(),
                })
                .collect(),
        })
        .await
        .map_err(|e| crate::errors::MasterError::Transport(e.to_string()))?;
    Ok(())
}

async fn delete_chunk_rpc(
    server: &ChunkServerMetadata,
    chunk_id: crate::types::ChunkId,
) -> Result<(), crate::errors::MasterError> {
    let mut client = ChunkClient::connect(format!("http://{}", server.address))
        .await
        .map_err(|e| crate::errors::MasterError::Transport(e.to_string()))?;
    client
        .delete_chunk(DeleteChunkRequest {
            chunk_id: chunk_id.to_string(),
        })
        .await
        .map_err(|e| crate::errors::MasterError::Transport(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommonConfig, MasterConfig};
    use crate::types::ChunkMetadata;

    fn master() -> Arc<MasterService> {
        Arc::new(MasterService::new(
            MasterConfig::default(),
            CommonConfig::default(),
        ))
    }

    #[tokio::test]
    async fn health_check_marks_silent_server_unhealthy_then_inactive() {
        let master = master();
        let id = master.register_chunk_server("a:1".to_string()).await;
        {
            let mut servers = master.servers.write().await;
            let server = servers.get_mut(&id).unwrap();
            server.last_report = SystemTime::now() - Duration::from_secs(1_000);
            server.failed_count = 2;
        }

        let now = SystemTime::now();
        let threshold = Duration::from_secs(master.common_config.healthcheck_threshold_secs);
        let limit = master.common_config.failed_healthcheck_limit;
        {
            let mut servers = master.servers.write().await;
            for server in servers.values_mut() {
                let silent = now.duration_since(server.last_report).unwrap_or(Duration::ZERO) >= threshold;
                if silent {
                    server.healthy = false;
                    server.failed_count += 1;
                    if server.failed_count >= limit {
                        server.active = false;
                    }
                }
            }
        }

        let servers = master.servers.read().await;
        let server = &servers[&id];
        assert!(!server.healthy);
        assert!(!server.active);
    }

    #[tokio::test]
    async fn deletion_monitor_reclaims_only_expired_deletes() {
        let master = master();
        {
            let mut files = master.files.write().await;
            let mut recent = crate::types::FileMetadata::new("/recent".to_string());
            recent.deleted = true;
            recent.deleted_at = Some(SystemTime::now());
            files.insert(recent.path.clone(), recent);

            let mut old = crate::types::FileMetadata::new("/old".to_string());
            old.deleted = true;
            old.deleted_at = Some(
                SystemTime::now()
                    - Duration::from_secs(master.common_config.deletion_threshold_secs + 10),
            );
            files.insert(old.path.clone(), old);
        }

        let now = SystemTime::now();
        let threshold = Duration::from_secs(master.common_config.deletion_threshold_secs);
        let mut files = master.files.write().await;
        let expired: Vec<String> = files
            .values()
            .filter(|f| {
                f.deleted
                    && f.deleted_at
                        .map(|at| now.duration_since(at).unwrap_or(Duration::ZERO) >= threshold)
                        .unwrap_or(false)
            })
            .map(|f| f.path.clone())
            .collect();
        for path in &expired {
            files.remove(path);
        }

        assert!(!files.contains_key("/old"));
        assert!(files.contains_key("/recent"));
    }

    #[tokio::test]
    async fn gc_treats_chunk_with_no_file_entry_as_orphaned() {
        let master = master();
        let chunk_id = crate::types::ChunkId::new();
        master.chunks.write().await.insert(
            chunk_id,
            ChunkMetadata::new(chunk_id, 0, "/never-created".to_string(), 1, HashSet::new()),
        );

        let files = master.files.read().await;
        assert!(is_orphaned(&files, "/never-created"));
    }

    #[tokio::test]
    async fn gc_does_not_treat_soft_deleted_but_present_file_as_orphaned() {
        let master = master();
        {
            let mut files = master.files.write().await;
            let mut deleted = crate::types::FileMetadata::new("/soon-gone".to_string());
            deleted.deleted = true;
            deleted.deleted_at = Some(SystemTime::now());
            files.insert(deleted.path.clone(), deleted);
        }

        let files = master.files.read().await;
        assert!(!is_orphaned(&files, "/soon-gone"));
    }
}
