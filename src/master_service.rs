// Master state and write-path/placement/lease logic. The gRPC trait impl
// (`master_impl.rs`) is a thin translation layer over these methods, the
// same split the teacher uses between `master_service.rs` and `master_impl.rs`.

use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{CommonConfig, MasterConfig};
use crate::errors::MasterError;
use crate::proto::chunk::chunk_client::ChunkClient;
use crate::proto::chunk::{CreateChunkRequest, GrantLeaseRequest, IncrementChunkVersionRequest};
use crate::types::{ChunkId, ChunkMetadata, ChunkServerMetadata, FileMetadata, Lease, ServerId};

#[derive(Debug, Default)]
pub struct MasterService {
    pub files: Arc<RwLock<HashMap<String, FileMetadata>>>,
    pub chunks: Arc<RwLock<HashMap<ChunkId, ChunkMetadata>>>,
    pub servers: Arc<RwLock<HashMap<ServerId, ChunkServerMetadata>>>,
    pub leases: Arc<RwLock<HashMap<ChunkId, Lease>>>,
    pub config: MasterConfig,
    pub common_config: CommonConfig,
}

impl MasterService {
    pub fn new(config: MasterConfig, common_config: CommonConfig) -> Self {
        Self {
            files: Arc::new(RwLock::new(HashMap::new())),
            chunks: Arc::new(RwLock::new(HashMap::new())),
            servers: Arc::new(RwLock::new(HashMap::new())),
            leases: Arc::new(RwLock::new(HashMap::new())),
            config,
            common_config,
        }
    }

    /// Registers a fresh chunk server. Idempotent across re-registrations:
    /// each call issues a new id; the old record ages out via health check.
    pub async fn register_chunk_server(&self, address: String) -> ServerId {
        let id = ServerId::new();
        let metadata = ChunkServerMetadata::new(id, address.clone(), SystemTime::now());

        let mut servers = self.servers.write().await;
        servers.insert(id, metadata);
        info!("Registered chunk server '{}' at {}", id, address);

        id
    }

    /// Deterministically selects up to `n` active servers whose id is not
    /// in `exclude` and whose current chunk load is below
    /// `max_allowed_chunks`. Order is the servers' uuid byte order, so that
    /// selection is reproducible for a given map snapshot (spec §9,
    /// "Placement determinism").
    pub async fn select_chunk_servers(
        &self,
        n: usize,
        exclude: &HashSet<ServerId>,
    ) -> Vec<ChunkServerMetadata> {
        let max_allowed_chunks = self.common_config.max_allowed_chunks;
        let load = self.chunk_load_by_server().await;

        let servers = self.servers.read().await;
        let mut candidates: Vec<&ChunkServerMetadata> = servers
            .values()
            .filter(|s| {
                s.active
                    && !exclude.contains(&s.id)
                    && load.get(&s.id).copied().unwrap_or(0) < max_allowed_chunks
            })
            .collect();
        candidates.sort_by_key(|s| s.id.0);
        candidates.into_iter().take(n).cloned().collect()
    }

    /// Number of chunks currently held by each server, used to cap
    /// placement load at `max_allowed_chunks`.
    async fn chunk_load_by_server(&self) -> HashMap<ServerId, usize> {
        let chunks = self.chunks.read().await;
        let mut load = HashMap::new();
        for chunk in chunks.values() {
            for holder in &chunk.holders {
                *load.entry(*holder).or_insert(0) += 1;
            }
        }
        load
    }

    /// Creates a new file: allocates chunks, places replicas, and issues
    /// `CreateChunk` to every selected server. Chunk metadata is recorded
    /// as each chunk's fan-out completes; file metadata is only published
    /// if every chunk's fan-out fully succeeded, so a failed creation
    /// leaves behind orphaned chunk metadata the GC will reclaim (spec §4.1).
    pub async fn create_new_file(
        &self,
        path: String,
        size: u64,
    ) -> Result<(FileMetadata, Vec<ServerId>), MasterError> {
        {
            let files = self.files.read().await;
            if files.contains_key(&path) {
                return Err(MasterError::FileExists);
            }
        }

        let num_chunks = if size == 0 {
            0
        } else {
            (size + self.common_config.chunk_size_bytes - 1) / self.common_config.chunk_size_bytes
        };

        let replication_factor = self.common_config.replication_factor;
        let mut file_metadata = FileMetadata::new(path.clone());
        let mut all_server_ids: HashSet<ServerId> = HashSet::new();
        let mut fully_succeeded = true;

        for index in 0..num_chunks {
            let selected = self
                .select_chunk_servers(replication_factor, &HashSet::new())
                .await;
            if selected.len() < replication_factor {
                return Err(MasterError::PlacementExhausted);
            }

            let chunk_id = ChunkId::new();
            let mut holders = HashSet::new();

            for server in &selected {
                match create_chunk_rpc(
                    server,
                    chunk_id,
                    &path,
                    index,
                    self.common_config.initial_chunk_version,
                    self.common_config.chunk_size_bytes,
                )
                .await
                {
                    Ok(()) => {
                        holders.insert(server.id);
                        all_server_ids.insert(server.id);
                    }
                    Err(e) => {
                        warn!(
                            "CreateChunk failed on {} for chunk {}: {}",
                            server.address, chunk_id, e
                        );
                        fully_succeeded = false;
                    }
                }
            }

            let metadata = ChunkMetadata::new(
                chunk_id,
                index,
                path.clone(),
                self.common_config.initial_chunk_version,
                holders,
            );
            self.chunks.write().await.insert(chunk_id, metadata);
            file_metadata.chunks.push(chunk_id);
        }

        if !fully_succeeded {
            return Err(MasterError::FileCreation);
        }

        self.files
            .write()
            .await
            .insert(path, file_metadata.clone());

        Ok((file_metadata, all_server_ids.into_iter().collect()))
    }

    /// Marks a file deleted. Chunks and chunk metadata are left intact
    /// until the deletion monitor, then the GC, reclaim them.
    pub async fn delete_file(&self, path: &str) -> Result<(), MasterError> {
        let mut files = self.files.write().await;
        let file = files.get_mut(path).ok_or(MasterError::FileNotFound)?;
        file.deleted = true;
        file.deleted_at = Some(SystemTime::now());
        Ok(())
    }

    pub async fn get_file_chunks(&self, path: &str) -> Result<Vec<ChunkId>, MasterError> {
        let files = self.files.read().await;
        let file = files.get(path).ok_or(MasterError::FileNotFound)?;
        Ok(file.chunks.clone())
    }

    /// Grants or reuses a write lease for `chunk_id`, bumps the chunk's
    /// recorded version, and propagates the bump to every current holder.
    /// A holder whose bump RPC fails is dropped from the holder set rather
    /// than aborting the whole call (spec §9, "RequestWrite version-bump
    /// fan-out").
    pub async fn request_write(
        &self,
        chunk_id: ChunkId,
    ) -> Result<(ChunkId, Lease, Vec<ChunkServerMetadata>, u64), MasterError> {
        let holder_ids: Vec<ServerId> = {
            let chunks = self.chunks.read().await;
            let chunk = chunks.get(&chunk_id).ok_or(MasterError::ChunkNotFound)?;
            chunk.holders.iter().copied().collect()
        };

        if holder_ids.is_empty() {
            return Err(MasterError::ChunkHolderNotFound);
        }

        let new_version = {
            let mut chunks = self.chunks.write().await;
            let chunk = chunks.get_mut(&chunk_id).ok_or(MasterError::ChunkNotFound)?;
            chunk.version += 1;
            chunk.version
        };

        let now = SystemTime::now();
        let existing_lease = { self.leases.read().await.get(&chunk_id).copied() };

        let lease = match existing_lease {
            Some(lease) if lease.is_valid_at(now) => lease,
            _ => {
                let holder = *holder_ids
                    .choose(&mut rand::thread_rng())
                    .ok_or(MasterError::ChunkHolderNotFound)?;
                let lease = Lease {
                    chunk_id,
                    holder,
                    valid_until: now + Duration::from_secs(self.common_config.lease_duration_secs),
                };
                self.leases.write().await.insert(chunk_id, lease);

                let holder_metadata = {
                    let servers = self.servers.read().await;
                    servers
                        .get(&holder)
                        .cloned()
                        .ok_or(MasterError::ChunkServerNotFound)?
                };
                if let Err(e) = grant_lease_rpc(&holder_metadata, chunk_id, lease.valid_until).await
                {
                    warn!("GrantLease failed on {}: {}", holder_metadata.address, e);
                }

                lease
            }
        };

        let mut stale_holders = HashSet::new();
        for holder_id in &holder_ids {
            let holder_metadata = {
                let servers = self.servers.read().await;
                servers.get(holder_id).cloned()
            };
            let Some(holder_metadata) = holder_metadata else {
                stale_holders.insert(*holder_id);
                continue;
            };

            if let Err(e) = increment_chunk_version_rpc(&holder_metadata, chunk_id, new_version).await
            {
                warn!(
                    "IncrementChunkVersion failed on {} for chunk {}: {} — dropping from holder set",
                    holder_metadata.address, chunk_id, e
                );
                stale_holders.insert(*holder_id);
            }
        }

        if !stale_holders.is_empty() {
            let mut chunks = self.chunks.write().await;
            if let Some(chunk) = chunks.get_mut(&chunk_id) {
                for stale in &stale_holders {
                    chunk.holders.remove(stale);
                }
            }
        }

        let remaining_holders: Vec<ServerId> = holder_ids
            .into_iter()
            .filter(|id| !stale_holders.contains(id))
            .collect();

        let holder_metadata = {
            let servers = self.servers.read().await;
            remaining_holders
                .iter()
                .filter_map(|id| servers.get(id).cloned())
                .collect::<Vec<_>>()
        };

        Ok((chunk_id, lease, holder_metadata, new_version))
    }

    /// Extends an existing lease if `server_id` is its current holder.
    pub async fn request_lease_renewal(
        &self,
        chunk_id: ChunkId,
        server_id: ServerId,
    ) -> Result<Lease, MasterError> {
        let mut leases = self.leases.write().await;
        let lease = leases.get(&chunk_id).ok_or(MasterError::LeaseNotFound)?;

        if lease.holder != server_id {
            return Err(MasterError::LeaseNotPreviouslyOwned);
        }

        let renewed = Lease {
            chunk_id,
            holder: server_id,
            valid_until: SystemTime::now()
                + Duration::from_secs(self.common_config.lease_duration_secs),
        };
        leases.insert(chunk_id, renewed);
        Ok(renewed)
    }

    /// Reconciles a chunk server's reported chunk set against the master's
    /// holder sets: presence in the report implies membership, absence
    /// implies removal (spec §9, "Holder-set growth on heartbeat").
    pub async fn report_health(
        &self,
        server_id: ServerId,
        reported: &[(ChunkId, u64, u64)],
    ) -> Result<(), MasterError> {
        {
            let mut servers = self.servers.write().await;
            let server = servers
                .get_mut(&server_id)
                .ok_or(MasterError::ChunkServerNotFound)?;
            server.healthy = true;
            server.active = true;
            server.failed_count = 0;
            server.last_report = SystemTime::now();
        }

        let reported_ids: HashSet<ChunkId> = reported.iter().map(|(id, _, _)| *id).collect();

        let mut chunks = self.chunks.write().await;
        for (chunk_id, _version, _index) in reported {
            if let Some(chunk) = chunks.get_mut(chunk_id) {
                chunk.holders.insert(server_id);
            } else {
                debug!(
                    "ReportHealth from {} references unknown chunk {}",
                    server_id, chunk_id
                );
            }
        }
        for chunk in chunks.values_mut() {
            if chunk.holders.contains(&server_id) && !reported_ids.contains(&chunk.id) {
                chunk.holders.remove(&server_id);
            }
        }

        Ok(())
    }
}

async fn connect(address: &str) -> Result<ChunkClient<tonic::transport::Channel>, MasterError> {
    ChunkClient::connect(format!("http://{}", address))
        .await
        .map_err(|e| MasterError::Transport(e.to_string()))
}

pub async fn create_chunk_rpc(
    server: &ChunkServerMetadata,
    chunk_id: ChunkId,
    file_path: &str,
    index: u64,
    version: u64,
    size: u64,
) -> Result<(), MasterError> {
    let mut client = connect(&server.address).await?;
    client
        .create_chunk(CreateChunkRequest {
            chunk_id: chunk_id.to_string(),
            file_path: file_path.to_string(),
            index,
            version,
            size,
        })
        .await
        .map_err(|e| MasterError::Transport(e.to_string()))?;
    Ok(())
}

pub async fn grant_lease_rpc(
    server: &ChunkServerMetadata,
    chunk_id: ChunkId,
    valid_until: SystemTime,
) -> Result<(), MasterError> {
    let mut client = connect(&server.address).await?;
    let valid_until_unix_secs = valid_until
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    client
        .grant_lease(GrantLeaseRequest {
            chunk_id: chunk_id.to_string(),
            valid_until_unix_secs,
        })
        .await
        .map_err(|e| MasterError::Transport(e.to_string()))?;
    Ok(())
}

pub async fn increment_chunk_version_rpc(
    server: &ChunkServerMetadata,
    chunk_id: ChunkId,
    version: u64,
) -> Result<(), MasterError> {
    let mut client = connect(&server.address).await?;
    client
        .increment_chunk_version(IncrementChunkVersionRequest {
            chunk_id: chunk_id.to_string(),
            version,
        })
        .await
        .map_err(|e| MasterError::Transport(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> MasterService {
        MasterService::new(MasterConfig::default(), CommonConfig::default())
    }

    #[tokio::test]
    async fn create_new_file_size_zero_allocates_zero_chunks() {
        let svc = service();
        // No chunk servers registered: a zero-size file still needs zero
        // placements, so creation must succeed without contacting anyone.
        let (file, _) = svc.create_new_file("/a".to_string(), 0).await.unwrap();
        assert_eq!(file.chunks.len(), 0);
    }

    #[tokio::test]
    async fn create_new_file_fails_with_fewer_active_servers_than_replication_factor() {
        let svc = service();
        // replication_factor defaults to 3; register only 2 servers.
        svc.register_chunk_server("a:1".to_string()).await;
        svc.register_chunk_server("b:1".to_string()).await;

        let err = svc.create_new_file("/a".to_string(), 1).await.unwrap_err();
        assert!(matches!(err, MasterError::PlacementExhausted));
    }

    #[tokio::test]
    async fn select_chunk_servers_excludes_inactive_and_excluded() {
        let svc = service();
        let a = svc.register_chunk_server("a:1".to_string()).await;
        let b = svc.register_chunk_server("b:1".to_string()).await;
        {
            let mut servers = svc.servers.write().await;
            servers.get_mut(&a).unwrap().active = false;
        }
        let mut exclude = HashSet::new();
        exclude.insert(b);
        let selected = svc.select_chunk_servers(5, &exclude).await;
        assert!(selected.is_empty());
    }

    #[tokio::test]
    async fn select_chunk_servers_is_deterministic_for_snapshot() {
        let svc = service();
        svc.register_chunk_server("a:1".to_string()).await;
        svc.register_chunk_server("b:1".to_string()).await;
        svc.register_chunk_server("c:1".to_string()).await;

        let first = svc.select_chunk_servers(2, &HashSet::new()).await;
        let second = svc.select_chunk_servers(2, &HashSet::new()).await;
        assert_eq!(
            first.iter().map(|s| s.id).collect::<Vec<_>>(),
            second.iter().map(|s| s.id).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn select_chunk_servers_excludes_servers_at_max_allowed_chunks() {
        let mut config = CommonConfig::default();
        config.max_allowed_chunks = 1;
        let svc = MasterService::new(MasterConfig::default(), config);

        let loaded = svc.register_chunk_server("a:1".to_string()).await;
        let free = svc.register_chunk_server("b:1".to_string()).await;

        let chunk_id = ChunkId::new();
        let mut holders = HashSet::new();
        holders.insert(loaded);
        svc.chunks
            .write()
            .await
            .insert(chunk_id, ChunkMetadata::new(chunk_id, 0, "/a".to_string(), 1, holders));

        let selected = svc.select_chunk_servers(2, &HashSet::new()).await;
        assert_eq!(selected.iter().map(|s| s.id).collect::<Vec<_>>(), vec![free]);
    }

    #[tokio::test]
    async fn request_write_fails_when_chunk_has_no_holders() {
        let svc = service();
        let chunk_id = ChunkId::new();
        svc.chunks.write().await.insert(
            chunk_id,
            ChunkMetadata::new(chunk_id, 0, "/a".to_string(), 1, HashSet::new()),
        );

        let err = svc.request_write(chunk_id).await.unwrap_err();
        assert!(matches!(err, MasterError::ChunkHolderNotFound));
    }

    #[tokio::test]
    async fn request_lease_renewal_rejects_non_holder() {
        let svc = service();
        let chunk_id = ChunkId::new();
        let holder = ServerId::new();
        let other = ServerId::new();
        svc.leases.write().await.insert(
            chunk_id,
            Lease {
                chunk_id,
                holder,
                valid_until: SystemTime::now() + Duration::from_secs(60),
            },
        );

        let err = svc
            .request_lease_renewal(chunk_id, other)
            .await
            .unwrap_err();
        assert!(matches!(err, MasterError::LeaseNotPreviouslyOwned));
    }

    #[tokio::test]
    async fn report_health_adds_and_removes_holders_by_presence() {
        let svc = service();
        let server_id = svc.register_chunk_server("a:1".to_string()).await;
        let chunk_a = ChunkId::new();
        let chunk_b = ChunkId::new();
        svc.chunks.write().await.insert(
            chunk_a,
            ChunkMetadata::new(chunk_a, 0, "/a".to_string(), 1, HashSet::new()),
        );
        let mut holders_b = HashSet::new();
        holders_b.insert(server_id);
        svc.chunks.write().await.insert(
            chunk_b,
            ChunkMetadata::new(chunk_b, 0, "/b".to_string(), 1, holders_b),
        );

        // Server now reports only chunk_a: chunk_a gains the holder,
        // chunk_b loses it.
        svc.report_health(server_id, &[(chunk_a, 1, 0)])
            .await
            .unwrap();

        let chunks = svc.chunks.read().await;
        assert!(chunks[&chunk_a].holders.contains(&server_id));
        assert!(!chunks[&chunk_b].holders.contains(&server_id));
    }
}
