// Implements the gRPC server behavior defined in the Chunk trait.
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tonic::{Request, Response, Status};
use tracing::{info, warn};

use crate::chunkserver_service::ChunkService;
use crate::errors::ChunkServerError;
use crate::proto::chunk::chunk_client::ChunkClient;
use crate::proto::chunk::chunk_server::Chunk;
use crate::proto::chunk::{
    ApplyMigrationRequest, ApplyMigrationResponse, CreateChunkRequest, CreateChunkResponse,
    DeleteChunkRequest, DeleteChunkResponse, GrantLeaseRequest, GrantLeaseResponse,
    IncrementChunkVersionRequest, IncrementChunkVersionResponse, ReplicateChunkRequest,
    ReplicateChunkResponse, TransferDataRequest, TransferDataResponse, WriteChunkRequest,
    WriteChunkResponse,
};
use crate::types::{self, ChunkId};
use crate::util::checksum;

fn parse_chunk_id(raw: &str) -> Result<ChunkId, Status> {
    raw.parse()
        .map_err(|_| Status::invalid_argument(format!("invalid chunk id '{}'", raw)))
}

#[tonic::async_trait]
impl Chunk for Arc<ChunkService> {
    async fn create_chunk(
        &self,
        request: Request<CreateChunkRequest>,
    ) -> Result<Response<CreateChunkResponse>, Status> {
        let request = request.into_inner();
        let chunk_id = parse_chunk_id(&request.chunk_id)?;

        {
            let chunks = self.chunks.read().await;
            if chunks.contains_key(&chunk_id) {
                return Err(ChunkServerError::ChunkAlreadyExists.into());
            }
        }

        let filename = types::Chunk::filename(chunk_id, request.index, request.version);
        let path = self.chunk_path(&request.file_path, &filename);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(ChunkServerError::Io)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(ChunkServerError::Io)?;
        drop(file);

        let chunk = types::Chunk {
            id: chunk_id,
            index: request.index,
            version: request.version,
            path,
            file_path: request.file_path,
        };

        info!("created chunk {} at index {}", chunk_id, chunk.index);
        self.chunks.write().await.insert(chunk_id, chunk);

        Ok(Response::new(CreateChunkResponse {
            chunk_id: chunk_id.to_string(),
            version: request.version,
            index: request.index,
        }))
    }

    async fn delete_chunk(
        &self,
        request: Request<DeleteChunkRequest>,
    ) -> Result<Response<DeleteChunkResponse>, Status> {
        let chunk_id = parse_chunk_id(&request.into_inner().chunk_id)?;

        let chunk = self.chunks.write().await.remove(&chunk_id);
        if let Some(chunk) = chunk {
            if let Err(e) = tokio::fs::remove_file(&chunk.path).await {
                warn!("failed to remove chunk file {:?}: {}", chunk.path, e);
            }
            self.leases.write().await.remove(&chunk_id);
            info!("deleted chunk {}", chunk_id);
            Ok(Response::new(DeleteChunkResponse {}))
        } else {
            Err(ChunkServerError::ChunkDoesNotExist.into())
        }
    }

    async fn grant_lease(
        &self,
        request: Request<GrantLeaseRequest>,
    ) -> Result<Response<GrantLeaseResponse>, Status> {
        let request = request.into_inner();
        let chunk_id = parse_chunk_id(&request.chunk_id)?;
        let valid_until =
            SystemTime::UNIX_EPOCH + Duration::from_secs(request.valid_until_unix_secs.max(0) as u64);

        self.leases.write().await.insert(
            chunk_id,
            types::LocalLease {
                chunk_id,
                valid_until,
            },
        );
        info!("granted lease for chunk {}", chunk_id);

        Ok(Response::new(GrantLeaseResponse {}))
    }

    /// Validates the requested version against the chunk's current version
    /// before renaming its backing file — validating first closes the
    /// window where a rejected bump could still leave the file renamed.
    async fn increment_chunk_version(
        &self,
        request: Request<IncrementChunkVersionRequest>,
    ) -> Result<Response<IncrementChunkVersionResponse>, Status> {
        let request = request.into_inner();
        let chunk_id = parse_chunk_id(&request.chunk_id)?;

        let mut chunks = self.chunks.write().await;
        let chunk = chunks
            .get_mut(&chunk_id)
            .ok_or(ChunkServerError::ChunkDoesNotExist)?;

        if request.version != chunk.version + 1 {
            return Err(ChunkServerError::ChunkVersionMismatch.into());
        }

        let new_filename = types::Chunk::filename(chunk_id, chunk.index, request.version);
        let new_path = self.chunk_path(&chunk.file_path, &new_filename);
        tokio::fs::rename(&chunk.path, &new_path)
            .await
            .map_err(ChunkServerError::Io)?;

        chunk.version = request.version;
        chunk.path = new_path;

        Ok(Response::new(IncrementChunkVersionResponse {}))
    }

    async fn transfer_data(
        &self,
        request: Request<TransferDataRequest>,
    ) -> Result<Response<TransferDataResponse>, Status> {
        let request = request.into_inner();
        let computed = checksum(&request.data);
        if computed != request.checksum {
            return Err(ChunkServerError::ChecksumMismatch.into());
        }

        let num_bytes_received = request.data.len() as u64;
        self.data_buffer
            .lock()
            .await
            .put(request.checksum, request.data.into());

        Ok(Response::new(TransferDataResponse {
            num_bytes_received,
        }))
    }

    /// Primary-side write: validates the lease and version, applies the
    /// buffered data locally, then forwards the same write to every
    /// secondary via `ApplyMigration`.
    async fn write_chunk(
        &self,
        request: Request<WriteChunkRequest>,
    ) -> Result<Response<WriteChunkResponse>, Status> {
        let request = request.into_inner();
        let chunk_id = parse_chunk_id(&request.chunk_id)?;

        {
            let leases = self.leases.read().await;
            let lease = leases
                .get(&chunk_id)
                .ok_or(ChunkServerError::ChunkLeaseNotFound)?;
            if !lease.is_valid_at(SystemTime::now()) {
                return Err(ChunkServerError::ChunkLeaseNotFound.into());
            }
        }

        let bytes_written = apply_write(self, chunk_id, request.checksum, request.offset, request.version).await?;

        for server in &request.chunk_servers {
            if server.id == self.id.to_string() {
                continue;
            }
            let server = server.clone();
            let migration = ApplyMigrationRequest {
                chunk_id: request.chunk_id.clone(),
                checksum: request.checksum,
                offset: request.offset,
                version: request.version,
            };
            match ChunkClient::connect(format!("http://{}", server.address)).await {
                Ok(mut client) => {
                    if let Err(e) = client.apply_migration(migration).await {
                        warn!(
                            "ApplyMigration failed on secondary {}: {}",
                            server.address, e
                        );
                    }
                }
                Err(e) => warn!("failed to connect to secondary {}: {}", server.address, e),
            }
        }

        Ok(Response::new(WriteChunkResponse { bytes_written }))
    }

    /// Secondary-side write: applies buffered data without further fan-out.
    async fn apply_migration(
        &self,
        request: Request<ApplyMigrationRequest>,
    ) -> Result<Response<ApplyMigrationResponse>, Status> {
        let request = request.into_inner();
        let chunk_id = parse_chunk_id(&request.chunk_id)?;

        let bytes_written = apply_write(self, chunk_id, request.checksum, request.offset, request.version).await?;

        Ok(Response::new(ApplyMigrationResponse { bytes_written }))
    }

    async fn replicate_chunk(
        &self,
        request: Request<ReplicateChunkRequest>,
    ) -> Result<Response<ReplicateChunkResponse>, Status> {
        let request = request.into_inner();
        let chunk_id = parse_chunk_id(&request.chunk_id)?;

        let chunk = {
            let chunks = self.chunks.read().await;
            chunks
                .get(&chunk_id)
                .cloned()
                .ok_or(ChunkServerError::ChunkDoesNotExist)?
        };

        let mut data = Vec::new();
        tokio::fs::File::open(&chunk.path)
            .await
            .map_err(ChunkServerError::Io)?
            .read_to_end(&mut data)
            .await
            .map_err(ChunkServerError::Io)?;
        let data_checksum = checksum(&data);

        for destination in &request.destinations {
            let mut client = match ChunkClient::connect(format!("http://{}", destination.address)).await
            {
                Ok(client) => client,
                Err(e) => {
                    warn!(
                        "failed to connect to replication destination {}: {}",
                        destination.address, e
                    );
                    continue;
                }
            };

            if let Err(e) = client
                .create_chunk(CreateChunkRequest {
                    chunk_id: chunk_id.to_string(),
                    file_path: chunk.file_path.clone(),
                    index: chunk.index,
                    version: chunk.version,
                    size: data.len() as u64,
                })
                .await
            {
                warn!(
                    "CreateChunk during replication failed on {}: {}",
                    destination.address, e
                );
                continue;
            }

            if let Err(e) = client
                .transfer_data(TransferDataRequest {
                    checksum: data_checksum,
                    data: data.clone(),
                })
                .await
            {
                warn!(
                    "TransferData during replication failed on {}: {}",
                    destination.address, e
                );
                continue;
            }

            if let Err(e) = client
                .apply_migration(ApplyMigrationRequest {
                    chunk_id: chunk_id.to_string(),
                    checksum: data_checksum,
                    offset: 0,
                    version: chunk.version,
                })
                .await
            {
                warn!(
                    "ApplyMigration during replication failed on {}: {}",
                    destination.address, e
                );
            }
        }

        Ok(Response::new(ReplicateChunkResponse {}))
    }
}

/// Shared by `write_chunk` and `apply_migration`: pulls the pushed data out
/// of the buffer by its checksum and writes it to the chunk's file at
/// `offset`, after checking the chunk's on-disk version matches.
async fn apply_write(
    service: &ChunkService,
    chunk_id: ChunkId,
    data_checksum: u32,
    offset: u64,
    version: u64,
) -> Result<u64, Status> {
    let path = {
        let chunks = service.chunks.read().await;
        let chunk = chunks
            .get(&chunk_id)
            .ok_or(ChunkServerError::ChunkDoesNotExist)?;
        if chunk.version != version {
            return Err(ChunkServerError::ChunkVersionMismatch.into());
        }
        chunk.path.clone()
    };

    let data = {
        let mut buffer = service.data_buffer.lock().await;
        buffer
            .pop(&data_checksum)
            .ok_or(ChunkServerError::DataNotFoundInCache)?
    };

    let mut file = OpenOptions::new()
        .write(true)
        .open(&path)
        .await
        .map_err(ChunkServerError::Io)?;
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(ChunkServerError::Io)?;
    file.write_all(&data).await.map_err(ChunkServerError::Io)?;

    Ok(data.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChunkServerConfig, CommonConfig};
    use crate::proto::chunk::ChunkServerRef;
    use crate::types::ServerId;

    fn service(data_path: &std::path::Path) -> Arc<ChunkService> {
        Arc::new(ChunkService::new(
            ServerId::new(),
            "127.0.0.1:0".to_string(),
            ChunkServerConfig {
                data_path: data_path.to_string_lossy().to_string(),
                log_path: String::new(),
            },
            CommonConfig::default(),
        ))
    }

    async fn create(svc: &Arc<ChunkService>, chunk_id: ChunkId, version: u64) {
        svc.create_chunk(Request::new(CreateChunkRequest {
            chunk_id: chunk_id.to_string(),
            file_path: "/f".to_string(),
            index: 0,
            version,
            size: 0,
        }))
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn create_chunk_writes_empty_file_and_records_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let chunk_id = ChunkId::new();
        create(&svc, chunk_id, 1).await;

        let chunks = svc.chunks.read().await;
        let chunk = &chunks[&chunk_id];
        assert!(chunk.path.exists());
    }

    #[tokio::test]
    async fn create_chunk_rejects_duplicate_id() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let chunk_id = ChunkId::new();
        create(&svc, chunk_id, 1).await;

        let err = svc
            .create_chunk(Request::new(CreateChunkRequest {
                chunk_id: chunk_id.to_string(),
                file_path: "/f".to_string(),
                index: 0,
                version: 1,
                size: 0,
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::AlreadyExists);
    }

    #[tokio::test]
    async fn increment_chunk_version_accepts_exact_successor() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let chunk_id = ChunkId::new();
        create(&svc, chunk_id, 1).await;

        svc.increment_chunk_version(Request::new(IncrementChunkVersionRequest {
            chunk_id: chunk_id.to_string(),
            version: 2,
        }))
        .await
        .unwrap();

        let chunks = svc.chunks.read().await;
        assert_eq!(chunks[&chunk_id].version, 2);
    }

    /// A stale replica rejoining at version 2 must not be allowed to jump
    /// straight to version 6 — only the exact successor is accepted.
    #[tokio::test]
    async fn increment_chunk_version_rejects_version_gap() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let chunk_id = ChunkId::new();
        create(&svc, chunk_id, 2).await;

        let err = svc
            .increment_chunk_version(Request::new(IncrementChunkVersionRequest {
                chunk_id: chunk_id.to_string(),
                version: 6,
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::FailedPrecondition);

        let chunks = svc.chunks.read().await;
        assert_eq!(chunks[&chunk_id].version, 2);
    }

    #[tokio::test]
    async fn write_chunk_does_not_fan_out_to_self() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let chunk_id = ChunkId::new();
        create(&svc, chunk_id, 1).await;

        svc.leases.write().await.insert(
            chunk_id,
            types::LocalLease {
                chunk_id,
                valid_until: SystemTime::now() + Duration::from_secs(60),
            },
        );

        let data = b"hello".to_vec();
        let data_checksum = checksum(&data);
        svc.data_buffer
            .lock()
            .await
            .put(data_checksum, data.clone().into());

        // Only the primary itself is listed as a holder: the fan-out loop
        // must skip it rather than dialing its own address.
        let response = svc
            .write_chunk(Request::new(WriteChunkRequest {
                chunk_id: chunk_id.to_string(),
                checksum: data_checksum,
                offset: 0,
                version: 1,
                chunk_servers: vec![ChunkServerRef {
                    id: svc.id.to_string(),
                    address: svc.address.clone(),
                }],
            }))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.bytes_written, data.len() as u64);
    }
}
