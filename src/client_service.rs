// Client write path (spec §4.3). The client owns nothing persistently — its
// file-chunk map is a cache refreshed from the master on a miss — and
// issues the `RequestWrite -> TransferData(all holders) -> WriteChunk(primary)`
// sequence for every chunk a write touches.

use std::collections::HashMap;
use std::ops::Range;

use tokio::sync::{Mutex, RwLock};
use tonic::transport::Channel;
use tracing::info;

use crate::config::CommonConfig;
use crate::errors::ClientError;
use crate::proto::chunk::chunk_client::ChunkClient;
use crate::proto::chunk::{TransferDataRequest, WriteChunkRequest};
use crate::proto::master::master_client::MasterClient;
use crate::proto::master::{CreateNewFileRequest, GetFileChunksRequest};
use crate::types::ChunkId;
use crate::util::checksum;

pub struct FileClient {
    master: Mutex<MasterClient<Channel>>,
    files: RwLock<HashMap<String, Vec<ChunkId>>>,
    common_config: CommonConfig,
}

/// One chunk's share of a `write_file` call: which chunk, the offset within
/// it to write at, and the slice of the caller's buffer that lands there.
struct ChunkWrite {
    chunk_id: ChunkId,
    chunk_offset: u64,
    range: Range<usize>,
}

/// Pure chunk-boundary arithmetic for `write_file` (spec §4.3 step 1-4):
/// `first_chunk = offset / chunk_size`, `chunk_start_offset = offset %
/// chunk_size`, each step taking `min(chunk_size - chunk_start_offset,
/// remaining)` bytes. Separated from `write_file` so it's testable without
/// a live master/chunk-server connection.
fn plan_chunk_writes(
    chunks: &[ChunkId],
    chunk_size: u64,
    offset: u64,
    data_len: usize,
) -> Result<Vec<ChunkWrite>, ClientError> {
    let mut first_chunk = (offset / chunk_size) as usize;
    let mut chunk_start_offset = offset % chunk_size;
    let mut consumed = 0usize;
    let mut plan = Vec::new();

    while consumed < data_len {
        let chunk_id = *chunks.get(first_chunk).ok_or(ClientError::WriteOverrun)?;

        let to_write = std::cmp::min(chunk_size - chunk_start_offset, (data_len - consumed) as u64) as usize;
        plan.push(ChunkWrite {
            chunk_id,
            chunk_offset: chunk_start_offset,
            range: consumed..consumed + to_write,
        });

        consumed += to_write;
        first_chunk += 1;
        chunk_start_offset = 0;
    }

    Ok(plan)
}

impl FileClient {
    pub async fn connect(
        master_addr: &str,
        common_config: CommonConfig,
    ) -> Result<Self, ClientError> {
        let master = MasterClient::connect(format!("http://{}", master_addr))
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(Self {
            master: Mutex::new(master),
            files: RwLock::new(HashMap::new()),
            common_config,
        })
    }

    pub async fn create_file(&self, path: &str, size: u64) -> Result<Vec<ChunkId>, ClientError> {
        let response = self
            .master
            .lock()
            .await
            .create_new_file(CreateNewFileRequest {
                path: path.to_string(),
                size,
            })
            .await?
            .into_inner();

        let chunks: Vec<ChunkId> = response
            .chunk_ids
            .iter()
            .map(|id| id.parse())
            .collect::<Result<_, _>>()
            .map_err(|_| ClientError::Rpc(tonic::Status::internal("master returned invalid chunk id")))?;

        self.files
            .write()
            .await
            .insert(path.to_string(), chunks.clone());
        Ok(chunks)
    }

    async fn chunks_for(&self, path: &str) -> Result<Vec<ChunkId>, ClientError> {
        if let Some(chunks) = self.files.read().await.get(path) {
            return Ok(chunks.clone());
        }

        let response = self
            .master
            .lock()
            .await
            .get_file_chunks(GetFileChunksRequest {
                path: path.to_string(),
            })
            .await
            .map_err(|_| ClientError::FileNotFound)?
            .into_inner();

        let chunks: Vec<ChunkId> = response
            .chunk_ids
            .iter()
            .map(|id| id.parse())
            .collect::<Result<_, _>>()
            .map_err(|_| ClientError::Rpc(tonic::Status::internal("master returned invalid chunk id")))?;

        self.files
            .write()
            .await
            .insert(path.to_string(), chunks.clone());
        Ok(chunks)
    }

    /// Splits `data` across the file's pre-allocated chunks starting at
    /// `offset` and writes each slice. Running off the end of the chunk
    /// list is an error (spec §4.3 step 4 — new-chunk allocation on
    /// overrun is explicitly left undone upstream).
    pub async fn write_file(
        &self,
        path: &str,
        data: &[u8],
        offset: u64,
    ) -> Result<u64, ClientError> {
        let chunks = self.chunks_for(path).await?;
        let plan = plan_chunk_writes(&chunks, self.common_config.chunk_size_bytes, offset, data.len())?;

        let mut total_written = 0u64;
        for slice in &plan {
            self.write_chunk(slice.chunk_id, &data[slice.range.clone()], slice.chunk_offset)
                .await?;
            total_written += slice.range.len() as u64;
        }

        Ok(total_written)
    }

    /// `RequestWrite` → push to every holder → commit on the primary.
    pub async fn write_chunk(
        &self,
        chunk_id: ChunkId,
        data: &[u8],
        offset: u64,
    ) -> Result<u64, ClientError> {
        let reply = self
            .master
            .lock()
            .await
            .request_write(crate::proto::master::RequestWriteRequest {
                chunk_id: chunk_id.to_string(),
            })
            .await?
            .into_inner();

        let data_checksum = checksum(data);

        let pushes = reply.chunk_servers.iter().map(|server| {
            let address = server.address.clone();
            let data = data.to_vec();
            async move {
                let mut client = ChunkClient::connect(format!("http://{}", address))
                    .await
                    .map_err(|e| ClientError::Transport(e.to_string()))?;
                client
                    .transfer_data(TransferDataRequest {
                        checksum: data_checksum,
                        data,
                    })
                    .await
                    .map_err(ClientError::Rpc)?;
                Ok::<(), ClientError>(())
            }
        });
        futures::future::try_join_all(pushes).await?;

        let primary = reply
            .chunk_servers
            .iter()
            .find(|s| s.id == reply.primary_id)
            .ok_or_else(|| ClientError::Rpc(tonic::Status::internal("primary not in holder list")))?;

        let mut primary_client = ChunkClient::connect(format!("http://{}", primary.address))
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let chunk_servers = reply
            .chunk_servers
            .iter()
            .map(|s| crate::proto::chunk::ChunkServerRef {
                id: s.id.clone(),
                address: s.address.clone(),
            })
            .collect();

        let response = primary_client
            .write_chunk(WriteChunkRequest {
                chunk_id: chunk_id.to_string(),
                checksum: data_checksum,
                offset,
                version: reply.version,
                chunk_servers,
            })
            .await?
            .into_inner();

        info!(
            "wrote {} bytes to chunk {} via primary {}",
            response.bytes_written, chunk_id, primary.address
        );

        Ok(response.bytes_written)
    }
}
