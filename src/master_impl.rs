// Implements the gRPC server behavior defined in the Master trait.
use std::sync::Arc;
use std::time::SystemTime;

use tonic::{Request, Response, Status};
use tracing::info;

use crate::master_service::MasterService;
use crate::proto::master::master_server::Master;
use crate::proto::master::{
    ChunkReport, ChunkServerRef, CreateNewFileRequest, CreateNewFileResponse, DeleteFileRequest,
    DeleteFileResponse, GetFileChunksRequest, GetFileChunksResponse, RegisterChunkServerRequest,
    RegisterChunkServerResponse, ReportHealthRequest, ReportHealthResponse,
    RequestLeaseRenewalRequest, RequestLeaseRenewalResponse, RequestWriteRequest,
    RequestWriteResponse,
};
use crate::types::{ChunkId, ServerId};

fn to_unix_secs(t: SystemTime) -> i64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn parse_id<T: std::str::FromStr>(raw: &str) -> Result<T, Status> {
    raw.parse()
        .map_err(|_| Status::invalid_argument(format!("invalid id '{}'", raw)))
}

#[tonic::async_trait]
impl Master for Arc<MasterService> {
    async fn register_chunk_server(
        &self,
        request: Request<RegisterChunkServerRequest>,
    ) -> Result<Response<RegisterChunkServerResponse>, Status> {
        let address = request.into_inner().address;
        let id = self.register_chunk_server(address).await;
        Ok(Response::new(RegisterChunkServerResponse {
            id: id.to_string(),
        }))
    }

    async fn create_new_file(
        &self,
        request: Request<CreateNewFileRequest>,
    ) -> Result<Response<CreateNewFileResponse>, Status> {
        let request = request.into_inner();
        info!("CreateNewFile: {} ({} bytes)", request.path, request.size);

        let (file, servers) = self.create_new_file(request.path, request.size).await?;

        Ok(Response::new(CreateNewFileResponse {
            path: file.path,
            chunk_ids: file.chunks.iter().map(|c| c.to_string()).collect(),
            chunk_server_ids: servers.iter().map(|s| s.to_string()).collect(),
        }))
    }

    async fn delete_file(
        &self,
        request: Request<DeleteFileRequest>,
    ) -> Result<Response<DeleteFileResponse>, Status> {
        let path = request.into_inner().path;
        self.delete_file(&path).await?;
        Ok(Response::new(DeleteFileResponse {
            success: true,
            message: String::new(),
        }))
    }

    async fn get_file_chunks(
        &self,
        request: Request<GetFileChunksRequest>,
    ) -> Result<Response<GetFileChunksResponse>, Status> {
        let path = request.into_inner().path;
        let chunks = self.get_file_chunks(&path).await?;
        Ok(Response::new(GetFileChunksResponse {
            path,
            chunk_ids: chunks.iter().map(|c| c.to_string()).collect(),
        }))
    }

    async fn request_write(
        &self,
        request: Request<RequestWriteRequest>,
    ) -> Result<Response<RequestWriteResponse>, Status> {
        let chunk_id: ChunkId = parse_id(&request.into_inner().chunk_id)?;

        let (chunk_id, lease, holders, version) = self.request_write(chunk_id).await?;

        Ok(Response::new(RequestWriteResponse {
            chunk_id: chunk_id.to_string(),
            version,
            primary_id: lease.holder.to_string(),
            valid_until_unix_secs: to_unix_secs(lease.valid_until),
            chunk_servers: holders
                .into_iter()
                .map(|s| ChunkServerRef {
                    id: s.id.to_string(),
                    address: s.address,
                })
                .collect(),
        }))
    }

    async fn request_lease_renewal(
        &self,
        request: Request<RequestLeaseRenewalRequest>,
    ) -> Result<Response<RequestLeaseRenewalResponse>, Status> {
        let request = request.into_inner();
        let chunk_id: ChunkId = parse_id(&request.chunk_id)?;
        let server_id: ServerId = parse_id(&request.chunk_server_id)?;

        match self.request_lease_renewal(chunk_id, server_id).await {
            Ok(lease) => Ok(Response::new(RequestLeaseRenewalResponse {
                granted: true,
                chunk_id: chunk_id.to_string(),
                valid_until_unix_secs: to_unix_secs(lease.valid_until),
            })),
            Err(crate::errors::MasterError::LeaseNotPreviouslyOwned) => {
                Ok(Response::new(RequestLeaseRenewalResponse {
                    granted: false,
                    chunk_id: chunk_id.to_string(),
                    valid_until_unix_secs: 0,
                }))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn report_health(
        &self,
        request: Request<ReportHealthRequest>,
    ) -> Result<Response<ReportHealthResponse>, Status> {
        let request = request.into_inner();
        let server_id: ServerId = parse_id(&request.chunk_server_id)?;

        let reports: Result<Vec<(ChunkId, u64, u64)>, Status> = request
            .chunks
            .into_iter()
            .map(|c: ChunkReport| -> Result<(ChunkId, u64, u64), Status> {
                Ok((parse_id(&c.chunk_id)?, c.version, c.index))
            })
            .collect();

        self.report_health(server_id, &reports?).await?;
        Ok(Response::new(ReportHealthResponse {}))
    }
}
