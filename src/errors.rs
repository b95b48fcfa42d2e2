// Error taxonomy for the master and chunk server (spec §7). Kinds, not
// just strings, so background loops can match on them instead of parsing
// `tonic::Status` messages.

use thiserror::Error;
use tonic::Status;

#[derive(Debug, Error)]
pub enum MasterError {
    #[error("file already exists")]
    FileExists,
    #[error("file not found")]
    FileNotFound,
    #[error("failed to create file")]
    FileCreation,
    #[error("chunk holder not found")]
    ChunkHolderNotFound,
    #[error("chunk not found")]
    ChunkNotFound,
    #[error("chunk server not found")]
    ChunkServerNotFound,
    #[error("lease not found")]
    LeaseNotFound,
    #[error("chunk server was not the previous lease holder")]
    LeaseNotPreviouslyOwned,
    #[error("not enough chunk servers available for placement")]
    PlacementExhausted,
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<MasterError> for Status {
    fn from(err: MasterError) -> Self {
        match err {
            MasterError::FileExists => Status::already_exists(err.to_string()),
            MasterError::FileNotFound
            | MasterError::ChunkNotFound
            | MasterError::ChunkHolderNotFound
            | MasterError::ChunkServerNotFound
            | MasterError::LeaseNotFound => Status::not_found(err.to_string()),
            MasterError::LeaseNotPreviouslyOwned => Status::permission_denied(err.to_string()),
            MasterError::FileCreation | MasterError::PlacementExhausted => {
                Status::resource_exhausted(err.to_string())
            }
            MasterError::Transport(_) => Status::unavailable(err.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ChunkServerError {
    #[error("chunk already exists")]
    ChunkAlreadyExists,
    #[error("chunk does not exist")]
    ChunkDoesNotExist,
    #[error("chunk version mismatch")]
    ChunkVersionMismatch,
    #[error("chunk lease not found")]
    ChunkLeaseNotFound,
    #[error("data not found in cache")]
    DataNotFoundInCache,
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("file not found")]
    FileNotFound,
    #[error("write offset runs past the end of the pre-allocated chunk list")]
    WriteOverrun,
    #[error("rpc error: {0}")]
    Rpc(#[from] Status),
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<ChunkServerError> for Status {
    fn from(err: ChunkServerError) -> Self {
        match err {
            ChunkServerError::ChunkAlreadyExists => Status::already_exists(err.to_string()),
            ChunkServerError::ChunkDoesNotExist => Status::not_found(err.to_string()),
            ChunkServerError::ChunkVersionMismatch => Status::failed_precondition(err.to_string()),
            ChunkServerError::ChunkLeaseNotFound => Status::permission_denied(err.to_string()),
            ChunkServerError::DataNotFoundInCache => Status::not_found(err.to_string()),
            ChunkServerError::ChecksumMismatch => Status::invalid_argument(err.to_string()),
            ChunkServerError::Io(_) => Status::internal(err.to_string()),
            ChunkServerError::Transport(_) => Status::unavailable(err.to_string()),
        }
    }
}
