// Shared domain types for the master, chunk server, and client.
//
// Chunks, chunk servers, files, and leases are identified by 128-bit random
// ids unique for the lifetime of the system (see DESIGN.md, ported from the
// original `github.com/google/uuid`-based Go model).

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Debug)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(ChunkId);
uuid_id!(ServerId);
uuid_id!(FileId);

/// Master's view of a file: its chunk list in order, and deletion bookkeeping.
#[derive(Clone, Debug)]
pub struct FileMetadata {
    pub id: FileId,
    pub path: String,
    pub chunks: Vec<ChunkId>,
    pub deleted: bool,
    pub deleted_at: Option<SystemTime>,
}

impl FileMetadata {
    pub fn new(path: String) -> Self {
        Self {
            id: FileId::new(),
            path,
            chunks: Vec::new(),
            deleted: false,
            deleted_at: None,
        }
    }
}

/// Master's view of a chunk: version and holder set.
#[derive(Clone, Debug)]
pub struct ChunkMetadata {
    pub id: ChunkId,
    pub index: u64,
    pub file_path: String,
    pub version: u64,
    pub holders: HashSet<ServerId>,
}

impl ChunkMetadata {
    pub fn new(id: ChunkId, index: u64, file_path: String, version: u64, holders: HashSet<ServerId>) -> Self {
        Self {
            id,
            index,
            file_path,
            version,
            holders,
        }
    }
}

/// Master's view of a lease: a single chunk server authorised to order
/// writes for a chunk until `valid_until`.
#[derive(Clone, Copy, Debug)]
pub struct Lease {
    pub chunk_id: ChunkId,
    pub holder: ServerId,
    pub valid_until: SystemTime,
}

impl Lease {
    /// A lease is held iff `valid_until` is strictly after `now`.
    pub fn is_valid_at(&self, now: SystemTime) -> bool {
        self.valid_until > now
    }
}

#[derive(Clone, Debug)]
pub struct ChunkServerMetadata {
    pub id: ServerId,
    pub address: String,
    pub healthy: bool,
    pub active: bool,
    pub failed_count: u32,
    pub last_report: SystemTime,
}

impl ChunkServerMetadata {
    pub fn new(id: ServerId, address: String, now: SystemTime) -> Self {
        Self {
            id,
            address,
            healthy: true,
            active: true,
            failed_count: 0,
            last_report: now,
        }
    }
}

/// Chunk server's local view of a stored chunk.
#[derive(Clone, Debug)]
pub struct Chunk {
    pub id: ChunkId,
    pub index: u64,
    pub version: u64,
    pub path: std::path::PathBuf,
    pub file_path: String,
}

impl Chunk {
    pub fn filename(id: ChunkId, index: u64, version: u64) -> String {
        format!("{}-{}-{}.chunk", id, index, version)
    }
}

/// Chunk server's local view of a lease: no holder field needed, since a
/// chunk server only ever tracks leases granted to itself.
#[derive(Clone, Copy, Debug)]
pub struct LocalLease {
    pub chunk_id: ChunkId,
    pub valid_until: SystemTime,
}

impl LocalLease {
    pub fn is_valid_at(&self, now: SystemTime) -> bool {
        self.valid_until > now
    }
}
