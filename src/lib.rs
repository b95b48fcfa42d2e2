pub mod client_service;
pub mod chunkserver_impl;
pub mod chunkserver_service;
pub mod config;
pub mod errors;
pub mod master_impl;
pub mod master_monitors;
pub mod master_service;
pub mod types;
pub mod util;

pub mod proto {
    pub mod master {
        tonic::include_proto!("master");
    }
    pub mod chunk {
        tonic::include_proto!("chunk");
    }
}
