use serde::Deserialize;
use std::fs;

#[derive(Clone, Debug, Deserialize, Default)]
pub struct MasterConfig {
    pub address: String,
    pub log_path: String,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct ChunkServerConfig {
    pub data_path: String,
    pub log_path: String,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct ClientConfig {
    pub master_address: String,
    pub log_path: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CommonConfig {
    /// Fixed chunk size in bytes (`CHUNK_SIZE_BYTES`).
    pub chunk_size_bytes: u64,
    /// Number of replicas maintained per chunk (`REPLICATION_FACTOR`).
    pub replication_factor: usize,
    /// Chunk servers stop receiving new chunks once they hold this many.
    pub max_allowed_chunks: usize,
    /// Version assigned to a chunk when it is first created.
    pub initial_chunk_version: u64,
    /// How often a chunk server sends `ReportHealth` to the master.
    pub heartbeat_interval_secs: u64,
    /// How often the master's health-check loop ticks.
    pub healthcheck_interval_secs: u64,
    /// Silence after which a server is marked unhealthy (`HEALTHCHECK_THRESHOLD`).
    pub healthcheck_threshold_secs: u64,
    /// Consecutive failed checks after which a server is marked inactive.
    pub failed_healthcheck_limit: u32,
    /// How often the replication monitor tick fires.
    pub replication_monitor_interval_secs: u64,
    /// How often the deletion monitor tick fires.
    pub deletion_monitor_interval_secs: u64,
    /// How often the garbage collector tick fires.
    pub gc_interval_secs: u64,
    /// Age of a soft-deleted file after which its metadata is reclaimed.
    pub deletion_threshold_secs: u64,
    /// Duration a write lease remains valid (`LEASE_DURATION`).
    pub lease_duration_secs: u64,
    /// Poll period of the chunk server's lease-expiry monitor.
    pub lease_monitor_poll_ms: u64,
    /// Capacity of the checksum-keyed data buffer.
    pub data_buffer_capacity: usize,
    pub log_level: String,
    pub log_output: String,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: 64 * 10_000_000,
            replication_factor: 3,
            max_allowed_chunks: 10_000,
            initial_chunk_version: 1,
            heartbeat_interval_secs: 10,
            healthcheck_interval_secs: 30,
            healthcheck_threshold_secs: 30,
            failed_healthcheck_limit: 3,
            replication_monitor_interval_secs: 60,
            deletion_monitor_interval_secs: 60,
            gc_interval_secs: 60,
            deletion_threshold_secs: 24 * 60 * 60,
            lease_duration_secs: 60,
            lease_monitor_poll_ms: 100,
            data_buffer_capacity: 100,
            log_level: "info".to_string(),
            log_output: "stdout".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub master: MasterConfig,
    pub chunkserver: ChunkServerConfig,
    pub client: ClientConfig,
    #[serde(default)]
    pub common: CommonConfig,
}

pub fn load_config(path: &str) -> Result<Config, Box<dyn std::error::Error>> {
    // Read the config file
    let config_content = fs::read_to_string(path)?;
    // Parse the TOML content into the Config struct
    let config: Config = toml::from_str(&config_content)?;
    Ok(config)
}
