use sha2::{Digest, Sha256};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::proto::master::master_client::MasterClient;

/// Initializes the global tracing subscriber from `CommonConfig`'s
/// `log_level`/`log_output`. `log_output == "stdout"` logs to the
/// console; anything else is treated as a directory and logs roll daily
/// into `{log_output}/{file_name}`. Returns the appender's guard, which
/// must be held for the process lifetime to avoid dropping buffered lines.
pub fn init_tracing(
    log_level: &str,
    log_output: &str,
    file_name: &str,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if log_output == "stdout" {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        None
    } else {
        let file_appender = tracing_appender::rolling::daily(log_output, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(non_blocking)
            .init();
        Some(guard)
    }
}

/// Connect to the master at the configured address.
pub async fn connect_to_master(
    master_addr: &str,
) -> Result<MasterClient<tonic::transport::Channel>, Box<dyn std::error::Error>> {
    match MasterClient::connect(format!("http://{}", master_addr)).await {
        Ok(client) => {
            info!("Connected to master at: {}", master_addr);
            Ok(client)
        }
        Err(e) => {
            info!("Failed to connect to master at {}: {}", master_addr, e);
            Err(Box::new(e))
        }
    }
}

/// 32-bit truncation of SHA-256, used as the integrity tag for pushed chunk
/// data (spec §6 `TransferData`).
pub fn checksum(data: &[u8]) -> u32 {
    let digest = Sha256::digest(data);
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}
