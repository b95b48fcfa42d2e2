use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;

use rustfs::client_service::FileClient;
use rustfs::config::load_config;
use rustfs::util::init_tracing;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "config.toml")]
    config: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a file of the given size on the master.
    Create { path: String, size: u64 },
    /// Write the contents of a local file to a remote path at an offset.
    Write {
        path: String,
        local_file: String,
        #[arg(default_value_t = 0)]
        offset: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args.config)?;

    let _guard = init_tracing(
        &config.common.log_level,
        &config.common.log_output,
        "client.log",
    );

    let client = FileClient::connect(&config.client.master_address, config.common).await?;

    match args.command {
        Command::Create { path, size } => {
            let chunks = client.create_file(&path, size).await?;
            println!("created '{}' with {} chunk(s)", path, chunks.len());
        }
        Command::Write {
            path,
            local_file,
            offset,
        } => {
            let mut file = tokio::fs::File::open(&local_file).await?;
            let mut data = Vec::new();
            file.read_to_end(&mut data).await?;

            let written = client.write_file(&path, &data, offset).await?;
            println!("wrote {} bytes to '{}'", written, path);
        }
    }

    Ok(())
}
