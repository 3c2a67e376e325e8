use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use gobt::client::{Client, ClientConfig};
use gobt::torrent::Torrent;

/// Downloads a single-file torrent into the output directory and exits.
#[derive(Parser, Debug)]
#[command(name = "gobt", version, about)]
struct Args {
    /// Path to the .torrent metainfo file
    torrent: PathBuf,

    /// Port reported to the tracker
    #[arg(long, default_value_t = 6881)]
    port: u16,

    /// Maximum number of peer connections
    #[arg(long, default_value_t = 50)]
    max_peers: usize,

    /// Directory for the downloaded file
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let torrent = Torrent::open(&args.torrent).await?;
    let config = ClientConfig::default()
        .with_listen_port(args.port)
        .with_max_peers(args.max_peers)
        .with_download_path(args.output_dir);

    Client::new(torrent, config).run().await
}
