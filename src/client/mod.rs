mod config;
mod peer_worker;
mod registry;
mod state;

pub use config::ClientConfig;
pub use registry::{PeerCommand, Registry};
pub use state::{DownloadStats, SharedState};

use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::output::OutputFile;
use crate::torrent::Torrent;
use crate::tracker::TrackerRequest;

/// Coordinates one download: announces, spawns a session per peer, waits
/// for the fleet to finish and settles the output file.
pub struct Client {
    torrent: Torrent,
    config: ClientConfig,
    peer_id: String,
}

impl Client {
    pub fn new(torrent: Torrent, config: ClientConfig) -> Self {
        Self {
            torrent,
            config,
            peer_id: TrackerRequest::generate_peer_id(),
        }
    }

    /// Announce to the tracker and download from whatever peers it
    /// returns.
    pub async fn run(self) -> Result<()> {
        let response = TrackerRequest::announce(
            &self.torrent,
            &self.peer_id,
            self.config.listen_port,
        )
        .await
        .context("Failed to announce to tracker")?;

        let peers: Vec<SocketAddrV4> = response.peer_addresses.iter().copied().collect();

        println!("Torrent: {}", self.torrent.info.name);
        println!(
            "Size:    {} ({} pieces)",
            format_bytes(self.torrent.length() as u64),
            self.torrent.piece_count()
        );
        if let Some(hash) = self.torrent.info_hash {
            println!("Hash:    {}", hex::encode(hash));
        }
        println!("Tracker: {}", self.torrent.announce);
        println!("Peers:   {} found", peers.len());
        println!();

        if peers.is_empty() {
            bail!("tracker returned no peers");
        }

        self.download_from(peers).await
    }

    /// Download the torrent from the given peer endpoints. Succeeds only
    /// when every piece verified; otherwise the partial file is removed.
    pub async fn download_from(self, peers: Vec<SocketAddrV4>) -> Result<()> {
        let output = OutputFile::create(&self.config.download_path, &self.torrent.info.name)?;
        let state = Arc::new(SharedState::new(&self.torrent, output, self.peer_id.clone())?);

        // SIGINT/SIGTERM turn into a fleet-wide shutdown; sessions then
        // exit on their next loop turn.
        let signal_state = Arc::clone(&state);
        let signal_task = tokio::spawn(async move {
            let mut terminate =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(signal) => signal,
                    Err(e) => {
                        warn!("Failed to install SIGTERM handler: {e}");
                        return;
                    }
                };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
            eprintln!("\nShutting down...");
            signal_state.registry.shutdown();
        });

        let progress = ProgressBar::new(state.stats.total_pieces());
        progress.set_style(
            ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} pieces  {msg}")
                .expect("progress template is valid")
                .progress_chars("##-"),
        );
        let progress_task = spawn_progress_task(Arc::clone(&state), progress.clone());

        // One session task per endpoint, capped by max_peers.
        let semaphore = Arc::new(Semaphore::new(self.config.max_peers));
        let mut sessions = JoinSet::new();
        for addr in peers {
            let permit = Arc::clone(&semaphore).acquire_owned().await?;
            let state = Arc::clone(&state);
            let config = self.config.clone();
            sessions.spawn(async move {
                if let Err(e) = peer_worker::run(addr, state, config).await {
                    debug!("Peer {addr}: {e:#}");
                }
                drop(permit);
            });
        }

        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                warn!("Peer task panicked: {e}");
            }
        }

        signal_task.abort();
        progress_task.abort();

        let complete = state.lock_bitfield().full();
        if !complete {
            progress.finish_and_clear();
            state
                .output
                .remove()
                .context("Failed to remove the partial download")?;
            bail!(
                "download incomplete: {}/{} pieces verified",
                state.stats.pieces_completed(),
                state.stats.total_pieces()
            );
        }

        progress.finish_with_message(format!(
            "{}  done!",
            format_bytes(state.stats.downloaded_bytes())
        ));
        println!(
            "\nDownload complete: {}",
            state.output.path().display()
        );
        Ok(())
    }
}

fn spawn_progress_task(
    state: Arc<SharedState>,
    progress: ProgressBar,
) -> tokio::task::JoinHandle<()> {
    let mut shutdown = state.registry.subscribe_shutdown();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(Duration::from_millis(500)) => {
                    let stats = &state.stats;
                    progress.set_position(stats.pieces_completed());
                    progress.set_message(format!(
                        "{}  {}/s",
                        format_bytes(stats.downloaded_bytes()),
                        format_bytes(stats.download_speed() as u64),
                    ));
                    if stats.pieces_completed() == stats.total_pieces() {
                        break;
                    }
                }
            }
        }
    })
}

/// Format byte count as human-readable string (e.g. "631.0 MB").
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
