use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::bitfield::Bitfield;
use crate::output::OutputFile;
use crate::piece::Picker;
use crate::storage::Storage;
use crate::torrent::Torrent;

use super::registry::Registry;

/// Everything the peer sessions share. Each member serializes its own
/// mutations; sessions hold no locks across I/O.
#[derive(Debug)]
pub struct SharedState {
    /// Block selection and all piece/block bookkeeping
    pub picker: Picker,
    /// Staging buffer and hash verification
    pub storage: Storage,
    /// Live session set and broadcast fan-out
    pub registry: Registry,
    /// Pieces this client has verified
    pub client_bitfield: Mutex<Bitfield>,
    /// Destination for verified pieces
    pub output: OutputFile,
    /// Expected SHA-1 per piece
    pub hashes: Vec<[u8; 20]>,
    pub info_hash: [u8; 20],
    pub peer_id: String,
    pub total_len: usize,
    pub piece_len: usize,
    pub stats: DownloadStats,
}

impl SharedState {
    pub fn new(torrent: &Torrent, output: OutputFile, peer_id: String) -> anyhow::Result<Self> {
        let total_len = torrent.length();
        let piece_len = torrent.info.piece_length;
        let piece_count = torrent.piece_count();

        Ok(Self {
            picker: Picker::new(total_len, piece_len),
            storage: Storage::new(total_len, piece_len),
            registry: Registry::new(),
            client_bitfield: Mutex::new(Bitfield::new(piece_count)),
            output,
            hashes: torrent.info.pieces.0.clone(),
            info_hash: torrent
                .info_hash
                .ok_or_else(|| anyhow::anyhow!("torrent is missing its info hash"))?,
            peer_id,
            total_len,
            piece_len,
            stats: DownloadStats::new(piece_count as u64),
        })
    }

    pub fn piece_count(&self) -> usize {
        self.hashes.len()
    }

    /// Do we already have this piece verified?
    pub fn has_piece(&self, index: usize) -> bool {
        self.lock_bitfield().get(index).unwrap_or(false)
    }

    pub fn lock_bitfield(&self) -> std::sync::MutexGuard<'_, Bitfield> {
        self.client_bitfield
            .lock()
            .expect("client bitfield poisoned")
    }
}

/// Atomic counters for download statistics; lock-free on the hot path.
#[derive(Debug)]
pub struct DownloadStats {
    downloaded_bytes: AtomicU64,
    pieces_completed: AtomicU64,
    total_pieces: u64,
    start_time: Instant,
}

impl DownloadStats {
    pub fn new(total_pieces: u64) -> Self {
        Self {
            downloaded_bytes: AtomicU64::new(0),
            pieces_completed: AtomicU64::new(0),
            total_pieces,
            start_time: Instant::now(),
        }
    }

    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn increment_pieces(&self) {
        self.pieces_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded_bytes.load(Ordering::Relaxed)
    }

    pub fn pieces_completed(&self) -> u64 {
        self.pieces_completed.load(Ordering::Relaxed)
    }

    pub fn total_pieces(&self) -> u64 {
        self.total_pieces
    }

    /// Download speed in bytes per second since startup.
    pub fn download_speed(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed < 0.001 {
            return 0.0;
        }
        self.downloaded_bytes() as f64 / elapsed
    }
}
