use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::piece::PeerId;

/// Out-of-band instructions delivered to a session's select loop; each
/// session forwards them to its remote peer on its own socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerCommand {
    /// Announce a freshly verified piece.
    Have(u32),
    /// Withdraw a now-redundant endgame request.
    Cancel { index: u32, begin: u32, length: u32 },
}

/// Live set of connected peer sessions. Hands out stable ids, fans out
/// HAVE/CANCEL notifications and broadcasts shutdown.
#[derive(Debug)]
pub struct Registry {
    peers: Mutex<HashMap<PeerId, mpsc::UnboundedSender<PeerCommand>>>,
    next_id: AtomicU64,
    shutdown: broadcast::Sender<()>,
}

impl Registry {
    pub fn new() -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            peers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown,
        }
    }

    /// Register a session after its successful handshake. Returns the
    /// session's id and the receiving end of its command mailbox.
    pub fn add(&self) -> (PeerId, mpsc::UnboundedReceiver<PeerCommand>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().insert(id, tx);
        (id, rx)
    }

    pub fn remove(&self, id: PeerId) {
        self.lock().remove(&id);
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Tell every other session to advertise the piece to its peer.
    pub fn broadcast_have(&self, piece: u32, except: PeerId) {
        self.broadcast(PeerCommand::Have(piece), except);
    }

    /// Tell every other session to withdraw its request for the block.
    /// Best-effort: a session that is already gone is skipped.
    pub fn broadcast_cancel(&self, index: u32, begin: u32, length: u32, except: PeerId) {
        self.broadcast(PeerCommand::Cancel { index, begin, length }, except);
    }

    /// Ask every session to exit. Sessions observe the broadcast at their
    /// next loop turn and tear down their connections.
    pub fn shutdown(&self) {
        // No receivers just means every session already exited.
        let _ = self.shutdown.send(());
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn broadcast(&self, command: PeerCommand, except: PeerId) {
        for (&id, tx) in self.lock().iter() {
            if id == except {
                continue;
            }
            if tx.send(command).is_err() {
                debug!("Peer {id} is gone, skipping {command:?}");
            }
        }
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<PeerId, mpsc::UnboundedSender<PeerCommand>>> {
        self.peers.lock().expect("registry poisoned")
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
