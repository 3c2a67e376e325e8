use std::collections::VecDeque;
use std::net::SocketAddrV4;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, info, warn};

use crate::bitfield::Bitfield;
use crate::message::PeerMessage;
use crate::peer::{Peer, ProtocolError};
use crate::piece::{block_size, PeerId, BLOCK_MAX};

use super::config::ClientConfig;
use super::registry::PeerCommand;
use super::state::SharedState;

/// A session is cut once its peer has served this many corrupt pieces.
const MAX_HASH_FAILS: u32 = 5;

/// Drives the wire protocol against a single remote peer: one of these
/// runs per connection, as its own task. All coordination with the rest
/// of the fleet goes through [`SharedState`].
pub struct PeerWorker {
    peer: Peer,
    id: PeerId,
    state: Arc<SharedState>,
    config: ClientConfig,
    /// What the remote advertises, grown by BITFIELD and HAVE
    remote_bitfield: Bitfield,
    /// Remote is choking us; wire state starts choked
    is_choking: bool,
    /// We have told the remote we are interested
    is_interesting: bool,
    /// Requests sent and not yet answered, in send order
    outstanding: Vec<(usize, usize)>,
    hash_fails: u32,
    handled_first_message: bool,
}

/// Connect, handshake and run a session against `addr` until the
/// download completes, the peer misbehaves or the connection dies.
/// Cleanup always runs: claims go back to the pool and the peer's
/// availability contribution is withdrawn.
pub async fn run(
    addr: SocketAddrV4,
    state: Arc<SharedState>,
    config: ClientConfig,
) -> Result<()> {
    let peer = Peer::connect(
        addr,
        state.info_hash,
        &state.peer_id,
        config.connection_timeout,
    )
    .await?;

    let (id, commands) = state.registry.add();
    let mut shutdown = state.registry.subscribe_shutdown();
    debug!("Connected to peer {addr} as session {id}");

    let mut worker = PeerWorker {
        peer,
        id,
        remote_bitfield: Bitfield::new(state.piece_count()),
        state: Arc::clone(&state),
        config,
        is_choking: true,
        is_interesting: false,
        outstanding: Vec::new(),
        hash_fails: 0,
        handled_first_message: false,
    };

    let result = worker.message_loop(commands, &mut shutdown).await;

    worker.release_claims();
    state.registry.remove(id);

    if let Err(e) = &result {
        debug!("Session {id} ({addr}) ended: {e:#}");
    }
    result
}

impl PeerWorker {
    async fn message_loop(
        &mut self,
        mut commands: mpsc::UnboundedReceiver<PeerCommand>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<()> {
        let period = self.config.keepalive_period;
        let mut keepalive = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    debug!("Session {} shutting down", self.id);
                    return Ok(());
                }

                command = commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await?,
                        None => return Ok(()),
                    }
                }

                _ = keepalive.tick() => {
                    self.peer.send(PeerMessage::KeepAlive).await?;
                }

                message = timeout(self.config.read_idle, self.peer.next_message()) => {
                    match message.context("Peer idle past the read deadline")? {
                        Some(Ok(message)) => self.handle_message(message).await?,
                        Some(Err(e)) => return Err(e).context("Failed reading from peer"),
                        None => {
                            debug!("Peer {} closed the connection", self.peer.address());
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, command: PeerCommand) -> Result<()> {
        match command {
            PeerCommand::Have(piece) => self.peer.send(PeerMessage::Have(piece)).await,
            PeerCommand::Cancel { index, begin, length } => {
                // Only withdraw requests this session actually issued.
                let claim = (index as usize, begin as usize / BLOCK_MAX);
                if self.outstanding.contains(&claim) {
                    self.peer
                        .send(PeerMessage::Cancel { index, begin, length })
                        .await?;
                }
                Ok(())
            }
        }
    }

    async fn handle_message(&mut self, message: PeerMessage) -> Result<()> {
        let first = !self.handled_first_message;
        self.handled_first_message = true;

        match message {
            PeerMessage::KeepAlive => {}

            PeerMessage::Choke => {
                debug!("Peer {} choked us", self.peer.address());
                // Outstanding requests are kept; they are reissued on the
                // next unchoke.
                self.is_choking = true;
            }

            PeerMessage::Unchoke => self.handle_unchoke().await?,

            PeerMessage::Have(index) => self.handle_have(index).await?,

            PeerMessage::Bitfield(bytes) => {
                if !first {
                    return Err(ProtocolError::UnexpectedBitfield.into());
                }
                self.handle_bitfield(&bytes).await?;
            }

            PeerMessage::Piece { index, begin, block } => {
                self.handle_piece(index, begin, block).await?;
            }

            // This client does not upload; the remote's interest and
            // requests carry no information for us.
            PeerMessage::Interested | PeerMessage::NotInterested => {}
            PeerMessage::Request { .. } | PeerMessage::Cancel { .. } => {}
        }

        Ok(())
    }

    async fn handle_unchoke(&mut self) -> Result<()> {
        debug!("Peer {} unchoked us", self.peer.address());
        let unresolved: VecDeque<(usize, usize)> = if self.is_choking {
            std::mem::take(&mut self.outstanding).into()
        } else {
            VecDeque::new()
        };
        self.is_choking = false;
        self.fill_pipeline(unresolved).await
    }

    async fn handle_have(&mut self, index: u32) -> Result<()> {
        let piece = index as usize;
        if piece >= self.state.piece_count() {
            return Err(ProtocolError::PieceOutOfRange(index).into());
        }
        self.remote_bitfield
            .set(piece)
            .map_err(ProtocolError::BadBitfield)?;
        self.state.picker.increment_piece_availability(piece);

        if !self.is_interesting && !self.state.has_piece(piece) {
            self.peer.send(PeerMessage::Interested).await?;
            self.is_interesting = true;
        }
        Ok(())
    }

    async fn handle_bitfield(&mut self, bytes: &[u8]) -> Result<()> {
        self.remote_bitfield
            .replace(bytes)
            .map_err(ProtocolError::BadBitfield)?;
        self.state.picker.increment_availability(&self.remote_bitfield);

        let wants_something = {
            let client = self.state.lock_bitfield();
            self.remote_bitfield
                .ones()
                .any(|i| !client.get(i).unwrap_or(false))
        };
        if wants_something {
            self.peer.send(PeerMessage::Interested).await?;
            self.is_interesting = true;
        }
        Ok(())
    }

    async fn handle_piece(&mut self, index: u32, begin: u32, data: Vec<u8>) -> Result<()> {
        if begin as usize % BLOCK_MAX != 0 {
            return Err(ProtocolError::MisalignedOffset(begin).into());
        }
        let piece = index as usize;
        let block = begin as usize / BLOCK_MAX;

        let position = self
            .outstanding
            .iter()
            .position(|&claim| claim == (piece, block))
            .ok_or(ProtocolError::UnsolicitedPiece {
                piece: index,
                offset: begin,
            })?;
        self.outstanding.remove(position);

        let expected = block_size(self.state.total_len, self.state.piece_len, piece, block);
        if data.len() != expected {
            return Err(ProtocolError::WrongBlockLength {
                expected,
                got: data.len(),
            }
            .into());
        }

        let piece_complete = self.state.picker.mark_block_done(piece, block, self.id);

        // Another session still has this block on the wire; withdraw the
        // now-redundant endgame requests.
        if self.state.picker.is_block_resolving(piece, block) {
            self.state
                .registry
                .broadcast_cancel(index, begin, expected as u32, self.id);
        }

        self.state.storage.save_at(piece, &data, begin as usize);
        self.state.stats.add_downloaded(data.len() as u64);

        if piece_complete && !self.state.has_piece(piece) {
            self.verify_piece(piece).await?;
        }

        self.fill_pipeline(VecDeque::new()).await
    }

    /// Hash the staged piece. A match publishes it: own bitfield, output
    /// file, HAVE fan-out, and shutdown once everything is verified. A
    /// mismatch requeues the piece and counts against the peer.
    async fn verify_piece(&mut self, piece: usize) -> Result<()> {
        if self.state.storage.verify(piece, &self.state.hashes[piece]) {
            {
                let mut client = self.state.lock_bitfield();
                client.set(piece).expect("verified piece is in range");
            }

            let data = self.state.storage.piece(piece);
            let offset = (piece * self.state.piece_len) as u64;
            self.state
                .output
                .write_at(offset, &data)
                .context("Failed writing verified piece to the output file")?;

            self.state.stats.increment_pieces();
            debug!(
                "Piece {piece} verified ({}/{})",
                self.state.stats.pieces_completed(),
                self.state.stats.total_pieces()
            );

            self.state.registry.broadcast_have(piece as u32, self.id);

            if self.state.lock_bitfield().full() {
                info!("All pieces verified, shutting down the fleet");
                self.state.registry.shutdown();
            }
        } else {
            warn!(
                "Piece {piece} from peer {} failed hash verification",
                self.peer.address()
            );
            self.state.picker.mark_piece_in_queue(piece);
            self.hash_fails += 1;
            if self.hash_fails >= MAX_HASH_FAILS {
                bail!("Peer exceeded {MAX_HASH_FAILS} hash failures, assuming poisoning");
            }
        }
        Ok(())
    }

    /// Top up the request pipeline: interrupted requests are reissued
    /// verbatim and in order first, then fresh blocks come from the
    /// picker. When the picker runs dry for this peer we tell it so.
    async fn fill_pipeline(&mut self, mut unresolved: VecDeque<(usize, usize)>) -> Result<()> {
        while !self.is_choking
            && self.outstanding.len() < self.config.max_requests_per_peer
        {
            let Some((piece, block)) = unresolved.pop_front() else {
                break;
            };
            self.request(piece, block).await?;
        }

        while self.is_requestable() {
            match self.state.picker.pick(&self.remote_bitfield, self.id) {
                Some((piece, block)) => self.request(piece, block).await?,
                None => {
                    self.peer.send(PeerMessage::NotInterested).await?;
                    self.is_interesting = false;
                    break;
                }
            }
        }

        // Reissues that did not fit (or arrived while choked) go back to
        // the pool for other peers.
        for (piece, block) in unresolved {
            self.state.picker.mark_block_in_queue(piece, block, self.id);
        }
        Ok(())
    }

    async fn request(&mut self, piece: usize, block: usize) -> Result<()> {
        let begin = block * BLOCK_MAX;
        let length = block_size(self.state.total_len, self.state.piece_len, piece, block);

        // Track before sending so a failed send still releases the claim
        // on the cleanup path.
        self.outstanding.push((piece, block));
        self.peer
            .send(PeerMessage::Request {
                index: piece as u32,
                begin: begin as u32,
                length: length as u32,
            })
            .await
    }

    fn is_requestable(&self) -> bool {
        self.outstanding.len() < self.config.max_requests_per_peer
            && !self.is_choking
            && self.is_interesting
    }

    /// Exit path: every unanswered request goes back to the pool and the
    /// peer's bitfield no longer counts towards availability.
    fn release_claims(&mut self) {
        for (piece, block) in self.outstanding.drain(..) {
            self.state.picker.mark_block_in_queue(piece, block, self.id);
        }
        self.state.picker.decrement_availability(&self.remote_bitfield);
    }
}
