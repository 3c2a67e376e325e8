use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::bitfield::Bitfield;

use super::{BlockStatus, PeerId, PieceStatus, PieceStore};

/// Number of piece starts during which selection is randomised instead of
/// rarest-first, so a fresh swarm does not convoy on the same piece.
const WARM_UP: usize = 5;

/// Chooses the next (piece, block) to request for a peer.
///
/// Candidate pieces live in an ordered list: in-progress pieces first
/// (finish what you started), then queued pieces, each class sorted by
/// ascending availability with stable ties. When the list runs dry the
/// picker switches to endgame and hands out already-pending blocks to
/// extra peers, trading duplicate bandwidth for tail latency.
///
/// One mutex guards the piece store and the ordered list together; every
/// public operation is a single short critical section with no I/O.
#[derive(Debug)]
pub struct Picker {
    inner: Mutex<State>,
}

#[derive(Debug)]
struct State {
    store: PieceStore,
    ordered: Vec<usize>,
    warm_up: usize,
    rng: StdRng,
}

impl Picker {
    pub fn new(total_len: usize, piece_len: usize) -> Self {
        let store = PieceStore::new(total_len, piece_len);
        let ordered = (0..store.piece_count()).collect();
        Self {
            inner: Mutex::new(State {
                store,
                ordered,
                warm_up: 0,
                rng: StdRng::from_entropy(),
            }),
        }
    }

    /// Reseed the warm-up randomness; picks become deterministic.
    pub fn set_seed(&self, seed: u64) {
        self.lock().rng = StdRng::seed_from_u64(seed);
    }

    /// Next block to request for a peer advertising `have`. The block is
    /// claimed for `peer` before returning. `None` means this peer has
    /// nothing we still need.
    pub fn pick(&self, have: &Bitfield, peer: PeerId) -> Option<(usize, usize)> {
        let mut state = self.lock();
        if state.ordered.is_empty() {
            return state.pick_endgame(have, peer);
        }
        let piece = state.pick_piece(have)?;
        let block = state.pick_block(piece, peer);
        Some((piece, block))
    }

    /// Record a block delivered by `peer`. Returns true once the whole
    /// piece is downloaded and awaiting verification of its hash.
    pub fn mark_block_done(&self, piece: usize, block: usize, peer: PeerId) -> bool {
        self.lock().store.mark_block_done(piece, block, peer)
    }

    /// Return a claimed block to the pool after a disconnect or lost
    /// request. A pending piece goes back on the ordered list so other
    /// peers can finish it.
    pub fn mark_block_in_queue(&self, piece: usize, block: usize, peer: PeerId) {
        let mut state = self.lock();
        let State { store, ordered, .. } = &mut *state;

        let entry = store.piece_at(piece);
        entry.blocks[block].release(peer);

        // Delivered by another peer in the meantime; nothing to requeue.
        if entry.blocks[block].status == BlockStatus::Done
            || entry.status == PieceStatus::Done
        {
            return;
        }
        // An endgame duplicate is still on the wire with another peer.
        if entry.blocks[block].is_resolving() {
            return;
        }
        entry.blocks[block].status = BlockStatus::InQueue;

        if entry.status == PieceStatus::Pending {
            entry.status = PieceStatus::InProgress;
            ordered.push(piece);
        }
        if entry.status == PieceStatus::InProgress
            && entry.blocks.iter().all(|b| {
                b.status == BlockStatus::InQueue && !b.is_resolving()
            })
        {
            entry.status = PieceStatus::InQueue;
        }
        state.order_pieces();
    }

    /// Reset a piece that failed hash verification and make it pickable
    /// again.
    pub fn mark_piece_in_queue(&self, piece: usize) {
        let mut state = self.lock();
        state.store.reset_piece(piece);
        state.ordered.push(piece);
        state.order_pieces();
    }

    pub fn increment_piece_availability(&self, piece: usize) {
        let mut state = self.lock();
        state.store.piece_at(piece).availability += 1;
        state.order_pieces();
    }

    /// Batch availability update for a freshly received bitfield, done
    /// under a single lock acquisition.
    pub fn increment_availability(&self, have: &Bitfield) {
        let mut state = self.lock();
        for piece in have.ones() {
            state.store.piece_at(piece).availability += 1;
        }
        state.order_pieces();
    }

    /// Undo a peer's contribution when it disconnects.
    pub fn decrement_availability(&self, have: &Bitfield) {
        let mut state = self.lock();
        for piece in have.ones() {
            let entry = state.store.piece_at(piece);
            entry.availability = entry.availability.saturating_sub(1);
        }
        state.order_pieces();
    }

    /// Does any peer still have an outstanding request for this block?
    pub fn is_block_resolving(&self, piece: usize, block: usize) -> bool {
        self.lock().store.piece_at(piece).blocks[block].is_resolving()
    }

    pub fn is_piece_done(&self, piece: usize) -> bool {
        self.lock().store.piece_at(piece).status == PieceStatus::Done
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned picker means a panic inside a critical section; the
        // state is unrecoverable (Integrity failure).
        self.inner.lock().expect("picker state poisoned")
    }

    #[cfg(test)]
    pub(crate) fn skip_warm_up(&self) {
        self.lock().warm_up = WARM_UP;
    }
}

impl State {
    /// Select a candidate piece from the ordered list: first a started
    /// piece the peer has, otherwise warm-up random or rarest-first among
    /// the queued suffix.
    fn pick_piece(&mut self, have: &Bitfield) -> Option<usize> {
        let State { store, ordered, .. } = self;

        let boundary = ordered
            .iter()
            .position(|&pi| store.piece_at(pi).status == PieceStatus::InQueue)
            .unwrap_or(ordered.len());

        for &pi in &ordered[..boundary] {
            if have.get(pi).unwrap_or(false) {
                return Some(pi);
            }
        }

        if self.warm_up < WARM_UP {
            self.pick_random_piece(have, boundary)
        } else {
            self.pick_rarest_piece(have, boundary)
        }
    }

    fn pick_random_piece(&mut self, have: &Bitfield, boundary: usize) -> Option<usize> {
        let candidates: Vec<usize> = self.ordered[boundary..]
            .iter()
            .copied()
            .filter(|&pi| have.get(pi).unwrap_or(false))
            .collect();
        candidates.choose(&mut self.rng).copied()
    }

    fn pick_rarest_piece(&self, have: &Bitfield, boundary: usize) -> Option<usize> {
        self.ordered[boundary..]
            .iter()
            .copied()
            .find(|&pi| have.get(pi).unwrap_or(false))
    }

    /// Claim the first queued block of `piece` for `peer`, maintaining
    /// the piece's status and its membership in the ordered list.
    fn pick_block(&mut self, piece: usize, peer: PeerId) -> usize {
        let entry = self.store.piece_at(piece);
        let block = entry
            .blocks
            .iter()
            .position(|b| b.status == BlockStatus::InQueue)
            .expect("picked piece has no free block");
        entry.blocks[block].status = BlockStatus::Pending;
        entry.blocks[block].claimants.push(peer);

        if !entry.has_in_queue_block() {
            entry.status = PieceStatus::Pending;
            self.ordered.retain(|&pi| pi != piece);
            return block;
        }

        if entry.status == PieceStatus::InQueue {
            entry.status = PieceStatus::InProgress;
            self.warm_up += 1;
            self.order_pieces();
        }

        block
    }

    /// The ordered list is empty: every remaining block is pending with
    /// some other peer. Ask this peer for the first pending block it has
    /// and is not already claiming.
    fn pick_endgame(&mut self, have: &Bitfield, peer: PeerId) -> Option<(usize, usize)> {
        for (pi, entry) in self.store.pieces_mut() {
            if entry.status != PieceStatus::Pending {
                continue;
            }
            if !have.get(pi).unwrap_or(false) {
                continue;
            }
            let found = entry.blocks.iter().position(|b| {
                b.status == BlockStatus::Pending && !b.claimants.contains(&peer)
            });
            if let Some(bi) = found {
                entry.blocks[bi].claimants.push(peer);
                return Some((pi, bi));
            }
        }
        None
    }

    /// Re-sort: in-progress pieces ahead of queued ones, rarest first
    /// within each class. `sort_by_key` is stable, so ties keep their
    /// relative order.
    fn order_pieces(&mut self) {
        let State { store, ordered, .. } = self;
        ordered.sort_by_key(|&pi| {
            let entry = store.piece_at(pi);
            let class = match entry.status {
                PieceStatus::InProgress => 0u8,
                _ => 1,
            };
            (class, entry.availability)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece::BlockStatus;

    fn full_have(pieces: usize) -> Bitfield {
        let mut bf = Bitfield::new(pieces);
        for i in 0..pieces {
            bf.set(i).unwrap();
        }
        bf
    }

    // 3 pieces x 2 blocks of 16 000 bytes
    fn three_piece_picker() -> Picker {
        Picker::new(96_000, 32_000)
    }

    #[test]
    fn rarest_piece_wins_after_warm_up() {
        let picker = three_piece_picker();
        picker.skip_warm_up();
        for _ in 0..3 {
            picker.increment_piece_availability(0);
        }
        picker.increment_piece_availability(1);
        for _ in 0..2 {
            picker.increment_piece_availability(2);
        }

        let (piece, block) = picker.pick(&full_have(3), 1).unwrap();
        assert_eq!((piece, block), (1, 0));
    }

    #[test]
    fn warm_up_picks_are_roughly_uniform() {
        // 10 equally available single-block pieces; chi-squared over the
        // distribution of first picks across 1000 seeds must not reject
        // uniformity at p = 0.01 (critical value 21.666 for 9 degrees of
        // freedom).
        let mut counts = [0usize; 10];
        for seed in 0..1000 {
            let picker = Picker::new(160_000, 16_000);
            picker.set_seed(seed);
            let (piece, _) = picker.pick(&full_have(10), 1).unwrap();
            counts[piece] += 1;
        }

        let expected = 100.0;
        let chi2: f64 = counts
            .iter()
            .map(|&obs| {
                let diff = obs as f64 - expected;
                diff * diff / expected
            })
            .sum();
        assert!(chi2 < 21.666, "chi-squared {chi2} rejects uniformity: {counts:?}");
    }

    #[test]
    fn started_pieces_are_finished_first() {
        let picker = three_piece_picker();
        picker.skip_warm_up();
        // piece 2 is rarest but piece 0 is already started
        for _ in 0..3 {
            picker.increment_piece_availability(0);
        }
        for _ in 0..3 {
            picker.increment_piece_availability(1);
        }
        picker.increment_piece_availability(2);

        let first = picker.pick(&full_have(3), 1).unwrap();
        assert_eq!(first, (2, 0));

        // another peer must continue piece 2 before opening piece 0
        let second = picker.pick(&full_have(3), 2).unwrap();
        assert_eq!(second, (2, 1));
    }

    #[test]
    fn never_picks_a_piece_the_peer_lacks() {
        let picker = three_piece_picker();
        let mut have = Bitfield::new(3);
        have.set(2).unwrap();

        for _ in 0..2 {
            let (piece, _) = picker.pick(&have, 1).unwrap();
            assert_eq!(piece, 2);
        }
        // piece 2 exhausted for this peer, the rest are not advertised
        assert_eq!(picker.pick(&have, 1), None);
    }

    #[test]
    fn same_block_is_never_claimed_twice_by_one_peer() {
        let picker = Picker::new(64_000, 32_000);
        let have = full_have(2);

        let mut seen = Vec::new();
        while let Some(claim) = picker.pick(&have, 1) {
            assert!(!seen.contains(&claim), "duplicate claim {claim:?}");
            seen.push(claim);
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn endgame_duplicates_to_other_peers_only() {
        let picker = Picker::new(64_000, 32_000);
        let have = full_have(2);

        // peer 1 claims everything, entering endgame for the rest
        while picker.pick(&have, 1).is_some() {}

        // peer 2 can duplicate each pending block exactly once
        let mut duplicated = Vec::new();
        while let Some(claim) = picker.pick(&have, 2) {
            duplicated.push(claim);
        }
        assert_eq!(duplicated.len(), 4);
        for &(pi, bi) in &duplicated {
            assert!(picker.is_block_resolving(pi, bi));
        }

        // both peers claim every block now, a third request from peer 1
        // finds nothing
        assert_eq!(picker.pick(&have, 1), None);
    }

    #[test]
    fn block_resolves_until_the_last_claimant_is_released() {
        let picker = Picker::new(64_000, 32_000);
        let have = full_have(2);

        while picker.pick(&have, 1).is_some() {}
        let (pi, bi) = picker.pick(&have, 2).unwrap();

        // peer 1 delivers; peer 2 still has an outstanding request
        picker.mark_block_done(pi, bi, 1);
        assert!(picker.is_block_resolving(pi, bi));

        picker.mark_block_in_queue(pi, bi, 2);
        assert!(!picker.is_block_resolving(pi, bi));
    }

    #[test]
    fn disconnect_requeues_outstanding_blocks() {
        let picker = three_piece_picker();
        picker.skip_warm_up();
        let have = full_have(3);

        let claims: Vec<_> = (0..3).map(|_| picker.pick(&have, 1).unwrap()).collect();

        for &(pi, bi) in &claims {
            picker.mark_block_in_queue(pi, bi, 1);
        }

        for &(pi, bi) in &claims {
            assert!(!picker.is_block_resolving(pi, bi));
        }
        {
            let mut state = picker.lock();
            for &(pi, _) in &claims {
                let entry = state.store.piece_at(pi);
                assert_eq!(entry.status(), PieceStatus::InQueue);
                assert!(entry
                    .blocks()
                    .iter()
                    .all(|b| b.status() == BlockStatus::InQueue && !b.is_resolving()));
            }
        }

        // every returned block is pickable again
        let mut seen = Vec::new();
        while let Some(claim) = picker.pick(&have, 2) {
            seen.push(claim);
        }
        for claim in claims {
            assert!(seen.contains(&claim));
        }
    }

    #[test]
    fn pending_piece_returns_to_the_list_in_progress() {
        let picker = Picker::new(64_000, 32_000);
        picker.skip_warm_up();
        let have = full_have(2);

        // two peers split piece 0; it leaves the ordered list as pending
        let (p0, b0) = picker.pick(&have, 1).unwrap();
        let (p1, b1) = picker.pick(&have, 2).unwrap();
        assert_eq!((p0, p1), (0, 0));

        // peer 2 disconnects; its half goes back and the piece jumps the
        // queue ahead of the untouched piece 1
        picker.mark_block_in_queue(p1, b1, 2);
        let next = picker.pick(&have, 3).unwrap();
        assert_eq!(next, (0, b1));

        // peer 1's half is still outstanding
        assert!(picker.is_block_resolving(p0, b0));
    }

    #[test]
    fn hash_failure_makes_the_piece_pickable_again() {
        let picker = Picker::new(32_000, 32_000);
        let have = full_have(1);

        let (_, b0) = picker.pick(&have, 1).unwrap();
        let (_, b1) = picker.pick(&have, 1).unwrap();
        picker.mark_block_done(0, b0, 1);
        picker.mark_block_done(0, b1, 1);
        assert!(picker.is_piece_done(0));

        picker.mark_piece_in_queue(0);
        assert!(!picker.is_piece_done(0));

        // full set of blocks available again, to anyone
        assert_eq!(picker.pick(&have, 2), Some((0, 0)));
        assert_eq!(picker.pick(&have, 2), Some((0, 1)));
    }
}
