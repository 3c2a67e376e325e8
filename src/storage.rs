use std::sync::Mutex;

use sha1::{Digest, Sha1};

use crate::piece::piece_size;

/// In-memory staging area for downloaded blocks: one flat buffer covering
/// the whole torrent, allocated up front. Sessions copy validated blocks
/// in as they arrive and hash whole pieces out of it.
#[derive(Debug)]
pub struct Storage {
    total_len: usize,
    piece_len: usize,
    buf: Mutex<Vec<u8>>,
}

impl Storage {
    pub fn new(total_len: usize, piece_len: usize) -> Self {
        Self {
            total_len,
            piece_len,
            buf: Mutex::new(vec![0; total_len]),
        }
    }

    /// Copy a received block to its absolute position. The caller has
    /// already validated the piece index, offset alignment and length.
    pub fn save_at(&self, piece: usize, data: &[u8], offset: usize) {
        let start = piece * self.piece_len + offset;
        let mut buf = self.lock();
        buf[start..start + data.len()].copy_from_slice(data);
    }

    /// Bytes of a whole piece, copied out for writing to the output file.
    pub fn piece(&self, piece: usize) -> Vec<u8> {
        let start = piece * self.piece_len;
        let len = piece_size(self.total_len, self.piece_len, piece);
        self.lock()[start..start + len].to_vec()
    }

    /// SHA-1 the piece's bytes and compare with the metainfo hash.
    pub fn verify(&self, piece: usize, expected: &[u8; 20]) -> bool {
        let start = piece * self.piece_len;
        let len = piece_size(self.total_len, self.piece_len, piece);
        let buf = self.lock();

        let mut hasher = Sha1::new();
        hasher.update(&buf[start..start + len]);
        let actual: [u8; 20] = hasher.finalize().into();
        actual == *expected
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.buf.lock().expect("storage buffer poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece::BLOCK_MAX;

    fn sha1_of(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    #[test]
    fn saved_blocks_verify_against_their_hash() {
        let storage = Storage::new(64_000, 32_000);
        let piece: Vec<u8> = (0..32_000).map(|i| (i % 251) as u8).collect();

        storage.save_at(1, &piece[..BLOCK_MAX], 0);
        storage.save_at(1, &piece[BLOCK_MAX..], BLOCK_MAX);

        assert!(storage.verify(1, &sha1_of(&piece)));
        assert_eq!(storage.piece(1), piece);
    }

    #[test]
    fn corrupt_piece_fails_verification() {
        let storage = Storage::new(64_000, 32_000);
        let piece = vec![7u8; 32_000];
        storage.save_at(0, &piece, 0);

        assert!(!storage.verify(0, &[0u8; 20]));

        let mut tampered = piece.clone();
        tampered[100] ^= 1;
        assert!(!storage.verify(0, &sha1_of(&tampered)));
        assert!(storage.verify(0, &sha1_of(&piece)));
    }

    #[test]
    fn last_piece_hashes_only_its_remainder() {
        // 50 000 bytes: piece 1 is 18 000 bytes long
        let storage = Storage::new(50_000, 32_000);
        let tail = vec![42u8; 18_000];
        storage.save_at(1, &tail[..BLOCK_MAX], 0);
        storage.save_at(1, &tail[BLOCK_MAX..], BLOCK_MAX);

        assert_eq!(storage.piece(1).len(), 18_000);
        assert!(storage.verify(1, &sha1_of(&tail)));
    }
}
