use core::fmt;
use std::path::Path;

use anyhow::Context;
use serde_derive::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

mod hashes;

pub use hashes::Hashes;

use crate::piece;

/// Parsed single-file metainfo. Multi-file torrents are not supported.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Torrent {
    /// The URL of the tracker.
    pub announce: String,
    pub info: Info,
    /// SHA-1 of the bencoded info dict, computed after parsing; never
    /// part of the metainfo itself.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub info_hash: Option<[u8; 20]>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Info {
    /// The suggested name to save the file as. Purely advisory.
    pub name: String,

    /// The number of bytes in each piece the file is split into; the last
    /// piece may be truncated.
    #[serde(rename = "piece length")]
    pub piece_length: usize,

    /// Each entry of `pieces` is the SHA1 hash of the piece at the
    /// corresponding index.
    pub pieces: Hashes,

    /// The length of the file in bytes.
    pub length: usize,
}

impl Torrent {
    #[tracing::instrument]
    pub async fn open(file: impl AsRef<Path> + fmt::Debug) -> anyhow::Result<Self> {
        let file = tokio::fs::read(file)
            .await
            .context("Failed opening torrent file")?;
        let mut t: Torrent =
            serde_bencode::from_bytes(&file).context("Failed parsing torrent file")?;
        t.compute_info_hash().context("Failed to get info hash")?;
        t.validate()?;

        tracing::info!("Successfully opened {}", t.info.name);
        Ok(t)
    }

    pub fn compute_info_hash(&mut self) -> anyhow::Result<()> {
        if self.info_hash.is_some() {
            return Ok(());
        }

        let info_encoded =
            serde_bencode::to_bytes(&self.info).context("Failed to re-encode torrent info")?;

        let mut hasher = Sha1::new();
        hasher.update(&info_encoded);
        self.info_hash = Some(hasher.finalize().into());

        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.info.length > 0, "torrent length must be positive");
        anyhow::ensure!(
            self.info.piece_length > 0,
            "piece length must be positive"
        );
        let expected = piece::piece_count(self.info.length, self.info.piece_length);
        anyhow::ensure!(
            self.info.pieces.0.len() == expected,
            "expected {expected} piece hashes, metainfo carries {}",
            self.info.pieces.0.len()
        );
        Ok(())
    }

    pub fn length(&self) -> usize {
        self.info.length
    }

    pub fn piece_count(&self) -> usize {
        self.info.pieces.0.len()
    }

    pub fn urlencode_infohash(&self) -> Option<String> {
        self.info_hash.map(|info_hash| {
            let mut encoded = String::with_capacity(info_hash.len() * 3);
            info_hash.into_iter().for_each(|byte| {
                encoded.push('%');
                encoded.push_str(&format!("{:02X}", byte));
            });
            encoded
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Torrent {
        Torrent {
            announce: "http://tracker.example/announce".to_string(),
            info: Info {
                name: "sample.bin".to_string(),
                piece_length: 32_000,
                pieces: Hashes(vec![[1u8; 20], [2u8; 20]]),
                length: 64_000,
            },
            info_hash: None,
        }
    }

    #[test]
    fn metainfo_round_trips_through_bencode() {
        let torrent = sample();
        let encoded = serde_bencode::to_bytes(&torrent).unwrap();
        let decoded: Torrent = serde_bencode::from_bytes(&encoded).unwrap();

        assert_eq!(decoded.announce, torrent.announce);
        assert_eq!(decoded.info.name, "sample.bin");
        assert_eq!(decoded.info.piece_length, 32_000);
        assert_eq!(decoded.info.length, 64_000);
        assert_eq!(decoded.info.pieces, torrent.info.pieces);
    }

    #[test]
    fn info_hash_is_stable() {
        let mut a = sample();
        let mut b = sample();
        a.compute_info_hash().unwrap();
        b.compute_info_hash().unwrap();

        assert_eq!(a.info_hash, b.info_hash);
        assert_eq!(a.info_hash.unwrap().len(), 20);

        // urlencoding always escapes every byte
        let encoded = a.urlencode_infohash().unwrap();
        assert_eq!(encoded.len(), 60);
        assert!(encoded.starts_with('%'));
    }

    #[test]
    fn validate_rejects_wrong_hash_count() {
        let mut torrent = sample();
        torrent.info.pieces.0.pop();
        assert!(torrent.validate().is_err());

        let torrent = sample();
        assert!(torrent.validate().is_ok());
    }
}
