use anyhow::Context;
use rand::Rng;
use serde_derive::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::peer::PeerAddresses;
use crate::torrent::Torrent;

#[derive(Debug, Clone, Deserialize)]
pub struct TrackerResponse {
    /// How often the client should re-announce, in seconds. This client
    /// announces once per run.
    pub interval: usize,

    /// Peers the client can connect to, in either the compact 6-byte
    /// encoding or the dictionary list form.
    #[serde(rename = "peers")]
    pub peer_addresses: PeerAddresses,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackerRequest {
    /// A unique identifier for this client: 20 bytes picked per run.
    pub peer_id: String,

    /// The port the client is nominally listening on.
    pub port: u16,

    /// The total amount uploaded so far.
    pub uploaded: usize,

    /// The total amount downloaded so far.
    pub downloaded: usize,

    /// The number of bytes left to download.
    pub left: usize,

    /// Whether the peer list should use the compact representation.
    pub compact: u8,
}

impl TrackerRequest {
    fn build_request(torrent: &Torrent, peer_id: &str, port: u16) -> Self {
        TrackerRequest {
            peer_id: peer_id.to_string(),
            port,
            uploaded: 0,
            downloaded: 0,
            left: torrent.length(),
            compact: 1,
        }
    }

    #[instrument(skip(torrent, peer_id))]
    pub async fn announce(
        torrent: &Torrent,
        peer_id: &str,
        port: u16,
    ) -> anyhow::Result<TrackerResponse> {
        let request = Self::build_request(torrent, peer_id, port);
        let params = serde_urlencoded::to_string(&request)
            .context("Failed to encode tracker url params!")?;
        let info_hash_urlencoded = torrent
            .urlencode_infohash()
            .context("Failed to urlencode infohash")?;

        let tracker_url = format!(
            "{}?{}&info_hash={}",
            torrent.announce, params, info_hash_urlencoded,
        );

        let response = reqwest::get(tracker_url)
            .await
            .context("Failed to make GET request to tracker server!")?;
        let response = response
            .bytes()
            .await
            .context("Failed converting tracker response into bytes!")?;

        let response: TrackerResponse = serde_bencode::from_bytes(&response)
            .context("Failed to deserialize tracker response!")?;

        info!(
            "Tracker returned {} peers",
            response.peer_addresses.0.len()
        );

        Ok(response)
    }

    pub fn generate_peer_id() -> String {
        let mut rng = rand::thread_rng();
        let prefix = "-GB0001-";
        let mut peer_id = String::with_capacity(20);
        peer_id.push_str(prefix);

        // Fill the rest with alphanumeric characters
        for _ in prefix.len()..20 {
            let char = match rng.gen_range(0..3) {
                0 => rng.gen_range(b'A'..=b'Z') as char,
                1 => rng.gen_range(b'a'..=b'z') as char,
                _ => rng.gen_range(b'0'..=b'9') as char,
            };
            peer_id.push(char);
        }

        peer_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::{Hashes, Info};
    use anyhow::{Ok, Result};
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn mock_torrent(announce: String) -> Torrent {
        Torrent {
            announce,
            info: Info {
                name: "mock_torrent".to_string(),
                piece_length: 256 * 1024,
                pieces: Hashes(vec![[0u8; 20]; 4]),
                length: 1024 * 1024,
            },
            info_hash: Some([0u8; 20]),
        }
    }

    #[tokio::test]
    async fn announce_parses_compact_peers() -> Result<()> {
        let mut mock_server = mockito::Server::new_async().await;

        let peers = [
            192, 0, 2, 123, 0x1A, 0xE1, // 0x1AE1 = 6881
            127, 0, 0, 1, 0x1A, 0xE9, // 0x1AE9 = 6889
        ];
        let mut response_body = Vec::new();
        response_body.extend_from_slice(b"d8:intervali900e5:peers12:");
        response_body.extend_from_slice(&peers);
        response_body.extend_from_slice(b"e");

        let mock = mock_server
            .mock("GET", "/announce")
            .match_query(mockito::Matcher::Any)
            .expect(1)
            .with_status(200)
            .with_header("content-type", "application/x-bencoded")
            .with_body(response_body)
            .create();

        let torrent = mock_torrent(format!("{}/announce", mock_server.url()));
        let peer_id = TrackerRequest::generate_peer_id();
        let response = TrackerRequest::announce(&torrent, &peer_id, 6881).await?;

        assert_eq!(response.interval, 900);
        assert_eq!(
            response.peer_addresses,
            PeerAddresses(vec![
                SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 123), 6881),
                SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 6889),
            ])
        );

        mock.assert();
        Ok(())
    }

    #[tokio::test]
    async fn announce_parses_dictionary_peers() -> Result<()> {
        let mut mock_server = mockito::Server::new_async().await;

        let body = b"d8:intervali1800e5:peersld2:ip11:192.0.2.2004:porti6881eeee".to_vec();
        let _mock = mock_server
            .mock("GET", "/announce")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(body)
            .create();

        let torrent = mock_torrent(format!("{}/announce", mock_server.url()));
        let peer_id = TrackerRequest::generate_peer_id();
        let response = TrackerRequest::announce(&torrent, &peer_id, 6881).await?;

        assert_eq!(response.interval, 1800);
        assert_eq!(
            response.peer_addresses,
            PeerAddresses(vec![SocketAddrV4::new(
                Ipv4Addr::new(192, 0, 2, 200),
                6881
            )])
        );

        Ok(())
    }

    #[test]
    fn peer_id_is_twenty_ascii_bytes() {
        let id = TrackerRequest::generate_peer_id();
        assert_eq!(id.as_bytes().len(), 20);
        assert!(id.starts_with("-GB0001-"));
        assert!(id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-'));
    }
}
