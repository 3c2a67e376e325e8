use std::net::SocketAddrV4;
use std::time::Duration;

use anyhow::{bail, Context, Ok};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tracing::instrument;

const PROTOCOL_IDENTIFIER_LENGTH: u8 = 19;
const PROTOCOL_IDENTIFIER: [u8; 19] = *b"BitTorrent protocol";
const HANDSHAKE_MESSAGE_LENGTH: usize = 68;

#[derive(Copy, Clone)]
struct HandshakeMessage {
    length: u8,
    pstr: [u8; PROTOCOL_IDENTIFIER_LENGTH as usize],
    reserved: [u8; 8],
    info_hash: [u8; 20],
    peer_id: [u8; 20],
}

impl HandshakeMessage {
    fn to_bytes(self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HANDSHAKE_MESSAGE_LENGTH);
        bytes.push(self.length);
        bytes.extend_from_slice(&self.pstr);
        bytes.extend_from_slice(&self.reserved);
        bytes.extend_from_slice(&self.info_hash);
        bytes.extend_from_slice(&self.peer_id);
        bytes
    }
}

/// Dial the peer and run the 68-byte handshake exchange in both
/// directions. The peer must speak the standard protocol and serve the
/// same info hash we are downloading.
#[instrument(skip(info_hash, peer_id))]
pub(super) async fn connect(
    addr: SocketAddrV4,
    info_hash: [u8; 20],
    peer_id: &str,
    connect_timeout: Duration,
) -> anyhow::Result<TcpStream> {
    if peer_id.as_bytes().len() != 20 {
        bail!("Peer ID must be exactly 20 bytes long");
    }

    let mut tcp_stream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .context("Establishing TCP stream timed out")?
        .context("Failed to connect to TCP stream")?;

    let mut our_peer_id = [0u8; 20];
    our_peer_id.copy_from_slice(peer_id.as_bytes());

    let handshake_message = HandshakeMessage {
        length: PROTOCOL_IDENTIFIER_LENGTH,
        pstr: PROTOCOL_IDENTIFIER,
        reserved: [0; 8],
        info_hash,
        peer_id: our_peer_id,
    };

    tcp_stream
        .write_all(&handshake_message.to_bytes())
        .await
        .context("Failed to send handshake message")?;

    let mut response = vec![0u8; HANDSHAKE_MESSAGE_LENGTH];
    timeout(connect_timeout, tcp_stream.read_exact(&mut response))
        .await
        .context("Handshake response timed out")?
        .context("Failed to read handshake response")?;

    if response[1..20] != PROTOCOL_IDENTIFIER {
        bail!("Invalid protocol identifier in handshake response");
    }

    if response[28..48] != info_hash {
        bail!("Info hash mismatch in handshake response");
    }

    tracing::debug!("Handshake with peer {} successful", addr);
    Ok(tcp_stream)
}
