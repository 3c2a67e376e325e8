use std::net::SocketAddrV4;
use std::time::Duration;

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

mod address;
mod handshake;

use crate::bitfield::BitfieldError;
use crate::message::{MessageCodec, PeerMessage};

#[derive(Debug, Clone, PartialEq)]
pub struct PeerAddresses(pub Vec<SocketAddrV4>);

impl PeerAddresses {
    pub fn iter(&self) -> std::slice::Iter<'_, SocketAddrV4> {
        self.0.iter()
    }
}

/// Wire-protocol violations. Fatal for the offending session; the rest
/// of the swarm is unaffected.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bitfield is only allowed as the first message after the handshake")]
    UnexpectedBitfield,
    #[error("invalid bitfield: {0}")]
    BadBitfield(#[from] BitfieldError),
    #[error("piece index {0} out of range")]
    PieceOutOfRange(u32),
    #[error("block offset {0} is not aligned to the block size")]
    MisalignedOffset(u32),
    #[error("piece {piece} offset {offset} was never requested from this peer")]
    UnsolicitedPiece { piece: u32, offset: u32 },
    #[error("block length {got} does not match the requested {expected} bytes")]
    WrongBlockLength { expected: usize, got: usize },
}

/// A handshaken peer connection carrying framed wire messages.
#[derive(Debug)]
pub struct Peer {
    addr: SocketAddrV4,
    stream: Framed<TcpStream, MessageCodec>,
}

impl Peer {
    /// Dial, handshake and frame the connection. Fails on timeout, on a
    /// protocol mismatch or when the peer serves a different info hash.
    pub async fn connect(
        addr: SocketAddrV4,
        info_hash: [u8; 20],
        peer_id: &str,
        connect_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let stream = handshake::connect(addr, info_hash, peer_id, connect_timeout)
            .await
            .with_context(|| format!("Failed to handshake with {addr}"))?;

        Ok(Self {
            addr,
            stream: Framed::new(stream, MessageCodec),
        })
    }

    pub fn address(&self) -> SocketAddrV4 {
        self.addr
    }

    pub async fn send(&mut self, msg: PeerMessage) -> anyhow::Result<()> {
        self.stream
            .send(msg)
            .await
            .with_context(|| format!("Failed to send message to {}", self.addr))
    }

    /// Next frame from the peer; `None` once the connection is closed.
    pub async fn next_message(&mut self) -> Option<std::io::Result<PeerMessage>> {
        self.stream.next().await
    }
}
