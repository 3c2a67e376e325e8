use std::io;

use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::PeerMessage;

// Largest legitimate frame is a PIECE carrying one 16 000-byte block plus
// its 9-byte header; anything bigger is a misbehaving peer.
const MAX_FRAME_SIZE: usize = 32 * 1024;

/// Length-prefixed frame codec for the peer wire protocol: 4-byte
/// big-endian length, 1-byte id, payload. Length zero is a keep-alive.
#[derive(Debug)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = PeerMessage;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "message length exceeds maximum allowed size",
            ));
        }

        // Wait for the whole frame before consuming anything.
        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        if length == 0 {
            return Ok(Some(PeerMessage::KeepAlive));
        }

        let mut frame = src.split_to(length);
        let id = frame.get_u8();

        let message = match id {
            0 => PeerMessage::Choke,
            1 => PeerMessage::Unchoke,
            2 => PeerMessage::Interested,
            3 => PeerMessage::NotInterested,
            4 => {
                if frame.len() != 4 {
                    return Err(malformed("have payload must be 4 bytes"));
                }
                PeerMessage::Have(frame.get_u32())
            }
            5 => PeerMessage::Bitfield(frame.to_vec()),
            6 => {
                if frame.len() != 12 {
                    return Err(malformed("request payload must be 12 bytes"));
                }
                PeerMessage::Request {
                    index: frame.get_u32(),
                    begin: frame.get_u32(),
                    length: frame.get_u32(),
                }
            }
            7 => {
                if frame.len() < 8 {
                    return Err(malformed("piece payload must carry index and begin"));
                }
                PeerMessage::Piece {
                    index: frame.get_u32(),
                    begin: frame.get_u32(),
                    block: frame.to_vec(),
                }
            }
            8 => {
                if frame.len() != 12 {
                    return Err(malformed("cancel payload must be 12 bytes"));
                }
                PeerMessage::Cancel {
                    index: frame.get_u32(),
                    begin: frame.get_u32(),
                    length: frame.get_u32(),
                }
            }
            _ => return Err(malformed("unknown message id")),
        };

        Ok(Some(message))
    }
}

impl Encoder<PeerMessage> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: PeerMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let Some(id) = msg.message_id() else {
            dst.put_u32(0);
            return Ok(());
        };

        match msg {
            PeerMessage::Choke
            | PeerMessage::Unchoke
            | PeerMessage::Interested
            | PeerMessage::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(id);
            }
            PeerMessage::Have(index) => {
                dst.put_u32(5);
                dst.put_u8(id);
                dst.put_u32(index);
            }
            PeerMessage::Bitfield(bytes) => {
                dst.put_u32(1 + bytes.len() as u32);
                dst.put_u8(id);
                dst.put_slice(&bytes);
            }
            PeerMessage::Request { index, begin, length }
            | PeerMessage::Cancel { index, begin, length } => {
                dst.put_u32(13);
                dst.put_u8(id);
                dst.put_u32(index);
                dst.put_u32(begin);
                dst.put_u32(length);
            }
            PeerMessage::Piece { index, begin, block } => {
                dst.put_u32(9 + block.len() as u32);
                dst.put_u8(id);
                dst.put_u32(index);
                dst.put_u32(begin);
                dst.put_slice(&block);
            }
            PeerMessage::KeepAlive => unreachable!(),
        }
        Ok(())
    }
}

fn malformed(detail: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, detail.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(bytes: &[u8]) -> Result<Option<PeerMessage>, io::Error> {
        MessageCodec.decode(&mut BytesMut::from(bytes))
    }

    #[test]
    fn decodes_keep_alive() {
        assert_eq!(decode_one(&[0, 0, 0, 0]).unwrap(), Some(PeerMessage::KeepAlive));
    }

    #[test]
    fn decodes_choke() {
        assert_eq!(decode_one(&[0, 0, 0, 1, 0]).unwrap(), Some(PeerMessage::Choke));
    }

    #[test]
    fn decodes_have() {
        assert_eq!(
            decode_one(&[0, 0, 0, 5, 4, 0, 0, 0, 42]).unwrap(),
            Some(PeerMessage::Have(42))
        );
    }

    #[test]
    fn decodes_bitfield() {
        assert_eq!(
            decode_one(&[0, 0, 0, 3, 5, 0b1010_1010, 0b1111_0000]).unwrap(),
            Some(PeerMessage::Bitfield(vec![0b1010_1010, 0b1111_0000]))
        );
    }

    #[test]
    fn incomplete_frame_waits_for_more() {
        let mut buffer = BytesMut::from(&[0, 0, 0, 5, 4, 0, 0][..]);
        assert!(MessageCodec.decode(&mut buffer).unwrap().is_none());
        // nothing consumed: completing the frame yields the message
        buffer.extend_from_slice(&[0, 42]);
        assert_eq!(
            MessageCodec.decode(&mut buffer).unwrap(),
            Some(PeerMessage::Have(42))
        );
    }

    #[test]
    fn rejects_unknown_message_id() {
        assert!(decode_one(&[0, 0, 0, 1, 99]).is_err());
    }

    #[test]
    fn rejects_excessive_length() {
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&((MAX_FRAME_SIZE + 1) as u32).to_be_bytes());
        buffer.extend_from_slice(&[0]);
        assert!(MessageCodec.decode(&mut buffer).is_err());
    }

    #[test]
    fn rejects_truncated_request_payload() {
        assert!(decode_one(&[0, 0, 0, 5, 6, 0, 0, 0, 1]).is_err());
    }

    #[test]
    fn encodes_what_it_decodes() {
        let messages = [
            PeerMessage::KeepAlive,
            PeerMessage::Interested,
            PeerMessage::NotInterested,
            PeerMessage::Have(7),
            PeerMessage::Bitfield(vec![0xA0, 0x01]),
            PeerMessage::Request { index: 1, begin: 16_000, length: 16_000 },
            PeerMessage::Piece { index: 1, begin: 16_000, block: vec![1, 2, 3] },
            PeerMessage::Cancel { index: 2, begin: 0, length: 4_000 },
        ];

        for msg in messages {
            let mut buffer = BytesMut::new();
            MessageCodec.encode(msg.clone(), &mut buffer).unwrap();
            assert_eq!(MessageCodec.decode(&mut buffer).unwrap(), Some(msg));
            assert!(buffer.is_empty());
        }
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let mut buffer = BytesMut::new();
        MessageCodec.encode(PeerMessage::Unchoke, &mut buffer).unwrap();
        MessageCodec.encode(PeerMessage::Have(3), &mut buffer).unwrap();

        assert_eq!(MessageCodec.decode(&mut buffer).unwrap(), Some(PeerMessage::Unchoke));
        assert_eq!(MessageCodec.decode(&mut buffer).unwrap(), Some(PeerMessage::Have(3)));
        assert_eq!(MessageCodec.decode(&mut buffer).unwrap(), None);
    }
}
