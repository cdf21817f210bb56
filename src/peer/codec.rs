//! The BitTorrent peer wire protocol framing.
//!
//! Two codecs are defined: [`HandshakeCodec`] for the fixed 68 byte
//! handshake that starts every connection, and [`PeerCodec`] for the length
//! prefixed messages exchanged afterwards. A connection switches from the
//! former to the latter via `FramedParts`, keeping any already buffered
//! bytes.
//!
//! All multi-byte integers on the wire are big-endian.

use std::convert::TryFrom;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::Error, Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash};

/// The protocol string transmitted after the length prefix byte of the
/// handshake.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The handshake is the first message of a connection, exchanged in both
/// directions:
///
/// ```text
/// <1 byte: 19> <19 bytes: "BitTorrent protocol">
/// <8 reserved bytes> <20 bytes: info hash> <20 bytes: peer id>
/// ```
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Handshake {
    /// The protocol string, always [`PROTOCOL_STRING`] when valid.
    pub prot: [u8; 19],
    /// Extension bits. We support none, so all zeros on send.
    pub reserved: [u8; 8],
    /// The torrent's identifier; a mismatch aborts the connection.
    pub info_hash: Sha1Hash,
    /// The sender's arbitrary 20 byte id.
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

#[derive(Debug)]
pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        let Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        } = handshake;
        buf.reserve(68);
        buf.put_u8(prot.len() as u8);
        buf.put_slice(&prot);
        buf.put_slice(&reserved);
        buf.put_slice(&info_hash);
        buf.put_slice(&peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Handshake>, Self::Error> {
        if buf.is_empty() {
            return Ok(None);
        }

        // the length prefix byte can be checked without waiting for the rest
        if buf[0] as usize != PROTOCOL_STRING.len() {
            return Err(Error::InvalidHandshake);
        }
        if buf.len() < 68 {
            return Ok(None);
        }

        buf.advance(1);
        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(Error::InvalidHandshake);
        }
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The id of a message, which is sent as a single byte after the length
/// prefix of all messages but the keep-alive.
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u8)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = ();

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        use MessageId::*;
        match id {
            0 => Ok(Choke),
            1 => Ok(Unchoke),
            2 => Ok(Interested),
            3 => Ok(NotInterested),
            4 => Ok(Have),
            5 => Ok(Bitfield),
            6 => Ok(Request),
            7 => Ok(Piece),
            8 => Ok(Cancel),
            9 => Ok(Port),
            _ => Err(()),
        }
    }
}

/// A message in the peer wire protocol, after the handshake.
///
/// The wire layout is a 4 byte big-endian length prefix (counting the id byte
/// and the payload, so zero for the keep-alive), then the id byte, then the
/// payload.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    Bitfield(Bitfield),
    Request(BlockInfo),
    /// The `piece` message carrying a block of data. It is named block since
    /// it carries a block of a piece, not a whole piece.
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
    Port {
        port: u16,
    },
}

impl Message {
    /// Returns the message's id, or `None` for the keep-alive, which has
    /// none.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Piece),
            Self::Cancel(_) => Some(MessageId::Cancel),
            Self::Port { .. } => Some(MessageId::Port),
        }
    }
}

pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(
        &mut self,
        msg: Message,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        use Message::*;
        match msg {
            KeepAlive => {
                buf.put_u32(0);
            }
            Choke | Unchoke | Interested | NotInterested => {
                buf.put_u32(1);
                // checked above, the id exists for all but the keep-alive
                buf.put_u8(msg.id().unwrap() as u8);
            }
            Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Bitfield(bitfield) => {
                buf.put_u32(1 + bitfield.as_slice().len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bitfield.as_slice());
            }
            Request(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
            Cancel(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Port { port } => {
                buf.put_u32(3);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(port);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Message>, Self::Error> {
        // messages with unknown ids are skipped, hence the loop
        loop {
            if buf.len() < 4 {
                return Ok(None);
            }

            // peek at the length prefix without consuming it, in case the
            // full message hasn't arrived yet
            let msg_len = {
                let mut peek = &buf[..4];
                peek.get_u32() as usize
            };

            if msg_len == 0 {
                buf.advance(4);
                return Ok(Some(Message::KeepAlive));
            }
            if buf.len() < 4 + msg_len {
                // preallocate so the next reads don't grow the buffer
                // piecemeal
                buf.reserve(4 + msg_len - buf.len());
                return Ok(None);
            }

            buf.advance(4);
            let id = buf.get_u8();
            let payload_len = msg_len - 1;

            let id = match MessageId::try_from(id) {
                Ok(id) => id,
                Err(()) => {
                    // unrecognized id: read and discard the payload, then
                    // keep decoding
                    log::debug!("Discarding unknown message id {}", id);
                    buf.advance(payload_len);
                    continue;
                }
            };

            let msg = match id {
                MessageId::Choke => Message::Choke,
                MessageId::Unchoke => Message::Unchoke,
                MessageId::Interested => Message::Interested,
                MessageId::NotInterested => Message::NotInterested,
                MessageId::Have => {
                    if payload_len != 4 {
                        return Err(Error::InvalidMessage);
                    }
                    Message::Have {
                        piece_index: buf.get_u32() as PieceIndex,
                    }
                }
                MessageId::Bitfield => {
                    let mut bytes = vec![0; payload_len];
                    buf.copy_to_slice(&mut bytes);
                    Message::Bitfield(Bitfield::from_vec(bytes))
                }
                MessageId::Request => {
                    if payload_len != 12 {
                        return Err(Error::InvalidMessage);
                    }
                    Message::Request(BlockInfo {
                        piece_index: buf.get_u32() as PieceIndex,
                        offset: buf.get_u32(),
                        len: buf.get_u32(),
                    })
                }
                MessageId::Piece => {
                    if payload_len < 8 {
                        return Err(Error::InvalidMessage);
                    }
                    let piece_index = buf.get_u32() as PieceIndex;
                    let offset = buf.get_u32();
                    let mut data = vec![0; payload_len - 8];
                    buf.copy_to_slice(&mut data);
                    Message::Block {
                        piece_index,
                        offset,
                        data,
                    }
                }
                MessageId::Cancel => {
                    if payload_len != 12 {
                        return Err(Error::InvalidMessage);
                    }
                    Message::Cancel(BlockInfo {
                        piece_index: buf.get_u32() as PieceIndex,
                        offset: buf.get_u32(),
                        len: buf.get_u32(),
                    })
                }
                MessageId::Port => {
                    if payload_len != 2 {
                        return Err(Error::InvalidMessage);
                    }
                    Message::Port {
                        port: buf.get_u16(),
                    }
                }
            };

            return Ok(Some(msg));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn encode_peer_msg(msg: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        PeerCodec.encode(msg, &mut buf).unwrap();
        buf
    }

    fn decode_peer_msg(buf: &mut BytesMut) -> Option<Message> {
        PeerCodec.decode(buf).unwrap()
    }

    #[test]
    fn test_handshake_round_trip() {
        let handshake = Handshake::new([0xab; 20], *b"-RT0010-abcdefghijkl");
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), 68);
        assert_eq!(buf[0], 0x13);
        assert_eq!(&buf[1..20], PROTOCOL_STRING.as_bytes());
        assert_eq!(&buf[28..48], &[0xab; 20][..]);

        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_handshake_incomplete_returns_none() {
        let handshake = Handshake::new([1; 20], [2; 20]);
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        let mut partial = buf.split_to(30);
        assert_eq!(HandshakeCodec.decode(&mut partial).unwrap(), None);
    }

    #[test]
    fn test_handshake_bad_prefix_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(18);
        buf.put_slice(&[0; 67]);
        assert!(HandshakeCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_handshake_bad_protocol_string_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(19);
        buf.put_slice(b"BitTorrent protocoX");
        buf.put_slice(&[0; 48]);
        assert!(HandshakeCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_request_round_trip() {
        let block = BlockInfo {
            piece_index: 42,
            offset: 0x4000,
            len: 0x4000,
        };
        let mut buf = encode_peer_msg(Message::Request(block));
        // length prefix 13, id 6, then three big-endian u32 fields
        assert_eq!(
            &buf[..],
            &[
                0, 0, 0, 13, 6, 0, 0, 0, 42, 0, 0, 0x40, 0, 0, 0, 0x40, 0
            ][..]
        );
        assert_eq!(
            decode_peer_msg(&mut buf),
            Some(Message::Request(block))
        );
    }

    #[test]
    fn test_block_round_trip() {
        let data: Vec<u8> = (0..255).collect();
        let msg = Message::Block {
            piece_index: 3,
            offset: 0x8000,
            data: data.clone(),
        };
        let mut buf = encode_peer_msg(msg);
        assert_eq!(buf.len(), 4 + 9 + data.len());
        assert_eq!(
            decode_peer_msg(&mut buf),
            Some(Message::Block {
                piece_index: 3,
                offset: 0x8000,
                data,
            })
        );
    }

    #[test]
    fn test_simple_messages_round_trip() {
        for msg in [
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { piece_index: 7 },
            Message::Port { port: 6881 },
        ]
        .iter()
        .cloned()
        {
            let mut buf = encode_peer_msg(msg.clone());
            assert_eq!(decode_peer_msg(&mut buf), Some(msg));
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_bitfield_round_trip() {
        // 16 pieces with 0, 1 and 10 set; the wire form is two bytes, MSB
        // first
        let mut bitfield = Bitfield::repeat(false, 16);
        bitfield.set(0, true);
        bitfield.set(1, true);
        bitfield.set(10, true);
        let mut buf = encode_peer_msg(Message::Bitfield(bitfield.clone()));
        assert_eq!(&buf[..], &[0, 0, 0, 3, 5, 0b1100_0000, 0b0010_0000][..]);
        assert_eq!(decode_peer_msg(&mut buf), Some(Message::Bitfield(bitfield)));
    }

    #[test]
    fn test_partial_message_returns_none() {
        let mut buf = encode_peer_msg(Message::Have { piece_index: 1 });
        let mut partial = buf.split_to(6);
        assert_eq!(decode_peer_msg(&mut partial), None);
    }

    #[test]
    fn test_unknown_id_is_discarded() {
        let mut buf = BytesMut::new();
        // an extension message with id 20 and a 3 byte payload
        buf.put_u32(4);
        buf.put_u8(20);
        buf.put_slice(&[1, 2, 3]);
        PeerCodec.encode(Message::Unchoke, &mut buf).unwrap();

        // the unknown message is skipped and the next one returned
        assert_eq!(decode_peer_msg(&mut buf), Some(Message::Unchoke));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_messages_decode_in_sequence() {
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::Interested, &mut buf).unwrap();
        PeerCodec
            .encode(
                Message::Request(BlockInfo {
                    piece_index: 0,
                    offset: 0,
                    len: 0x4000,
                }),
                &mut buf,
            )
            .unwrap();
        assert_eq!(decode_peer_msg(&mut buf), Some(Message::Interested));
        assert!(decode_peer_msg(&mut buf).is_some());
        assert_eq!(decode_peer_msg(&mut buf), None);
    }
}
