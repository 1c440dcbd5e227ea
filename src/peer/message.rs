use crate::error::{Result, SwarmError};
use bytes::{Buf, BufMut, BytesMut};

/// Messages exchanged between peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Keep-alive message (no type, no payload)
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    /// Sender now owns the piece
    Have { piece_index: u32 },
    /// Packed ownership bits, most significant bit first
    Bitfield { bitfield: Vec<u8> },
    Request { piece_index: u32 },
    /// A whole piece
    Piece { piece_index: u32, data: Vec<u8> },
}

impl PeerMessage {
    /// Message type IDs
    const CHOKE: u8 = 0;
    const UNCHOKE: u8 = 1;
    const INTERESTED: u8 = 2;
    const NOT_INTERESTED: u8 = 3;
    const HAVE: u8 = 4;
    const BITFIELD: u8 = 5;
    const REQUEST: u8 = 6;
    const PIECE: u8 = 7;

    /// Serialize message to bytes
    /// Format: <length prefix><message ID><payload>
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();

        match self {
            PeerMessage::KeepAlive => {
                buf.put_u32(0);
            }
            PeerMessage::Choke => {
                buf.put_u32(1);
                buf.put_u8(Self::CHOKE);
            }
            PeerMessage::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(Self::UNCHOKE);
            }
            PeerMessage::Interested => {
                buf.put_u32(1);
                buf.put_u8(Self::INTERESTED);
            }
            PeerMessage::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(Self::NOT_INTERESTED);
            }
            PeerMessage::Have { piece_index } => {
                buf.put_u32(5); // length = 1 + 4
                buf.put_u8(Self::HAVE);
                buf.put_u32(*piece_index);
            }
            PeerMessage::Bitfield { bitfield } => {
                buf.put_u32((1 + bitfield.len()) as u32);
                buf.put_u8(Self::BITFIELD);
                buf.put_slice(bitfield);
            }
            PeerMessage::Request { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(Self::REQUEST);
                buf.put_u32(*piece_index);
            }
            PeerMessage::Piece { piece_index, data } => {
                buf.put_u32((5 + data.len()) as u32);
                buf.put_u8(Self::PIECE);
                buf.put_u32(*piece_index);
                buf.put_slice(data);
            }
        }

        buf.to_vec()
    }

    /// Deserialize a complete frame, length prefix included
    #[cfg(test)]
    pub fn from_bytes(mut data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(SwarmError::Protocol("Message too short".to_string()));
        }

        let length = data.get_u32() as usize;

        if length == 0 {
            return Ok(PeerMessage::KeepAlive);
        }

        if data.len() < length {
            return Err(SwarmError::Protocol("Incomplete message".to_string()));
        }

        let message_id = data.get_u8();
        Self::from_parts(message_id, &data[..length - 1])
    }

    /// Build a message from its type byte and exact payload
    pub fn from_parts(message_id: u8, mut payload: &[u8]) -> Result<Self> {
        match message_id {
            Self::CHOKE => Ok(PeerMessage::Choke),
            Self::UNCHOKE => Ok(PeerMessage::Unchoke),
            Self::INTERESTED => Ok(PeerMessage::Interested),
            Self::NOT_INTERESTED => Ok(PeerMessage::NotInterested),
            Self::HAVE => {
                if payload.len() != 4 {
                    return Err(SwarmError::Protocol("Invalid Have message".to_string()));
                }
                Ok(PeerMessage::Have {
                    piece_index: payload.get_u32(),
                })
            }
            Self::BITFIELD => Ok(PeerMessage::Bitfield {
                bitfield: payload.to_vec(),
            }),
            Self::REQUEST => {
                if payload.len() != 4 {
                    return Err(SwarmError::Protocol("Invalid Request message".to_string()));
                }
                Ok(PeerMessage::Request {
                    piece_index: payload.get_u32(),
                })
            }
            Self::PIECE => {
                if payload.len() < 4 {
                    return Err(SwarmError::Protocol("Invalid Piece message".to_string()));
                }
                let piece_index = payload.get_u32();
                Ok(PeerMessage::Piece {
                    piece_index,
                    data: payload.to_vec(),
                })
            }
            _ => Err(SwarmError::UnknownMessageType(message_id)),
        }
    }

    /// Short name for logs; piece payloads are too large to print.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::KeepAlive => "keep-alive",
            PeerMessage::Choke => "choke",
            PeerMessage::Unchoke => "unchoke",
            PeerMessage::Interested => "interested",
            PeerMessage::NotInterested => "not-interested",
            PeerMessage::Have { .. } => "have",
            PeerMessage::Bitfield { .. } => "bitfield",
            PeerMessage::Request { .. } => "request",
            PeerMessage::Piece { .. } => "piece",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece::Bitfield;

    #[test]
    fn test_have_frame() {
        let bytes = PeerMessage::Have { piece_index: 42 }.to_bytes();

        assert_eq!(bytes, vec![0, 0, 0, 5, 4, 0, 0, 0, 42]);
        assert_eq!(
            PeerMessage::from_bytes(&bytes).unwrap(),
            PeerMessage::Have { piece_index: 42 }
        );
    }

    #[test]
    fn test_bitfield_frame() {
        let mut bf = Bitfield::new(3, false);
        bf.set(0);
        bf.set(2);

        let bytes = PeerMessage::Bitfield {
            bitfield: bf.to_bytes(),
        }
        .to_bytes();
        assert_eq!(bytes, vec![0, 0, 0, 2, 5, 0b1010_0000]);

        let PeerMessage::Bitfield { bitfield } = PeerMessage::from_bytes(&bytes).unwrap() else {
            panic!("expected bitfield");
        };
        assert_eq!(Bitfield::from_bytes(&bitfield, 3), bf);
    }

    #[test]
    fn test_piece_frame() {
        let message = PeerMessage::Piece {
            piece_index: 3,
            data: vec![9, 8, 7],
        };
        let bytes = message.to_bytes();

        assert_eq!(&bytes[..5], &[0, 0, 0, 8, 7]);
        assert_eq!(PeerMessage::from_bytes(&bytes).unwrap(), message);
    }

    #[test]
    fn test_keep_alive_and_flags() {
        assert_eq!(PeerMessage::KeepAlive.to_bytes(), vec![0, 0, 0, 0]);
        assert_eq!(PeerMessage::Unchoke.to_bytes(), vec![0, 0, 0, 1, 1]);
        assert_eq!(
            PeerMessage::from_bytes(&[0, 0, 0, 0]).unwrap(),
            PeerMessage::KeepAlive
        );
        assert_eq!(
            PeerMessage::from_bytes(&[0, 0, 0, 1, 3]).unwrap(),
            PeerMessage::NotInterested
        );
    }

    #[test]
    fn test_malformed_and_unknown() {
        assert!(matches!(
            PeerMessage::from_parts(4, &[0, 1]),
            Err(SwarmError::Protocol(_))
        ));
        assert!(matches!(
            PeerMessage::from_parts(6, &[]),
            Err(SwarmError::Protocol(_))
        ));
        assert!(matches!(
            PeerMessage::from_parts(20, &[1, 2, 3]),
            Err(SwarmError::UnknownMessageType(20))
        ));
    }
}
