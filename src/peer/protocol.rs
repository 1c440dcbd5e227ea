use crate::config::PeerId;
use crate::error::{Result, SwarmError};

pub const HANDSHAKE_HEADER: &[u8; 18] = b"P2PFILESHARINGPROJ";
pub const HANDSHAKE_LEN: usize = 32;

/// Handshake message for the peer wire protocol
/// Format: <header><reserved><peer_id>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(peer_id: PeerId) -> Self {
        Self { peer_id }
    }

    /// Serialize handshake to bytes
    /// Total: 18 + 10 + 4 = 32 bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HANDSHAKE_LEN);

        buf.extend_from_slice(HANDSHAKE_HEADER);

        // Reserved bytes (10 bytes, all zeros)
        buf.extend_from_slice(&[0u8; 10]);

        buf.extend_from_slice(&self.peer_id.to_be_bytes());

        buf
    }

    /// Deserialize handshake from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HANDSHAKE_LEN {
            return Err(SwarmError::InvalidHandshake(format!(
                "expected {} bytes, got {}",
                HANDSHAKE_LEN,
                data.len()
            )));
        }

        if &data[..HANDSHAKE_HEADER.len()] != HANDSHAKE_HEADER {
            return Err(SwarmError::InvalidHandshake("header mismatch".to_string()));
        }

        let mut peer_id = [0u8; 4];
        peer_id.copy_from_slice(&data[28..32]);

        Ok(Handshake {
            peer_id: PeerId::from_be_bytes(peer_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_serialization() {
        let bytes = Handshake::new(7).to_bytes();

        assert_eq!(bytes.len(), 32);
        assert_eq!(&bytes[..18], HANDSHAKE_HEADER);
        assert!(bytes[18..28].iter().all(|&b| b == 0));
        assert_eq!(&bytes[28..], &[0, 0, 0, 7]);

        let decoded = Handshake::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.peer_id, 7);
    }

    #[test]
    fn test_corrupted_header_rejected() {
        let mut bytes = Handshake::new(7).to_bytes();
        bytes[5] ^= 0xFF;

        assert!(matches!(
            Handshake::from_bytes(&bytes),
            Err(SwarmError::InvalidHandshake(_))
        ));
    }

    #[test]
    fn test_short_handshake_rejected() {
        let bytes = Handshake::new(1001).to_bytes();

        assert!(matches!(
            Handshake::from_bytes(&bytes[..31]),
            Err(SwarmError::InvalidHandshake(_))
        ));
    }
}
