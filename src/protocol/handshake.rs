//! BitTorrent handshake
//!
//! The 68-byte preamble exchanged before any framed messages:
//!
//! ```text
//! pstrlen=19 | pstr="BitTorrent protocol" | reserved[8] | info_hash[20] | peer_id[20]
//! ```
//!
//! Reserved byte 5, bit 0x10, advertises BEP-10 extension support; we set
//! it on every outgoing handshake and negotiate capabilities afterwards.

use bytes::{BufMut, BytesMut};
use rand::RngCore;
use tracing::debug;

use crate::error::TorrentError;

/// BitTorrent protocol identifier string
pub const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";

/// Length of the protocol string
pub const PROTOCOL_LENGTH: u8 = 19;

/// Serialized handshake size in bytes
pub const HANDSHAKE_LEN: usize = 68;

/// Reserved-byte flag for BEP-10 extension support (reserved[5] & 0x10)
const EXTENSION_BIT: u8 = 0x10;

/// A peer-wire handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Reserved capability bytes
    pub reserved: [u8; 8],
    /// Torrent info-hash
    pub info_hash: [u8; 20],
    /// Sender's peer-id
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Create an outgoing handshake. The extension bit is always set.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut reserved = [0u8; 8];
        reserved[5] |= EXTENSION_BIT;
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Generate a random peer ID with the client prefix.
    pub fn generate_peer_id() -> [u8; 20] {
        let mut peer_id = [0u8; 20];
        peer_id[0..8].copy_from_slice(b"-BG0001-");
        rand::thread_rng().fill_bytes(&mut peer_id[8..]);
        debug!("generated peer id {}", hex::encode(peer_id));
        peer_id
    }

    /// Whether the sender advertised BEP-10 extension support.
    pub fn supports_extensions(&self) -> bool {
        self.reserved[5] & EXTENSION_BIT != 0
    }

    /// Serialize to the 68-byte wire form.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_LENGTH);
        buf.put_slice(PROTOCOL_STRING);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.to_vec()
    }

    /// Parse a 68-byte handshake. Rejects a wrong pstrlen or pstr.
    pub fn deserialize(data: &[u8]) -> Result<Self, TorrentError> {
        if data.len() < HANDSHAKE_LEN {
            return Err(TorrentError::protocol_with_source(
                "handshake too short",
                format!("expected {} bytes, got {}", HANDSHAKE_LEN, data.len()),
            ));
        }
        if data[0] != PROTOCOL_LENGTH {
            return Err(TorrentError::protocol_with_source(
                "invalid handshake pstrlen",
                format!("expected {}, got {}", PROTOCOL_LENGTH, data[0]),
            ));
        }
        if &data[1..20] != PROTOCOL_STRING {
            return Err(TorrentError::protocol("invalid handshake protocol string"));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Check the peer's handshake against the info-hash we asked for.
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> Result<(), TorrentError> {
        if &self.info_hash != expected_info_hash {
            return Err(TorrentError::protocol_with_source(
                "handshake info-hash mismatch",
                format!(
                    "expected {}, got {}",
                    hex::encode(expected_info_hash),
                    hex::encode(self.info_hash)
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_exact_bytes() {
        // peer_id = 0x00..0x13, info_hash = 0x0a..0x1d
        let peer_id: [u8; 20] = std::array::from_fn(|i| i as u8);
        let info_hash: [u8; 20] = std::array::from_fn(|i| (i + 10) as u8);
        let bytes = Handshake::new(info_hash, peer_id).serialize();

        assert_eq!(bytes.len(), 68);
        let mut expected = vec![0x13];
        expected.extend_from_slice(b"BitTorrent protocol");
        expected.extend_from_slice(&[0, 0, 0, 0, 0, 0x10, 0, 0]);
        expected.extend_from_slice(&info_hash);
        expected.extend_from_slice(&peer_id);
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_round_trip() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let parsed = Handshake::deserialize(&handshake.serialize()).unwrap();
        assert_eq!(parsed, handshake);
        assert!(parsed.supports_extensions());
    }

    #[test]
    fn test_rejects_bad_pstrlen() {
        let mut bytes = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        bytes[0] = 18;
        assert!(Handshake::deserialize(&bytes).is_err());
    }

    #[test]
    fn test_rejects_bad_pstr() {
        let mut bytes = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        bytes[1] = b'X';
        assert!(Handshake::deserialize(&bytes).is_err());
    }

    #[test]
    fn test_rejects_truncated() {
        let bytes = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        assert!(Handshake::deserialize(&bytes[..67]).is_err());
    }

    #[test]
    fn test_validate_info_hash() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        assert!(handshake.validate(&[1u8; 20]).is_ok());
        assert!(handshake.validate(&[9u8; 20]).is_err());
    }

    #[test]
    fn test_extension_bit_detection() {
        let mut no_ext = Handshake::new([1u8; 20], [2u8; 20]);
        no_ext.reserved = [0u8; 8];
        assert!(!no_ext.supports_extensions());
    }

    #[test]
    fn test_generate_peer_id() {
        let peer_id = Handshake::generate_peer_id();
        assert_eq!(&peer_id[0..8], b"-BG0001-");
    }
}
