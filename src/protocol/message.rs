//! Peer-wire messages
//!
//! The tagged message vocabulary exchanged after the handshake. The codec
//! in [`super::codec`] converts between these variants and length-prefixed
//! frames.

use crate::error::TorrentError;

/// Wire message IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
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
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = TorrentError;

    fn try_from(value: u8) -> Result<Self, TorrentError> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            20 => Ok(MessageId::Extended),
            _ => Err(TorrentError::protocol_with_source(
                "unknown message id",
                format!("{}", value),
            )),
        }
    }
}

/// One framed peer-wire message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: u32,
    },
    Bitfield(Bitfield),
    Request {
        index: u32,
        begin: u32,
        length: u32,
    },
    Piece {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    Cancel {
        index: u32,
        begin: u32,
        length: u32,
    },
    /// DHT port announcement; parsed and ignored
    Port {
        listen_port: u16,
    },
    /// BEP-10 extended message: sub-id plus an opaque payload
    Extended {
        ext_id: u8,
        payload: Vec<u8>,
    },
}

impl Message {
    /// The message ID, or None for keep-alives.
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield(_) => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
            Message::Port { .. } => Some(MessageId::Port),
            Message::Extended { .. } => Some(MessageId::Extended),
        }
    }

    /// Frame body length (id byte plus payload, excluding the prefix).
    pub fn body_len(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield(bitfield) => 1 + bitfield.as_bytes().len() as u32,
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len() as u32,
            Message::Port { .. } => 3,
            Message::Extended { payload, .. } => 2 + payload.len() as u32,
        }
    }
}

/// Piece availability bitmap: bit 7 of byte 0 is piece 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitfield(Vec<u8>);

impl Bitfield {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// An all-zero bitfield sized for `piece_count` pieces.
    pub fn with_capacity(piece_count: usize) -> Self {
        Self(vec![0u8; piece_count.div_ceil(8)])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether the peer has the piece at `index`.
    pub fn has(&self, index: u32) -> bool {
        let byte = (index / 8) as usize;
        let bit = 7 - (index % 8);
        self.0
            .get(byte)
            .map(|b| (b >> bit) & 1 == 1)
            .unwrap_or(false)
    }

    /// Mark the piece at `index` as available, growing if needed (peers
    /// may follow a short bitfield with Have messages).
    pub fn set(&mut self, index: u32) {
        let byte = (index / 8) as usize;
        let bit = 7 - (index % 8);
        if byte >= self.0.len() {
            self.0.resize(byte + 1, 0);
        }
        self.0[byte] |= 1 << bit;
    }

    /// Number of pieces marked available.
    pub fn count(&self) -> usize {
        self.0.iter().map(|b| b.count_ones() as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_round_trip() {
        for id in [0u8, 1, 2, 3, 4, 5, 6, 7, 8, 9, 20] {
            assert_eq!(MessageId::try_from(id).unwrap() as u8, id);
        }
        assert!(MessageId::try_from(10).is_err());
        assert!(MessageId::try_from(21).is_err());
    }

    #[test]
    fn test_body_len() {
        assert_eq!(Message::KeepAlive.body_len(), 0);
        assert_eq!(Message::Choke.body_len(), 1);
        assert_eq!(Message::Have { piece_index: 0 }.body_len(), 5);
        assert_eq!(
            Message::Request {
                index: 0,
                begin: 0,
                length: 0
            }
            .body_len(),
            13
        );
        assert_eq!(
            Message::Piece {
                index: 0,
                begin: 0,
                block: vec![0; 3]
            }
            .body_len(),
            12
        );
        assert_eq!(Message::Port { listen_port: 0 }.body_len(), 3);
        assert_eq!(
            Message::Extended {
                ext_id: 0,
                payload: vec![0; 4]
            }
            .body_len(),
            6
        );
    }

    #[test]
    fn test_keepalive_has_no_id() {
        assert_eq!(Message::KeepAlive.message_id(), None);
        assert_eq!(Message::Choke.message_id(), Some(MessageId::Choke));
    }

    #[test]
    fn test_bitfield_msb_first() {
        let bitfield = Bitfield::from_bytes(vec![0b1010_0000]);
        assert!(bitfield.has(0));
        assert!(!bitfield.has(1));
        assert!(bitfield.has(2));
        assert!(!bitfield.has(7));
        assert!(!bitfield.has(8));
    }

    #[test]
    fn test_bitfield_set_and_grow() {
        let mut bitfield = Bitfield::with_capacity(4);
        assert_eq!(bitfield.as_bytes().len(), 1);
        bitfield.set(0);
        bitfield.set(11);
        assert!(bitfield.has(0));
        assert!(bitfield.has(11));
        assert_eq!(bitfield.as_bytes().len(), 2);
        assert_eq!(bitfield.count(), 2);
    }

    #[test]
    fn test_bitfield_out_of_range_is_absent() {
        let bitfield = Bitfield::from_bytes(vec![0xff]);
        assert!(bitfield.has(7));
        assert!(!bitfield.has(64));
    }
}
