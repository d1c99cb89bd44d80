//! BitTorrent peer-wire protocol
//!
//! Handshake framing, the message vocabulary, the length-prefixed frame
//! codec, and the BEP-10 extension sub-protocol.

pub mod codec;
pub mod extension;
pub mod handshake;
pub mod message;

pub use codec::{WireCodec, BLOCK_LEN, MAX_FRAME};
pub use extension::ExtendedHandshake;
pub use handshake::Handshake;
pub use message::{Bitfield, Message, MessageId};
