//! bitgrab
//!
//! A BitTorrent v1 client library: bencode codec, metainfo and magnet
//! loading, tracker announce, the peer-wire protocol, and a concurrent
//! piece download engine with SHA-1 verification and ordered assembly.

pub mod bencode;
pub mod cli;
pub mod download;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod torrent;
pub mod tracker;

pub use error::TorrentError;

pub use download::{DownloadConfig, PieceState, PieceWork};
pub use peer::{PeerSession, SessionState, SwarmInfo};
pub use protocol::{Bitfield, ExtendedHandshake, Handshake, Message, MessageId, WireCodec};
pub use torrent::{MagnetLink, Metainfo};
pub use tracker::{Announce, TrackerResponse};
