//! Download engine
//!
//! Work-unit model for pieces, the dispatcher that multiplexes them
//! across peer sessions, and final verification and assembly of the
//! output file.

pub mod assembler;
pub mod dispatcher;
pub mod piece;

pub use dispatcher::{download_piece, download_torrent, DownloadConfig};
pub use piece::{PieceState, PieceWork};
