//! CLI argument definitions
//!
//! Subcommand names keep their underscore forms; they are part of the
//! tool's interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// A command-line BitTorrent v1 downloader
#[derive(Debug, Parser)]
#[command(name = "bitgrab", version, about = "A command-line BitTorrent downloader")]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Verbose output (debug-level logs)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Decode one bencoded value and print it as JSON
    Decode {
        /// The bencoded input
        bencoded: String,
    },

    /// Print metadata from a .torrent file
    Info {
        /// Path to the .torrent file
        torrent: PathBuf,
    },

    /// Announce to the tracker and list the swarm's peers
    Peers {
        /// Path to the .torrent file
        torrent: PathBuf,
    },

    /// Handshake with one peer and print its peer ID
    Handshake {
        /// Path to the .torrent file
        torrent: PathBuf,
        /// Peer address as ip:port
        peer: String,
    },

    /// Download a single piece and verify its hash
    #[command(name = "download_piece")]
    DownloadPiece {
        /// Output file path
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        /// Path to the .torrent file
        torrent: PathBuf,
        /// Zero-based piece index
        index: u32,
    },

    /// Download the whole payload and assemble it
    Download {
        /// Output file path
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        /// Path to the .torrent file
        torrent: PathBuf,
    },

    /// Parse a magnet URI and print its tracker and info-hash
    #[command(name = "magnet_parse")]
    MagnetParse {
        /// The magnet URI
        uri: String,
    },

    /// Announce via a magnet URI and perform the extension handshake
    #[command(name = "magnet_handshake")]
    MagnetHandshake {
        /// The magnet URI
        uri: String,
    },
}

impl CliArgs {
    /// Map the verbosity flags to a log level.
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subcommand_names_keep_underscores() {
        let args =
            CliArgs::try_parse_from(["bitgrab", "download_piece", "-o", "out", "t.torrent", "3"])
                .unwrap();
        match args.command {
            Command::DownloadPiece { index, .. } => assert_eq!(index, 3),
            other => panic!("unexpected command: {:?}", other),
        }

        assert!(CliArgs::try_parse_from(["bitgrab", "magnet_parse", "magnet:?x"]).is_ok());
        assert!(CliArgs::try_parse_from(["bitgrab", "magnet_handshake", "magnet:?x"]).is_ok());
    }

    #[test]
    fn test_decode_takes_raw_argument() {
        let args = CliArgs::try_parse_from(["bitgrab", "decode", "i42e"]).unwrap();
        match args.command {
            Command::Decode { bencoded } => assert_eq!(bencoded, "i42e"),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_log_level_flags() {
        let verbose = CliArgs::try_parse_from(["bitgrab", "-v", "decode", "i1e"]).unwrap();
        assert_eq!(verbose.log_level(), tracing::Level::DEBUG);
        let quiet = CliArgs::try_parse_from(["bitgrab", "-q", "decode", "i1e"]).unwrap();
        assert_eq!(quiet.log_level(), tracing::Level::ERROR);
        let default = CliArgs::try_parse_from(["bitgrab", "decode", "i1e"]).unwrap();
        assert_eq!(default.log_level(), tracing::Level::INFO);
    }

    #[test]
    fn test_download_requires_output() {
        assert!(CliArgs::try_parse_from(["bitgrab", "download", "t.torrent"]).is_err());
    }
}
