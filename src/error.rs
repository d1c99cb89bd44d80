//! Error types for the download engine.
//!
//! One crate-wide error enum, grouped by failure domain. Startup failures
//! (Input, Io) abort the process; session-scoped failures (Network,
//! Protocol, Integrity) end one peer session and requeue its piece.

use std::fmt;

/// Crate-wide error type for torrent operations
#[derive(Debug, Clone)]
pub enum TorrentError {
    /// Invalid user input: bad bencode, malformed metainfo or magnet URI
    Input {
        message: String,
        source: Option<String>,
    },

    /// Local file I/O errors
    Io {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// Socket-level errors: connect refused, timeout, unexpected EOF
    Network {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },

    /// Peer-wire protocol violations: bad handshake, oversized frame,
    /// truncated payload, unknown extension id where one is required
    Protocol {
        message: String,
        source: Option<String>,
    },

    /// Tracker-level failures: HTTP errors and `failure reason` responses
    Tracker {
        message: String,
        url: Option<String>,
    },

    /// Piece hash verification failures
    Integrity { piece_index: u32 },

    /// The operation was cancelled before it completed
    Cancelled,
}

impl TorrentError {
    /// Create a new Input error
    pub fn input(message: impl Into<String>) -> Self {
        TorrentError::Input {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new Input error with source detail
    pub fn input_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::Input {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new Io error
    pub fn io(message: impl Into<String>) -> Self {
        TorrentError::Io {
            message: message.into(),
            path: None,
            source: None,
        }
    }

    /// Create a new Io error with path and source detail
    pub fn io_full(
        message: impl Into<String>,
        path: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        TorrentError::Io {
            message: message.into(),
            path: Some(path.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new Network error
    pub fn network(message: impl Into<String>) -> Self {
        TorrentError::Network {
            message: message.into(),
            address: None,
            source: None,
        }
    }

    /// Create a new Network error with peer address
    pub fn network_with_address(message: impl Into<String>, address: impl Into<String>) -> Self {
        TorrentError::Network {
            message: message.into(),
            address: Some(address.into()),
            source: None,
        }
    }

    /// Create a new Network error with address and source detail
    pub fn network_full(
        message: impl Into<String>,
        address: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        TorrentError::Network {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new Protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        TorrentError::Protocol {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new Protocol error with source detail
    pub fn protocol_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::Protocol {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new Tracker error
    pub fn tracker(message: impl Into<String>) -> Self {
        TorrentError::Tracker {
            message: message.into(),
            url: None,
        }
    }

    /// Create a new Tracker error with the announce URL
    pub fn tracker_with_url(message: impl Into<String>, url: impl Into<String>) -> Self {
        TorrentError::Tracker {
            message: message.into(),
            url: Some(url.into()),
        }
    }

    /// Create a new Integrity error for a piece that failed verification
    pub fn integrity(piece_index: u32) -> Self {
        TorrentError::Integrity { piece_index }
    }

    /// Whether this error should end only the session that hit it,
    /// leaving the rest of the swarm running
    pub fn is_session_scoped(&self) -> bool {
        matches!(
            self,
            TorrentError::Network { .. }
                | TorrentError::Protocol { .. }
                | TorrentError::Integrity { .. }
        )
    }
}

impl fmt::Display for TorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorrentError::Input { message, source } => match source {
                Some(src) => write!(f, "invalid input: {} ({})", message, src),
                None => write!(f, "invalid input: {}", message),
            },
            TorrentError::Io {
                message,
                path,
                source,
            } => match (path, source) {
                (Some(p), Some(s)) => write!(f, "io error: {} (path: {}, {})", message, p, s),
                (Some(p), None) => write!(f, "io error: {} (path: {})", message, p),
                (None, Some(s)) => write!(f, "io error: {} ({})", message, s),
                (None, None) => write!(f, "io error: {}", message),
            },
            TorrentError::Network {
                message,
                address,
                source,
            } => match (address, source) {
                (Some(a), Some(s)) => write!(f, "network error: {} (peer: {}, {})", message, a, s),
                (Some(a), None) => write!(f, "network error: {} (peer: {})", message, a),
                (None, Some(s)) => write!(f, "network error: {} ({})", message, s),
                (None, None) => write!(f, "network error: {}", message),
            },
            TorrentError::Protocol { message, source } => match source {
                Some(src) => write!(f, "protocol error: {} ({})", message, src),
                None => write!(f, "protocol error: {}", message),
            },
            TorrentError::Tracker { message, url } => match url {
                Some(u) => write!(f, "tracker error: {} (url: {})", message, u),
                None => write!(f, "tracker error: {}", message),
            },
            TorrentError::Integrity { piece_index } => {
                write!(f, "integrity error: piece {} failed hash check", piece_index)
            }
            TorrentError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for TorrentError {}

impl From<std::io::Error> for TorrentError {
    fn from(err: std::io::Error) -> Self {
        TorrentError::Network {
            message: err.to_string(),
            address: None,
            source: Some(err.kind().to_string()),
        }
    }
}

impl From<std::net::AddrParseError> for TorrentError {
    fn from(err: std::net::AddrParseError) -> Self {
        TorrentError::input_with_source("failed to parse peer address", err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for TorrentError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        TorrentError::network("operation timed out")
    }
}

impl From<url::ParseError> for TorrentError {
    fn from(err: url::ParseError) -> Self {
        TorrentError::input_with_source("failed to parse URL", err.to_string())
    }
}

impl From<reqwest::Error> for TorrentError {
    fn from(err: reqwest::Error) -> Self {
        TorrentError::Tracker {
            message: err.to_string(),
            url: err.url().map(|u| u.to_string()),
        }
    }
}
