//! Tracker client
//!
//! Announces to the HTTP tracker and parses the compact peer list out of
//! the bencoded response. The raw 20-byte info-hash and peer-id must be
//! percent-encoded byte-wise; going through a str-based query API would
//! mangle the non-UTF-8 bytes.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use tracing::{debug, info};

use crate::bencode::{self, Value};
use crate::error::TorrentError;

/// Default port reported to the tracker.
pub const DEFAULT_PORT: u16 = 6881;

/// Timeout for the announce HTTP request.
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(30);

/// One announce request.
#[derive(Debug, Clone)]
pub struct Announce {
    /// Tracker announce URL
    pub url: String,
    /// Raw 20-byte info-hash
    pub info_hash: [u8; 20],
    /// Raw 20-byte client peer-id
    pub peer_id: [u8; 20],
    /// Port we claim to listen on
    pub port: u16,
    /// Bytes still needed; magnet announces with an unknown length use 1
    pub left: u64,
}

impl Announce {
    pub fn new(url: impl Into<String>, info_hash: [u8; 20], peer_id: [u8; 20], left: u64) -> Self {
        Self {
            url: url.into(),
            info_hash,
            peer_id,
            port: DEFAULT_PORT,
            left,
        }
    }

    /// Build the full request URL with all query parameters attached.
    fn request_url(&self) -> String {
        let sep = if self.url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1",
            self.url,
            sep,
            percent_encode(&self.info_hash),
            percent_encode(&self.peer_id),
            self.port,
            self.left,
        )
    }
}

/// A successful tracker response.
#[derive(Debug, Clone)]
pub struct TrackerResponse {
    /// Seconds until the tracker wants the next announce; None when the
    /// tracker did not schedule one
    pub interval: Option<u64>,
    /// Swarm members, compact-form decoded
    pub peers: Vec<SocketAddrV4>,
}

/// Announce to the tracker and return the peer list.
pub async fn announce(req: &Announce) -> Result<TrackerResponse, TorrentError> {
    let request_url = req.request_url();
    debug!(url = %request_url, "announcing to tracker");

    let client = reqwest::Client::builder()
        .timeout(ANNOUNCE_TIMEOUT)
        .build()?;
    let response = client.get(&request_url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(TorrentError::tracker_with_url(
            format!("announce returned HTTP {}", status.as_u16()),
            &req.url,
        ));
    }

    let body = response.bytes().await?;
    let parsed = parse_response(&body).map_err(|e| match e {
        TorrentError::Tracker { message, url: None } => {
            TorrentError::tracker_with_url(message, &req.url)
        }
        other => other,
    })?;
    info!(peers = parsed.peers.len(), interval = ?parsed.interval, "tracker responded");
    Ok(parsed)
}

/// Parse a bencoded tracker response body.
pub fn parse_response(body: &[u8]) -> Result<TrackerResponse, TorrentError> {
    let root = bencode::decode_all(body)
        .map_err(|e| TorrentError::tracker(format!("malformed bencode response: {}", e)))?;
    let dict = root
        .as_dict()
        .ok_or_else(|| TorrentError::tracker("response is not a dictionary"))?;

    if let Some(reason) = dict.get(b"failure reason".as_slice()).and_then(Value::as_bytes) {
        return Err(TorrentError::tracker(
            String::from_utf8_lossy(reason).into_owned(),
        ));
    }

    let peers = dict
        .get(b"peers".as_slice())
        .and_then(Value::as_bytes)
        .ok_or_else(|| TorrentError::tracker("response is missing the peers field"))?;
    let peers = parse_compact_peers(peers)?;

    let interval = dict
        .get(b"interval".as_slice())
        .and_then(Value::as_int)
        .filter(|&i| i > 0)
        .map(|i| i as u64);

    Ok(TrackerResponse { interval, peers })
}

/// Decode a compact peer list: 6 bytes per peer, 4-byte IPv4 then a
/// 2-byte port, both big-endian.
pub fn parse_compact_peers(bytes: &[u8]) -> Result<Vec<SocketAddrV4>, TorrentError> {
    if bytes.len() % 6 != 0 {
        return Err(TorrentError::tracker(format!(
            "compact peer list length {} is not a multiple of 6",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddrV4::new(ip, port)
        })
        .collect())
}

/// Percent-encode raw bytes per RFC 3986: unreserved characters pass
/// through, everything else becomes %XX.
fn percent_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for &b in bytes {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_encode_passes_unreserved() {
        assert_eq!(percent_encode(b"AZaz09-._~"), "AZaz09-._~");
    }

    #[test]
    fn test_percent_encode_escapes_raw_bytes() {
        assert_eq!(percent_encode(&[0x00, 0xff, b' ']), "%00%FF%20");
    }

    #[test]
    fn test_request_url_contains_all_params() {
        let req = Announce::new("http://t.example/announce", [0x0a; 20], [b'A'; 20], 12345);
        let url = req.request_url();
        assert!(url.starts_with("http://t.example/announce?"));
        assert!(url.contains(&format!("info_hash={}", "%0A".repeat(20))));
        assert!(url.contains(&format!("peer_id={}", "A".repeat(20))));
        assert!(url.contains("port=6881"));
        assert!(url.contains("uploaded=0"));
        assert!(url.contains("downloaded=0"));
        assert!(url.contains("left=12345"));
        assert!(url.contains("compact=1"));
    }

    #[test]
    fn test_request_url_appends_to_existing_query() {
        let req = Announce::new("http://t.example/announce?key=1", [0; 20], [0; 20], 1);
        assert!(req.request_url().contains("announce?key=1&info_hash="));
    }

    #[test]
    fn test_parse_compact_peers() {
        let bytes = [192, 168, 0, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0x1b, 0x39];
        let peers = parse_compact_peers(&bytes).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].to_string(), "192.168.0.1:6881");
        assert_eq!(peers[1].to_string(), "10.0.0.2:6969");
    }

    #[test]
    fn test_parse_compact_peers_ragged() {
        assert!(parse_compact_peers(&[1, 2, 3, 4, 5]).is_err());
    }

    #[test]
    fn test_parse_response_with_interval() {
        let mut body = b"d8:intervali1800e5:peers6:".to_vec();
        body.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
        body.push(b'e');
        let resp = parse_response(&body).unwrap();
        assert_eq!(resp.interval, Some(1800));
        assert_eq!(resp.peers[0].to_string(), "127.0.0.1:6881");
    }

    #[test]
    fn test_parse_response_without_interval() {
        let mut body = b"d5:peers6:".to_vec();
        body.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
        body.push(b'e');
        let resp = parse_response(&body).unwrap();
        assert_eq!(resp.interval, None);
    }

    #[test]
    fn test_parse_response_failure_reason() {
        let body = b"d14:failure reason13:access deniede";
        let err = parse_response(body).unwrap_err();
        assert!(err.to_string().contains("access denied"));
    }

    #[test]
    fn test_parse_response_missing_peers() {
        assert!(parse_response(b"d8:intervali60ee").is_err());
    }
}
