//! Metainfo (.torrent) loader
//!
//! Parses the bencoded metainfo mapping and computes the info-hash over the
//! exact byte range of the `info` value in the original input. Re-encoding
//! could reorder keys and change the digest, so the span reported by the
//! bencode parser is hashed instead.

use std::path::Path;

use sha1::{Digest, Sha1};
use tracing::{debug, info};

use crate::bencode::{self, Value};
use crate::error::TorrentError;

/// Parsed single-file torrent metadata. Built once at startup, immutable.
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// Tracker announce URL
    pub announce: String,
    /// Suggested output file name
    pub name: String,
    /// Payload size in bytes
    pub total_length: u64,
    /// Nominal piece size in bytes (the last piece may be shorter)
    pub piece_length: u64,
    /// Expected SHA-1 hash per piece, in piece-index order
    pub piece_hashes: Vec<[u8; 20]>,
    /// SHA-1 of the bencoded `info` value
    pub info_hash: [u8; 20],
}

impl Metainfo {
    /// Load and parse a `.torrent` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TorrentError> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| {
            TorrentError::io_full(
                "failed to read torrent file",
                path.display().to_string(),
                e.to_string(),
            )
        })?;
        debug!("read {} bytes from {}", data.len(), path.display());
        Self::from_bytes(&data)
    }

    /// Parse metainfo from raw bencoded bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, TorrentError> {
        let (root, info_span) = bencode::decode_with_span(data, b"info")?;
        let root = root
            .as_dict()
            .ok_or_else(|| TorrentError::input("metainfo root must be a dictionary"))?;

        let announce = root
            .get(b"announce".as_slice())
            .and_then(Value::as_bytes)
            .ok_or_else(|| TorrentError::input("metainfo is missing the announce URL"))?;
        let announce = String::from_utf8(announce.to_vec())
            .map_err(|_| TorrentError::input("announce URL is not valid UTF-8"))?;

        let info_dict = root
            .get(b"info".as_slice())
            .and_then(Value::as_dict)
            .ok_or_else(|| TorrentError::input("metainfo is missing the info dictionary"))?;
        let info_span =
            info_span.ok_or_else(|| TorrentError::input("metainfo is missing the info dictionary"))?;

        let name = info_dict
            .get(b"name".as_slice())
            .and_then(Value::as_bytes)
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .ok_or_else(|| TorrentError::input("info dictionary is missing the name field"))?;

        if info_dict.contains_key(b"files".as_slice()) {
            return Err(TorrentError::input("multi-file torrents are not supported"));
        }
        let total_length = info_dict
            .get(b"length".as_slice())
            .and_then(Value::as_int)
            .filter(|&l| l >= 0)
            .ok_or_else(|| TorrentError::input("info dictionary is missing the length field"))?
            as u64;

        let piece_length = info_dict
            .get(b"piece length".as_slice())
            .and_then(Value::as_int)
            .filter(|&l| l > 0)
            .ok_or_else(|| TorrentError::input("info dictionary is missing the piece length field"))?
            as u64;

        let pieces = info_dict
            .get(b"pieces".as_slice())
            .and_then(Value::as_bytes)
            .ok_or_else(|| TorrentError::input("info dictionary is missing the pieces field"))?;
        let piece_hashes = parse_piece_hashes(pieces)?;

        let expected_pieces = total_length.div_ceil(piece_length);
        if piece_hashes.len() as u64 != expected_pieces {
            return Err(TorrentError::input_with_source(
                "piece hash count does not match payload length",
                format!("{} hashes, expected {}", piece_hashes.len(), expected_pieces),
            ));
        }

        // Hash the original bytes of the info value, not a re-encoding.
        let info_hash: [u8; 20] = Sha1::digest(&data[info_span]).into();

        info!(
            name,
            total_length,
            pieces = piece_hashes.len(),
            "loaded torrent metainfo"
        );

        Ok(Self {
            announce,
            name,
            total_length,
            piece_length,
            piece_hashes,
            info_hash,
        })
    }

    /// Number of pieces in the payload.
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length in bytes of the piece at `index`. The final piece covers
    /// whatever the nominal piece length leaves over.
    pub fn piece_len(&self, index: u32) -> u64 {
        let index = index as u64;
        let start = index * self.piece_length;
        std::cmp::min(self.piece_length, self.total_length - start)
    }

    /// Info-hash rendered as 40 hex digits.
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

/// Split the concatenated `pieces` byte string into 20-byte hashes.
pub fn parse_piece_hashes(pieces: &[u8]) -> Result<Vec<[u8; 20]>, TorrentError> {
    if pieces.len() % 20 != 0 {
        return Err(TorrentError::input_with_source(
            "pieces field length must be a multiple of 20",
            format!("got {}", pieces.len()),
        ));
    }
    Ok(pieces
        .chunks_exact(20)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_torrent() -> Vec<u8> {
        // single file of 12345 bytes, one 16 KiB piece
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce31:http://tracker.example/announce4:infod");
        data.extend_from_slice(b"6:lengthi12345e4:name4:test12:piece lengthi16384e6:pieces20:");
        data.extend_from_slice(&[0xabu8; 20]);
        data.extend_from_slice(b"ee");
        data
    }

    #[test]
    fn test_from_bytes() {
        let meta = Metainfo::from_bytes(&sample_torrent()).unwrap();
        assert_eq!(meta.announce, "http://tracker.example/announce");
        assert_eq!(meta.name, "test");
        assert_eq!(meta.total_length, 12345);
        assert_eq!(meta.piece_length, 16384);
        assert_eq!(meta.piece_count(), 1);
        assert_eq!(meta.piece_hashes[0], [0xab; 20]);
    }

    #[test]
    fn test_info_hash_covers_exact_byte_range() {
        // the info value from the sample is the 92 bytes between the
        // "4:info" key and the final dictionary terminator
        let data = sample_torrent();
        let mut expected_info = Vec::new();
        expected_info.extend_from_slice(b"d6:lengthi12345e4:name4:test12:piece lengthi16384e6:pieces20:");
        expected_info.extend_from_slice(&[0xabu8; 20]);
        expected_info.extend_from_slice(b"e");
        assert_eq!(expected_info.len(), 82);

        let meta = Metainfo::from_bytes(&data).unwrap();
        let expected: [u8; 20] = Sha1::digest(&expected_info).into();
        assert_eq!(meta.info_hash, expected);
    }

    #[test]
    fn test_info_hash_ignores_key_order() {
        // same info dictionary, but the outer mapping carries keys that
        // sort after "info"; the digest must not change
        let mut reordered = Vec::new();
        reordered.extend_from_slice(b"d8:announce31:http://tracker.example/announce4:infod");
        reordered.extend_from_slice(b"6:lengthi12345e4:name4:test12:piece lengthi16384e6:pieces20:");
        reordered.extend_from_slice(&[0xabu8; 20]);
        reordered.extend_from_slice(b"e7:comment5:helloe");

        let a = Metainfo::from_bytes(&sample_torrent()).unwrap();
        let b = Metainfo::from_bytes(&reordered).unwrap();
        assert_eq!(a.info_hash, b.info_hash);
    }

    #[test]
    fn test_missing_announce_rejected() {
        let mut data = Vec::new();
        data.extend_from_slice(b"d4:infod6:lengthi1e4:name1:x12:piece lengthi16384e6:pieces20:");
        data.extend_from_slice(&[0u8; 20]);
        data.extend_from_slice(b"ee");
        assert!(Metainfo::from_bytes(&data).is_err());
    }

    #[test]
    fn test_multi_file_rejected() {
        let data = b"d8:announce3:url4:infod5:filesle4:name1:x12:piece lengthi16384e6:pieces0:ee";
        let err = Metainfo::from_bytes(data).unwrap_err();
        assert!(err.to_string().contains("multi-file"));
    }

    #[test]
    fn test_piece_count_invariant_enforced() {
        // 12345 bytes at 16 KiB per piece needs exactly one hash, not two
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce3:url4:infod");
        data.extend_from_slice(b"6:lengthi12345e4:name4:test12:piece lengthi16384e6:pieces40:");
        data.extend_from_slice(&[0u8; 40]);
        data.extend_from_slice(b"ee");
        assert!(Metainfo::from_bytes(&data).is_err());
    }

    #[test]
    fn test_piece_len_last_piece_shorter() {
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce3:url4:infod");
        data.extend_from_slice(b"6:lengthi40000e4:name4:test12:piece lengthi16384e6:pieces60:");
        data.extend_from_slice(&[0u8; 60]);
        data.extend_from_slice(b"ee");
        let meta = Metainfo::from_bytes(&data).unwrap();
        assert_eq!(meta.piece_count(), 3);
        assert_eq!(meta.piece_len(0), 16384);
        assert_eq!(meta.piece_len(1), 16384);
        assert_eq!(meta.piece_len(2), 7232);
    }

    #[test]
    fn test_parse_piece_hashes_rejects_ragged_input() {
        assert!(parse_piece_hashes(&[0u8; 21]).is_err());
        assert_eq!(parse_piece_hashes(&[0u8; 40]).unwrap().len(), 2);
    }
}
