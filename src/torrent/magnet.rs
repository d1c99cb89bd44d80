//! Magnet URI parsing
//!
//! A magnet-initiated session knows only the info-hash and tracker list
//! until the metadata extension fills in the rest, so this type carries
//! just what parse/announce/handshake need.

use url::Url;

use crate::error::TorrentError;

/// Data parsed from a `magnet:?` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    /// The 20-byte SHA-1 info-hash from the `xt=urn:btih:` parameter
    pub info_hash: [u8; 20],
    /// Optional display name (`dn`)
    pub display_name: Option<String>,
    /// Tracker URLs (`tr`), in the order given
    pub trackers: Vec<String>,
}

impl MagnetLink {
    /// Parse a magnet URI.
    pub fn parse(uri: &str) -> Result<Self, TorrentError> {
        let url = Url::parse(uri)
            .map_err(|e| TorrentError::input_with_source("failed to parse magnet URI", e.to_string()))?;
        if url.scheme() != "magnet" {
            return Err(TorrentError::input_with_source(
                "not a magnet URI",
                format!("scheme: {}", url.scheme()),
            ));
        }

        let mut xt = None;
        let mut display_name = None;
        let mut trackers = Vec::new();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => xt = Some(value.into_owned()),
                "dn" => display_name = Some(value.into_owned()),
                "tr" => trackers.push(value.into_owned()),
                _ => {}
            }
        }

        let xt = xt.ok_or_else(|| TorrentError::input("magnet URI is missing the xt parameter"))?;
        let hash_hex = xt
            .strip_prefix("urn:btih:")
            .ok_or_else(|| TorrentError::input("xt parameter must start with urn:btih:"))?;
        let hash_bytes = hex::decode(hash_hex)
            .map_err(|_| TorrentError::input("info-hash is not valid hex"))?;
        let info_hash: [u8; 20] = hash_bytes
            .try_into()
            .map_err(|_| TorrentError::input("info-hash must be 40 hex digits"))?;

        Ok(Self {
            info_hash,
            display_name,
            trackers,
        })
    }

    /// The first tracker URL. Magnet flows announce to one tracker at a
    /// time, starting here.
    pub fn tracker(&self) -> Result<&str, TorrentError> {
        self.trackers
            .first()
            .map(String::as_str)
            .ok_or_else(|| TorrentError::input("magnet URI has no tracker (tr) parameter"))
    }

    /// Info-hash rendered as 40 hex digits.
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "magnet:?xt=urn:btih:ad42ce8109f54c99613ce38f9b4d87e70f24a165&dn=magnet1.gif&tr=http%3A%2F%2Fbittorrent-test-tracker.codecrafters.io%2Fannounce";

    #[test]
    fn test_parse_full_uri() {
        let magnet = MagnetLink::parse(SAMPLE).unwrap();
        assert_eq!(
            magnet.info_hash_hex(),
            "ad42ce8109f54c99613ce38f9b4d87e70f24a165"
        );
        assert_eq!(magnet.display_name.as_deref(), Some("magnet1.gif"));
        assert_eq!(
            magnet.tracker().unwrap(),
            "http://bittorrent-test-tracker.codecrafters.io/announce"
        );
    }

    #[test]
    fn test_parse_multiple_trackers() {
        let uri = "magnet:?xt=urn:btih:ad42ce8109f54c99613ce38f9b4d87e70f24a165\
                   &tr=http%3A%2F%2Fone%2Fannounce&tr=http%3A%2F%2Ftwo%2Fannounce";
        let magnet = MagnetLink::parse(uri).unwrap();
        assert_eq!(magnet.trackers.len(), 2);
        assert_eq!(magnet.tracker().unwrap(), "http://one/announce");
    }

    #[test]
    fn test_parse_without_display_name() {
        let uri = "magnet:?xt=urn:btih:ad42ce8109f54c99613ce38f9b4d87e70f24a165&tr=http%3A%2F%2Ft";
        let magnet = MagnetLink::parse(uri).unwrap();
        assert!(magnet.display_name.is_none());
    }

    #[test]
    fn test_rejects_wrong_scheme() {
        assert!(MagnetLink::parse("http://example.com").is_err());
    }

    #[test]
    fn test_rejects_missing_xt() {
        assert!(MagnetLink::parse("magnet:?dn=file.gif").is_err());
    }

    #[test]
    fn test_rejects_bad_urn() {
        assert!(MagnetLink::parse("magnet:?xt=urn:sha1:ad42ce8109f54c99613ce38f9b4d87e70f24a165").is_err());
    }

    #[test]
    fn test_rejects_short_hash() {
        assert!(MagnetLink::parse("magnet:?xt=urn:btih:deadbeef").is_err());
        assert!(MagnetLink::parse("magnet:?xt=urn:btih:zz42ce8109f54c99613ce38f9b4d87e70f24a165").is_err());
    }

    #[test]
    fn test_tracker_missing() {
        let magnet =
            MagnetLink::parse("magnet:?xt=urn:btih:ad42ce8109f54c99613ce38f9b4d87e70f24a165")
                .unwrap();
        assert!(magnet.tracker().is_err());
    }
}
