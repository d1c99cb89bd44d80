//! BEP-10 extension protocol
//!
//! An Extended message with sub-id 0 carries a bencoded handshake whose
//! `m` mapping assigns the sender's local numeric ids to extension names.
//! Non-zero sub-ids on later messages refer back to that table.

use std::collections::BTreeMap;

use crate::bencode::{self, Value};
use crate::error::TorrentError;

/// Extended-message sub-id of the extension handshake itself.
pub const HANDSHAKE_EXT_ID: u8 = 0;

/// The metadata-exchange extension name (BEP-9).
pub const UT_METADATA: &str = "ut_metadata";

/// Local id we advertise for `ut_metadata`.
pub const LOCAL_UT_METADATA_ID: u8 = 1;

/// A decoded BEP-10 extension handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtendedHandshake {
    /// Extension name to the sender's numeric id for it
    pub m: BTreeMap<String, u8>,
    /// Metadata size in bytes, when the peer has the info dictionary
    pub metadata_size: Option<i64>,
}

impl ExtendedHandshake {
    /// The handshake we advertise: just `ut_metadata`.
    pub fn ours() -> Self {
        let mut m = BTreeMap::new();
        m.insert(UT_METADATA.to_string(), LOCAL_UT_METADATA_ID);
        Self {
            m,
            metadata_size: None,
        }
    }

    /// The peer's id for `ut_metadata`, if advertised.
    pub fn ut_metadata_id(&self) -> Option<u8> {
        self.m.get(UT_METADATA).copied()
    }

    /// Encode to the bencoded handshake payload.
    pub fn encode(&self) -> Vec<u8> {
        let m = self
            .m
            .iter()
            .map(|(name, id)| (name.clone().into_bytes(), Value::Int(*id as i64)))
            .collect();
        let mut dict = BTreeMap::new();
        dict.insert(b"m".to_vec(), Value::Dict(m));
        if let Some(size) = self.metadata_size {
            dict.insert(b"metadata_size".to_vec(), Value::Int(size));
        }
        bencode::encode(&Value::Dict(dict))
    }

    /// Decode a handshake payload.
    pub fn decode(payload: &[u8]) -> Result<Self, TorrentError> {
        let (root, _) = bencode::decode(payload)
            .map_err(|e| TorrentError::protocol_with_source("invalid extension handshake", e.to_string()))?;
        let dict = root
            .as_dict()
            .ok_or_else(|| TorrentError::protocol("extension handshake is not a dictionary"))?;

        let mut m = BTreeMap::new();
        if let Some(m_dict) = dict.get(b"m".as_slice()).and_then(Value::as_dict) {
            for (name, id) in m_dict {
                let Some(id) = id.as_int() else { continue };
                // id 0 disables a previously advertised extension
                if (1..=u8::MAX as i64).contains(&id) {
                    m.insert(String::from_utf8_lossy(name).into_owned(), id as u8);
                }
            }
        }

        let metadata_size = dict.get(b"metadata_size".as_slice()).and_then(Value::as_int);

        Ok(Self { m, metadata_size })
    }
}
