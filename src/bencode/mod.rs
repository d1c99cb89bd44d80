//! Bencode codec
//!
//! Strict single-pass decoder and streaming encoder for the four bencode
//! value kinds. The decoder reports how many bytes it consumed and can
//! report the byte span of any top-level dictionary entry, which is how
//! the metainfo loader hashes the exact `info` range of the original
//! input instead of a re-encoding.

use std::collections::BTreeMap;
use std::ops::Range;

use crate::error::TorrentError;

/// A decoded bencode value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// `i<decimal>e`
    Int(i64),
    /// `<len>:<raw bytes>`, not necessarily UTF-8
    Bytes(Vec<u8>),
    /// `l<values>e`
    List(Vec<Value>),
    /// `d(<key><value>)*e`; keys sorted on encode, any order accepted on decode
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Render as JSON: byte strings become text where valid UTF-8 and an
    /// ASCII-escaped form (`\xNN`) otherwise, so distinct inputs stay
    /// distinct. Used by the `decode` subcommand.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Bytes(b) => serde_json::Value::from(json_text(b)),
            Value::List(l) => serde_json::Value::Array(l.iter().map(Value::to_json).collect()),
            Value::Dict(d) => serde_json::Value::Object(
                d.iter()
                    .map(|(k, v)| (json_text(k), v.to_json()))
                    .collect(),
            ),
        }
    }
}

/// Decode one bencode value from the front of `data`.
///
/// Returns the value and the number of bytes consumed. Trailing bytes are
/// left to the caller; use [`decode_all`] when the input must be exactly
/// one value.
pub fn decode(data: &[u8]) -> Result<(Value, usize), TorrentError> {
    let mut parser = Parser { data, pos: 0 };
    let value = parser.value()?;
    Ok((value, parser.pos))
}

/// Decode one bencode value that must span the entire input.
pub fn decode_all(data: &[u8]) -> Result<Value, TorrentError> {
    let (value, consumed) = decode(data)?;
    if consumed != data.len() {
        return Err(TorrentError::input_with_source(
            "trailing bytes after bencode value",
            format!("consumed {} of {} bytes", consumed, data.len()),
        ));
    }
    Ok(value)
}

/// Decode a top-level dictionary and report the byte span of the value
/// stored under `key`, if present.
///
/// The span addresses `data` itself, so `&data[span]` is the exact
/// encoding of that entry's value as it appeared on disk.
pub fn decode_with_span(
    data: &[u8],
    key: &[u8],
) -> Result<(Value, Option<Range<usize>>), TorrentError> {
    let mut parser = Parser { data, pos: 0 };
    if parser.peek()? != b'd' {
        return Err(TorrentError::input("expected top-level dictionary"));
    }
    parser.pos += 1;

    let mut dict = BTreeMap::new();
    let mut span = None;
    loop {
        match parser.peek()? {
            b'e' => {
                parser.pos += 1;
                break;
            }
            _ => {
                let k = parser.byte_string()?;
                let start = parser.pos;
                let v = parser.value()?;
                if k == key {
                    span = Some(start..parser.pos);
                }
                if dict.insert(k, v).is_some() {
                    return Err(TorrentError::input("duplicate dictionary key"));
                }
            }
        }
    }
    Ok((Value::Dict(dict), span))
}

/// Byte strings render verbatim when valid UTF-8; anything else is
/// byte-wise escaped. The escaping is injective, so non-UTF-8 dict keys
/// cannot collide in the JSON object.
fn json_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.escape_ascii().to_string(),
    }
}

/// Encode a value to a fresh buffer.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

/// Encode a value onto the end of `out`. Dictionary keys are emitted in
/// ascending byte order.
pub fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::List(l) => {
            out.push(b'l');
            for v in l {
                encode_into(v, out);
            }
            out.push(b'e');
        }
        Value::Dict(d) => {
            out.push(b'd');
            // BTreeMap iteration is already in ascending byte order
            for (k, v) in d {
                encode_into(&Value::Bytes(k.clone()), out);
                encode_into(v, out);
            }
            out.push(b'e');
        }
    }
}

struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Result<u8, TorrentError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| TorrentError::input("truncated bencode value"))
    }

    fn value(&mut self) -> Result<Value, TorrentError> {
        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(),
            b'd' => self.dict(),
            b'0'..=b'9' => Ok(Value::Bytes(self.byte_string()?)),
            other => Err(TorrentError::input_with_source(
                "unexpected bencode token",
                format!("byte 0x{:02x} at offset {}", other, self.pos),
            )),
        }
    }

    fn integer(&mut self) -> Result<Value, TorrentError> {
        self.pos += 1; // skip 'i'
        let start = self.pos;
        let end = self.data[self.pos..]
            .iter()
            .position(|&b| b == b'e')
            .map(|p| start + p)
            .ok_or_else(|| TorrentError::input("unterminated integer"))?;
        let digits = &self.data[start..end];

        // Grammar: -?(0|[1-9][0-9]*). Rejects "", "-", "-0" and leading zeros.
        let unsigned = digits.strip_prefix(b"-").unwrap_or(digits);
        let valid = match unsigned {
            [] => false,
            [b'0'] => digits == b"0",
            [b'0', ..] => false,
            _ => unsigned.iter().all(|b| b.is_ascii_digit()),
        };
        if !valid {
            return Err(TorrentError::input_with_source(
                "invalid integer",
                String::from_utf8_lossy(digits).into_owned(),
            ));
        }

        let number = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| TorrentError::input("integer out of range"))?;
        self.pos = end + 1;
        Ok(Value::Int(number))
    }

    fn byte_string(&mut self) -> Result<Vec<u8>, TorrentError> {
        let colon = self.data[self.pos..]
            .iter()
            .position(|&b| b == b':')
            .map(|p| self.pos + p)
            .ok_or_else(|| TorrentError::input("unterminated string length"))?;
        let len_digits = &self.data[self.pos..colon];
        if len_digits.is_empty() || !len_digits.iter().all(|b| b.is_ascii_digit()) {
            return Err(TorrentError::input("non-digit string length"));
        }
        let len = std::str::from_utf8(len_digits)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| TorrentError::input("string length out of range"))?;
        let start = colon + 1;
        let end = start
            .checked_add(len)
            .filter(|&e| e <= self.data.len())
            .ok_or_else(|| TorrentError::input("truncated byte string"))?;
        self.pos = end;
        Ok(self.data[start..end].to_vec())
    }

    fn list(&mut self) -> Result<Value, TorrentError> {
        self.pos += 1; // skip 'l'
        let mut items = Vec::new();
        loop {
            match self.peek()? {
                b'e' => {
                    self.pos += 1;
                    return Ok(Value::List(items));
                }
                _ => items.push(self.value()?),
            }
        }
    }

    fn dict(&mut self) -> Result<Value, TorrentError> {
        self.pos += 1; // skip 'd'
        let mut dict = BTreeMap::new();
        loop {
            match self.peek()? {
                b'e' => {
                    self.pos += 1;
                    return Ok(Value::Dict(dict));
                }
                b'0'..=b'9' => {
                    let key = self.byte_string()?;
                    let value = self.value()?;
                    if dict.insert(key, value).is_some() {
                        return Err(TorrentError::input("duplicate dictionary key"));
                    }
                }
                _ => return Err(TorrentError::input("dictionary key must be a byte string")),
            }
        }
    }
}
