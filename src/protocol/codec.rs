//! Length-prefixed frame codec
//!
//! `u32 length (big-endian) | u8 id | payload[length-1]`, length 0 being a
//! keep-alive. The decoder is restartable: it returns `Ok(None)` until a
//! complete frame is buffered, so bytes straddling a socket read boundary
//! are never lost. Declared lengths above [`MAX_FRAME`] are rejected to
//! keep a hostile peer from ballooning the receive buffer.

use std::io::Cursor;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use super::message::{Bitfield, Message, MessageId};
use crate::error::TorrentError;

/// Standard block size for piece requests: 16 KiB.
pub const BLOCK_LEN: u32 = 16 * 1024;

/// Upper bound on a declared frame length: 64 KiB.
pub const MAX_FRAME: usize = 64 * 1024;

/// Receive window: prefix + the largest well-formed piece frame header +
/// one full block.
const RECV_WINDOW: usize = 4 + 1 + 4 + 4 + BLOCK_LEN as usize;

/// Frame codec for the peer-wire protocol.
#[derive(Debug, Clone, Default)]
pub struct WireCodec;

impl Decoder for WireCodec {
    type Item = Message;
    type Error = TorrentError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, TorrentError> {
        if src.len() < 4 {
            src.reserve(RECV_WINDOW);
            return Ok(None);
        }

        // Peek the length without consuming; the frame may still be partial.
        let mut peek = Cursor::new(&src[..]);
        let frame_len = peek.get_u32() as usize;

        if frame_len > MAX_FRAME {
            return Err(TorrentError::protocol_with_source(
                "frame length exceeds limit",
                format!("{} > {}", frame_len, MAX_FRAME),
            ));
        }
        if src.len() < 4 + frame_len {
            trace!(
                buffered = src.len(),
                needed = 4 + frame_len,
                "frame incomplete"
            );
            src.reserve(4 + frame_len - src.len());
            return Ok(None);
        }

        src.advance(4);
        if frame_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let id = MessageId::try_from(src.get_u8())?;
        let payload_len = frame_len - 1;
        let message = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                require_payload(id, payload_len, 4)?;
                Message::Have {
                    piece_index: src.get_u32(),
                }
            }
            MessageId::Bitfield => {
                let mut bytes = vec![0u8; payload_len];
                src.copy_to_slice(&mut bytes);
                Message::Bitfield(Bitfield::from_bytes(bytes))
            }
            MessageId::Request => {
                require_payload(id, payload_len, 12)?;
                Message::Request {
                    index: src.get_u32(),
                    begin: src.get_u32(),
                    length: src.get_u32(),
                }
            }
            MessageId::Piece => {
                if payload_len < 8 {
                    return Err(truncated(id, payload_len, 8));
                }
                let index = src.get_u32();
                let begin = src.get_u32();
                let mut block = vec![0u8; payload_len - 8];
                src.copy_to_slice(&mut block);
                Message::Piece {
                    index,
                    begin,
                    block,
                }
            }
            MessageId::Cancel => {
                require_payload(id, payload_len, 12)?;
                Message::Cancel {
                    index: src.get_u32(),
                    begin: src.get_u32(),
                    length: src.get_u32(),
                }
            }
            MessageId::Port => {
                require_payload(id, payload_len, 2)?;
                Message::Port {
                    listen_port: src.get_u16(),
                }
            }
            MessageId::Extended => {
                if payload_len < 1 {
                    return Err(truncated(id, payload_len, 1));
                }
                let ext_id = src.get_u8();
                let mut payload = vec![0u8; payload_len - 1];
                src.copy_to_slice(&mut payload);
                Message::Extended { ext_id, payload }
            }
        };

        Ok(Some(message))
    }
}

impl Encoder<Message> for WireCodec {
    type Error = TorrentError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), TorrentError> {
        dst.reserve(4 + item.body_len() as usize);
        dst.put_u32(item.body_len());
        let Some(id) = item.message_id() else {
            return Ok(()); // keep-alive: just the zero prefix
        };
        dst.put_u8(id as u8);

        match item {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {}
            Message::Have { piece_index } => dst.put_u32(piece_index),
            Message::Bitfield(bitfield) => dst.put_slice(bitfield.as_bytes()),
            Message::Request {
                index,
                begin,
                length,
            }
            | Message::Cancel {
                index,
                begin,
                length,
            } => {
                dst.put_u32(index);
                dst.put_u32(begin);
                dst.put_u32(length);
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                dst.put_u32(index);
                dst.put_u32(begin);
                dst.put_slice(&block);
            }
            Message::Port { listen_port } => dst.put_u16(listen_port),
            Message::Extended { ext_id, payload } => {
                dst.put_u8(ext_id);
                dst.put_slice(&payload);
            }
        }
        Ok(())
    }
}

fn require_payload(id: MessageId, got: usize, want: usize) -> Result<(), TorrentError> {
    if got != want {
        return Err(truncated(id, got, want));
    }
    Ok(())
}

fn truncated(id: MessageId, got: usize, want: usize) -> TorrentError {
    TorrentError::protocol_with_source(
        "truncated message payload",
        format!("{:?}: expected {} bytes, got {}", id, want, got),
    )
}
