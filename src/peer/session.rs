//! Peer session state machine
//!
//! One session per TCP connection. The flow for a download:
//!
//! ```text
//! connect -> handshake -> (optional bitfield) -> Interested -> Unchoke
//!         -> pipelined Requests -> Piece frames -> piece complete
//! ```
//!
//! Reads are polled with a short deadline so the cancellation token is
//! observed within about a second; a longer inactivity bound tears the
//! session down when the peer goes quiet mid-download.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{SessionState, SwarmInfo};
use crate::download::PieceWork;
use crate::error::TorrentError;
use crate::protocol::extension::HANDSHAKE_EXT_ID;
use crate::protocol::handshake::HANDSHAKE_LEN;
use crate::protocol::{Bitfield, ExtendedHandshake, Handshake, Message, WireCodec, BLOCK_LEN};

/// TCP connect timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the 68-byte handshake exchange
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the BEP-10 extension handshake exchange
const EXTENSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-poll read deadline; bounds how long cancellation can go unnoticed
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Inactivity bound after which the session gives up on the peer
const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Outbound-idle interval for keep-alives (the protocol allows up to 2 min)
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(90);

/// Number of Request frames kept in flight while downloading a piece
const PIPELINE_DEPTH: usize = 5;

/// A live connection to one peer.
#[derive(Debug)]
pub struct PeerSession {
    addr: SocketAddr,
    frames: Framed<TcpStream, WireCodec>,
    /// Protocol flag block
    pub state: SessionState,
    /// The peer's identity from its handshake
    pub peer_id: [u8; 20],
    /// Piece availability; empty until the peer tells us
    pub bitfield: Bitfield,
    /// The peer's BEP-10 table, once negotiated
    pub extensions: Option<ExtendedHandshake>,
    last_send: Instant,
    last_recv: Instant,
    /// A non-keepalive frame has arrived since the handshake
    saw_first_frame: bool,
}

impl PeerSession {
    /// Dial a peer and exchange handshakes.
    ///
    /// The outgoing handshake always carries the extension bit; whether
    /// the peer does too is recorded in `state.peer_supports_ext`.
    pub async fn connect(addr: SocketAddr, swarm: &SwarmInfo) -> Result<Self, TorrentError> {
        debug!(%addr, "connecting to peer");
        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| TorrentError::network_with_address("connect timed out", addr.to_string()))?
            .map_err(|e| {
                TorrentError::network_full("failed to connect", addr.to_string(), e.to_string())
            })?;

        let mut state = SessionState::default();
        let ours = Handshake::new(swarm.info_hash, swarm.peer_id);
        let exchange = async {
            stream.write_all(&ours.serialize()).await?;
            state.handshake_sent = true;
            let mut buf = [0u8; HANDSHAKE_LEN];
            stream.read_exact(&mut buf).await?;
            Ok::<_, std::io::Error>(buf)
        };
        let buf = timeout(HANDSHAKE_TIMEOUT, exchange)
            .await
            .map_err(|_| {
                TorrentError::network_with_address("handshake timed out", addr.to_string())
            })?
            .map_err(|e| {
                TorrentError::network_full("handshake failed", addr.to_string(), e.to_string())
            })?;

        let theirs = Handshake::deserialize(&buf)?;
        theirs.validate(&swarm.info_hash)?;
        state.handshake_recv = true;
        state.peer_supports_ext = theirs.supports_extensions();
        debug!(
            %addr,
            peer_id = %hex::encode(theirs.peer_id),
            extensions = state.peer_supports_ext,
            "handshake complete"
        );

        let now = Instant::now();
        Ok(Self {
            addr,
            frames: Framed::new(stream, WireCodec),
            state,
            peer_id: theirs.peer_id,
            bitfield: Bitfield::default(),
            extensions: None,
            last_send: now,
            last_recv: now,
            saw_first_frame: false,
        })
    }

    /// The peer's address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The peer's identity as 40 hex digits.
    pub fn peer_id_hex(&self) -> String {
        hex::encode(self.peer_id)
    }

    /// Whether this peer claims the piece. Optimistic while no bitfield
    /// has arrived: some peers skip it and announce pieces via Have.
    pub fn has_piece(&self, index: u32) -> bool {
        if !self.state.bitfield_recv && self.bitfield.count() == 0 {
            return true;
        }
        self.bitfield.has(index)
    }

    /// Perform the BEP-10 extension handshake and return the peer's table.
    ///
    /// Bitfield or Have frames arriving first are absorbed into session
    /// state; anything else is skipped until the extended handshake shows
    /// up or the deadline passes.
    pub async fn extended_handshake(&mut self) -> Result<ExtendedHandshake, TorrentError> {
        if !self.state.peer_supports_ext {
            return Err(TorrentError::protocol(
                "peer did not advertise extension support",
            ));
        }

        self.send(Message::Extended {
            ext_id: HANDSHAKE_EXT_ID,
            payload: ExtendedHandshake::ours().encode(),
        })
        .await?;

        let deadline = Instant::now() + EXTENSION_TIMEOUT;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| {
                    TorrentError::network_with_address(
                        "extension handshake timed out",
                        self.addr.to_string(),
                    )
                })?;
            let frame = timeout(remaining, self.frames.next())
                .await
                .map_err(|_| {
                    TorrentError::network_with_address(
                        "extension handshake timed out",
                        self.addr.to_string(),
                    )
                })?;
            let message = match frame {
                None => {
                    return Err(TorrentError::network_with_address(
                        "peer closed connection during extension handshake",
                        self.addr.to_string(),
                    ))
                }
                Some(result) => result?,
            };
            self.last_recv = Instant::now();

            match message {
                Message::Extended {
                    ext_id: HANDSHAKE_EXT_ID,
                    payload,
                } => {
                    let theirs = ExtendedHandshake::decode(&payload)?;
                    debug!(addr = %self.addr, table = ?theirs.m, "extension handshake complete");
                    self.extensions = Some(theirs.clone());
                    return Ok(theirs);
                }
                other => self.note(&other),
            }
        }
    }

    /// Download one piece into its buffer.
    ///
    /// Drives the per-session machine as far as it needs to go: waits out
    /// the optional bitfield on the first call, declares interest once,
    /// waits for Unchoke, then keeps [`PIPELINE_DEPTH`] requests in
    /// flight until every block of the piece has arrived. On Choke the
    /// outstanding requests are forgotten and re-issued after the next
    /// Unchoke.
    pub async fn download(
        &mut self,
        piece: &mut PieceWork,
        cancel: &CancellationToken,
    ) -> Result<(), TorrentError> {
        // Bitfield intake: optional per the BEP, so the wait ends at the
        // first non-keepalive frame of any kind. Keepalives only reset
        // the receive deadline.
        while !self.saw_first_frame {
            match self.recv(cancel).await? {
                Some(Message::KeepAlive) => continue,
                None => self.tick().await?,
                Some(message) => self.note(&message),
            }
        }

        if !self.state.am_interested {
            self.send(Message::Interested).await?;
            self.state.am_interested = true;
        }

        // requested[i]: a Request for block i is in flight
        let mut requested = vec![false; piece.block_count()];
        let mut in_flight = 0usize;

        while !piece.is_complete() {
            if self.state.can_request() {
                while in_flight < PIPELINE_DEPTH {
                    let Some(block_index) = next_wanted(piece, &requested) else {
                        break;
                    };
                    let (begin, length) = piece.block_range(block_index);
                    trace!(addr = %self.addr, piece = piece.index, begin, length, "requesting block");
                    self.send(Message::Request {
                        index: piece.index,
                        begin,
                        length,
                    })
                    .await?;
                    requested[block_index] = true;
                    in_flight += 1;
                }
            }

            let Some(message) = self.recv(cancel).await? else {
                // poll deadline: run the timers and go around
                self.tick().await?;
                continue;
            };

            match message {
                Message::Piece {
                    index,
                    begin,
                    block,
                } => {
                    if index != piece.index {
                        warn!(addr = %self.addr, index, expected = piece.index, "piece index mismatch");
                        return Err(TorrentError::protocol_with_source(
                            "piece frame for a piece we did not request",
                            format!("expected {}, got {}", piece.index, index),
                        ));
                    }
                    piece.accept_block(begin, &block)?;
                    in_flight = in_flight.saturating_sub(1);
                }
                Message::Choke => {
                    debug!(addr = %self.addr, "choked mid-pipeline, draining requests");
                    self.state.peer_choking = true;
                    // outstanding requests are void; re-request after Unchoke
                    for (block_index, flag) in requested.iter_mut().enumerate() {
                        *flag = piece.block_is_received(block_index as u32 * BLOCK_LEN);
                    }
                    in_flight = 0;
                }
                other => self.note(&other),
            }
        }

        debug!(addr = %self.addr, piece = piece.index, "piece fully received");
        Ok(())
    }

    /// Apply a state-bearing message to the session flags.
    fn note(&mut self, message: &Message) {
        match message {
            Message::Choke => self.state.peer_choking = true,
            Message::Unchoke => self.state.peer_choking = false,
            Message::Bitfield(bitfield) => {
                self.state.bitfield_recv = true;
                self.bitfield = bitfield.clone();
            }
            Message::Have { piece_index } => self.bitfield.set(*piece_index),
            // Port (DHT) and unsolicited Request/Cancel/Piece/Extended
            // traffic carry nothing this client acts on
            _ => {}
        }
    }

    /// Receive one frame, or `None` when the poll deadline passes.
    async fn recv(&mut self, cancel: &CancellationToken) -> Result<Option<Message>, TorrentError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(TorrentError::Cancelled),
            polled = timeout(POLL_TIMEOUT, self.frames.next()) => match polled {
                Err(_) => Ok(None),
                Ok(None) => Err(TorrentError::network_with_address(
                    "peer closed connection",
                    self.addr.to_string(),
                )),
                Ok(Some(Ok(message))) => {
                    self.last_recv = Instant::now();
                    if message == Message::KeepAlive {
                        trace!(addr = %self.addr, "keep-alive received");
                    } else {
                        self.saw_first_frame = true;
                    }
                    Ok(Some(message))
                }
                Ok(Some(Err(e))) => Err(e),
            },
        }
    }

    /// Poll-deadline housekeeping: keep-alive and the inactivity bound.
    async fn tick(&mut self) -> Result<(), TorrentError> {
        self.keepalive_if_idle().await?;
        if self.last_recv.elapsed() > IDLE_TIMEOUT {
            return Err(TorrentError::network_with_address(
                "peer went silent",
                self.addr.to_string(),
            ));
        }
        Ok(())
    }

    /// Send one frame and flush it.
    async fn send(&mut self, message: Message) -> Result<(), TorrentError> {
        self.frames.send(message).await?;
        self.last_send = Instant::now();
        Ok(())
    }

    /// Emit a keep-alive when the outbound side has been idle too long.
    async fn keepalive_if_idle(&mut self) -> Result<(), TorrentError> {
        if self.last_send.elapsed() >= KEEPALIVE_INTERVAL {
            trace!(addr = %self.addr, "sending keep-alive");
            self.send(Message::KeepAlive).await?;
        }
        Ok(())
    }
}

/// First block that is neither received nor currently requested.
fn next_wanted(piece: &PieceWork, requested: &[bool]) -> Option<usize> {
    (0..piece.block_count())
        .find(|&i| !requested[i] && !piece.block_is_received(i as u32 * BLOCK_LEN))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha1::{Digest, Sha1};
    use tokio::net::TcpListener;

    const INFO_HASH: [u8; 20] = [0xaa; 20];
    const REMOTE_ID: [u8; 20] = [0xcc; 20];

    fn swarm() -> SwarmInfo {
        SwarmInfo::new(INFO_HASH, Handshake::generate_peer_id())
    }

    /// A scripted remote peer: accepts one connection, answers the
    /// handshake, then runs the provided closure over a framed stream.
    async fn scripted_peer<F, Fut>(script: F) -> SocketAddr
    where
        F: FnOnce(Framed<TcpStream, WireCodec>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; HANDSHAKE_LEN];
            stream.read_exact(&mut buf).await.unwrap();
            let theirs = Handshake::deserialize(&buf).unwrap();
            assert_eq!(theirs.info_hash, INFO_HASH);
            assert!(theirs.supports_extensions());
            let reply = Handshake::new(INFO_HASH, REMOTE_ID);
            stream.write_all(&reply.serialize()).await.unwrap();
            script(Framed::new(stream, WireCodec)).await;
        });
        addr
    }

    /// Serve block requests for `payload` until the piece is done.
    async fn serve_blocks(frames: &mut Framed<TcpStream, WireCodec>, payload: &[u8]) {
        loop {
            match frames.next().await {
                Some(Ok(Message::Request {
                    index,
                    begin,
                    length,
                })) => {
                    let begin_usize = begin as usize;
                    let block = payload[begin_usize..begin_usize + length as usize].to_vec();
                    frames
                        .send(Message::Piece {
                            index,
                            begin,
                            block,
                        })
                        .await
                        .unwrap();
                }
                Some(Ok(_)) => {}
                _ => break,
            }
        }
    }

    #[tokio::test]
    async fn test_connect_validates_handshake() {
        let addr = scripted_peer(|_| async {}).await;
        let session = PeerSession::connect(addr, &swarm()).await.unwrap();
        assert_eq!(session.peer_id, REMOTE_ID);
        assert!(session.state.handshake_sent);
        assert!(session.state.handshake_recv);
        assert!(session.state.peer_supports_ext);
        assert_eq!(session.peer_id_hex(), "cc".repeat(20));
    }

    #[tokio::test]
    async fn test_connect_rejects_info_hash_mismatch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; HANDSHAKE_LEN];
            stream.read_exact(&mut buf).await.unwrap();
            let reply = Handshake::new([0x99; 20], REMOTE_ID);
            stream.write_all(&reply.serialize()).await.unwrap();
        });
        let err = PeerSession::connect(addr, &swarm()).await.unwrap_err();
        assert!(err.to_string().contains("info-hash mismatch"));
    }

    #[tokio::test]
    async fn test_download_happy_path() {
        let payload: Vec<u8> = (0..40000u32).map(|i| (i * 7 % 256) as u8).collect();
        let expected: [u8; 20] = Sha1::digest(&payload).into();
        let script_payload = payload.clone();

        let addr = scripted_peer(move |mut frames| async move {
            frames
                .send(Message::Bitfield(Bitfield::from_bytes(vec![0b1000_0000])))
                .await
                .unwrap();
            // wait for Interested before unchoking
            loop {
                match frames.next().await.unwrap().unwrap() {
                    Message::Interested => break,
                    _ => {}
                }
            }
            frames.send(Message::Unchoke).await.unwrap();
            serve_blocks(&mut frames, &script_payload).await;
        })
        .await;

        let mut session = PeerSession::connect(addr, &swarm()).await.unwrap();
        let mut piece = PieceWork::new(0, payload.len() as u32, expected);
        let cancel = CancellationToken::new();
        session.download(&mut piece, &cancel).await.unwrap();

        assert!(session.state.bitfield_recv);
        assert!(session.state.am_interested);
        assert!(!session.state.peer_choking);
        assert!(piece.is_complete());
        piece.verify().unwrap();
        assert_eq!(piece.data(), &payload[..]);
    }

    #[tokio::test]
    async fn test_download_without_bitfield() {
        // bitfield is optional; the unchoke itself signals readiness
        let payload = vec![0x5au8; 1000];
        let expected: [u8; 20] = Sha1::digest(&payload).into();
        let script_payload = payload.clone();

        let addr = scripted_peer(move |mut frames| async move {
            frames.send(Message::Unchoke).await.unwrap();
            serve_blocks(&mut frames, &script_payload).await;
        })
        .await;

        let mut session = PeerSession::connect(addr, &swarm()).await.unwrap();
        let mut piece = PieceWork::new(0, payload.len() as u32, expected);
        session
            .download(&mut piece, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!session.state.bitfield_recv);
        piece.verify().unwrap();
    }

    #[tokio::test]
    async fn test_download_survives_choke_between_blocks() {
        let payload: Vec<u8> = (0..(2 * 16384 + 5) as u32).map(|i| (i % 253) as u8).collect();
        let expected: [u8; 20] = Sha1::digest(&payload).into();
        let script_payload = payload.clone();

        let addr = scripted_peer(move |mut frames| async move {
            frames.send(Message::Unchoke).await.unwrap();
            // serve exactly one block, then choke and unchoke again
            loop {
                match frames.next().await.unwrap().unwrap() {
                    Message::Request {
                        index,
                        begin,
                        length,
                    } => {
                        let block =
                            script_payload[begin as usize..(begin + length) as usize].to_vec();
                        frames
                            .send(Message::Piece {
                                index,
                                begin,
                                block,
                            })
                            .await
                            .unwrap();
                        break;
                    }
                    _ => {}
                }
            }
            frames.send(Message::Choke).await.unwrap();
            frames.send(Message::Unchoke).await.unwrap();
            serve_blocks(&mut frames, &script_payload).await;
        })
        .await;

        let mut session = PeerSession::connect(addr, &swarm()).await.unwrap();
        let mut piece = PieceWork::new(0, payload.len() as u32, expected);
        session
            .download(&mut piece, &CancellationToken::new())
            .await
            .unwrap();
        piece.verify().unwrap();
        assert_eq!(piece.data(), &payload[..]);
    }

    #[tokio::test]
    async fn test_download_observes_cancellation() {
        // peer unchokes but never serves blocks
        let addr = scripted_peer(move |mut frames| async move {
            frames.send(Message::Unchoke).await.unwrap();
            loop {
                if frames.next().await.is_none() {
                    break;
                }
            }
        })
        .await;

        let mut session = PeerSession::connect(addr, &swarm()).await.unwrap();
        let mut piece = PieceWork::new(0, 16384, [0u8; 20]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = session.download(&mut piece, &cancel).await.unwrap_err();
        assert!(matches!(err, TorrentError::Cancelled));
    }

    #[tokio::test]
    async fn test_download_rejects_wrong_piece_index() {
        let addr = scripted_peer(move |mut frames| async move {
            frames.send(Message::Unchoke).await.unwrap();
            loop {
                match frames.next().await {
                    Some(Ok(Message::Request { begin, length, .. })) => {
                        frames
                            .send(Message::Piece {
                                index: 99,
                                begin,
                                block: vec![0u8; length as usize],
                            })
                            .await
                            .unwrap();
                    }
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
        })
        .await;

        let mut session = PeerSession::connect(addr, &swarm()).await.unwrap();
        let mut piece = PieceWork::new(0, 16384, [0u8; 20]);
        let err = session
            .download(&mut piece, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TorrentError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_extended_handshake() {
        let addr = scripted_peer(move |mut frames| async move {
            // noise before the extension handshake is legal
            frames
                .send(Message::Bitfield(Bitfield::from_bytes(vec![0xff])))
                .await
                .unwrap();
            loop {
                match frames.next().await.unwrap().unwrap() {
                    Message::Extended { ext_id: 0, payload } => {
                        let theirs = ExtendedHandshake::decode(&payload).unwrap();
                        assert_eq!(theirs.ut_metadata_id(), Some(1));
                        break;
                    }
                    _ => {}
                }
            }
            frames
                .send(Message::Extended {
                    ext_id: 0,
                    payload: b"d1:md11:ut_metadatai16eee".to_vec(),
                })
                .await
                .unwrap();
        })
        .await;

        let mut session = PeerSession::connect(addr, &swarm()).await.unwrap();
        let theirs = session.extended_handshake().await.unwrap();
        assert_eq!(theirs.ut_metadata_id(), Some(16));
        assert!(session.state.bitfield_recv);
        assert!(session.has_piece(3));
    }

    #[test]
    fn test_has_piece_optimistic_until_bitfield() {
        // exercised through the public surface in the async tests; here
        // just the bitfield logic
        let bitfield = Bitfield::from_bytes(vec![0b0100_0000]);
        assert!(!bitfield.has(0));
        assert!(bitfield.has(1));
    }
}
