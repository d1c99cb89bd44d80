//! Piece dispatcher
//!
//! The coordinator owns the piece collection and three channels: `todo`
//! (pending and retried work, pulled by any idle session), `done`
//! (completions, successful or failed) and `errs` (informational session
//! failures). Pieces move by value: a session owns the piece it pulled
//! until it hands it back. The coordinator is the only task that writes
//! temp files or counts completions.

use std::net::SocketAddrV4;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::assembler;
use super::piece::{PieceState, PieceWork};
use crate::error::TorrentError;
use crate::peer::{PeerSession, SwarmInfo};
use crate::protocol::Handshake;
use crate::torrent::Metainfo;
use crate::tracker::{self, Announce, TrackerResponse};

/// Announce retry schedule: bounded exponential backoff.
const ANNOUNCE_RETRIES: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// How many times a fully-dead swarm may be rebuilt from a re-announce
/// before the download aborts.
const MAX_SWARM_RESTARTS: u32 = 5;

/// Pause before a session retries the queue after pulling a piece the
/// peer does not have.
const UNSUITED_PIECE_DELAY: Duration = Duration::from_millis(250);

/// Tunables for a download run.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Port reported to the tracker
    pub port: u16,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            port: tracker::DEFAULT_PORT,
        }
    }
}

/// Download the whole payload described by `meta` and assemble it at
/// `output`.
pub async fn download_torrent(
    meta: &Metainfo,
    output: &Path,
    config: &DownloadConfig,
    cancel: &CancellationToken,
) -> Result<(), TorrentError> {
    let indices: Vec<u32> = (0..meta.piece_count() as u32).collect();
    download_pieces(meta, output, &indices, config, cancel).await?;
    assembler::assemble(output, &indices).await
}

/// Download a single piece to `output`, hash-verified.
pub async fn download_piece(
    meta: &Metainfo,
    output: &Path,
    index: u32,
    config: &DownloadConfig,
    cancel: &CancellationToken,
) -> Result<(), TorrentError> {
    if index as usize >= meta.piece_count() {
        return Err(TorrentError::input_with_source(
            "piece index out of range",
            format!("{} of {}", index, meta.piece_count()),
        ));
    }
    let indices = [index];
    download_pieces(meta, output, &indices, config, cancel).await?;
    assembler::assemble(output, &indices).await
}

/// Fetch the given pieces into per-piece temp files next to `output`.
async fn download_pieces(
    meta: &Metainfo,
    output: &Path,
    indices: &[u32],
    config: &DownloadConfig,
    cancel: &CancellationToken,
) -> Result<(), TorrentError> {
    let peer_id = Handshake::generate_peer_id();
    let swarm = SwarmInfo::new(meta.info_hash, peer_id);
    let announce = Announce {
        url: meta.announce.clone(),
        info_hash: meta.info_hash,
        peer_id,
        port: config.port,
        left: meta.total_length,
    };

    let response = announce_with_backoff(&announce, cancel).await?;
    if response.peers.is_empty() {
        return Err(TorrentError::tracker_with_url(
            "tracker returned no peers",
            &meta.announce,
        ));
    }

    let pieces: Vec<PieceWork> = indices
        .iter()
        .map(|&i| PieceWork::new(i, meta.piece_len(i) as u32, meta.piece_hashes[i as usize]))
        .collect();

    Dispatcher {
        swarm,
        announce,
        output: output.to_path_buf(),
        cancel: cancel.clone(),
    }
    .run(pieces, response.peers)
    .await
}

struct Dispatcher {
    swarm: SwarmInfo,
    announce: Announce,
    output: PathBuf,
    cancel: CancellationToken,
}

impl Dispatcher {
    /// Drive the swarm until every piece is done, the run is cancelled,
    /// or the swarm dies beyond recovery.
    async fn run(
        self,
        pieces: Vec<PieceWork>,
        initial_peers: Vec<SocketAddrV4>,
    ) -> Result<(), TorrentError> {
        let total = pieces.len();
        let (todo_tx, todo_rx) = mpsc::channel::<PieceWork>(total.max(1));
        let (done_tx, mut done_rx) = mpsc::channel::<PieceWork>(total.max(1));
        let (errs_tx, mut errs_rx) = mpsc::channel::<TorrentError>(16);
        let todo_rx = Arc::new(Mutex::new(todo_rx));

        for piece in pieces {
            // capacity equals the piece count, so seeding cannot block
            todo_tx
                .send(piece)
                .await
                .expect("todo channel closed before seeding finished");
        }

        // sessions observe this child token; completion cancels only the
        // sessions, external cancellation reaches them through the parent
        let session_cancel = self.cancel.child_token();
        let mut sessions = JoinSet::new();
        self.spawn_sessions(
            &mut sessions,
            &initial_peers,
            total,
            &todo_rx,
            &done_tx,
            &errs_tx,
            &session_cancel,
        );

        let mut done_count = 0usize;
        let mut restarts = 0u32;
        let result = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Err(TorrentError::Cancelled),

                Some(piece) = done_rx.recv() => match piece.state {
                    PieceState::Done => {
                        assembler::write_piece(&self.output, &piece).await?;
                        done_count += 1;
                        info!(
                            piece = piece.index,
                            done = done_count,
                            total,
                            "piece verified"
                        );
                        if done_count == total {
                            break Ok(());
                        }
                    }
                    _ => {
                        debug!(piece = piece.index, "requeueing failed piece");
                        let mut piece = piece;
                        piece.reset();
                        if todo_tx.send(piece).await.is_err() {
                            break Err(TorrentError::Cancelled);
                        }
                    }
                },

                Some(err) = errs_rx.recv() => {
                    warn!(%err, "peer session failed");
                }

                Some(_) = sessions.join_next() => {
                    if !sessions.is_empty() || done_count == total {
                        continue;
                    }
                    // the whole swarm is gone with work outstanding
                    restarts += 1;
                    if restarts > MAX_SWARM_RESTARTS {
                        break Err(TorrentError::network(format!(
                            "all peer sessions failed with {} of {} pieces incomplete",
                            total - done_count,
                            total
                        )));
                    }
                    info!(restarts, "all sessions ended, re-announcing");
                    match announce_with_backoff(&self.announce, &self.cancel).await {
                        Ok(TrackerResponse { peers, .. }) if !peers.is_empty() => {
                            self.spawn_sessions(
                                &mut sessions,
                                &peers,
                                total - done_count,
                                &todo_rx,
                                &done_tx,
                                &errs_tx,
                                &session_cancel,
                            );
                        }
                        Ok(_) => break Err(TorrentError::tracker_with_url(
                            "tracker returned no peers",
                            &self.announce.url,
                        )),
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        // cooperative shutdown: sessions notice within one poll period
        session_cancel.cancel();
        while sessions.join_next().await.is_some() {}
        result
    }

    /// One session task per peer, capped at the number of pieces still
    /// wanted.
    #[allow(clippy::too_many_arguments)]
    fn spawn_sessions(
        &self,
        sessions: &mut JoinSet<()>,
        peers: &[SocketAddrV4],
        want: usize,
        todo_rx: &Arc<Mutex<mpsc::Receiver<PieceWork>>>,
        done_tx: &mpsc::Sender<PieceWork>,
        errs_tx: &mpsc::Sender<TorrentError>,
        cancel: &CancellationToken,
    ) {
        let budget = peers.len().min(want.max(1));
        info!(peers = peers.len(), sessions = budget, "spawning peer sessions");
        for &addr in peers.iter().take(budget) {
            sessions.spawn(session_worker(
                addr,
                self.swarm,
                Arc::clone(todo_rx),
                done_tx.clone(),
                errs_tx.clone(),
                cancel.clone(),
            ));
        }
    }
}

/// One peer session: pull pieces from `todo`, drive each to completion,
/// report on `done`. Any session-scoped failure hands the current piece
/// back as failed and ends the task.
async fn session_worker(
    addr: SocketAddrV4,
    swarm: SwarmInfo,
    todo_rx: Arc<Mutex<mpsc::Receiver<PieceWork>>>,
    done_tx: mpsc::Sender<PieceWork>,
    errs_tx: mpsc::Sender<TorrentError>,
    cancel: CancellationToken,
) {
    let mut session = match PeerSession::connect(addr.into(), &swarm).await {
        Ok(session) => session,
        Err(e) => {
            let _ = errs_tx.send(e).await;
            return;
        }
    };

    loop {
        // bounded receive; holding the lock only while pulling keeps the
        // other sessions free to grab work
        let pulled = {
            let mut rx = todo_rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => return,
                piece = rx.recv() => piece,
            }
        };
        let Some(mut piece) = pulled else { return };
        piece.state = PieceState::InFlight;

        if !session.has_piece(piece.index) {
            // not useful for this piece; hand it back untouched
            piece.state = PieceState::Failed;
            if done_tx.send(piece).await.is_err() {
                return;
            }
            tokio::time::sleep(UNSUITED_PIECE_DELAY).await;
            continue;
        }

        match session.download(&mut piece, &cancel).await {
            Ok(()) => match piece.verify() {
                Ok(()) => {
                    if done_tx.send(piece).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    // hash mismatch: requeue the piece and drop this peer
                    let _ = done_tx.send(piece).await;
                    let _ = errs_tx.send(e).await;
                    return;
                }
            },
            Err(TorrentError::Cancelled) => return,
            Err(e) => {
                piece.state = PieceState::Failed;
                let _ = done_tx.send(piece).await;
                let _ = errs_tx.send(e).await;
                return;
            }
        }
    }
}

/// Announce with bounded exponential backoff between attempts.
async fn announce_with_backoff(
    req: &Announce,
    cancel: &CancellationToken,
) -> Result<TrackerResponse, TorrentError> {
    let mut delay = BACKOFF_BASE;
    let mut last_err = TorrentError::tracker_with_url("announce never attempted", &req.url);
    for attempt in 1..=ANNOUNCE_RETRIES {
        match tracker::announce(req).await {
            Ok(response) => return Ok(response),
            Err(e) => {
                warn!(attempt, %e, "announce failed");
                last_err = e;
            }
        }
        if attempt < ANNOUNCE_RETRIES {
            tokio::select! {
                _ = cancel.cancelled() => return Err(TorrentError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            delay = std::cmp::min(delay * 2, BACKOFF_CAP);
        }
    }
    Err(last_err)
}
