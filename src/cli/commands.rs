//! Subcommand implementations
//!
//! Each command prints its result to stdout in the tool's established
//! format; logs go to stderr so the output stays parseable. Errors are
//! reported through `anyhow` with a context naming the phase that
//! failed.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::args::Command;
use crate::bencode;
use crate::download::{self, DownloadConfig};
use crate::error::TorrentError;
use crate::peer::{PeerSession, SwarmInfo};
use crate::protocol::Handshake;
use crate::torrent::{MagnetLink, Metainfo};
use crate::tracker::{self, Announce};

/// Run one subcommand to completion.
pub async fn run(command: Command, cancel: &CancellationToken) -> Result<()> {
    match command {
        Command::Decode { bencoded } => decode(&bencoded),
        Command::Info { torrent } => info_cmd(&torrent),
        Command::Peers { torrent } => peers(&torrent).await,
        Command::Handshake { torrent, peer } => handshake(&torrent, &peer).await,
        Command::DownloadPiece {
            output,
            torrent,
            index,
        } => download_piece(&torrent, &output, index, cancel).await,
        Command::Download { output, torrent } => download(&torrent, &output, cancel).await,
        Command::MagnetParse { uri } => magnet_parse(&uri),
        Command::MagnetHandshake { uri } => magnet_handshake(&uri).await,
    }
}

fn decode(bencoded: &str) -> Result<()> {
    let value = bencode::decode_all(bencoded.as_bytes())
        .context("Failed to decode bencoded value")?;
    println!("{}", value.to_json());
    Ok(())
}

fn info_cmd(torrent: &Path) -> Result<()> {
    let meta = Metainfo::from_file(torrent).context("Failed to load torrent file")?;
    println!("Tracker URL: {}", meta.announce);
    println!("Length: {}", meta.total_length);
    println!("Info Hash: {}", meta.info_hash_hex());
    println!("Piece Length: {}", meta.piece_length);
    println!("Piece Hashes:");
    for hash in &meta.piece_hashes {
        println!("{}", hex::encode(hash));
    }
    Ok(())
}

async fn peers(torrent: &Path) -> Result<()> {
    let meta = Metainfo::from_file(torrent).context("Failed to load torrent file")?;
    let announce = Announce::new(
        &meta.announce,
        meta.info_hash,
        Handshake::generate_peer_id(),
        meta.total_length,
    );
    let response = tracker::announce(&announce)
        .await
        .context("Failed to announce to tracker")?;
    for peer in &response.peers {
        println!("{}", peer);
    }
    Ok(())
}

async fn handshake(torrent: &Path, peer: &str) -> Result<()> {
    let meta = Metainfo::from_file(torrent).context("Failed to load torrent file")?;
    let addr: SocketAddr = peer.parse().context("Failed to parse peer address")?;
    let swarm = SwarmInfo::new(meta.info_hash, Handshake::generate_peer_id());
    let session = PeerSession::connect(addr, &swarm)
        .await
        .context("Failed to handshake with peer")?;
    println!("Peer ID: {}", session.peer_id_hex());
    Ok(())
}

async fn download_piece(
    torrent: &Path,
    output: &Path,
    index: u32,
    cancel: &CancellationToken,
) -> Result<()> {
    let meta = Metainfo::from_file(torrent).context("Failed to load torrent file")?;
    download::dispatcher::download_piece(&meta, output, index, &DownloadConfig::default(), cancel)
        .await
        .context("Failed to download piece")?;
    println!("Piece {} downloaded to {}.", index, output.display());
    Ok(())
}

async fn download(torrent: &Path, output: &Path, cancel: &CancellationToken) -> Result<()> {
    let meta = Metainfo::from_file(torrent).context("Failed to load torrent file")?;
    download::dispatcher::download_torrent(&meta, output, &DownloadConfig::default(), cancel)
        .await
        .context("Failed to download torrent")?;
    println!("Downloaded {} to {}.", torrent.display(), output.display());
    Ok(())
}

fn magnet_parse(uri: &str) -> Result<()> {
    let magnet = MagnetLink::parse(uri).context("Failed to parse magnet URI")?;
    println!("Tracker URL: {}", magnet.tracker()?);
    println!("Info Hash: {}", magnet.info_hash_hex());
    Ok(())
}

async fn magnet_handshake(uri: &str) -> Result<()> {
    let magnet = MagnetLink::parse(uri).context("Failed to parse magnet URI")?;
    let peer_id = Handshake::generate_peer_id();

    // length is unknown before the metadata exchange; announce left=1
    let announce = Announce::new(magnet.tracker()?, magnet.info_hash, peer_id, 1);
    let response = tracker::announce(&announce)
        .await
        .context("Failed to announce to tracker")?;

    let swarm = SwarmInfo::new(magnet.info_hash, peer_id);
    let mut last_err =
        TorrentError::tracker_with_url("tracker returned no peers", magnet.tracker()?);
    for &peer in &response.peers {
        match PeerSession::connect(peer.into(), &swarm).await {
            Ok(mut session) => {
                let theirs = session
                    .extended_handshake()
                    .await
                    .context("Failed to perform extension handshake")?;
                let ut_metadata = theirs.ut_metadata_id().ok_or_else(|| {
                    TorrentError::protocol("peer did not advertise ut_metadata")
                })?;
                println!("Peer ID: {}", session.peer_id_hex());
                println!("Peer Metadata Extension ID: {}", ut_metadata);
                return Ok(());
            }
            Err(e) => {
                info!(%peer, %e, "peer unusable, trying next");
                last_err = e;
            }
        }
    }
    Err(last_err).context("Failed to handshake with any peer")
}
