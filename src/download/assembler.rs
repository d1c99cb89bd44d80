//! Piece persistence and final assembly
//!
//! Each verified piece lands in its own temp file, `<output>.<index>`,
//! so concurrent completions never collide. Assembly concatenates the
//! temp files strictly in ascending index order and unlinks them only
//! after the output file is fully written; on failure they stay behind
//! for inspection.

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info};

use super::piece::PieceWork;
use crate::error::TorrentError;

/// The temp file carrying piece `index`.
pub fn temp_path(output: &Path, index: u32) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(format!(".{}", index));
    PathBuf::from(name)
}

/// Persist one verified piece to its temp file.
pub async fn write_piece(output: &Path, piece: &PieceWork) -> Result<(), TorrentError> {
    let path = temp_path(output, piece.index);
    tokio::fs::write(&path, piece.data()).await.map_err(|e| {
        TorrentError::io_full(
            "failed to write piece file",
            path.display().to_string(),
            e.to_string(),
        )
    })?;
    debug!(piece = piece.index, path = %path.display(), "piece persisted");
    Ok(())
}

/// Concatenate the temp files for `indices` (ascending) into `output`,
/// then remove them.
pub async fn assemble(output: &Path, indices: &[u32]) -> Result<(), TorrentError> {
    let file = File::create(output).await.map_err(|e| {
        TorrentError::io_full(
            "failed to create output file",
            output.display().to_string(),
            e.to_string(),
        )
    })?;
    let mut writer = BufWriter::new(file);

    for &index in indices {
        let path = temp_path(output, index);
        let mut piece_file = File::open(&path).await.map_err(|e| {
            TorrentError::io_full(
                "failed to open piece file",
                path.display().to_string(),
                e.to_string(),
            )
        })?;
        tokio::io::copy(&mut piece_file, &mut writer)
            .await
            .map_err(|e| {
                TorrentError::io_full(
                    "failed to append piece to output",
                    path.display().to_string(),
                    e.to_string(),
                )
            })?;
    }
    writer.flush().await.map_err(|e| {
        TorrentError::io_full(
            "failed to flush output file",
            output.display().to_string(),
            e.to_string(),
        )
    })?;

    // the output is durable now, so the temp files can go
    for &index in indices {
        let path = temp_path(output, index);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            debug!(path = %path.display(), %e, "could not remove piece file");
        }
    }

    info!(path = %output.display(), pieces = indices.len(), "assembly complete");
    Ok(())
}
