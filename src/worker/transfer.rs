//! File Transfer (slave side)
//!
//! Negotiates the file index that follows a parameter blob and stores requested
//! files as `tmp_<hash><.ext>` in the work directory. File parameters are rewritten
//! to point at the local copy. A hash already received in this session is reused
//! without being requested again.

use super::handlers::Connection;
use super::types::SessionError;
use crate::scene::params::ParamSet;
use crate::wire::error::WireError;
use crate::wire::hash::{StreamingHash, is_valid_hash};
use crate::wire::protocol::*;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Local name for a received file: content hash plus the original extension.
pub fn temp_file_name(hash: &str, original: &str) -> String {
    let extension = Path::new(original)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()));
    match extension {
        Some(ext) => format!("tmp_{hash}.{ext}"),
        None => format!("tmp_{hash}"),
    }
}

pub(crate) async fn receive_files(
    conn: &mut Connection,
    params: &mut ParamSet,
) -> Result<(), SessionError> {
    let opening = conn.wire.read_line().await?;
    if opening == FILE_INDEX_EMPTY {
        return Ok(());
    }
    if opening != BEGIN_FILE_INDEX {
        return Err(WireError::unexpected(BEGIN_FILE_INDEX, &opening).into());
    }
    conn.wire.write_line(BEGIN_FILE_INDEX_OK).await?;

    let mut needed: Vec<(String, PathBuf)> = Vec::new();
    loop {
        let param = conn.wire.read_line().await?;
        if param == END_FILE_INDEX {
            break;
        }
        let filename = conn.wire.read_line().await?;
        let hash = conn.wire.read_line().await?;
        let separator = conn.wire.read_line().await?;

        if param.is_empty() || filename.is_empty() || !is_valid_hash(&hash) || !separator.is_empty() {
            tracing::error!("Invalid file index entry for parameter '{}'", param);
            conn.wire.write_line(FILE_INDEX_INVALID).await?;
            conn.wire.flush().await?;
            return Err(WireError::protocol(format!("invalid file index entry '{}'", param)).into());
        }

        let local = match conn.server.cached_file(&hash).await {
            Some(path) => {
                tracing::debug!("Reusing '{}' for '{}'", path.display(), filename);
                path
            }
            None => match needed.iter().find(|(h, _)| *h == hash) {
                Some((_, path)) => path.clone(),
                None => {
                    let path = conn
                        .server
                        .config
                        .work_dir
                        .join(temp_file_name(&hash, &filename));
                    tracing::info!("Requesting file '{}' ({})", filename, hash);
                    needed.push((hash.clone(), path.clone()));
                    path
                }
            },
        };
        params.add_string(&param, &local.to_string_lossy());
    }

    conn.wire.write_line(END_FILE_INDEX_OK).await?;
    conn.wire.expect_line(BEGIN_FILES).await?;
    conn.wire.write_line(BEGIN_FILES_OK).await?;

    for (hash, path) in needed {
        conn.server.track_file(&path).await;
        conn.wire.write_line(&hash).await?;

        if !receive_file(conn, &path, &hash).await? {
            conn.wire.write_line(RESEND_FILE).await?;
            if !receive_file(conn, &path, &hash).await? {
                return Err(WireError::Integrity(hash).into());
            }
        }
        conn.wire.write_line(FILE_OK).await?;
        conn.server.mark_received(&hash, &path).await;
    }

    conn.wire.write_line(END_FILES).await?;
    conn.wire.expect_line(END_FILES_OK).await?;
    Ok(())
}

/// Receives one `<filename>\n<len>\n<bytes>` body into `path`.
/// Returns `false` (with the partial file removed) when the content hash differs.
async fn receive_file(
    conn: &mut Connection,
    path: &Path,
    expected_hash: &str,
) -> Result<bool, SessionError> {
    let source = conn.wire.read_line().await?;
    let len_line = conn.wire.read_line().await?;
    let len: u64 = len_line
        .trim()
        .parse()
        .map_err(|_| WireError::protocol(format!("invalid file length '{}'", len_line)))?;

    tracing::info!(
        "Receiving file '{}' as '{}' ({} bytes)",
        source,
        path.display(),
        len
    );

    let file_error = |source: std::io::Error| SessionError::File {
        path: path.to_path_buf(),
        source,
    };
    let mut file = tokio::fs::File::create(path).await.map_err(file_error)?;
    let mut hasher = StreamingHash::new();
    let mut buf = vec![0u8; FILE_CHUNK_SIZE];
    let mut remaining = len;
    while remaining > 0 {
        let chunk = remaining.min(buf.len() as u64) as usize;
        conn.wire.read_exact_into(&mut buf[..chunk]).await?;
        hasher.update(&buf[..chunk]);
        file.write_all(&buf[..chunk]).await.map_err(file_error)?;
        remaining -= chunk as u64;
    }
    file.flush().await.map_err(file_error)?;
    drop(file);

    if hasher.finish() != expected_hash {
        tracing::warn!("File '{}' failed its integrity check", source);
        if let Err(e) = tokio::fs::remove_file(path).await {
            tracing::warn!("Unable to remove '{}': {}", path.display(), e);
        }
        return Ok(false);
    }
    Ok(true)
}
