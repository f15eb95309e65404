//! File Registry
//!
//! Content-addressed index of the local files referenced by compiled commands.
//! One entry per distinct path; two paths with identical bytes share a hash, which
//! is what slaves request, so identical content crosses the wire once.

use crate::wire::codec::Wire;
use crate::wire::error::{WireError, WireResult};
use crate::wire::hash::file_hash;
use crate::wire::protocol::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    local_path: PathBuf,
    content_hash: String,
}

impl FileEntry {
    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }
}

#[derive(Debug, Default)]
pub struct FileRegistry {
    entries: Vec<FileEntry>,
    by_path: HashMap<PathBuf, usize>,
    by_hash: HashMap<String, usize>,
    files_sent: u64,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry for `path`, hashing the file the first time it is seen.
    ///
    /// # Errors
    /// Fails when the file cannot be read; the caller must drop the command.
    pub fn add(&mut self, path: &Path) -> std::io::Result<FileEntry> {
        if let Some(entry) = self.lookup(path) {
            return Ok(entry.clone());
        }

        let entry = FileEntry {
            local_path: path.to_path_buf(),
            content_hash: file_hash(path)?,
        };
        let index = self.entries.len();
        self.by_path.insert(entry.local_path.clone(), index);
        self.by_hash.entry(entry.content_hash.clone()).or_insert(index);
        self.entries.push(entry.clone());

        tracing::debug!(
            "Registered file '{}' as {}",
            path.display(),
            entry.content_hash
        );
        Ok(entry)
    }

    pub fn lookup(&self, path: &Path) -> Option<&FileEntry> {
        self.by_path.get(path).map(|&i| &self.entries[i])
    }

    pub fn lookup_by_hash(&self, hash: &str) -> Option<&FileEntry> {
        self.by_hash.get(hash).map(|&i| &self.entries[i])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// How many file bodies have been streamed to slaves, retransmits included.
    pub fn files_sent(&self) -> u64 {
        self.files_sent
    }

    /// Serves the slave's file requests, from `BEGIN FILES` to `END FILES OK`.
    pub async fn send_requested<S>(&mut self, wire: &mut Wire<S>) -> WireResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        wire.write_line(BEGIN_FILES).await?;
        wire.expect_line(BEGIN_FILES_OK).await?;

        loop {
            let hash = wire.read_line().await?;
            if hash == END_FILES {
                break;
            }

            let entry = self
                .lookup_by_hash(&hash)
                .cloned()
                .ok_or_else(|| WireError::protocol(format!("slave requested unknown file {}", hash)))?;

            self.send_file(wire, &entry).await?;
            match wire.read_line().await?.as_str() {
                FILE_OK => {}
                RESEND_FILE => {
                    tracing::warn!(
                        "Resending file '{}' ({})",
                        entry.local_path.display(),
                        entry.content_hash
                    );
                    self.send_file(wire, &entry).await?;
                    wire.expect_line(FILE_OK).await?;
                }
                other => return Err(WireError::unexpected(FILE_OK, other)),
            }
        }

        wire.write_line(END_FILES_OK).await?;
        wire.flush().await
    }

    async fn send_file<S>(&mut self, wire: &mut Wire<S>, entry: &FileEntry) -> WireResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let filename = entry.local_path.to_string_lossy();
        let mut file = match tokio::fs::File::open(&entry.local_path).await {
            Ok(file) => file,
            Err(e) => {
                // An empty body tells the slave the file is gone; it fails the hash check.
                tracing::error!("Error reading file '{}': {}", filename, e);
                wire.write_line("").await?;
                wire.write_line("0").await?;
                return Ok(());
            }
        };
        let len = file.metadata().await?.len();

        tracing::info!("Sending file '{}' ({} bytes)", filename, len);
        wire.write_line(&filename).await?;
        wire.write_line(&len.to_string()).await?;

        let mut buf = vec![0u8; FILE_CHUNK_SIZE];
        let mut remaining = len;
        while remaining > 0 {
            let read = file.read(&mut buf).await?;
            if read == 0 {
                return Err(WireError::protocol(format!(
                    "file '{}' shrank while being sent",
                    filename
                )));
            }
            let read = read.min(remaining as usize);
            wire.write_raw(&buf[..read]).await?;
            remaining -= read as u64;
        }
        wire.flush().await?;

        self.files_sent += 1;
        Ok(())
    }
}
