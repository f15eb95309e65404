use super::protocol::FILE_CHUNK_SIZE;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Hex digest of a byte buffer. Identical content always yields the same value.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn file_hash(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = StreamingHash::new();
    let mut buf = vec![0u8; FILE_CHUNK_SIZE];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finish())
}

/// Answer to a reset challenge: `hash(salt + password + salt)`.
pub fn challenge_response(salt: &str, password: &str) -> String {
    content_hash(format!("{salt}{password}{salt}").as_bytes())
}

/// Content hashes are lowercase hex; anything else is refused before touching disk.
pub fn is_valid_hash(candidate: &str) -> bool {
    candidate.len() == 64 && candidate.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Incremental variant used while a file is received in chunks.
#[derive(Default)]
pub struct StreamingHash {
    hasher: Sha256,
}

impl StreamingHash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}
