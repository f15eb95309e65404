use super::error::{WireError, WireResult};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};

/// gzip level for parameter blobs.
pub const PARAMS_COMPRESSION: u32 = 9;
/// gzip level for noise-aware and user sampling maps.
pub const MAP_COMPRESSION: u32 = 4;
/// Longest line accepted before the peer is considered hostile.
pub const MAX_LINE_LEN: u64 = 64 * 1024;
/// Largest size-prefixed blob a peer may announce.
pub const MAX_BLOB_LEN: u32 = 64 * 1024 * 1024;
/// Largest payload read up to end of stream (film snapshots, maps, logs).
pub const MAX_PAYLOAD_LEN: u64 = 256 * 1024 * 1024;
/// Largest output `decompress` produces.
pub const MAX_DECOMPRESSED_LEN: u64 = 1024 * 1024 * 1024;

/// Buffered protocol endpoint over a single byte stream.
///
/// Writes are buffered until a read (or an explicit `flush`) so that a request and
/// its fields leave in as few segments as possible.
pub struct Wire<S> {
    stream: BufStream<S>,
}

impl<S> Wire<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufStream::new(stream),
        }
    }

    pub async fn write_line(&mut self, line: &str) -> WireResult<()> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\n").await?;
        Ok(())
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) -> WireResult<()> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    pub async fn write_u32_le(&mut self, value: u32) -> WireResult<()> {
        self.stream.write_all(&value.to_le_bytes()).await?;
        Ok(())
    }

    /// Size-prefixed binary payload followed by a line terminator.
    pub async fn write_blob(&mut self, blob: &[u8]) -> WireResult<()> {
        let size = u32::try_from(blob.len())
            .map_err(|_| WireError::protocol(format!("blob of {} bytes is too large", blob.len())))?;
        self.write_u32_le(size).await?;
        self.write_raw(blob).await?;
        self.write_raw(b"\n").await
    }

    pub async fn flush(&mut self) -> WireResult<()> {
        self.stream.flush().await?;
        Ok(())
    }

    /// Flushes pending output and closes the write half.
    pub async fn shutdown(&mut self) -> WireResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Next line without its terminator, `None` on a clean end of stream.
    pub async fn next_line(&mut self) -> WireResult<Option<String>> {
        self.stream.flush().await?;

        let mut buf = Vec::new();
        let read = (&mut self.stream)
            .take(MAX_LINE_LEN)
            .read_until(b'\n', &mut buf)
            .await?;
        if read == 0 {
            return Ok(None);
        }

        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        } else if read as u64 == MAX_LINE_LEN {
            return Err(WireError::protocol("line exceeds maximum length"));
        }

        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }

    pub async fn read_line(&mut self) -> WireResult<String> {
        self.next_line().await?.ok_or(WireError::UnexpectedEof)
    }

    pub async fn expect_line(&mut self, expected: &str) -> WireResult<()> {
        let got = self.read_line().await?;
        if got != expected {
            return Err(WireError::unexpected(expected, &got));
        }
        Ok(())
    }

    pub async fn read_u32_le(&mut self) -> WireResult<u32> {
        let mut bytes = [0u8; 4];
        self.read_exact_into(&mut bytes).await?;
        Ok(u32::from_le_bytes(bytes))
    }

    pub async fn read_exact_into(&mut self, buf: &mut [u8]) -> WireResult<()> {
        self.stream.flush().await?;
        match self.stream.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(WireError::UnexpectedEof),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads exactly `len` bytes. The buffer grows with what actually arrives.
    pub async fn read_exact_bytes(&mut self, len: usize) -> WireResult<Vec<u8>> {
        self.stream.flush().await?;
        let mut buf = Vec::new();
        let read = (&mut self.stream)
            .take(len as u64)
            .read_to_end(&mut buf)
            .await?;
        if read < len {
            return Err(WireError::UnexpectedEof);
        }
        Ok(buf)
    }

    /// Counterpart of `write_blob`.
    pub async fn read_blob(&mut self) -> WireResult<Vec<u8>> {
        let size = self.read_u32_le().await?;
        if size > MAX_BLOB_LEN {
            return Err(WireError::protocol(format!(
                "blob of {} bytes exceeds the {} byte limit",
                size, MAX_BLOB_LEN
            )));
        }
        let blob = self.read_exact_bytes(size as usize).await?;
        let trailer = self.read_line().await?;
        if !trailer.is_empty() {
            return Err(WireError::protocol(format!(
                "unexpected data after parameter blob: '{}'",
                trailer
            )));
        }
        Ok(blob)
    }

    /// Everything the peer sends until it closes its write half, at most
    /// `MAX_PAYLOAD_LEN` bytes.
    pub async fn read_to_end(&mut self) -> WireResult<Vec<u8>> {
        self.stream.flush().await?;
        let mut buf = Vec::new();
        (&mut self.stream)
            .take(MAX_PAYLOAD_LEN + 1)
            .read_to_end(&mut buf)
            .await?;
        if buf.len() as u64 > MAX_PAYLOAD_LEN {
            return Err(WireError::protocol(format!(
                "payload exceeds the {} byte limit",
                MAX_PAYLOAD_LEN
            )));
        }
        Ok(buf)
    }
}

pub fn compress(data: &[u8], level: u32) -> WireResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level));
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn decompress(data: &[u8]) -> WireResult<Vec<u8>> {
    if data.is_empty() {
        return Err(WireError::protocol("empty compressed stream"));
    }
    let mut out = Vec::new();
    GzDecoder::new(data)
        .take(MAX_DECOMPRESSED_LEN + 1)
        .read_to_end(&mut out)?;
    if out.len() as u64 > MAX_DECOMPRESSED_LEN {
        return Err(WireError::protocol("compressed stream expands past the size limit"));
    }
    Ok(out)
}

pub fn encode_floats(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_floats(bytes: &[u8], count: usize) -> WireResult<Vec<f32>> {
    if bytes.len() != count * 4 {
        return Err(WireError::protocol(format!(
            "expected {} floats, got {} bytes",
            count,
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
