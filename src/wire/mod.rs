//! Wire Protocol Module
//!
//! The shared transport layer spoken by the master (`master`) and the rendering
//! slaves (`worker`). Every exchange is a sequence of newline-terminated ASCII lines,
//! interleaved with length-prefixed binary payloads where a command defines them.
//!
//! ## Framing
//! - **Lines**: command names, session IDs, plain command fields and every response.
//! - **Parameter blobs**: `u32` little-endian size, gzip-compressed `bincode` bytes, `\n`.
//! - **Streams**: film samples, logs and float maps are written until the sender closes
//!   its half of the connection.
//!
//! ## Submodules
//! - **`codec`**: Buffered line/blob reader-writer over any async byte stream, plus gzip helpers.
//! - **`commands`**: The replayable scene command vocabulary and its field encoding.
//! - **`error`**: Transport and protocol error taxonomy.
//! - **`hash`**: Content addressing and challenge/response digests.
//! - **`protocol`**: Literal command names and response lines of the session protocol.

pub mod codec;
pub mod commands;
pub mod error;
pub mod hash;
pub mod protocol;
