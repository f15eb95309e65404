//! Session Protocol Definitions
//!
//! Literal command names and response lines exchanged between master and slave.
//! Scene commands (`luxShape`, `luxCamera`, ...) live in `commands`.

// --- Version ---

pub const PROTOCOL_VERSION: u32 = 1011;
/// Marker the master looks for before comparing version strings.
pub const PROTOCOL_MARKER: &str = "protocol";
pub const SERVER_VERSION_STRING: &str =
    concat!(env!("CARGO_PKG_VERSION"), " (protocol: 1011)");

// --- Session commands ---

pub const CMD_SERVER_CONNECT: &str = "ServerConnect";
pub const CMD_SERVER_RECONNECT: &str = "ServerReconnect";
pub const CMD_SERVER_RESET: &str = "ServerReset";
pub const CMD_SERVER_DISCONNECT: &str = "ServerDisconnect";
pub const CMD_GET_FILM: &str = "luxGetFilm";
pub const CMD_GET_LOG: &str = "luxGetLog";
pub const CMD_SET_NOISE_AWARE_MAP: &str = "luxSetNoiseAwareMap";
pub const CMD_SET_USER_SAMPLING_MAP: &str = "luxSetUserSamplingMap";

// --- Responses ---

pub const RESP_OK: &str = "OK";
pub const RESP_BUSY: &str = "BUSY";
pub const RESP_CONNECTED: &str = "CONNECTED";
pub const RESP_DENIED: &str = "DENIED";
pub const RESP_IDLE: &str = "IDLE";
pub const RESP_CHALLENGE: &str = "CHALLENGE";
pub const RESP_RESET: &str = "RESET";

// --- File index / transfer ---

pub const FILE_INDEX_EMPTY: &str = "FILE INDEX EMPTY";
pub const FILE_INDEX_INVALID: &str = "FILE INDEX INVALID";
pub const BEGIN_FILE_INDEX: &str = "BEGIN FILE INDEX";
pub const BEGIN_FILE_INDEX_OK: &str = "BEGIN FILE INDEX OK";
pub const END_FILE_INDEX: &str = "END FILE INDEX";
pub const END_FILE_INDEX_OK: &str = "END FILE INDEX OK";
pub const BEGIN_FILES: &str = "BEGIN FILES";
pub const BEGIN_FILES_OK: &str = "BEGIN FILES OK";
pub const END_FILES: &str = "END FILES";
pub const END_FILES_OK: &str = "END FILES OK";
pub const FILE_OK: &str = "FILE OK";
pub const RESEND_FILE: &str = "RESEND FILE";

/// Chunk size used when streaming files in either direction.
pub const FILE_CHUNK_SIZE: usize = 1024 * 1024;
