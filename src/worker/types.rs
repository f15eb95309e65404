use crate::wire::error::WireError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerState {
    Unstarted,
    Ready,
    Busy,
    Stopped,
}

/// Random token identifying the single active session of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw.trim()).ok().map(Self)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a connection ended its session. Handled once by the connection task.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("i/o error on '{path}': {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What the connection loop does after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// State shared by every connection of one server.
#[derive(Debug)]
pub(crate) struct SessionSlot {
    pub state: ServerState,
    pub sid: Option<SessionId>,
    /// Every file written for the current session, deleted on cleanup.
    pub temp_files: Vec<PathBuf>,
    /// Content hash to local path of files fully received in this session.
    pub received: HashMap<String, PathBuf>,
}

impl SessionSlot {
    pub fn new() -> Self {
        Self {
            state: ServerState::Unstarted,
            sid: None,
            temp_files: Vec::new(),
            received: HashMap::new(),
        }
    }
}
