use crate::wire::protocol::{CMD_SET_NOISE_AWARE_MAP, CMD_SET_USER_SAMPLING_MAP};
use serde::Serialize;
use std::time::Instant;

/// Master-side view of one slave.
///
/// An inactive session is kept in the roster so the periodic retry can restore it;
/// only an explicit disconnect removes it.
#[derive(Debug, Clone)]
pub struct WorkerSession {
    pub host: String,
    pub port: u16,
    pub sid: String,
    pub active: bool,
    /// The full command log has been replayed to this slave.
    pub flushed: bool,
    pub last_contact: Instant,
    pub last_samples: Instant,
    pub samples_received: f64,
    pub samples_per_second: f64,
}

impl WorkerSession {
    pub fn new(host: &str, port: u16) -> Self {
        let now = Instant::now();
        Self {
            host: host.to_string(),
            port,
            sid: String::new(),
            active: false,
            flushed: false,
            last_contact: now,
            last_samples: now,
            samples_received: 0.0,
            samples_per_second: 0.0,
        }
    }

    pub fn same_server(&self, host: &str, port: u16) -> bool {
        self.port == port && self.host.eq_ignore_ascii_case(host)
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            host: self.host.clone(),
            port: self.port,
            sid: self.sid.clone(),
            active: self.active,
            secs_since_last_contact: self.last_contact.elapsed().as_secs_f64(),
            secs_since_last_samples: self.last_samples.elapsed().as_secs_f64(),
            samples_received: self.samples_received,
            samples_per_second: self.samples_per_second,
        }
    }
}

/// Point-in-time snapshot of one slave, as reported by `Coordinator::status`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub host: String,
    pub port: u16,
    pub sid: String,
    pub active: bool,
    pub secs_since_last_contact: f64,
    pub secs_since_last_samples: f64,
    pub samples_received: f64,
    pub samples_per_second: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapKind {
    NoiseAware,
    UserSampling,
}

impl MapKind {
    pub const ALL: [MapKind; 2] = [MapKind::NoiseAware, MapKind::UserSampling];

    pub fn command(self) -> &'static str {
        match self {
            MapKind::NoiseAware => CMD_SET_NOISE_AWARE_MAP,
            MapKind::UserSampling => CMD_SET_USER_SAMPLING_MAP,
        }
    }
}

/// Latest map pushed of each kind, re-sent to slaves after a flush.
#[derive(Debug, Clone, Default)]
pub struct MapCache {
    noise_aware: Option<Vec<f32>>,
    user_sampling: Option<Vec<f32>>,
}

impl MapCache {
    pub fn get(&self, kind: MapKind) -> Option<&[f32]> {
        match kind {
            MapKind::NoiseAware => self.noise_aware.as_deref(),
            MapKind::UserSampling => self.user_sampling.as_deref(),
        }
    }

    pub fn set(&mut self, kind: MapKind, map: Vec<f32>) {
        match kind {
            MapKind::NoiseAware => self.noise_aware = Some(map),
            MapKind::UserSampling => self.user_sampling = Some(map),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectStatus {
    /// Transport failure; the slave may come back later.
    Error,
    /// The slave answered but does not know this session.
    Rejected,
    Success,
}
