//! Render Context
//!
//! Explicit handle to the scene a coordinator or listener works on, passed in at
//! construction instead of living in process-wide state. It bundles:
//! - the `RenderTarget` commands are applied to and film samples are merged into,
//! - the log filter level used when re-emitting slave diagnostics,
//! - the buffer holding this process's own diagnostics for `luxGetLog`.

use crate::logging::{LogBuffer, Severity};
use crate::wire::commands::SceneCommand;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// The scene/film collaborator the farm drives.
///
/// Errors returned by `apply` are resource problems (missing camera, bad
/// parameters); callers log them and keep the connection alive.
pub trait RenderTarget: Send {
    /// Applies one decoded scene command.
    fn apply(&mut self, command: SceneCommand) -> anyhow::Result<()>;

    /// True once the scene is complete and samples are being produced.
    fn is_rendering(&self) -> bool;

    /// Compressed snapshot of the accumulated samples.
    fn film_snapshot(&self) -> anyhow::Result<Vec<u8>>;

    /// Drops the accumulated samples once a snapshot has been delivered.
    fn reset_film(&mut self);

    /// Merges a compressed snapshot produced by `film_snapshot` on another node.
    /// Returns the number of samples merged.
    fn merge_film(&mut self, compressed: &[u8]) -> anyhow::Result<f64>;

    /// Persists a resumable `.flm` snapshot without resetting the accumulation.
    fn write_resume_film(&mut self, path: &Path) -> anyhow::Result<PathBuf>;

    fn set_noise_aware_map(&mut self, map: Vec<f32>) -> anyhow::Result<()>;

    fn set_user_sampling_map(&mut self, map: Vec<f32>) -> anyhow::Result<()>;

    /// Stops rendering and discards the scene.
    fn abort(&mut self);
}

pub type SharedTarget = Arc<Mutex<dyn RenderTarget>>;

#[derive(Clone)]
pub struct RenderContext {
    target: SharedTarget,
    log_filter: Severity,
    log_buffer: LogBuffer,
}

impl RenderContext {
    pub fn new(target: SharedTarget) -> Self {
        Self {
            target,
            log_filter: Severity::Info,
            log_buffer: LogBuffer::default(),
        }
    }

    pub fn with_log_filter(mut self, filter: Severity) -> Self {
        self.log_filter = filter;
        self
    }

    pub fn with_log_buffer(mut self, buffer: LogBuffer) -> Self {
        self.log_buffer = buffer;
        self
    }

    pub fn target(&self) -> &SharedTarget {
        &self.target
    }

    pub fn log_filter(&self) -> Severity {
        self.log_filter
    }

    pub fn log_buffer(&self) -> &LogBuffer {
        &self.log_buffer
    }
}
