//! Scene Module
//!
//! The scene-side collaborators the farm transports data for: typed parameter sets,
//! the sample accumulation film and a command recorder usable as the default
//! render target on both master and slaves.
//!
//! ## Submodules
//! - **`params`**: Ordered, typed parameter sets attached to scene commands.
//! - **`film`**: Per-pixel sample buffer with compressed snapshots and `.flm` persistence.
//! - **`recorder`**: `RenderTarget` implementation that records every applied command.

pub mod film;
pub mod params;
pub mod recorder;
