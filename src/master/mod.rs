//! Master Coordinator Module
//!
//! Drives a pool of rendering slaves from the process that owns the scene.
//!
//! ## Architecture Overview
//! 1. **Compilation**: Every scene API call is serialized once into a `CompiledCommand`
//!    and appended to the `CommandLog`. Parameters naming local files are resolved
//!    through the content-addressed `FileRegistry`.
//! 2. **Flush**: When the scene is complete (`luxWorldEnd`), the whole log is replayed
//!    to every connected slave that has not seen it yet. Files travel by hash, so a
//!    slave never receives the same bytes twice in one session.
//! 3. **Polling**: A single background task pulls film samples from every active slave
//!    once per polling interval and merges them into the local film.
//! 4. **Recovery**: Any transport failure only marks that slave inactive. Inactive
//!    slaves are retried before and after every roster-wide operation; a slave that
//!    rejects its old session gets a fresh one and a full replay.
//!
//! All roster mutation and all network I/O issued by the coordinator happen under one
//! mutex, so operations on different slaves are sequential.
//!
//! ## Submodules
//! - **`files`**: Path and hash indices over local files referenced by commands.
//! - **`commands`**: Compiled commands, the append-only log and its replay.
//! - **`coordinator`**: The roster owner exposing connect/flush/update operations.
//! - **`types`**: Per-slave session bookkeeping and status snapshots.

pub mod commands;
pub mod coordinator;
pub mod files;
pub mod types;
