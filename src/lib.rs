//! Distributed Render Farm Library
//!
//! Splits one rendering job across a master process and a pool of slave processes
//! over TCP. The master replays the scene description to every slave and merges the
//! samples they compute into its own film.
//!
//! ## Architecture Modules
//! - **`wire`**: The shared line-oriented protocol with length-prefixed, gzip-compressed
//!   payloads and content hashing.
//! - **`master`**: The coordinator owning the slave roster, the command log and the
//!   content-addressed file registry, plus the periodic film polling task.
//! - **`worker`**: The slave listener, its `Ready`/`Busy` session state machine and the
//!   command handlers that rebuild the scene locally.
//! - **`scene`**: Parameter sets, the sample film and a recording render target.
//! - **`context`**: The explicit render context handed to both roles.
//! - **`logging`**: Subscriber setup and the capture layer feeding `luxGetLog`.
//! - **`config`**: Serde-backed settings for both roles.

pub mod config;
pub mod context;
pub mod logging;
pub mod master;
pub mod scene;
pub mod wire;
pub mod worker;
