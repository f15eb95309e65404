//! Render Server Module
//!
//! The slave side of the farm: a TCP listener that accepts one rendering session
//! at a time and applies the scene a master replays to it.
//!
//! ## Architecture Overview
//! 1. **Listeners**: One accept loop per address family (IPv4, IPv6). Every accepted
//!    connection runs on its own task and reads command names line by line.
//! 2. **Dispatch**: Each name is looked up in a `CommandRegistry` mapping literal
//!    command strings to async handlers. Blank lines are heartbeats.
//! 3. **Session**: `ServerConnect` moves the server from `Ready` to `Busy` and mints
//!    the session ID. Privileged commands must present it.
//! 4. **Teardown**: A handler error is a disconnect-with-reason. The connection task
//!    logs it once, aborts the render, deletes the session's received files and
//!    returns the server to `Ready`.
//!
//! ## Submodules
//! - **`types`**: Server states, session IDs and the session error type.
//! - **`handlers`**: The command registry and every command handler.
//! - **`transfer`**: File index negotiation and content-verified file reception.
//! - **`server`**: `RenderServer` lifecycle, accept loops and per-connection dispatch.

pub mod handlers;
pub mod server;
pub mod transfer;
pub mod types;

#[cfg(test)]
mod tests;
