//! Funcgate - dev server integration for a local serverless functions runtime
//!
//! This library lets a frontend dev server serve function routes next to its own
//! assets:
//! - Spawns the functions runtime as a child process with a message channel
//! - Waits for its readiness message (bound address) with a start timeout
//! - Forwards requests whose path matches any configured regex to the runtime
//! - Asks connected clients for a full reload whenever the runtime restarts
//! - Optionally relays the runtime's output with escape codes removed

pub mod ansi;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod host;
pub mod ipc;
pub mod launcher;
mod lines;
pub mod logs;
pub mod plugin;
pub mod pool;
pub mod routes;
