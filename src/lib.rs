//! labvm - a simulated per-student lab machine.
//!
//! Each session owns an in-memory file system, a sandbox policy with an
//! audit log, a small shell interpreter, and an exercise tracker. Sessions
//! are snapshotted to a key-value store and served over HTTP.

pub mod config;
pub mod content;
pub mod error;
pub mod evaluator;
pub mod events;
pub mod exercise;
pub mod http_server;
pub mod persistence;
pub mod sandbox;
pub mod session;
pub mod state;
pub mod terminal;
pub mod vfs;
