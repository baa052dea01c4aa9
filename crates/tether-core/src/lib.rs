//! Lifecycle coordinator for threads that hand off to an embedded script
//! interpreter.
//!
//! This crate provides:
//! - A per-thread state machine with parking waits
//! - A pinning arena for memory exposed to the interpreter
//! - Thread records with swappable lifecycle hooks (modes)
//! - The four boundary callbacks, as Rust methods and as C ABI exports
//! - Failure backoff and table configuration

pub mod config;
pub mod error;
pub mod ffi;
pub mod request;
pub mod table;
pub mod thread;

pub use config::{BackoffConfig, TableConfig};
pub use error::{Error, Result};
pub use request::{Handoff, ScriptRequest};
pub use table::ThreadTable;
pub use thread::{
    ExponentialBackoff, Hooks, PinArena, ScriptThread, StateHandler, ThreadHandle, ThreadState,
};
