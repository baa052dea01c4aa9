//! Error types for tether-core.

use thiserror::Error;

/// Result type for tether-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tether-core.
#[derive(Debug, Error)]
pub enum Error {
    /// The interpreter reported a negative exit status.
    ///
    /// This means the interpreter itself failed, not the script. The thread
    /// cannot continue and the host should treat it as crashed.
    #[error("interpreter fault on thread {thread}: script execution returned status {status}")]
    ScriptExecution { thread: usize, status: i32 },

    /// No thread record exists for the given index.
    #[error("unknown thread index {0}")]
    UnknownThread(usize),

    /// A script was requested before any mode was assigned to the thread.
    #[error("thread {0} has no mode assigned")]
    NoModeAssigned(usize),

    /// The owner-side lock of a thread was poisoned by a panicking hook.
    #[error("thread {0} lock poisoned (hook panicked)")]
    Poisoned(usize),

    /// The owner side is in use by a boundary callback, possibly one whose
    /// hook is waiting for a request.
    #[error("thread {0} is inside a boundary callback")]
    Busy(usize),

    /// A request could not be handed off to a thread.
    #[error("cannot dispatch to thread {thread}: {reason}")]
    Dispatch { thread: usize, reason: String },

    /// A thread table is already installed for the C ABI.
    #[error("a thread table is already installed")]
    AlreadyInstalled,

    /// No thread table is installed for the C ABI.
    #[error("no thread table installed")]
    NotInstalled,

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error signals a broken interpreter rather than a
    /// recoverable condition.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ScriptExecution { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_script_execution_is_fatal() {
        assert!(Error::ScriptExecution { thread: 0, status: -1 }.is_fatal());
        assert!(!Error::UnknownThread(3).is_fatal());
        assert!(!Error::NoModeAssigned(0).is_fatal());
    }

    #[test]
    fn test_display_includes_status() {
        let err = Error::ScriptExecution { thread: 2, status: -1 };
        let msg = err.to_string();
        assert!(msg.contains("thread 2"));
        assert!(msg.contains("-1"));
    }
}
