//! Requests handed to script threads.
//!
//! Parsing and routing happen elsewhere; a `ScriptRequest` only carries what
//! a mode needs to pick a script and bind the request to a thread.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unit of work bound to a thread for one or more script executions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptRequest {
    /// Unique request identifier.
    pub id: Uuid,
    /// Request method, e.g. `GET`.
    pub method: String,
    /// Request path, e.g. `/index.php?page=2`.
    pub path: String,
    /// Script resolved for this request.
    pub script_filename: String,
    /// Request headers in arrival order.
    pub headers: Vec<(String, String)>,
}

impl ScriptRequest {
    /// Create a request whose script is the path without its query string.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        let path = path.into();
        let script_filename = path.split('?').next().unwrap_or_default().to_string();
        Self {
            id: Uuid::new_v4(),
            method: method.into(),
            path,
            script_filename,
            headers: Vec::new(),
        }
    }

    /// Override the resolved script.
    pub fn with_script(mut self, script_filename: impl Into<String>) -> Self {
        self.script_filename = script_filename.into();
        self
    }

    /// Append a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First header with the given name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Message on a thread's request channel.
#[derive(Debug, Clone)]
pub enum Handoff {
    /// Work for the thread.
    Request(Arc<ScriptRequest>),
    /// Stop waiting for work; the thread is shutting down.
    Stop,
}
