//! Thread modes offered by the host and the counters they feed.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use clap::ValueEnum;
use serde::Serialize;
use tether_core::{Hooks, ScriptThread};

/// How a thread turns requests into scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// One script per request, resolved from the request path.
    Regular,
    /// A long-lived worker script that handles one request per run.
    Worker,
}

impl Mode {
    /// Build the hooks for one thread.
    pub fn hooks(self, worker_script: &str, stats: &Arc<Stats>) -> Hooks {
        match self {
            Mode::Regular => regular(Arc::clone(stats)),
            Mode::Worker => worker(worker_script.to_string(), Arc::clone(stats)),
        }
    }
}

/// Outcome counters shared by every thread.
#[derive(Debug)]
pub struct Stats {
    completed: AtomicUsize,
    failed: AtomicUsize,
    fatal: AtomicUsize,
    /// Requests finished per thread, in any outcome.
    served: Box<[AtomicUsize]>,
}

impl Stats {
    pub fn new(num_threads: usize) -> Self {
        Self {
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            fatal: AtomicUsize::new(0),
            served: (0..num_threads).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    /// Record a script that ran to completion.
    pub fn record(&self, thread: usize, exit_status: i32) {
        if exit_status == 0 {
            self.completed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        self.mark_served(thread);
    }

    /// Record an interpreter fault.
    pub fn record_fatal(&self, thread: usize) {
        self.fatal.fetch_add(1, Ordering::SeqCst);
        self.mark_served(thread);
    }

    fn mark_served(&self, thread: usize) {
        if let Some(served) = self.served.get(thread) {
            served.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn fatal(&self) -> usize {
        self.fatal.load(Ordering::SeqCst)
    }

    pub fn served(&self, thread: usize) -> usize {
        self.served
            .get(thread)
            .map_or(0, |served| served.load(Ordering::SeqCst))
    }
}

/// Regular mode: every request names its own script.
fn regular(stats: Arc<Stats>) -> Hooks {
    Hooks::new(|thread| match thread.recv_request() {
        Some(request) => {
            thread.set_script_name(request.script_filename.clone());
            thread.set_main_request(Some(request));
        }
        None => thread.set_script_name(""),
    })
    .after_script_execution(move |thread, exit_status| {
        stats.record(thread.index(), exit_status);
        thread.clear_requests();
    })
}

/// Worker mode: the same script handles every request, with backoff on
/// failures and a retirement once too many fail in a row.
fn worker(script: String, stats: Arc<Stats>) -> Hooks {
    Hooks::new(move |thread| {
        thread.backoff().wait();
        match thread.recv_request() {
            Some(request) => {
                thread.set_worker_request(Some(request));
                thread.set_script_name(script.clone());
            }
            None => thread.set_script_name(""),
        }
    })
    .on_startup(|thread| {
        tracing::debug!(thread = thread.index(), "worker booted");
    })
    .after_script_execution(move |thread, exit_status| {
        stats.record(thread.index(), exit_status);
        if exit_status == 0 {
            thread.backoff_mut().record_success();
        } else {
            note_worker_failure(thread, exit_status);
        }
        thread.clear_requests();
    })
    .on_shutdown(|thread| {
        tracing::debug!(
            thread = thread.index(),
            failures = thread.backoff().consecutive_failures(),
            "worker stopped"
        );
    })
}

fn note_worker_failure(thread: &mut ScriptThread, exit_status: i32) {
    let give_up = thread.backoff_mut().record_failure();
    tracing::warn!(
        thread = thread.index(),
        status = exit_status,
        failures = thread.backoff().consecutive_failures(),
        delay_ms = thread.backoff().delay().as_millis() as u64,
        "worker script failed"
    );
    if give_up {
        tracing::error!(thread = thread.index(), "too many consecutive failures, retiring worker");
        thread.handle().request_shutdown();
    }
}
