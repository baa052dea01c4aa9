//! Run command implementation for Tether CLI.
//!
//! Builds a thread table, brings up one simulated interpreter per record,
//! assigns the chosen mode and serves a batch of requests.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tether_core::{ScriptRequest, TableConfig, ThreadHandle, ThreadTable};

use crate::colors;
use crate::interpreter;
use crate::modes::{Mode, Stats};

/// Poll interval while waiting on full buffers or draining.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Parsed `run` arguments.
pub struct RunOptions {
    pub config: TableConfig,
    pub requests: usize,
    pub mode: Mode,
    pub worker_script: String,
    pub paths: Vec<String>,
    pub json: bool,
}

/// Result of a run.
#[derive(Debug, Serialize)]
pub struct Summary {
    pub mode: Mode,
    pub threads: usize,
    pub requests: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    pub fatal: usize,
    /// Dispatched but never finished, because their thread retired first.
    pub unserved: usize,
    /// Never dispatched, because every thread had retired.
    pub rejected: usize,
    pub elapsed_ms: u64,
}

/// Execute a batch run.
pub fn execute(options: &RunOptions) -> anyhow::Result<()> {
    anyhow::ensure!(!options.paths.is_empty(), "at least one request path is required");
    let start = Instant::now();
    let table = Arc::new(ThreadTable::new(&options.config)?);
    let stats = Arc::new(Stats::new(table.len()));

    let (started_tx, started_rx) = mpsc::channel();
    let mut natives = Vec::with_capacity(table.len());
    for index in 0..table.len() {
        natives.push(interpreter::spawn(
            Arc::clone(&table),
            index,
            Arc::clone(&stats),
            started_tx.clone(),
        )?);
    }
    drop(started_tx);
    // Activating before the startup callback would be undone by it.
    let started = started_rx.iter().count();
    tracing::debug!(started, "native threads up");

    let handles = table.handles();
    for handle in &handles {
        handle.set_active(options.mode.hooks(&options.worker_script, &stats));
    }

    let batch = dispatch(&handles, options);
    drain(&handles, &batch.sent, &stats);

    table.request_shutdown_all();
    for native in natives {
        if native.join().is_err() {
            anyhow::bail!("an interpreter thread panicked");
        }
    }

    let accounted = stats.completed() + stats.failed() + stats.fatal();
    let dispatched: usize = batch.sent.iter().sum();
    let summary = Summary {
        mode: options.mode,
        threads: table.len(),
        requests: options.requests,
        dispatched,
        completed: stats.completed(),
        failed: stats.failed(),
        fatal: stats.fatal(),
        unserved: dispatched.saturating_sub(accounted),
        rejected: batch.rejected,
        elapsed_ms: start.elapsed().as_millis() as u64,
    };

    if options.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    if summary.fatal > 0 {
        anyhow::bail!("{} interpreter fault(s) during the run", summary.fatal);
    }
    Ok(())
}

struct Batch {
    /// Requests handed to each thread.
    sent: Vec<usize>,
    rejected: usize,
}

/// Hand out requests round-robin, waiting while every buffer is full.
fn dispatch(handles: &[ThreadHandle], options: &RunOptions) -> Batch {
    let mut batch = Batch {
        sent: vec![0; handles.len()],
        rejected: 0,
    };
    let mut next = 0;

    'requests: for n in 0..options.requests {
        let path = &options.paths[n % options.paths.len()];
        let mut request = Arc::new(ScriptRequest::new("GET", path.as_str()));
        loop {
            if handles.iter().all(|handle| handle.state().is_stopping()) {
                batch.rejected = options.requests - n;
                tracing::warn!(rejected = batch.rejected, "every thread retired");
                break 'requests;
            }
            for _ in 0..handles.len() {
                let handle = &handles[next % handles.len()];
                next += 1;
                match handle.try_dispatch(request) {
                    Ok(()) => {
                        batch.sent[handle.index()] += 1;
                        continue 'requests;
                    }
                    Err(returned) => request = returned,
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
    batch
}

/// Wait until each thread finished what it was sent, or retired.
fn drain(handles: &[ThreadHandle], sent: &[usize], stats: &Stats) {
    while !handles.iter().all(|handle| {
        stats.served(handle.index()) >= sent[handle.index()] || handle.state().is_stopping()
    }) {
        thread::sleep(POLL_INTERVAL);
    }
}

fn print_summary(summary: &Summary) {
    println!(
        "{}Served{} {} of {} requests on {} {:?} threads in {:.2}s",
        colors::BOLD,
        colors::RESET,
        summary.completed + summary.failed + summary.fatal,
        summary.requests,
        summary.threads,
        summary.mode,
        summary.elapsed_ms as f64 / 1000.0
    );
    println!("  {}completed{} {}", colors::GREEN, colors::RESET, summary.completed);
    if summary.failed > 0 {
        println!("  {}failed{}    {}", colors::YELLOW, colors::RESET, summary.failed);
    }
    if summary.fatal > 0 {
        println!("  {}fatal{}     {}", colors::RED, colors::RESET, summary.fatal);
    }
    if summary.unserved + summary.rejected > 0 {
        println!(
            "  {}dropped{}   {} ({} unserved, {} rejected)",
            colors::YELLOW,
            colors::RESET,
            summary.unserved + summary.rejected,
            summary.unserved,
            summary.rejected
        );
    }
}
