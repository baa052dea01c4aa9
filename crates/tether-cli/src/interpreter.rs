//! Simulated interpreter.
//!
//! Each native thread calls the boundary callbacks in the order a real
//! embedded interpreter would. "Running" a script means reading the pinned
//! script name and deriving an exit status from the request bound to the
//! thread.

use std::ffi::{CStr, c_char};
use std::io;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};

use tether_core::ThreadTable;

use crate::modes::Stats;

/// Exit status the simulated interpreter reports for a request path.
///
/// Paths containing `crash` fault the interpreter, paths containing `fail`
/// end with a script error.
pub fn exit_status_for(path: &str) -> i32 {
    if path.contains("crash") {
        -1
    } else if path.contains("fail") {
        1
    } else {
        0
    }
}

/// Spawn the native thread for `index`.
///
/// `started` receives the index once the startup callback returned.
pub fn spawn(
    table: Arc<ThreadTable>,
    index: usize,
    stats: Arc<Stats>,
    started: Sender<usize>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("tether-{index}"))
        .spawn(move || run(&table, index, &stats, &started))
}

fn run(table: &ThreadTable, index: usize, stats: &Stats, started: &Sender<usize>) {
    if let Err(err) = table.on_thread_startup(index) {
        tracing::error!(thread = index, "startup failed: {}", err);
        return;
    }
    let _ = started.send(index);

    loop {
        let script = match table.before_script_execution(index) {
            Ok(Some(script)) => script,
            Ok(None) => break,
            Err(err) => {
                tracing::error!(thread = index, "no script to run: {}", err);
                break;
            }
        };

        let exit_status = execute_script(table, index, script);

        match table.after_script_execution(index, exit_status) {
            Ok(()) => {}
            Err(err) if err.is_fatal() => {
                tracing::error!(thread = index, "{}, retiring thread", err);
                stats.record_fatal(index);
                break;
            }
            Err(err) => {
                tracing::error!(thread = index, "after-script callback failed: {}", err);
                break;
            }
        }
    }

    if let Err(err) = table.on_thread_shutdown(index) {
        tracing::error!(thread = index, "shutdown failed: {}", err);
    }
}

fn execute_script(table: &ThreadTable, index: usize, script: NonNull<c_char>) -> i32 {
    // Pinned until the after-script callback.
    let script = unsafe { CStr::from_ptr(script.as_ptr()) }.to_string_lossy();
    let path = table
        .with_thread(index, |thread| {
            thread.active_request().map(|request| request.path.clone())
        })
        .ok()
        .flatten();

    let exit_status = path.as_deref().map_or(0, exit_status_for);
    tracing::debug!(
        thread = index,
        script = %script,
        path = path.as_deref().unwrap_or("-"),
        status = exit_status,
        "script executed"
    );
    exit_status
}
