//! C ABI entry points called by the interpreter.
//!
//! The interpreter identifies a thread by the index it was started with.
//! These functions look the thread up in the table installed with
//! [`install`] and forward to the matching `ThreadTable` callback.
//!
//! Errors cannot cross the boundary. They are logged; the before-script entry
//! returns null so the interpreter stops the thread. An interpreter fault
//! reported to the after-script entry aborts the process, since the
//! interpreter's memory can no longer be trusted.

use std::ptr;
use std::sync::{Arc, OnceLock};

use libc::{c_char, c_int, uintptr_t};

use crate::error::{Error, Result};
use crate::table::ThreadTable;

static THREAD_TABLE: OnceLock<Arc<ThreadTable>> = OnceLock::new();

/// Install the table the C entry points operate on. Can only happen once.
pub fn install(table: Arc<ThreadTable>) -> Result<()> {
    THREAD_TABLE.set(table).map_err(|_| Error::AlreadyInstalled)
}

/// The installed table.
pub fn installed() -> Result<&'static Arc<ThreadTable>> {
    THREAD_TABLE.get().ok_or(Error::NotInstalled)
}

#[unsafe(no_mangle)]
pub extern "C" fn tether_on_thread_startup(thread_index: uintptr_t) {
    if let Err(err) = installed().and_then(|table| table.on_thread_startup(thread_index)) {
        tracing::error!(thread = thread_index, "thread startup failed: {}", err);
    }
}

/// Returns the script to run, or null to stop the thread.
#[unsafe(no_mangle)]
pub extern "C" fn tether_before_script_execution(thread_index: uintptr_t) -> *const c_char {
    match installed().and_then(|table| table.before_script_execution(thread_index)) {
        Ok(Some(script)) => script.as_ptr().cast_const(),
        Ok(None) => ptr::null(),
        Err(err) => {
            tracing::error!(thread = thread_index, "cannot hand out a script: {}", err);
            ptr::null()
        }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn tether_after_script_execution(thread_index: uintptr_t, exit_status: c_int) {
    match installed().and_then(|table| table.after_script_execution(thread_index, exit_status)) {
        Ok(()) => {}
        Err(err) if err.is_fatal() => {
            tracing::error!(thread = thread_index, "{}", err);
            std::process::abort();
        }
        Err(err) => {
            tracing::error!(thread = thread_index, "after-script callback failed: {}", err);
        }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn tether_on_thread_shutdown(thread_index: uintptr_t) {
    if let Err(err) = installed().and_then(|table| table.on_thread_shutdown(thread_index)) {
        tracing::error!(thread = thread_index, "thread shutdown failed: {}", err);
    }
}
