//! Drives the C ABI exports the way the interpreter would.
//!
//! The table is process-global, so every test shares one installation and
//! uses its own thread index.

use std::ffi::CStr;
use std::sync::{Arc, OnceLock};

use tether_core::ffi::{
    self, tether_after_script_execution, tether_before_script_execution,
    tether_on_thread_shutdown, tether_on_thread_startup,
};
use tether_core::{Error, Hooks, ThreadState, ThreadTable};

fn table() -> &'static Arc<ThreadTable> {
    static INSTALL: OnceLock<()> = OnceLock::new();
    INSTALL.get_or_init(|| {
        ffi::install(Arc::new(ThreadTable::with_threads(4).unwrap())).unwrap();
    });
    ffi::installed().unwrap()
}

#[test]
fn test_second_install_is_rejected() {
    let _ = table();
    let again = ffi::install(Arc::new(ThreadTable::with_threads(1).unwrap()));
    assert!(matches!(again, Err(Error::AlreadyInstalled)));
}

#[test]
fn test_exports_run_a_full_cycle() {
    let table = table();
    let handle = table.handle(0).unwrap();

    tether_on_thread_startup(0);
    assert_eq!(handle.state(), ThreadState::Inactive);

    handle.set_active(Hooks::new(|thread| thread.set_script_name("/index.php")));
    let script = tether_before_script_execution(0);
    assert!(!script.is_null());
    assert_eq!(unsafe { CStr::from_ptr(script) }.to_str().unwrap(), "/index.php");

    tether_after_script_execution(0, 0);
    assert_eq!(table.with_thread(0, |t| t.pinned_count()).unwrap(), 0);

    handle.request_shutdown();
    assert!(tether_before_script_execution(0).is_null());

    tether_on_thread_shutdown(0);
    assert_eq!(handle.state(), ThreadState::Done);
}

#[test]
fn test_script_failure_is_not_fatal() {
    let table = table();
    let handle = table.handle(1).unwrap();
    handle.set_active(Hooks::new(|thread| thread.set_script_name("/fails.php")));

    assert!(!tether_before_script_execution(1).is_null());
    // Positive statuses are script-level failures; only negative ones abort.
    tether_after_script_execution(1, 255);
    assert!(handle.is_ready());
}

#[test]
fn test_unknown_index_stops_the_thread() {
    let _ = table();
    assert!(tether_before_script_execution(99).is_null());
    // Logged, not propagated.
    tether_on_thread_startup(99);
    tether_after_script_execution(99, 0);
    tether_on_thread_shutdown(99);
}
