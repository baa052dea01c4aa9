//! Script thread records.
//!
//! A record is split along the line of who may touch it:
//!
//! ```text
//! ThreadHandle (any thread, cloneable)
//!     │
//!     ├── StateHandler        authoritative lifecycle state
//!     ├── pending mode        hooks waiting to be installed by the owner
//!     └── request sender      Handoff::Request / Handoff::Stop
//!
//! ScriptThread (owning thread only, passed to hooks)
//!     │
//!     ├── main / worker request
//!     ├── request receiver
//!     ├── script name
//!     ├── backoff
//!     └── PinArena
//! ```
//!
//! # Module Structure
//!
//! - `state` - ThreadState and StateHandler
//! - `pin` - PinArena for memory exposed to the interpreter
//! - `hooks` - Hooks that define a mode
//! - `backoff` - ExponentialBackoff for worker failures

mod backoff;
mod hooks;
mod pin;
mod state;

use std::ffi::c_char;
use std::ptr::NonNull;
use std::sync::mpsc::{Receiver, SyncSender, TryRecvError, sync_channel};
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::TableConfig;
use crate::error::{Error, Result};
use crate::request::{Handoff, ScriptRequest};

pub use backoff::ExponentialBackoff;
pub use hooks::{AfterHook, Hook, Hooks};
pub use pin::{PinArena, PinnedSet};
pub use state::{StateHandler, ThreadState};

/// Cross-thread part of a record.
struct ThreadShared {
    index: usize,
    state: StateHandler,
    /// Mode requested by `set_active`, installed by the owner at its next
    /// startup checkpoint.
    pending_mode: Mutex<Option<Hooks>>,
    requests: SyncSender<Handoff>,
}

/// Controller-side handle to a script thread.
///
/// Cloneable and usable from any thread. It can only touch the state, the
/// pending mode slot and the request channel; everything else belongs to the
/// owning thread.
#[derive(Clone)]
pub struct ThreadHandle {
    shared: Arc<ThreadShared>,
}

impl ThreadHandle {
    /// Index of the thread in its table.
    pub fn index(&self) -> usize {
        self.shared.index
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ThreadState {
        self.shared.state.get()
    }

    /// The state handler itself, for waiting on transitions.
    pub fn state_handler(&self) -> &StateHandler {
        &self.shared.state
    }

    /// Whether the thread has passed its startup checkpoint and is serving.
    pub fn is_ready(&self) -> bool {
        self.shared.state.is(ThreadState::Ready)
    }

    /// Whether work is assigned to the thread.
    pub fn is_active(&self) -> bool {
        matches!(self.state(), ThreadState::Active | ThreadState::Ready)
    }

    /// Assign a new mode to the thread.
    ///
    /// The hooks are not installed here. The owning thread installs them at
    /// its next startup checkpoint: it runs the previous mode's `on_shutdown`,
    /// swaps in `hooks`, then runs their `on_startup`. Returns `false` without
    /// doing anything when the thread is already shutting down.
    pub fn set_active(&self, hooks: Hooks) -> bool {
        if self.state().is_stopping() {
            return false;
        }
        *self
            .shared
            .pending_mode
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(hooks);

        // The pending mode must be stored before Active becomes observable.
        let previous = self
            .shared
            .state
            .update(|current| (!current.is_stopping()).then_some(ThreadState::Active));
        if previous.is_stopping() {
            self.take_pending_mode();
            return false;
        }
        tracing::debug!(thread = self.index(), from = %previous, "mode change requested");
        true
    }

    fn take_pending_mode(&self) -> Option<Hooks> {
        self.shared
            .pending_mode
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Ask the thread to stop.
    ///
    /// A parked thread wakes up, a thread waiting for a request receives
    /// `Handoff::Stop`, and a thread inside a script stops at its next
    /// before-script callback.
    pub fn request_shutdown(&self) {
        let previous = self
            .shared
            .state
            .update(|current| (current != ThreadState::Done).then_some(ThreadState::ShuttingDown));
        if previous != ThreadState::ShuttingDown && previous != ThreadState::Done {
            tracing::debug!(thread = self.index(), from = %previous, "shutdown requested");
        }
        // A full buffer holds a request, which is consumed before the state is rechecked.
        let _ = self.shared.requests.try_send(Handoff::Stop);
    }

    /// Hand a request to the thread, blocking while its buffer is full.
    ///
    /// Fails once the thread is shutting down, or when it retires while this
    /// call is blocked.
    pub fn dispatch(&self, request: Arc<ScriptRequest>) -> Result<()> {
        if self.state().is_stopping() {
            return Err(Error::Dispatch {
                thread: self.index(),
                reason: format!("thread is {}", self.state()),
            });
        }
        self.shared
            .requests
            .send(Handoff::Request(request))
            .map_err(|_| Error::Dispatch {
                thread: self.index(),
                reason: "request channel closed".to_string(),
            })
    }

    /// Hand a request to the thread without blocking.
    ///
    /// Gives the request back when the buffer is full or the thread is
    /// shutting down.
    pub fn try_dispatch(
        &self,
        request: Arc<ScriptRequest>,
    ) -> std::result::Result<(), Arc<ScriptRequest>> {
        if self.state().is_stopping() {
            return Err(request);
        }
        match self
            .shared
            .requests
            .try_send(Handoff::Request(Arc::clone(&request)))
        {
            Ok(()) => Ok(()),
            Err(_) => Err(request),
        }
    }
}

impl std::fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("index", &self.index())
            .field("state", &self.state())
            .finish()
    }
}

/// Owner-side view of a script thread, handed to every hook.
pub struct ScriptThread {
    handle: ThreadHandle,
    main_request: Option<Arc<ScriptRequest>>,
    worker_request: Option<Arc<ScriptRequest>>,
    /// Dropped when the thread retires, which fails any blocked `dispatch`.
    requests: Option<Receiver<Handoff>>,
    script_name: String,
    backoff: ExponentialBackoff,
    arena: PinArena,
}

impl ScriptThread {
    pub(crate) fn new(index: usize, config: &TableConfig) -> Self {
        let (sender, receiver) = sync_channel(config.request_buffer);
        let handle = ThreadHandle {
            shared: Arc::new(ThreadShared {
                index,
                state: StateHandler::new(ThreadState::Inactive),
                pending_mode: Mutex::new(None),
                requests: sender,
            }),
        };
        Self {
            handle,
            main_request: None,
            worker_request: None,
            requests: Some(receiver),
            script_name: String::new(),
            backoff: ExponentialBackoff::new(&config.backoff),
            arena: PinArena::new(),
        }
    }

    /// Index of the thread in its table.
    pub fn index(&self) -> usize {
        self.handle.index()
    }

    /// Controller handle for this thread.
    pub fn handle(&self) -> &ThreadHandle {
        &self.handle
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ThreadState {
        self.handle.state()
    }

    /// Request currently bound to the thread. The worker request wins.
    pub fn active_request(&self) -> Option<&Arc<ScriptRequest>> {
        self.worker_request.as_ref().or(self.main_request.as_ref())
    }

    pub fn main_request(&self) -> Option<&Arc<ScriptRequest>> {
        self.main_request.as_ref()
    }

    pub fn worker_request(&self) -> Option<&Arc<ScriptRequest>> {
        self.worker_request.as_ref()
    }

    pub fn set_main_request(&mut self, request: Option<Arc<ScriptRequest>>) {
        self.main_request = request;
    }

    pub fn set_worker_request(&mut self, request: Option<Arc<ScriptRequest>>) {
        self.worker_request = request;
    }

    /// Drop both request references.
    pub fn clear_requests(&mut self) {
        self.main_request = None;
        self.worker_request = None;
    }

    /// Script handed to the interpreter by the next before-script callback.
    pub fn script_name(&self) -> &str {
        &self.script_name
    }

    pub fn set_script_name(&mut self, script_name: impl Into<String>) {
        self.script_name = script_name.into();
    }

    /// Go idle: clear the script name and park at the next before-script
    /// callback. Has no effect on the state once shutdown was requested.
    pub fn set_inactive(&mut self) {
        self.script_name.clear();
        self.handle.shared.state.update(|current| {
            (!current.is_stopping()).then_some(ThreadState::Inactive)
        });
    }

    /// Block until a request arrives.
    ///
    /// Returns `None` when the thread is told to stop.
    pub fn recv_request(&mut self) -> Option<Arc<ScriptRequest>> {
        match self.requests.as_ref()?.recv() {
            Ok(Handoff::Request(request)) => Some(request),
            Ok(Handoff::Stop) | Err(_) => None,
        }
    }

    /// Take a request if one is waiting.
    pub fn try_recv_request(&mut self) -> Option<Arc<ScriptRequest>> {
        match self.requests.as_ref()?.try_recv() {
            Ok(Handoff::Request(request)) => Some(request),
            Ok(Handoff::Stop) | Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    pub fn backoff(&self) -> &ExponentialBackoff {
        &self.backoff
    }

    pub fn backoff_mut(&mut self) -> &mut ExponentialBackoff {
        &mut self.backoff
    }

    /// Pin a value for the current work unit. See `PinArena::pin`.
    pub fn pin<T: Send + 'static>(&mut self, value: T) -> NonNull<T> {
        self.arena.pin(value)
    }

    /// Pin string bytes without a terminator. See `PinArena::pin_str`.
    pub fn pin_str(&mut self, text: impl Into<String>) -> (NonNull<u8>, usize) {
        self.arena.pin_str(text)
    }

    /// Pin a terminated string. See `PinArena::pin_c_string`.
    pub fn pin_c_string(&mut self, text: impl Into<String>) -> NonNull<c_char> {
        self.arena.pin_c_string(text)
    }

    /// Number of live pinned registrations.
    pub fn pinned_count(&self) -> usize {
        self.arena.len()
    }

    /// Drop the receiving end of the request channel. Queued requests are
    /// discarded and senders get `Error::Dispatch` from now on.
    pub(crate) fn close_requests(&mut self) {
        if self.requests.take().is_some() {
            tracing::debug!(thread = self.index(), "request channel closed");
        }
    }

    pub(crate) fn unpin_all(&mut self) -> usize {
        let released = self.arena.take();
        released.len()
    }
}

impl std::fmt::Debug for ScriptThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptThread")
            .field("index", &self.index())
            .field("state", &self.state())
            .field("script_name", &self.script_name)
            .field("pinned", &self.arena.len())
            .finish_non_exhaustive()
    }
}

/// Owner-side state stored in the table: the record plus its installed mode.
pub(crate) struct ThreadCell {
    pub(crate) thread: ScriptThread,
    pub(crate) hooks: Option<Hooks>,
}

impl ThreadCell {
    pub(crate) fn new(thread: ScriptThread) -> Self {
        Self { thread, hooks: None }
    }

    /// Install a pending mode, if any, then run the current `on_startup`.
    pub(crate) fn run_startup_checkpoint(&mut self) {
        if let Some(next) = self.thread.handle.take_pending_mode() {
            if let Some(previous) = self.hooks.as_mut() {
                previous.run_shutdown(&mut self.thread);
            }
            tracing::debug!(thread = self.thread.index(), "installed new mode");
            self.hooks = Some(next);
        }
        if let Some(hooks) = self.hooks.as_mut() {
            hooks.run_startup(&mut self.thread);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread() -> ScriptThread {
        ScriptThread::new(0, &TableConfig::with_threads(1))
    }

    #[test]
    fn test_worker_request_takes_precedence() {
        let mut thread = thread();
        let main = Arc::new(ScriptRequest::new("GET", "/main.php"));
        let worker = Arc::new(ScriptRequest::new("GET", "/worker.php"));

        thread.set_main_request(Some(main.clone()));
        assert_eq!(thread.active_request().unwrap().id, main.id);

        thread.set_worker_request(Some(worker.clone()));
        assert_eq!(thread.active_request().unwrap().id, worker.id);

        thread.clear_requests();
        assert!(thread.active_request().is_none());
    }

    #[test]
    fn test_set_inactive_keeps_shutdown() {
        let mut thread = thread();
        thread.set_script_name("/index.php");
        thread.handle().state_handler().set(ThreadState::Ready);

        thread.set_inactive();
        assert_eq!(thread.script_name(), "");
        assert_eq!(thread.state(), ThreadState::Inactive);

        thread.handle().request_shutdown();
        thread.set_inactive();
        assert_eq!(thread.state(), ThreadState::ShuttingDown);
    }

    #[test]
    fn test_dispatch_and_receive() {
        let mut thread = thread();
        let request = Arc::new(ScriptRequest::new("GET", "/index.php"));
        thread.handle().try_dispatch(request.clone()).unwrap();

        // Buffer of one is now full.
        let second = Arc::new(ScriptRequest::new("GET", "/other.php"));
        let rejected = thread.handle().try_dispatch(second.clone()).unwrap_err();
        assert_eq!(rejected.id, second.id);

        assert_eq!(thread.recv_request().unwrap().id, request.id);
        assert!(thread.try_recv_request().is_none());
    }

    #[test]
    fn test_stop_handoff_ends_receive() {
        let mut thread = thread();
        thread.handle().request_shutdown();
        assert!(thread.recv_request().is_none());
        assert!(thread.handle().try_dispatch(Arc::new(ScriptRequest::new("GET", "/"))).is_err());
    }

    #[test]
    fn test_closed_channel_fails_senders() {
        let mut thread = thread();
        let handle = thread.handle().clone();
        handle
            .try_dispatch(Arc::new(ScriptRequest::new("GET", "/queued.php")))
            .unwrap();

        thread.close_requests();
        assert!(thread.recv_request().is_none());
        assert!(thread.try_recv_request().is_none());
        assert!(matches!(
            handle.dispatch(Arc::new(ScriptRequest::new("GET", "/late.php"))),
            Err(Error::Dispatch { thread: 0, .. })
        ));
    }

    #[test]
    fn test_set_active_rejected_after_shutdown() {
        let thread = thread();
        thread.handle().request_shutdown();
        assert!(!thread.handle().set_active(Hooks::new(|_| {})));
        assert_eq!(thread.state(), ThreadState::ShuttingDown);
    }

    #[test]
    fn test_status_is_derived_from_state() {
        let thread = thread();
        let handle = thread.handle();
        assert!(!handle.is_active());
        assert!(!handle.is_ready());

        assert!(handle.set_active(Hooks::new(|_| {})));
        assert!(handle.is_active());
        assert!(!handle.is_ready());

        handle.state_handler().set(ThreadState::Ready);
        assert!(handle.is_active());
        assert!(handle.is_ready());
    }

    #[test]
    fn test_startup_checkpoint_swaps_mode_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut cell = ThreadCell::new(thread());

        let old_log = log.clone();
        cell.hooks = Some(Hooks::new(|_| {}).on_shutdown(move |_| {
            old_log.lock().unwrap().push("old shutdown");
        }));

        let new_log = log.clone();
        cell.thread.handle().set_active(Hooks::new(|_| {}).on_startup(move |_| {
            new_log.lock().unwrap().push("new startup");
        }));

        cell.run_startup_checkpoint();
        assert_eq!(*log.lock().unwrap(), vec!["old shutdown", "new startup"]);

        // Without a pending mode only the current startup hook runs.
        cell.run_startup_checkpoint();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["old shutdown", "new startup", "new startup"]
        );
    }
}
