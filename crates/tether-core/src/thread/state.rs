//! Lifecycle state of a script thread.
//!
//! `StateHandler` is the single source of truth for where a thread is in its
//! lifecycle. Reads go through an atomic mirror so `is` never takes a lock;
//! writes take a mutex and broadcast on a condition variable so every thread
//! parked in `wait_for` re-checks the new state.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;

/// Lifecycle state of a script thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ThreadState {
    /// Started but idle; the next before-script callback parks.
    Inactive = 0,
    /// A mode has been assigned and is running.
    Ready = 1,
    /// Work was requested; the next before-script callback runs the startup checkpoint.
    Active = 2,
    /// Shutdown requested; no further script will be handed out.
    ShuttingDown = 3,
    /// The native thread has retired.
    Done = 4,
}

impl ThreadState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Inactive,
            1 => Self::Ready,
            2 => Self::Active,
            3 => Self::ShuttingDown,
            _ => Self::Done,
        }
    }

    /// Short name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Ready => "ready",
            Self::Active => "active",
            Self::ShuttingDown => "shutting_down",
            Self::Done => "done",
        }
    }

    /// Whether no further script may run in this state.
    pub fn is_stopping(self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Done)
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thread-safe holder of a `ThreadState`.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use tether_core::thread::{StateHandler, ThreadState};
///
/// let state = Arc::new(StateHandler::new(ThreadState::Inactive));
/// let waiter = {
///     let state = Arc::clone(&state);
///     std::thread::spawn(move || state.wait_for(&[ThreadState::Active, ThreadState::ShuttingDown]))
/// };
///
/// state.set(ThreadState::Active);
/// assert_eq!(waiter.join().unwrap(), ThreadState::Active);
/// ```
#[derive(Debug)]
pub struct StateHandler {
    /// Authoritative value, only written with `changed` held.
    current: Mutex<ThreadState>,
    /// Lock-free mirror of `current` for `is`.
    mirror: AtomicU8,
    changed: Condvar,
}

impl Default for StateHandler {
    fn default() -> Self {
        Self::new(ThreadState::Inactive)
    }
}

impl StateHandler {
    /// Create a handler in the given state.
    pub fn new(initial: ThreadState) -> Self {
        Self {
            current: Mutex::new(initial),
            mirror: AtomicU8::new(initial as u8),
            changed: Condvar::new(),
        }
    }

    // The lock only protects a Copy value, so a poisoned guard is still valid.
    fn lock(&self) -> MutexGuard<'_, ThreadState> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store(&self, guard: &mut MutexGuard<'_, ThreadState>, next: ThreadState) {
        let previous = **guard;
        **guard = next;
        self.mirror.store(next as u8, Ordering::Release);
        self.changed.notify_all();
        if previous != next {
            tracing::trace!(from = %previous, to = %next, "thread state changed");
        }
    }

    /// Current state.
    pub fn get(&self) -> ThreadState {
        ThreadState::from_u8(self.mirror.load(Ordering::Acquire))
    }

    /// Check the current state without blocking.
    pub fn is(&self, candidate: ThreadState) -> bool {
        self.get() == candidate
    }

    /// Transition unconditionally and wake every waiter.
    pub fn set(&self, next: ThreadState) {
        let mut guard = self.lock();
        self.store(&mut guard, next);
    }

    /// Atomic read-modify-write.
    ///
    /// `transition` sees the current state and returns the state to install,
    /// or `None` to leave it untouched. Returns the state observed before the
    /// call.
    pub fn update(&self, transition: impl FnOnce(ThreadState) -> Option<ThreadState>) -> ThreadState {
        let mut guard = self.lock();
        let observed = *guard;
        if let Some(next) = transition(observed) {
            self.store(&mut guard, next);
        }
        observed
    }

    /// Park until the state is one of `targets`, then return the matched state.
    pub fn wait_for(&self, targets: &[ThreadState]) -> ThreadState {
        let guard = self.lock();
        let guard = self
            .changed
            .wait_while(guard, |state| !targets.contains(state))
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }

    /// Like `wait_for`, giving up after `timeout`.
    pub fn wait_for_timeout(&self, targets: &[ThreadState], timeout: Duration) -> Option<ThreadState> {
        let guard = self.lock();
        let (guard, result) = self
            .changed
            .wait_timeout_while(guard, timeout, |state| !targets.contains(state))
            .unwrap_or_else(PoisonError::into_inner);
        if result.timed_out() {
            None
        } else {
            Some(*guard)
        }
    }
}
