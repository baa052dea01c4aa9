//! Process-wide table of script threads and the boundary callbacks.
//!
//! The interpreter only carries an integer per thread, so every boundary
//! callback starts by looking the record up by index. The table is built once
//! with a fixed number of records; indexes are never reused while it lives.
//!
//! # Callback order per native thread
//!
//! ```text
//! on_thread_startup
//!     │
//!     └── loop
//!             ├── before_script_execution   (may park; None = stop)
//!             │       └── interpreter runs the returned script
//!             └── after_script_execution    (exit status)
//!     │
//! on_thread_shutdown
//! ```

use std::ffi::c_char;
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, TryLockError};

use crate::config::TableConfig;
use crate::error::{Error, Result};
use crate::thread::{ScriptThread, ThreadCell, ThreadHandle, ThreadState};

struct ThreadSlot {
    handle: ThreadHandle,
    /// Only the owning thread locks this, from inside boundary callbacks.
    cell: Mutex<ThreadCell>,
}

/// Fixed-size table of script threads, indexed by thread handle.
pub struct ThreadTable {
    slots: Box<[ThreadSlot]>,
}

impl ThreadTable {
    /// Build a table with `config.num_threads` inactive records.
    pub fn new(config: &TableConfig) -> Result<Self> {
        config.validate()?;
        let slots = (0..config.num_threads)
            .map(|index| {
                let thread = ScriptThread::new(index, config);
                ThreadSlot {
                    handle: thread.handle().clone(),
                    cell: Mutex::new(ThreadCell::new(thread)),
                }
            })
            .collect();
        tracing::debug!(threads = config.num_threads, "thread table created");
        Ok(Self { slots })
    }

    /// Build a table with `num_threads` records and default settings.
    pub fn with_threads(num_threads: usize) -> Result<Self> {
        Self::new(&TableConfig::with_threads(num_threads))
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, index: usize) -> Result<&ThreadSlot> {
        self.slots.get(index).ok_or(Error::UnknownThread(index))
    }

    fn lock(&self, index: usize) -> Result<MutexGuard<'_, ThreadCell>> {
        self.slot(index)?
            .cell
            .lock()
            .map_err(|_| Error::Poisoned(index))
    }

    /// Controller handle for the thread at `index`.
    pub fn handle(&self, index: usize) -> Result<ThreadHandle> {
        Ok(self.slot(index)?.handle.clone())
    }

    /// Controller handles for every thread, in index order.
    pub fn handles(&self) -> Vec<ThreadHandle> {
        self.slots.iter().map(|slot| slot.handle.clone()).collect()
    }

    /// Run `f` against the owner-side record.
    ///
    /// Never blocks. Boundary callbacks hold the record while mode hooks run,
    /// and a hook may wait there for its next request, so this returns
    /// `Error::Busy` while the owning thread is inside a callback.
    pub fn with_thread<T>(&self, index: usize, f: impl FnOnce(&mut ScriptThread) -> T) -> Result<T> {
        let mut cell = match self.slot(index)?.cell.try_lock() {
            Ok(cell) => cell,
            Err(TryLockError::WouldBlock) => return Err(Error::Busy(index)),
            Err(TryLockError::Poisoned(_)) => return Err(Error::Poisoned(index)),
        };
        Ok(f(&mut cell.thread))
    }

    /// Request shutdown of every thread.
    pub fn request_shutdown_all(&self) {
        for slot in self.slots.iter() {
            slot.handle.request_shutdown();
        }
    }

    /// Native thread bring-up.
    ///
    /// Clears the script name and parks the thread (state `Inactive`) unless
    /// a shutdown was already requested.
    pub fn on_thread_startup(&self, index: usize) -> Result<()> {
        self.lock(index)?.thread.set_inactive();
        tracing::info!(thread = index, "thread started");
        Ok(())
    }

    /// Called right before the interpreter would run a script.
    ///
    /// Parks while the thread is inactive. Returns `None` (stop) once shutdown
    /// was requested; otherwise runs the startup checkpoint on the first call
    /// of an activation, then the mode's before-script hook, and returns the
    /// script name as a terminated string.
    ///
    /// # Safety of the returned pointer
    ///
    /// The string stays valid until the matching `after_script_execution` or
    /// `on_thread_shutdown` call for this index, and no longer.
    pub fn before_script_execution(&self, index: usize) -> Result<Option<NonNull<c_char>>> {
        let slot = self.slot(index)?;
        let state = slot.handle.state_handler();

        if state.is(ThreadState::Inactive) {
            tracing::trace!(thread = index, "parked until activated");
            state.wait_for(&[ThreadState::Active, ThreadState::ShuttingDown, ThreadState::Done]);
        }

        if state.get().is_stopping() {
            tracing::debug!(thread = index, "stop handed to interpreter");
            return Ok(None);
        }

        let mut cell = self.lock(index)?;

        let previous = state.update(|current| match current {
            ThreadState::Inactive | ThreadState::Active => Some(ThreadState::Ready),
            ThreadState::Ready | ThreadState::ShuttingDown | ThreadState::Done => None,
        });
        match previous {
            ThreadState::Ready => {}
            ThreadState::ShuttingDown | ThreadState::Done => return Ok(None),
            ThreadState::Inactive | ThreadState::Active => cell.run_startup_checkpoint(),
        }

        let ThreadCell { thread, hooks } = &mut *cell;
        let hooks = hooks.as_mut().ok_or(Error::NoModeAssigned(index))?;
        hooks.run_before_script(thread);

        // A hook woken by a stop handoff binds nothing. Work it did bind still
        // runs; the shutdown takes effect at the next call.
        if thread.state().is_stopping()
            && thread.script_name().is_empty()
            && thread.active_request().is_none()
        {
            tracing::debug!(thread = index, "stop handed to interpreter");
            return Ok(None);
        }

        let script_name = thread.script_name().to_owned();
        tracing::trace!(thread = index, script = %script_name, "handing script to interpreter");
        Ok(Some(thread.pin_c_string(script_name)))
    }

    /// Called once the interpreter finished the script returned by
    /// `before_script_execution`.
    ///
    /// A negative `exit_status` means the interpreter itself failed: the
    /// after-script hook is skipped and `Error::ScriptExecution` is returned.
    /// Pinned memory is released on every path.
    pub fn after_script_execution(&self, index: usize, exit_status: i32) -> Result<()> {
        let slot = self.slot(index)?;
        let mut cell = match slot.cell.lock() {
            Ok(cell) => cell,
            Err(poisoned) => {
                poisoned.into_inner().thread.unpin_all();
                return Err(Error::Poisoned(index));
            }
        };
        let ThreadCell { thread, hooks } = &mut *cell;

        let outcome = if exit_status < 0 {
            tracing::error!(thread = index, status = exit_status, "interpreter fault");
            Err(Error::ScriptExecution {
                thread: index,
                status: exit_status,
            })
        } else {
            if let Some(hooks) = hooks.as_mut() {
                hooks.run_after_script(thread, exit_status);
            }
            Ok(())
        };

        let released = thread.unpin_all();
        tracing::trace!(thread = index, status = exit_status, released, "script finished");
        outcome
    }

    /// Native thread retirement.
    ///
    /// Releases pinned memory, closes the request channel (dispatchers still
    /// blocked on it get an error), runs the mode's `on_shutdown` and marks
    /// the thread `Done`, whatever state it was in.
    pub fn on_thread_shutdown(&self, index: usize) -> Result<()> {
        let slot = self.slot(index)?;
        let poisoned = {
            let (mut cell, poisoned) = match slot.cell.lock() {
                Ok(cell) => (cell, false),
                Err(poisoned) => (poisoned.into_inner(), true),
            };
            let ThreadCell { thread, hooks } = &mut *cell;
            thread.unpin_all();
            thread.close_requests();
            if !poisoned {
                if let Some(hooks) = hooks.as_mut() {
                    hooks.run_shutdown(thread);
                }
            }
            poisoned
        };

        slot.handle.state_handler().set(ThreadState::Done);
        tracing::info!(thread = index, "thread retired");

        if poisoned {
            Err(Error::Poisoned(index))
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for ThreadTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.slots.iter().map(|slot| &slot.handle))
            .finish()
    }
}
