//! Lifecycle hooks that define a thread's mode of operation.

use super::ScriptThread;

/// Hook run at a lifecycle checkpoint.
pub type Hook = Box<dyn FnMut(&mut ScriptThread) + Send>;

/// Hook run after a script finished, with its exit status.
pub type AfterHook = Box<dyn FnMut(&mut ScriptThread, i32) + Send>;

/// The four hooks of one mode, installed and replaced as a unit.
///
/// Only `before_script_execution` is required. It runs before every script
/// and is expected to pick the script to run (and bind any request).
pub struct Hooks {
    on_startup: Option<Hook>,
    before_script_execution: Hook,
    after_script_execution: Option<AfterHook>,
    on_shutdown: Option<Hook>,
}

impl Hooks {
    /// Create a mode from its required before-script hook.
    pub fn new(before_script_execution: impl FnMut(&mut ScriptThread) + Send + 'static) -> Self {
        Self {
            on_startup: None,
            before_script_execution: Box::new(before_script_execution),
            after_script_execution: None,
            on_shutdown: None,
        }
    }

    /// Run once each time the thread is activated with this mode.
    pub fn on_startup(mut self, hook: impl FnMut(&mut ScriptThread) + Send + 'static) -> Self {
        self.on_startup = Some(Box::new(hook));
        self
    }

    /// Run after every non-fatal script execution.
    pub fn after_script_execution(
        mut self,
        hook: impl FnMut(&mut ScriptThread, i32) + Send + 'static,
    ) -> Self {
        self.after_script_execution = Some(Box::new(hook));
        self
    }

    /// Run when this mode is replaced or the thread retires.
    pub fn on_shutdown(mut self, hook: impl FnMut(&mut ScriptThread) + Send + 'static) -> Self {
        self.on_shutdown = Some(Box::new(hook));
        self
    }

    pub(crate) fn run_startup(&mut self, thread: &mut ScriptThread) {
        if let Some(hook) = self.on_startup.as_mut() {
            hook(thread);
        }
    }

    pub(crate) fn run_before_script(&mut self, thread: &mut ScriptThread) {
        (self.before_script_execution)(thread);
    }

    pub(crate) fn run_after_script(&mut self, thread: &mut ScriptThread, exit_status: i32) {
        if let Some(hook) = self.after_script_execution.as_mut() {
            hook(thread, exit_status);
        }
    }

    pub(crate) fn run_shutdown(&mut self, thread: &mut ScriptThread) {
        if let Some(hook) = self.on_shutdown.as_mut() {
            hook(thread);
        }
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("on_startup", &self.on_startup.is_some())
            .field("after_script_execution", &self.after_script_execution.is_some())
            .field("on_shutdown", &self.on_shutdown.is_some())
            .finish_non_exhaustive()
    }
}
