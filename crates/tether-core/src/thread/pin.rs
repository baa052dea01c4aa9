//! Host memory exposed to the interpreter for the length of one native call.
//!
//! Anything whose address crosses the boundary is moved into the arena and
//! stays at a fixed heap address until the work unit ends. Release happens
//! through `unpin_all`, through dropping a `PinnedSet` taken from the arena,
//! or when the arena itself is dropped.

use std::ffi::c_char;
use std::ptr::NonNull;

/// One heap allocation owned by the arena.
enum Pinned {
    Bytes(NonNull<[u8]>),
    Value {
        ptr: NonNull<()>,
        release: unsafe fn(NonNull<()>),
    },
}

// Only `Send` values are accepted by `pin`, and byte buffers are plain data.
unsafe impl Send for Pinned {}

unsafe fn release_boxed<T>(ptr: NonNull<()>) {
    // Safety: `ptr` came from `Box::<T>::into_raw` in `PinArena::pin` and is
    // released exactly once.
    drop(unsafe { Box::from_raw(ptr.cast::<T>().as_ptr()) });
}

impl Drop for Pinned {
    fn drop(&mut self) {
        match *self {
            // Safety: produced by `Box::<[u8]>::into_raw`, released once.
            Self::Bytes(ptr) => drop(unsafe { Box::from_raw(ptr.as_ptr()) }),
            // Safety: `release` matches the type that produced `ptr`.
            Self::Value { ptr, release } => unsafe { release(ptr) },
        }
    }
}

/// Per-thread registry of pinned host memory.
#[derive(Default)]
pub struct PinArena {
    pinned: Vec<Pinned>,
}

impl PinArena {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move `value` to a stable address for the rest of the work unit.
    pub fn pin<T: Send + 'static>(&mut self, value: T) -> NonNull<T> {
        let ptr = NonNull::from(Box::leak(Box::new(value)));
        self.pinned.push(Pinned::Value {
            ptr: ptr.cast(),
            release: release_boxed::<T>,
        });
        ptr
    }

    fn pin_bytes(&mut self, bytes: Box<[u8]>) -> NonNull<[u8]> {
        let ptr = NonNull::from(Box::leak(bytes));
        self.pinned.push(Pinned::Bytes(ptr));
        ptr
    }

    /// Pin the bytes of `text` without a terminator.
    ///
    /// Returns the address of the first byte and the length. Zero bytes inside
    /// `text` are kept as is.
    pub fn pin_str(&mut self, text: impl Into<String>) -> (NonNull<u8>, usize) {
        let bytes = text.into().into_bytes().into_boxed_slice();
        let len = bytes.len();
        let ptr = self.pin_bytes(bytes);
        (ptr.cast::<u8>(), len)
    }

    /// Pin `text` followed by a zero byte.
    ///
    /// Embedded zero bytes are not rejected; a C reader simply stops at the
    /// first one.
    pub fn pin_c_string(&mut self, text: impl Into<String>) -> NonNull<c_char> {
        let mut bytes = text.into().into_bytes();
        bytes.push(0);
        self.pin_bytes(bytes.into_boxed_slice()).cast::<c_char>()
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.pinned.len()
    }

    /// Whether nothing is pinned.
    pub fn is_empty(&self) -> bool {
        self.pinned.is_empty()
    }

    /// Release every registration. Returns how many were released.
    ///
    /// Must not be called while the interpreter may still read a pinned address.
    pub fn unpin_all(&mut self) -> usize {
        let released = self.pinned.len();
        self.pinned.clear();
        released
    }

    /// Move every registration into a `PinnedSet` that releases them on drop.
    pub fn take(&mut self) -> PinnedSet {
        PinnedSet {
            pinned: std::mem::take(&mut self.pinned),
        }
    }
}

impl std::fmt::Debug for PinArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinArena").field("len", &self.len()).finish()
    }
}

/// Registrations detached from an arena; released when dropped.
pub struct PinnedSet {
    pinned: Vec<Pinned>,
}

impl PinnedSet {
    /// Number of registrations held.
    pub fn len(&self) -> usize {
        self.pinned.len()
    }

    /// Whether the set holds nothing.
    pub fn is_empty(&self) -> bool {
        self.pinned.is_empty()
    }
}

impl Drop for PinnedSet {
    fn drop(&mut self) {
        if !self.pinned.is_empty() {
            tracing::trace!(released = self.pinned.len(), "released pinned memory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_pin_c_string_is_terminated() {
        let mut arena = PinArena::new();
        let ptr = arena.pin_c_string("/index.php");
        let text = unsafe { CStr::from_ptr(ptr.as_ptr()) };
        assert_eq!(text.to_bytes(), b"/index.php");
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_pin_c_string_keeps_embedded_zero() {
        let mut arena = PinArena::new();
        let ptr = arena.pin_c_string("a\0b");
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr().cast::<u8>(), 4) };
        assert_eq!(bytes, b"a\0b\0");
    }

    #[test]
    fn test_pin_str_has_no_terminator() {
        let mut arena = PinArena::new();
        let (ptr, len) = arena.pin_str("abc");
        assert_eq!(len, 3);
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) };
        assert_eq!(bytes, b"abc");
    }

    #[test]
    fn test_pinned_address_survives_more_pins() {
        let mut arena = PinArena::new();
        let first = arena.pin(42u64);
        for i in 0..100u64 {
            arena.pin(i);
        }
        assert_eq!(unsafe { *first.as_ptr() }, 42);
    }

    #[test]
    fn test_unpin_all_drops_values() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut arena = PinArena::new();
        arena.pin(DropCounter(drops.clone()));
        arena.pin(DropCounter(drops.clone()));
        arena.pin_c_string("x");

        assert_eq!(arena.unpin_all(), 3);
        assert!(arena.is_empty());
        assert_eq!(drops.load(Ordering::SeqCst), 2);
        assert_eq!(arena.unpin_all(), 0);
    }

    #[test]
    fn test_take_releases_on_drop() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut arena = PinArena::new();
        arena.pin(DropCounter(drops.clone()));

        let set = arena.take();
        assert!(arena.is_empty());
        assert_eq!(set.len(), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        drop(set);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_arena_drop_releases_everything() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let mut arena = PinArena::new();
            arena.pin(DropCounter(drops.clone()));
        }
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
