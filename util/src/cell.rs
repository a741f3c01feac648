//! Cell types.

use core::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    sync::atomic::{AtomicU8, Ordering},
};

/// Flag bit: construction has been locked.
///
/// If this bit is not set, then no access to the value can exist.
const LOCKED: u8 = 1 << 0;
/// Flag bit: the value has been initialized.
///
/// If this bit is set, then no exclusive access to the value exists anymore,
/// and the value may be read freely.
const INITIALIZED: u8 = 1 << 1;

/// A locked value which can only be written to once.
///
/// This is the intended home for process-wide state that is constructed once
/// at startup and then only read, such as a resource manager placed in a
/// `static`.
pub struct OnceLock<T> {
    /// Flags indicating the inner state.
    flags: AtomicU8,
    /// The inner value.
    value: UnsafeCell<MaybeUninit<T>>,
}
impl<T> OnceLock<T> {
    /// Construct a new lock, without a written value.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            flags: AtomicU8::new(0),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Get the value, if it has already been initialized.
    pub fn get(&self) -> Option<&T> {
        (self.flags.load(Ordering::Acquire) & INITIALIZED != 0).then(|| {
            // SAFETY:
            // Because `INITIALIZED` is set, no more exclusive access can exist.
            let value = unsafe { &*self.value.get() };
            // SAFETY:
            // Because `INITIALIZED` is set, the value must be initialized.
            unsafe { value.assume_init_ref() }
        })
    }

    /// Attempt to set the value.
    ///
    /// If the value has already been set (or a set is in flight on another
    /// thread), then the given value is returned in an `Err`.
    pub fn set(&self, value: T) -> Result<(), T> {
        if self.flags.fetch_or(LOCKED, Ordering::AcqRel) & LOCKED != 0 {
            return Err(value);
        }
        // SAFETY:
        // Because we set `LOCKED`, we have exclusive access until we mark
        // `INITIALIZED`.
        unsafe { &mut *self.value.get() }.write(value);
        self.flags.fetch_or(INITIALIZED, Ordering::Release);
        Ok(())
    }
}
impl<T> Default for OnceLock<T> {
    fn default() -> Self {
        Self::new()
    }
}
/// Construct a [`OnceLock`] with the value already inside.
impl<T> From<T> for OnceLock<T> {
    fn from(value: T) -> Self {
        Self {
            flags: AtomicU8::new(LOCKED | INITIALIZED),
            value: UnsafeCell::new(MaybeUninit::new(value)),
        }
    }
}
impl<T> Drop for OnceLock<T> {
    fn drop(&mut self) {
        if *self.flags.get_mut() & INITIALIZED != 0 {
            // SAFETY:
            // The value is initialized, and won't be used anymore, so we can
            // drop it.
            unsafe { self.value.get_mut().assume_init_drop() };
        }
    }
}
// SAFETY:
// A `OnceLock<T>` is equivalent to a `T`.
unsafe impl<T: Send> Send for OnceLock<T> {}
// SAFETY:
// A `OnceLock<T>` is equivalent to a `T`.
unsafe impl<T: Sync> Sync for OnceLock<T> {}
