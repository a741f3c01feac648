//! Lock primitives.
//!
//! Two lock flavors live here, and the distinction between them matters to
//! every caller: a [`SpinLock`] protects a short, non-suspending critical
//! section, while a [`SleepLock`] may be held across long operations and is
//! the only lock a task is allowed to wait on indefinitely. A `SpinLock`
//! guard must never be alive at the point a `SleepLock` is acquired; keeping
//! the guards in separate lexical scopes makes the compiler check that rule
//! for free.

use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicBool, Ordering},
};

/// A lock which "spins" when contended.
///
/// Only short critical sections belong under this lock: nothing that blocks,
/// suspends, or performs I/O may run while the guard is alive.
pub struct SpinLock<T: ?Sized> {
    /// The lock state.
    ///
    /// `false` means the lock is not held, and `true` means the lock is held.
    flag: AtomicBool,
    /// The value stored in the lock.
    value: UnsafeCell<T>,
}
impl<T> SpinLock<T> {
    /// Construct a [`SpinLock`] to wrap the given value.
    pub const fn new(value: T) -> Self {
        Self {
            flag: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Destruct the lock and return the inner value.
    ///
    /// This function does not have to lock because consuming the value means
    /// it cannot be in use anywhere else.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }

    /// Get an exclusive reference to the inner value from an exclusive
    /// reference to the outer value.
    ///
    /// This function does not have to lock because the exclusive reference to
    /// the value means it cannot be in use anywhere else.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Lock the lock, returning an RAII guard.
    ///
    /// If the lock is already held, this method spins until the holder
    /// releases it. Holders are obliged to release quickly.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            core::hint::spin_loop();
        }
    }

    /// Attempt to lock the lock without blocking.
    ///
    /// Uses the strong compare-exchange: a failure here always means someone
    /// else holds the lock, never a spurious miss.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.flag
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinLockGuard {
                // SAFETY:
                // We've locked `flag`, so we have exclusive access.
                data: unsafe { &mut *self.value.get() },
                flag: &self.flag,
            })
    }
}
impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

// UnsafeCell implements `Send` as appropriate, so we only need `Sync`.

// SAFETY:
// Sharing the lock between threads corresponds to sending the value to
// whichever thread locks it.
unsafe impl<T: Send> Sync for SpinLock<T> {}

/// An RAII guard for a [`SpinLock`].
///
/// This value is constructed by calling [`SpinLock::lock`] and related
/// methods.
pub struct SpinLockGuard<'a, T: ?Sized> {
    data: &'a mut T,
    flag: &'a AtomicBool,
}
impl<T: ?Sized> core::ops::Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        self.data
    }
}
impl<T: ?Sized> core::ops::DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data
    }
}
impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// A lock whose acquire is a suspension point.
///
/// Unlike [`SpinLock`], a `SleepLock` guard may be held across long
/// operations such as device I/O, and [`SleepLock::lock`] waits unboundedly
/// for the current holder. In a kernel embedding the waiting task is parked
/// by the scheduler; this freestanding version waits in place. Either way,
/// callers must have released every `SpinLock` guard before acquiring one of
/// these.
pub struct SleepLock<T: ?Sized> {
    /// The lock state.
    ///
    /// `false` means the lock is not held, and `true` means the lock is held.
    locked: AtomicBool,
    /// The value stored in the lock.
    value: UnsafeCell<T>,
}
impl<T> SleepLock<T> {
    /// Construct a [`SleepLock`] to wrap the given value.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Destruct the lock and return the inner value.
    ///
    /// This function does not have to lock because consuming the value means
    /// it cannot be in use anywhere else.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }

    /// Get an exclusive reference to the inner value from an exclusive
    /// reference to the outer value.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// Lock the lock, returning an RAII guard.
    ///
    /// Waits as long as it takes for the current holder to release. There is
    /// no cancellation and no timeout.
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        while self.locked.swap(true, Ordering::Acquire) {
            // Suspension point. The stand-in for being parked by a scheduler.
            core::hint::spin_loop();
        }
        SleepLockGuard {
            // SAFETY:
            // We've locked `locked`, so we have exclusive access.
            data: unsafe { &mut *self.value.get() },
            locked: &self.locked,
        }
    }

    /// Whether the lock is currently held by someone.
    ///
    /// The answer may be stale by the time it is returned; it is meant for
    /// diagnostics, not synchronization.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}
impl<T: Default> Default for SleepLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

// SAFETY:
// Sharing the lock between threads corresponds to sending the value to
// whichever thread locks it.
unsafe impl<T: Send> Sync for SleepLock<T> {}

/// An RAII guard for a [`SleepLock`].
///
/// This value is constructed by calling [`SleepLock::lock`].
pub struct SleepLockGuard<'a, T: ?Sized> {
    data: &'a mut T,
    locked: &'a AtomicBool,
}
impl<T: ?Sized> core::ops::Deref for SleepLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        self.data
    }
}
impl<T: ?Sized> core::ops::DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data
    }
}
impl<T: ?Sized> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        self.locked.store(false, Ordering::Release);
    }
}
