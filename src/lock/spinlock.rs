//! Spin locks.
use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use super::Waitable;

/// Mutual exclusion lock that busy waits (spins).
///
/// Unlike a guard-based lock, a `RawSpinLock` may be released by a different
/// thread than the one that acquired it; the scheduler relies on this for
/// the process-table lock, which is passed through `swtch`.
pub struct RawSpinLock {
    /// Name of lock, for diagnostics.
    name: &'static str,

    locked: AtomicBool,
}

impl RawSpinLock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
        }
    }

    /// Acquires the lock. Loops (spins) until it is acquired.
    ///
    /// The `Acquire` ordering on success pairs with the `Release` store in
    /// `release`, so stores in one critical section are visible to the next.
    pub fn acquire(&self) {
        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
    }

    /// Releases the lock.
    pub fn release(&self) {
        assert!(self.holding(), "release {}", self.name);
        self.locked.store(false, Ordering::Release);
    }

    /// Whether the lock is held by someone.
    ///
    /// The hosted lock does not track the owning CPU, so this is a liveness
    /// check rather than an ownership check.
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// Locks that busy wait, owning their data.
pub struct SpinLock<T> {
    lock: RawSpinLock,
    data: UnsafeCell<T>,
}

// SAFETY: the data is only accessible through a guard obtained by `lock`.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

pub struct SpinLockGuard<'s, T> {
    lock: &'s SpinLock<T>,
    _marker: core::marker::PhantomData<*const ()>,
}

impl<T> SpinLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSpinLock::new(name),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.lock.acquire();
        SpinLockGuard {
            lock: self,
            _marker: core::marker::PhantomData,
        }
    }

    /// Returns a mutable pointer to the inner data without locking.
    ///
    /// The caller must ensure that accessing the pointer does not race.
    pub fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }

    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: &mut self is exclusive.
        unsafe { &mut *self.data.get() }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T> SpinLockGuard<'_, T> {
    /// Temporarily releases the lock, runs `f`, and reacquires.
    pub fn reacquire_after<F: FnOnce() -> U, U>(&mut self, f: F) -> U {
        self.lock.lock.release();
        let r = f();
        self.lock.lock.acquire();
        r
    }
}

impl<T> Waitable for SpinLockGuard<'_, T> {
    unsafe fn raw_release(&mut self) {
        self.lock.lock.release();
    }

    unsafe fn raw_acquire(&mut self) {
        self.lock.lock.acquire();
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: the guard holds the lock and &mut self is exclusive.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}
