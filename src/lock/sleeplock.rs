//! Sleeping locks: long-term locks for processes.
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use super::SpinLock;
use crate::kernel::Kernel;
use crate::proc::{KernelCtx, Pid, WaitChannel};

/// Locks that block the calling process instead of busy waiting.
///
/// The owner field (`-1` when unlocked, else the holder's pid) is guarded
/// by an internal spinlock; contenders sleep on the lock's wait channel.
pub struct SleepLock<T> {
    /// Process holding the lock. `-1` means unlocked.
    locked: SpinLock<Pid>,

    /// WaitChannel saying the lock has been released.
    waitchannel: WaitChannel,

    data: UnsafeCell<T>,
}

// SAFETY: the data is only accessible through a guard obtained by `lock`.
unsafe impl<T: Send> Sync for SleepLock<T> {}
unsafe impl<T: Send> Send for SleepLock<T> {}

/// An acquired `SleepLock`. Releasing wakes the lock's wait channel, so the
/// guard carries a kernel handle.
pub struct SleepLockGuard<'s, T> {
    lock: &'s SleepLock<T>,
    kernel: &'s Kernel,
}

impl<T> SleepLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            locked: SpinLock::new(name, -1),
            waitchannel: WaitChannel::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock, sleeping while it is held by another process.
    pub fn lock<'s>(&'s self, ctx: &KernelCtx<'s>) -> SleepLockGuard<'s, T> {
        let mut guard = self.locked.lock();
        while *guard != -1 {
            self.waitchannel.sleep(&mut guard, ctx);
        }
        *guard = ctx.pid();
        drop(guard);

        SleepLockGuard {
            lock: self,
            kernel: ctx.kernel(),
        }
    }

    /// Whether the calling process holds the lock.
    pub fn holding(&self, ctx: &KernelCtx<'_>) -> bool {
        *self.locked.lock() == ctx.pid()
    }

    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: &mut self is exclusive.
        unsafe { &mut *self.data.get() }
    }

    /// Returns a mutable pointer to the inner data without locking.
    ///
    /// The caller must ensure that no guard exists and that the access
    /// does not race.
    pub fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: the guard holds the lock and &mut self is exclusive.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        let mut guard = self.lock.locked.lock();
        *guard = -1;
        drop(guard);
        self.lock.waitchannel.wakeup(self.kernel);
    }
}
