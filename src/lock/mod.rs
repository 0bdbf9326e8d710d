//! The lock module.
//!
//! Two families, as in any xv6-lineage kernel:
//!
//! * Spin locks: non-blocking, safe to take from any kernel path that does
//!   not suspend while holding them.
//! * Sleep locks: block the calling process on a wait channel; may be held
//!   across disk I/O and other suspension points.
//!
//! There are no interrupts in the hosted model, so the spinlock does not
//! carry the push_off/pop_off bookkeeping of a bare-metal kernel. The
//! process-table lock is a bare `RawSpinLock` because its ownership crosses
//! threads during a context switch.

mod sleeplock;
mod spinlock;

pub use sleeplock::{SleepLock, SleepLockGuard};
pub use spinlock::{RawSpinLock, SpinLock, SpinLockGuard};

/// Lock guards that a process can sleep in a `WaitChannel` while holding.
///
/// `WaitChannel::sleep` releases the guard's raw lock after the process is
/// registered on the channel and reacquires it on wakeup.
pub trait Waitable {
    /// Releases the inner raw lock.
    ///
    /// # Safety
    ///
    /// Must be paired with `raw_acquire`, and the guarded data must not be
    /// accessed in between.
    unsafe fn raw_release(&mut self);

    /// Reacquires the inner raw lock.
    ///
    /// # Safety
    ///
    /// Must be paired with a preceding `raw_release`.
    unsafe fn raw_acquire(&mut self);
}
