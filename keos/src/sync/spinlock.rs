//! SMP-supported spinlock.
//!
//! A processor acquiring the lock 1) polls a flag that tells whether the lock
//! is held, 2) sets the flag when it observes the lock free, and 3) clears the
//! flag on `unlock`. Steps 1 and 2 are a single atomic read-modify-write.
//!
//! Unlike `std::sync::Mutex`, dropping a [`SpinLockGuard`] does **not**
//! release the lock. Every guard must be released with
//! [`SpinLockGuard::unlock`], which makes each critical section visible at the
//! call site. Forgetting to do so panics and reports where the lock was taken.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};
use crossbeam_utils::Backoff;

/// The lock could not be acquired at this time because the operation would
/// otherwise block.
#[derive(Debug)]
pub struct WouldBlock;

/// A mutual exclusion primitive useful for protecting shared data.
///
/// The data can only be accessed through the guards returned from [`lock`]
/// and [`try_lock`].
///
/// # Examples
///
/// ```
/// use keos::sync::SpinLock;
///
/// let lock = SpinLock::new(0);
/// let mut guard = lock.lock();
/// *guard += 1;
/// // the lock must be "explicitly" unlocked before `guard` goes out of scope.
/// guard.unlock();
/// ```
///
/// [`lock`]: Self::lock
/// [`try_lock`]: Self::try_lock
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock in an unlocked state ready for use.
    #[inline]
    pub const fn new(t: T) -> SpinLock<T> {
        SpinLock {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(t),
        }
    }

    /// Consumes this spinlock, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires the spinlock, spinning until it is available.
    ///
    /// The lock is not reentrant: locking it again from the holder never
    /// returns.
    #[track_caller]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let backoff = Backoff::new();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
        SpinLockGuard {
            caller: core::panic::Location::caller(),
            lock: self,
        }
    }

    /// Attempts to acquire this lock without spinning.
    ///
    /// # Errors
    /// Returns [`WouldBlock`] if the lock is held by someone else.
    #[track_caller]
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, WouldBlock> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Ok(SpinLockGuard {
                caller: core::panic::Location::caller(),
                lock: self,
            })
        } else {
            Err(WouldBlock)
        }
    }

    /// Returns a mutable reference to the data without locking.
    ///
    /// The exclusive borrow statically guarantees no guard exists.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> SpinLock<T> {
        SpinLock::new(Default::default())
    }
}

/// A scoped lock of a [`SpinLock`].
///
/// The lock must be explicitly released by [`unlock`]; dropping the guard
/// while the lock is held panics.
///
/// [`unlock`]: Self::unlock
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
    caller: &'static core::panic::Location<'static>,
    lock: &'a SpinLock<T>,
}

unsafe impl<T: ?Sized + Sync> Sync for SpinLockGuard<'_, T> {}

impl<T: ?Sized> SpinLockGuard<'_, T> {
    /// Releases the underlying [`SpinLock`].
    pub fn unlock(self) {
        self.lock.locked.store(false, Ordering::Release);
        core::mem::forget(self);
    }
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Unwinding through a critical section: release so that the failure
        // is reported instead of turning into a deadlock or a double panic.
        if std::thread::panicking() {
            self.lock.locked.store(false, Ordering::Release);
            return;
        }
        panic!(
            "`.unlock()` must be explicitly called before dropping SpinLockGuard.
The lock is held at {:?}.",
            self.caller
        );
    }
}

#[cfg(test)]
mod tests {
    use super::SpinLock;
    use std::{sync::Arc, thread};

    #[test]
    fn counter_is_serialized() {
        let data = Arc::new(SpinLock::new(0usize));
        let workers = (0..8)
            .map(|_| {
                let data = data.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let mut guard = data.lock();
                        *guard += 1;
                        guard.unlock();
                    }
                })
            })
            .collect::<Vec<_>>();
        for w in workers {
            w.join().unwrap();
        }
        let guard = data.lock();
        assert_eq!(*guard, 8000);
        guard.unlock();
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_err());
        guard.unlock();
        let guard = lock.try_lock().ok().unwrap();
        guard.unlock();
    }

    #[test]
    #[should_panic(expected = "must be explicitly called")]
    fn dropping_a_guard_panics() {
        let lock = SpinLock::new(1);
        let _guard = lock.lock();
    }
}
