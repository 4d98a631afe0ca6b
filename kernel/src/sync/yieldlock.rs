//! Yield-lock: a CAS lock that gives the CPU away instead of spinning.
//!
//! On a single CPU a contended lock can only be released by another thread,
//! so spinning is wasted time; yielding lets the holder finish. Thread
//! context only: an interrupt handler cannot yield.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::task::scheduler::Scheduler;

pub struct YieldLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: `locked` grants exclusive access to `data`.
unsafe impl<T: Send> Send for YieldLock<T> {}
unsafe impl<T: Send> Sync for YieldLock<T> {}

impl<T> YieldLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    pub fn lock<'a>(&'a self, sched: &Scheduler) -> YieldLockGuard<'a, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            sched.yield_now();
        }
    }

    pub fn try_lock(&self) -> Option<YieldLockGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| YieldLockGuard { lock: self })
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

pub struct YieldLockGuard<'a, T> {
    lock: &'a YieldLock<T>,
}

impl<'a, T> YieldLockGuard<'a, T> {
    /// The lock this guard holds, for re-acquiring after a condvar wait.
    pub fn source(guard: &Self) -> &'a YieldLock<T> {
        guard.lock
    }
}

impl<T> Deref for YieldLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves we hold the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for YieldLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves we hold the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for YieldLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}
