//! Condition variable.
//!
//! `wait_until` checks the predicate with the caller's lock held; while it is
//! false the caller queues itself, blocks, releases the lock, yields, then
//! re-acquires the lock and checks again. A `notify` with nobody waiting is
//! not remembered.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::ops::DerefMut;

use super::mutex::MutexGuard;
use super::spinlock::SpinLock;
use super::yieldlock::YieldLockGuard;
use crate::task::scheduler::Scheduler;
use crate::task::thread::Thread;

/// A held lock that can be released and taken again around a wait.
pub trait Relock<'a>: DerefMut + Sized {
    type Lock: 'a;

    fn release(self) -> Self::Lock;
    fn reacquire(lock: Self::Lock, sched: &'a Scheduler) -> Self;
}

impl<'a, T: 'a> Relock<'a> for YieldLockGuard<'a, T> {
    type Lock = &'a super::YieldLock<T>;

    fn release(self) -> Self::Lock {
        YieldLockGuard::source(&self)
    }

    fn reacquire(lock: Self::Lock, sched: &'a Scheduler) -> Self {
        lock.lock(sched)
    }
}

impl<'a, T: 'a> Relock<'a> for MutexGuard<'a, T> {
    type Lock = &'a super::Mutex<T>;

    fn release(self) -> Self::Lock {
        MutexGuard::source(&self).0
    }

    fn reacquire(lock: Self::Lock, sched: &'a Scheduler) -> Self {
        lock.lock(sched)
    }
}

pub struct CondVar {
    waiters: SpinLock<VecDeque<Arc<Thread>>>,
}

impl CondVar {
    pub const fn new() -> Self {
        Self {
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    /// Block until `condition` holds for the data behind `guard`; returns
    /// the re-acquired guard.
    pub fn wait_until<'a, G>(
        &self,
        sched: &'a Scheduler,
        mut guard: G,
        mut condition: impl FnMut(&mut G::Target) -> bool,
    ) -> G
    where
        G: Relock<'a>,
    {
        while !condition(&mut *guard) {
            let mut lock = None;
            sched.block_on(|me| {
                self.waiters.lock(sched).push_back(me.clone());
                lock = Some(guard.release());
            });
            match lock {
                Some(lock) => guard = G::reacquire(lock, sched),
                None => unreachable!("condvar park did not run"),
            }
        }
        guard
    }

    /// Wake the oldest waiter, if any.
    pub fn notify(&self, sched: &Scheduler) {
        let next = self.waiters.lock(sched).pop_front();
        if let Some(thread) = next {
            sched.wake(&thread);
        }
    }

    pub fn notify_all(&self, sched: &Scheduler) {
        let woken: VecDeque<_> = core::mem::take(&mut *self.waiters.lock(sched));
        for thread in woken {
            sched.wake(&thread);
        }
    }

    pub fn waiter_count(&self, sched: &Scheduler) -> usize {
        self.waiters.lock(sched).len()
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}
