//! Blocking mutex with FIFO hand-off.
//!
//! A contended `lock` parks the caller on the mutex's wait queue. `unlock`
//! never releases the lock while someone waits: it pops the oldest waiter,
//! records it as the new owner and wakes it, so late arrivals cannot barge
//! ahead. The wait queue itself is protected by a [`YieldLock`] that is
//! only ever held with preemption disabled, so it is never found contended:
//! a condvar can release the mutex after its caller is already marked
//! blocked without the release yielding.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use super::yieldlock::YieldLock;
use crate::task::scheduler::Scheduler;
use crate::task::thread::{Thread, ThreadId};

struct MutexState {
    locked: bool,
    /// Set by `unlock` when ownership passes to a parked waiter.
    handed_to: Option<ThreadId>,
    waiters: VecDeque<Arc<Thread>>,
}

pub struct Mutex<T> {
    state: YieldLock<MutexState>,
    data: UnsafeCell<T>,
}

// SAFETY: `state.locked` grants exclusive access to `data`.
unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            state: YieldLock::new(MutexState {
                locked: false,
                handed_to: None,
                waiters: VecDeque::new(),
            }),
            data: UnsafeCell::new(value),
        }
    }

    pub fn lock<'a>(&'a self, sched: &'a Scheduler) -> MutexGuard<'a, T> {
        let me = sched.current();
        loop {
            sched.preempt_disable();
            let mut state = self.state.lock(sched);
            let acquired = if !state.locked {
                state.locked = true;
                true
            } else if state.handed_to == Some(me.id()) {
                state.handed_to = None;
                true
            } else {
                if !state.waiters.iter().any(|t| Arc::ptr_eq(t, &me)) {
                    state.waiters.push_back(me.clone());
                }
                false
            };
            if acquired {
                drop(state);
                sched.preempt_enable();
                break;
            }
            sched.block_on(move |_| drop(state));
            sched.preempt_enable();
        }
        MutexGuard { mutex: self, sched }
    }

    fn with_state<R>(&self, sched: &Scheduler, f: impl FnOnce(&mut MutexState) -> R) -> R {
        sched.preempt_disable();
        let result = f(&mut *self.state.lock(sched));
        sched.preempt_enable();
        result
    }

    pub fn try_lock<'a>(&'a self, sched: &'a Scheduler) -> Option<MutexGuard<'a, T>> {
        let acquired = self.with_state(sched, |state| !core::mem::replace(&mut state.locked, true));
        acquired.then_some(MutexGuard { mutex: self, sched })
    }

    fn unlock(&self, sched: &Scheduler) {
        let next = self.with_state(sched, |state| match state.waiters.pop_front() {
            Some(next) => {
                state.handed_to = Some(next.id());
                Some(next)
            }
            None => {
                state.locked = false;
                None
            }
        });
        if let Some(next) = next {
            sched.wake(&next);
        }
    }

    pub fn is_locked(&self, sched: &Scheduler) -> bool {
        self.with_state(sched, |state| state.locked)
    }
}

pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
    sched: &'a Scheduler,
}

impl<'a, T> MutexGuard<'a, T> {
    /// The mutex this guard holds, for re-acquiring after a condvar wait.
    pub fn source(guard: &Self) -> (&'a Mutex<T>, &'a Scheduler) {
        (guard.mutex, guard.sched)
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves we own the mutex.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves we own the mutex.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock(self.sched);
    }
}
