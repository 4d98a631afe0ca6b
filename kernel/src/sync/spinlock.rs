// =============================================================================
// taskcore — Preemption-aware Spinlock
// =============================================================================
//
// A spinlock for very short critical sections. Acquiring it first bumps the
// running thread's preemption counter, so the timer can mark the thread for
// rescheduling but `schedule()` will not switch away while the lock is held.
// On a single CPU that alone guarantees the spin loop never actually spins
// against another thread.
//
// IRQ SAFETY:
//   An interrupt handler that takes a lock the interrupted thread already
//   holds would spin forever. Locks shared with handlers use
//   `lock_irqsave()`, which masks interrupts BEFORE acquiring and remembers
//   whether they were enabled, restoring that exact state on unlock so
//   nested lock/unlock pairs compose.
//
// Never yield or block while holding a SpinLock.
// =============================================================================

use core::ops::{Deref, DerefMut};

use crate::task::scheduler::Scheduler;

/// Mutual exclusion for short sections, usable from interrupt handlers
/// (through [`SpinLock::lock_irqsave`]).
pub struct SpinLock<T> {
    inner: spin::Mutex<T>,
}

impl<T> SpinLock<T> {
    /// Creates a new, unlocked spinlock. Usable in statics.
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    /// Acquires the lock with preemption disabled.
    pub fn lock<'a>(&'a self, sched: &'a Scheduler) -> SpinLockGuard<'a, T> {
        sched.preempt_disable();
        SpinLockGuard {
            guard: Some(self.inner.lock()),
            sched,
            irq_was_enabled: None,
        }
    }

    /// Acquires the lock with preemption AND interrupts disabled.
    ///
    /// The previous interrupt state is restored when the guard drops:
    ///   - enabled before → re-enabled on unlock
    ///   - already disabled → stays disabled
    pub fn lock_irqsave<'a>(&'a self, sched: &'a Scheduler) -> SpinLockGuard<'a, T> {
        let cpu = sched.cpu();
        let irq_was_enabled = cpu.interrupts_enabled();
        cpu.disable_interrupts();
        sched.preempt_disable();
        SpinLockGuard {
            guard: Some(self.inner.lock()),
            sched,
            irq_was_enabled: Some(irq_was_enabled),
        }
    }
}

/// RAII guard for a held spinlock.
///
/// Dropping it releases the lock, restores the saved interrupt state (for
/// `lock_irqsave`) and re-enables preemption, in that order.
pub struct SpinLockGuard<'a, T> {
    guard: Option<spin::MutexGuard<'a, T>>,
    sched: &'a Scheduler,
    irq_was_enabled: Option<bool>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.guard {
            Some(guard) => guard,
            None => unreachable!("spinlock guard used after release"),
        }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.guard {
            Some(guard) => guard,
            None => unreachable!("spinlock guard used after release"),
        }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        drop(self.guard.take());
        if self.irq_was_enabled == Some(true) {
            self.sched.cpu().enable_interrupts();
        }
        self.sched.preempt_enable();
    }
}
