// =============================================================================
// taskcore — Synchronization Primitives
// =============================================================================
//
// Four locks, chosen by blocking strategy and interrupt safety:
//
//   SpinLock   busy-waits with preemption disabled; `lock_irqsave` also
//              masks interrupts. Short sections only, never across a yield.
//              The only lock interrupt handlers may take.
//   YieldLock  retries its CAS, giving the CPU away between attempts.
//              Longer sections, thread context only.
//   Mutex      parks the caller on a FIFO wait queue; unlock hands the
//              lock straight to the oldest waiter.
//   CondVar    waits on a predicate guarded by a YieldLock or Mutex.
//
// `IrqCell` is not a lock: it is the interrupt-disable discipline the
// scheduler uses for the ready queue, which timer and keyboard handlers
// touch as well.
//
// Lock ordering: a process lock is never held while taking another process
// lock. SpinLocks are innermost.
// =============================================================================

pub mod condvar;
pub mod irq;
pub mod mutex;
pub mod spinlock;
pub mod yieldlock;

pub use condvar::CondVar;
pub use irq::IrqCell;
pub use mutex::{Mutex, MutexGuard};
pub use spinlock::{SpinLock, SpinLockGuard};
pub use yieldlock::{YieldLock, YieldLockGuard};
