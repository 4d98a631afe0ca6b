//! Data owned by "whoever runs with interrupts off".
//!
//! On a single CPU, masking interrupts is enough to exclude both other
//! threads (no timer preemption) and interrupt handlers. The scheduler's
//! ready queue lives in an [`IrqCell`] because the timer and keyboard
//! handlers touch it.

use core::cell::UnsafeCell;

use crate::arch::Cpu;

pub struct IrqCell<T> {
    value: UnsafeCell<T>,
}

// SAFETY: every access goes through `with`, which masks interrupts on the
// only CPU, so no two contexts ever hold the reference at once.
unsafe impl<T: Send> Sync for IrqCell<T> {}
unsafe impl<T: Send> Send for IrqCell<T> {}

impl<T> IrqCell<T> {
    pub const fn new(value: T) -> Self {
        Self {
            value: UnsafeCell::new(value),
        }
    }

    /// Run `f` with interrupts masked, restoring the previous interrupt
    /// state afterwards.
    ///
    /// `f` must not call back into `with` on the same cell, nor switch
    /// threads.
    pub fn with<R>(&self, cpu: &dyn Cpu, f: impl FnOnce(&mut T) -> R) -> R {
        let irq_was_enabled = cpu.interrupts_enabled();
        cpu.disable_interrupts();
        // SAFETY: interrupts are off and callers never nest `with`.
        let result = f(unsafe { &mut *self.value.get() });
        if irq_was_enabled {
            cpu.enable_interrupts();
        }
        result
    }
}
