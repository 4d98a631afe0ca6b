// =============================================================================
// taskcore — Architecture Abstraction
// =============================================================================
//
// The scheduler never touches registers or stack layouts directly. It talks
// to a `Cpu`:
//   - interrupt flag control and HLT
//   - building the initial saved context on a new kernel stack
//   - the register/stack swap itself
//   - telling the hardware which kernel stack to use on ring 3 → 0 entry
//
// `x86_64` is the bare-metal implementation. `hosted` (tests only) runs each
// kernel thread on a host thread and passes a single "CPU baton" between
// them, so blocking paths really block and only one thread runs at a time.
// =============================================================================

use alloc::boxed::Box;

use crate::task::context::KernelStack;

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(test)]
pub mod hosted;

/// Entry body of a kernel thread. Never returns: the thread manager wraps it
/// so it ends in the thread-exit path.
pub type KernelEntry = Box<dyn FnOnce() + Send>;

/// How a freshly built context begins executing when first switched to.
pub enum ThreadStart {
    /// Run the closure in ring 0 with interrupts enabled.
    Kernel(KernelEntry),
    /// Drop to ring 3 at `entry`; the user stack is supplied afterwards via
    /// [`Cpu::set_user_stack`].
    User { entry: u64 },
    /// The stack is a byte copy of a thread that entered the kernel from
    /// ring 3; return to the same user instruction with a result of 0.
    ForkReturn,
}

pub trait Cpu: Send + Sync {
    fn interrupts_enabled(&self) -> bool;
    fn disable_interrupts(&self);
    fn enable_interrupts(&self);

    /// Sleep until the next interrupt (HLT). With interrupts disabled this
    /// never returns.
    fn wait_for_interrupt(&self);

    /// Lay out `stack` so that switching to the returned stack pointer
    /// begins execution as described by `start`.
    fn prepare_context(&self, stack: &mut KernelStack, start: ThreadStart) -> usize;

    /// Record the initial user stack pointer and `main(argc, argv)`
    /// arguments of a context built with [`ThreadStart::User`].
    fn set_user_stack(&self, stack: &mut KernelStack, user_sp: u64, argc: u64, argv: u64);

    /// Save the running context, storing its stack pointer through
    /// `from_sp`, and resume the context saved at `to_sp`. Returns when some
    /// later switch resumes the saved context.
    ///
    /// # Safety
    /// Interrupts must be disabled. `from_sp` must stay valid until the
    /// saved context is resumed (or forever, for a dead thread), and `to_sp`
    /// must come from `prepare_context` or an earlier switch.
    unsafe fn switch_context(&self, from_sp: *mut usize, to_sp: usize);

    /// Kernel stack used when the next thread traps in from ring 3.
    fn set_kernel_stack_top(&self, top: u64);
}

/// Body of the embedding kernel's `#[panic_handler]`.
///
/// A panic in the core is a broken invariant: report it and stop the CPU.
/// There is no unwinding and no recovery.
pub fn halt_on_panic(cpu: &dyn Cpu, info: &core::panic::PanicInfo) -> ! {
    cpu.disable_interrupts();
    match info.location() {
        Some(at) => klog::error!("KERNEL PANIC at {}:{}: {}", at.file(), at.line(), info.message()),
        None => klog::error!("KERNEL PANIC: {}", info.message()),
    }
    klog::error!("system halted");
    loop {
        cpu.wait_for_interrupt();
    }
}
