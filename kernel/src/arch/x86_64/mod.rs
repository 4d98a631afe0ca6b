// =============================================================================
// taskcore — x86_64 backend
// =============================================================================
//
// frame.rs   — initial kernel-stack layouts (pure memory, tested on the host)
// switch.rs  — context_switch_asm and the first-entry trampolines
//
// `X86Cpu` ties them to the real interrupt flag and HLT. It only exists on
// the bare-metal target; everything else builds anywhere.
// =============================================================================

pub mod frame;

#[cfg(target_os = "none")]
mod switch;

#[cfg(target_os = "none")]
pub use cpu::X86Cpu;

#[cfg(target_os = "none")]
mod cpu {
    use alloc::boxed::Box;

    use super::frame::{self, UserSelectors};
    use super::switch;
    use crate::arch::{Cpu, ThreadStart};
    use crate::task::context::KernelStack;

    /// The bare-metal CPU.
    ///
    /// The GDT/TSS are owned by the boot code; it hands us the ring 3
    /// selectors and a hook that stores a new RSP0 in the TSS.
    pub struct X86Cpu {
        selectors: UserSelectors,
        set_rsp0: fn(u64),
    }

    impl X86Cpu {
        pub const fn new(selectors: UserSelectors, set_rsp0: fn(u64)) -> Self {
            Self {
                selectors,
                set_rsp0,
            }
        }
    }

    impl Cpu for X86Cpu {
        fn interrupts_enabled(&self) -> bool {
            x86_64::instructions::interrupts::are_enabled()
        }

        fn disable_interrupts(&self) {
            x86_64::instructions::interrupts::disable();
        }

        fn enable_interrupts(&self) {
            x86_64::instructions::interrupts::enable();
        }

        /// Halts the CPU until the next interrupt arrives (timer, device IRQ).
        fn wait_for_interrupt(&self) {
            x86_64::instructions::hlt();
        }

        fn prepare_context(&self, stack: &mut KernelStack, start: ThreadStart) -> usize {
            let user_entry = switch::user_entry_trampoline as usize as u64;
            match start {
                ThreadStart::Kernel(entry) => {
                    // Double box: a thin pointer fits in r12.
                    let raw = Box::into_raw(Box::new(entry)) as u64;
                    frame::kernel_frame(stack, switch::kernel_entry_trampoline as usize as u64, raw)
                }
                ThreadStart::User { entry } => frame::user_frame(stack, user_entry, self.selectors, entry),
                ThreadStart::ForkReturn => frame::fork_frame(stack, user_entry),
            }
        }

        fn set_user_stack(&self, stack: &mut KernelStack, user_sp: u64, argc: u64, argv: u64) {
            frame::set_user_registers(stack, user_sp, argc, argv);
        }

        unsafe fn switch_context(&self, from_sp: *mut usize, to_sp: usize) {
            // SAFETY: forwarded from the caller's contract.
            unsafe { switch::context_switch(from_sp, to_sp) }
        }

        fn set_kernel_stack_top(&self, top: u64) {
            (self.set_rsp0)(top);
        }
    }
}
