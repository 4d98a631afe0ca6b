//! Initial kernel-stack layouts for x86_64 contexts.
//!
//! The top of every kernel stack holds an [`InterruptFrame`]: the user
//! register state saved by the syscall/interrupt entry stubs when a thread
//! traps in from ring 3, in the order they push it. Directly below sits the
//! [`SwitchFrame`] that `context_switch_asm` pops when it first resumes a
//! context:
//!
//! ```text
//!   top ──────────────►  ┌──────────────────────┐
//!                        │ InterruptFrame (160) │  ss rsp rflags cs rip rax … r15
//!   top - 160 ────────►  ├──────────────────────┤
//!                        │ SwitchFrame (56)     │  rip rbp rbx r12 r13 r14 r15
//!   top - 216 = sp ───►  └──────────────────────┘
//! ```
//!
//! A switch to `sp` pops r15..rbp and `ret`s into `SwitchFrame::rip`:
//!   - kernel thread: the kernel trampoline, with the boxed entry in r12
//!   - user thread / fork child: the user trampoline, which pops the
//!     interrupt frame's general registers and `iretq`s to ring 3

use crate::task::context::KernelStack;

/// RFLAGS: Interrupt Flag, set so user threads take interrupts in Ring 3.
pub const RFLAGS_IF: u64 = 1 << 9;

/// RFLAGS: reserved bit 1, always set.
pub const RFLAGS_RESERVED1: u64 = 1 << 1;

/// Callee-saved registers popped by `context_switch_asm`, lowest address
/// first. Layout must match its push/pop order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct SwitchFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rip: u64, // return address (pushed by `call`)
}

/// User register state, lowest address first: general registers in the
/// order the entry stubs push them, then the five quadwords `iretq` pops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct InterruptFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

pub const INTERRUPT_FRAME_SIZE: usize = size_of::<InterruptFrame>();
pub const SWITCH_FRAME_SIZE: usize = size_of::<SwitchFrame>();

/// Ring 3 segment selectors (RPL 3 included).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserSelectors {
    pub code: u16,
    pub data: u16,
}

impl Default for UserSelectors {
    /// User CS = 0x20 | 3 = 0x23, User SS = 0x18 | 3 = 0x1b
    fn default() -> Self {
        Self {
            code: 0x23,
            data: 0x1b,
        }
    }
}

fn interrupt_frame_offset(stack: &KernelStack) -> usize {
    stack.len() - INTERRUPT_FRAME_SIZE
}

fn switch_frame_offset(stack: &KernelStack) -> usize {
    interrupt_frame_offset(stack) - SWITCH_FRAME_SIZE
}

fn initial_sp(stack: &KernelStack) -> usize {
    (stack.bottom() as usize) + switch_frame_offset(stack)
}

pub fn read_interrupt_frame(stack: &KernelStack) -> InterruptFrame {
    stack.read(interrupt_frame_offset(stack))
}

pub fn read_switch_frame(stack: &KernelStack) -> SwitchFrame {
    stack.read(switch_frame_offset(stack))
}

/// Kernel thread: `trampoline` runs with `arg` in r12.
pub fn kernel_frame(stack: &mut KernelStack, trampoline: u64, arg: u64) -> usize {
    let at = switch_frame_offset(stack);
    stack.write(interrupt_frame_offset(stack), InterruptFrame::default());
    stack.write(
        at,
        SwitchFrame {
            r12: arg,
            rip: trampoline,
            ..SwitchFrame::default()
        },
    );
    initial_sp(stack)
}

/// User thread: `trampoline` irets to `entry` in ring 3 with interrupts on.
/// The user stack pointer and arguments are filled in by
/// [`set_user_registers`].
pub fn user_frame(stack: &mut KernelStack, trampoline: u64, selectors: UserSelectors, entry: u64) -> usize {
    stack.write(
        interrupt_frame_offset(stack),
        InterruptFrame {
            rip: entry,
            cs: selectors.code as u64,
            rflags: RFLAGS_IF | RFLAGS_RESERVED1,
            ss: selectors.data as u64,
            ..InterruptFrame::default()
        },
    );
    stack.write(
        switch_frame_offset(stack),
        SwitchFrame {
            rip: trampoline,
            ..SwitchFrame::default()
        },
    );
    initial_sp(stack)
}

/// `main(argc, argv)` per the SysV ABI: rdi = argc, rsi = argv.
pub fn set_user_registers(stack: &mut KernelStack, user_sp: u64, argc: u64, argv: u64) {
    let at = interrupt_frame_offset(stack);
    let mut frame: InterruptFrame = stack.read(at);
    frame.rsp = user_sp;
    frame.rdi = argc;
    frame.rsi = argv;
    stack.write(at, frame);
}

/// Fork child: the stack already holds a copy of the parent's interrupt
/// frame. Zero rax (the child's fork result) and resume through the user
/// trampoline instead of the parent's saved kernel call chain.
pub fn fork_frame(stack: &mut KernelStack, trampoline: u64) -> usize {
    let at = interrupt_frame_offset(stack);
    let mut frame: InterruptFrame = stack.read(at);
    frame.rax = 0;
    stack.write(at, frame);
    stack.write(
        switch_frame_offset(stack),
        SwitchFrame {
            rip: trampoline,
            ..SwitchFrame::default()
        },
    );
    initial_sp(stack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PAGE_SIZE;

    const KERNEL_TRAMPOLINE: u64 = 0xffff_8000_0010_0000;
    const USER_TRAMPOLINE: u64 = 0xffff_8000_0010_0040;

    #[test]
    fn frame_sizes_match_the_assembly() {
        assert_eq!(INTERRUPT_FRAME_SIZE, 20 * 8);
        assert_eq!(SWITCH_FRAME_SIZE, 7 * 8);
    }

    #[test]
    fn kernel_frame_sits_below_the_interrupt_frame_and_is_abi_aligned() {
        let mut stack = KernelStack::new(4 * PAGE_SIZE).unwrap();
        let sp = kernel_frame(&mut stack, KERNEL_TRAMPOLINE, 0x1234);

        assert_eq!(sp as u64, stack.top() - 216);
        // After `ret` pops rip the trampoline runs with rsp 16-aligned, so
        // its `call` enters Rust code with the ABI's 8 mod 16.
        assert_eq!((sp + 56) % 16, 0);

        // Popped in order r15, r14, r13, r12, rbx, rbp, then `ret`.
        let words: [u64; 7] = stack.read(sp - stack.bottom() as usize);
        assert_eq!(words, [0, 0, 0, 0x1234, 0, 0, KERNEL_TRAMPOLINE]);
    }

    #[test]
    fn user_frame_irets_to_ring3_with_interrupts_enabled() {
        let mut stack = KernelStack::new(4 * PAGE_SIZE).unwrap();
        let sp = user_frame(&mut stack, USER_TRAMPOLINE, UserSelectors::default(), 0x40_1000);
        set_user_registers(&mut stack, 0x7fff_ffbf_ffe8, 2, 0x7fff_ffbf_fff0);

        assert_eq!(read_switch_frame(&stack).rip, USER_TRAMPOLINE);
        let frame = read_interrupt_frame(&stack);
        assert_eq!(frame.rip, 0x40_1000);
        assert_eq!(frame.cs, 0x23);
        assert_eq!(frame.ss, 0x1b);
        assert_eq!(frame.rflags, 0x202);
        assert_eq!((frame.rsp, frame.rdi, frame.rsi), (0x7fff_ffbf_ffe8, 2, 0x7fff_ffbf_fff0));

        // The iretq quintet occupies the last 40 bytes of the stack.
        let iret: [u64; 5] = stack.read(stack.len() - 40);
        assert_eq!(iret, [0x40_1000, 0x23, 0x202, 0x7fff_ffbf_ffe8, 0x1b]);
        assert_eq!(sp as u64 + 216, stack.top());
    }

    #[test]
    fn fork_frame_zeroes_rax_and_keeps_the_parent_registers() {
        let mut parent = KernelStack::new(4 * PAGE_SIZE).unwrap();
        user_frame(&mut parent, USER_TRAMPOLINE, UserSelectors::default(), 0x40_2000);
        let mut saved = read_interrupt_frame(&parent);
        saved.rax = 1; // syscall number of fork
        saved.rbx = 0xb0b;
        saved.rsp = 0x7fff_0000_1000;
        parent.write(parent.len() - INTERRUPT_FRAME_SIZE, saved);

        let mut child = KernelStack::new(4 * PAGE_SIZE).unwrap();
        child.copy_from(&parent);
        let sp = fork_frame(&mut child, USER_TRAMPOLINE);

        let frame = read_interrupt_frame(&child);
        assert_eq!(frame.rax, 0);
        assert_eq!(frame.rbx, 0xb0b);
        assert_eq!(frame.rsp, 0x7fff_0000_1000);
        assert_eq!(frame.rip, 0x40_2000);
        assert_eq!(read_switch_frame(&child).rip, USER_TRAMPOLINE);
        assert_eq!(sp as u64, child.top() - 216);
        // The parent is untouched.
        assert_eq!(read_interrupt_frame(&parent).rax, 1);
    }
}
