//! Context switch and first-entry trampolines.
//!
//! Stack layouts these rely on are built in `frame.rs`.

use alloc::boxed::Box;

use crate::arch::KernelEntry;

core::arch::global_asm!(
    ".global context_switch_asm",
    "context_switch_asm:",
    // rdi = &mut old_thread.saved_sp
    // rsi = new_thread.saved_sp
    //
    // Save callee-saved registers on old stack
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    // Save old RSP
    "mov [rdi], rsp",
    // Load new RSP
    "mov rsp, rsi",
    // Restore callee-saved registers from new stack
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    // Return to wherever the new thread left off (pops RIP from stack)
    "ret",
    //
    // First entry of a kernel thread: r12 holds the boxed entry closure.
    ".global kernel_entry_trampoline",
    "kernel_entry_trampoline:",
    "mov rdi, r12",
    "sti",
    "call kernel_thread_start",
    "ud2",
    //
    // First entry of a user thread or fork child: restore the interrupt
    // frame's general registers and return to ring 3.
    ".global user_entry_trampoline",
    "user_entry_trampoline:",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop r11",
    "pop r10",
    "pop r9",
    "pop r8",
    "pop rbp",
    "pop rdi",
    "pop rsi",
    "pop rdx",
    "pop rcx",
    "pop rbx",
    "pop rax",
    "iretq",
);

unsafe extern "C" {
    /// Raw assembly context switch.
    ///
    /// Saves callee-saved registers on old stack, writes RSP to `*old_rsp_ptr`,
    /// loads new RSP, restores registers, and `ret`s to the new thread's saved RIP.
    fn context_switch_asm(old_rsp_ptr: *mut usize, new_rsp: usize);

    pub fn kernel_entry_trampoline();
    pub fn user_entry_trampoline();
}

/// # Safety
/// See [`crate::arch::Cpu::switch_context`].
pub unsafe fn context_switch(old_rsp_ptr: *mut usize, new_rsp: usize) {
    unsafe { context_switch_asm(old_rsp_ptr, new_rsp) }
}

/// Called (once) by `kernel_entry_trampoline` on a new kernel thread.
#[unsafe(no_mangle)]
extern "C" fn kernel_thread_start(entry: *mut KernelEntry) -> ! {
    // SAFETY: `entry` was produced by `Box::into_raw` in `prepare_context`
    // and is consumed exactly once, here.
    let entry = unsafe { Box::from_raw(entry) };
    (*entry)();
    // The thread manager ends every entry in the thread-exit path.
    loop {
        x86_64::instructions::hlt();
    }
}
