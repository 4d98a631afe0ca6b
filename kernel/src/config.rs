//! Boot-time tunables for the task core.

use klog::Level;

use crate::error::{Error, Result};
use crate::memory::PAGE_SIZE;

/// Configuration handed to [`crate::Kernel::boot`].
///
/// Everything here is fixed for the lifetime of the kernel.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Bytes of kernel stack per thread (whole pages).
    pub kernel_stack_size: usize,
    /// Timeslice, in timer ticks, of threads created without an explicit priority.
    pub default_priority: u32,
    /// Timeslice of the reaper thread.
    pub reaper_priority: u32,
    /// Thread id pool: initial capacity and hard maximum.
    pub thread_ids: (usize, usize),
    /// Process id pool: initial capacity and hard maximum.
    pub process_ids: (usize, usize),
    /// Highest user stack address; slot N sits N slots below it.
    pub user_stack_top: u64,
    /// Bytes reserved for each user thread stack (whole pages).
    pub user_stack_size: u64,
    /// User stack slots per process, i.e. the per-process user thread limit.
    pub max_user_threads: usize,
    /// User address of the `thread_exit` syscall stub that user `main`
    /// returns into.
    pub thread_exit_stub: u64,
    /// Minimum level that reaches the log sink.
    pub log_level: Level,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            kernel_stack_size: 16 * 1024,
            default_priority: 10,
            reaper_priority: 5,
            thread_ids: (2048, 32768),
            process_ids: (1024, 16384),
            user_stack_top: 0x0000_7FFF_FFC0_0000,
            user_stack_size: 64 * 1024,
            max_user_threads: 4096,
            thread_exit_stub: 0x0000_7FFF_FFFF_F000,
            log_level: Level::Info,
        }
    }
}

impl KernelConfig {
    /// Rejects values the core cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.kernel_stack_size == 0 || self.kernel_stack_size % PAGE_SIZE != 0 {
            return Err(Error::InvalidConfig("kernel stack size must be whole pages"));
        }
        if self.default_priority == 0 || self.reaper_priority == 0 {
            return Err(Error::InvalidConfig("priorities are timeslices and must be positive"));
        }
        for (initial, max) in [self.thread_ids, self.process_ids] {
            if initial == 0 || initial > max {
                return Err(Error::InvalidConfig("id pool initial size must be in 1..=max"));
            }
        }
        if self.user_stack_size == 0 || self.user_stack_size % PAGE_SIZE as u64 != 0 {
            return Err(Error::InvalidConfig("user stack size must be whole pages"));
        }
        if self.max_user_threads == 0 {
            return Err(Error::InvalidConfig("processes need at least one user stack slot"));
        }
        let reserved = self.user_stack_size.checked_mul(self.max_user_threads as u64);
        match reserved {
            Some(bytes) if bytes <= self.user_stack_top => Ok(()),
            _ => Err(Error::InvalidConfig("user stack slots do not fit below the stack top")),
        }
    }
}
