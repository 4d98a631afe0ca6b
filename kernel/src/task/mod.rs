//! Threads, processes and the scheduler.

pub mod context;
pub mod id_pool;
pub mod input;
pub mod process;
pub mod scheduler;
pub mod thread;
