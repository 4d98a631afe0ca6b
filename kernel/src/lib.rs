// =============================================================================
// taskcore — Process, Thread and Scheduling Core
// =============================================================================
//
// The part of a single-CPU preemptible kernel that decides what runs:
//
//   sync/       spinlock, yield-lock, blocking mutex, condition variable
//   task/       threads, processes, the round-robin scheduler and reaper,
//               the keyboard input queue
//   syscall     number decoding and dispatch into the process manager
//
// Everything it does not own comes in through traits at boot:
//
//   Cpu                 interrupt flag, HLT, context build and switch
//   AddressSpaces       clone / release / map / switch / free
//   FileSystem          stat / read / write / list_dir
//   ExecutableLoader    validate and map an executable image
//
// BOOT SEQUENCE (Kernel::boot):
//   1. Validate the configuration and set the log level
//   2. Create process 0, the root, in the kernel address space
//   3. Adopt the boot context as thread 0 (main, also the idle thread)
//   4. Start the reaper kernel thread
//   5. Enable interrupts: from here on the timer preempts
//
// Then `start_init` turns process 1 into the first user program and the
// boot thread falls into `idle()`.
// =============================================================================

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod error;
pub mod fs;
pub mod memory;
pub mod sync;
pub mod syscall;
pub mod task;

#[cfg(test)]
pub(crate) mod testing;

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec;

pub use config::KernelConfig;
pub use error::{Error, Result};

use arch::Cpu;
use fs::FileSystem;
use fs::elf::ExecutableLoader;
use memory::AddressSpaces;
use task::input::InputQueue;
use task::process::{Pid, ProcessManager};
use task::scheduler::Scheduler;
use task::thread::{ThreadEntry, ThreadManager};

/// Collaborators the core is built on.
#[derive(Clone)]
pub struct Services {
    pub cpu: Arc<dyn Cpu>,
    pub vm: Arc<dyn AddressSpaces>,
    pub fs: Arc<dyn FileSystem>,
    pub loader: Arc<dyn ExecutableLoader>,
}

/// The kernel context: every manager, reached through one `&'static`
/// reference instead of globals.
pub struct Kernel {
    config: KernelConfig,
    vm: Arc<dyn AddressSpaces>,
    fs: Arc<dyn FileSystem>,
    loader: Arc<dyn ExecutableLoader>,
    pub threads: ThreadManager,
    pub processes: ProcessManager,
    pub scheduler: Scheduler,
    pub input: InputQueue,
}

impl Kernel {
    /// Bring up the task core on the boot context.
    ///
    /// Must be called once, with interrupts disabled, before anything can
    /// block. Returns with the caller running as thread 0 and interrupts
    /// enabled.
    pub fn boot(config: KernelConfig, services: Services) -> Result<&'static Kernel> {
        config.validate()?;
        klog::set_max_level(config.log_level);

        let Services { cpu, vm, fs, loader } = services;
        let (initial, max) = config.thread_ids;
        let threads = ThreadManager::new(initial, max);
        let (initial, max) = config.process_ids;
        let processes = ProcessManager::new(initial, max);
        let kernel: &'static Kernel = Box::leak(Box::new(Kernel {
            scheduler: Scheduler::new(cpu, vm.clone()),
            config,
            vm,
            fs,
            loader,
            threads,
            processes,
            input: InputQueue::new(),
        }));

        let root = kernel.create_root_process()?;
        let main = kernel
            .threads
            .adopt_boot_thread(kernel.config.default_priority, kernel.vm.kernel_space());
        main.set_process(Some(root.clone()));
        root.attach_thread(&kernel.scheduler, &main);
        kernel.scheduler.start(main);

        let reaper = kernel.create_thread(
            &root,
            "reaper",
            ThreadEntry::Kernel(Box::new(move || kernel.reap_forever())),
            kernel.config.reaper_priority,
        )?;
        kernel.scheduler.add(reaper);

        kernel.scheduler.cpu().enable_interrupts();
        klog::info!(
            "taskcore: booted ({} KiB kernel stacks, timeslice {} ticks)",
            kernel.config.kernel_stack_size / 1024,
            kernel.config.default_priority
        );
        Ok(kernel)
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Create process 1 and have it `exec` the program at `path`.
    ///
    /// The process starts as a copy of the caller's address space with one
    /// kernel thread; the exec turns it into a user process. If the exec
    /// fails the thread logs the error and process 1 ends.
    pub fn start_init(&'static self, path: &str) -> Result<Pid> {
        let space = self.vm.clone_current().ok_or(Error::AddressSpaceClone)?;
        let root = self.processes.root();
        let init = match self.create_process("init", space, &root) {
            Ok(init) => init,
            Err(err) => {
                self.vm.release_user_space(space);
                self.vm.free(space);
                return Err(err);
            }
        };

        let kernel = self;
        let path = path.to_string();
        let body = move || {
            let argv = vec![path.clone()];
            if let Err(err) = kernel.exec(&path, &argv) {
                klog::error!("init: cannot exec {}: {}", path, err);
            }
        };
        let thread = match self.create_thread(&init, "init", ThreadEntry::Kernel(Box::new(body)), self.config.default_priority) {
            Ok(thread) => thread,
            Err(err) => {
                self.discard_process(&root, init);
                return Err(err);
            }
        };
        self.scheduler.add(thread);
        klog::info!("init: process {} starting", init.pid());
        Ok(init.pid())
    }

    /// The boot thread's final loop: give the CPU away while anything is
    /// runnable, otherwise halt until the next interrupt.
    pub fn idle(&self) -> ! {
        let cpu = self.scheduler.cpu();
        loop {
            if self.scheduler.ready_len() > 0 {
                self.scheduler.yield_now();
            } else {
                cpu.enable_interrupts();
                cpu.wait_for_interrupt();
            }
        }
    }

    /// Name of the program the calling thread's process runs.
    pub fn current_program(&self) -> Option<String> {
        self.scheduler.current().process().map(|p| p.name(&self.scheduler))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::process::ROOT_PID;
    use crate::task::thread::IDLE_TID;
    use crate::testing::{Machine, logged};
    use std::sync::Mutex as StdMutex;

    #[test]
    fn boot_adopts_the_main_thread_into_the_root_process() {
        let m = Machine::boot();
        let kernel = m.kernel;
        let main = kernel.scheduler.current();
        assert_eq!(main.id(), IDLE_TID);
        assert!(main.is_idle());
        assert!(main.is_running());

        let root = kernel.processes.root();
        assert_eq!(root.pid(), ROOT_PID);
        assert_eq!(root.space(), m.vm.kernel_space());
        // main plus the reaper
        assert_eq!(root.thread_count(&kernel.scheduler), 2);
        assert!(kernel.scheduler.cpu().interrupts_enabled());
        assert_eq!(kernel.current_program().as_deref(), Some("kernel"));
        assert!(logged("taskcore: booted"));
    }

    #[test]
    fn boot_rejects_a_bad_config() {
        let config = KernelConfig {
            kernel_stack_size: 1000,
            ..KernelConfig::default()
        };
        let err = Machine::try_boot_with(config, &[]).err();
        assert!(matches!(err, Some(Error::InvalidConfig(_))));
    }

    #[test]
    fn init_is_process_one_and_runs_its_program() {
        let m = Machine::with_binaries(&[("bin/init", 0x40_1000)]);
        let kernel = m.kernel;
        let seen: &'static StdMutex<Option<(Pid, String)>> = Box::leak(Box::new(StdMutex::new(None)));

        m.program(0x40_1000, move |_| {
            let process = kernel.scheduler.current().process().unwrap();
            *seen.lock().unwrap() = Some((process.pid(), process.name(&kernel.scheduler)));
        });
        let pid = kernel.start_init("bin/init").unwrap();
        assert_eq!(pid, Pid(1));
        m.settle();

        assert_eq!(*seen.lock().unwrap(), Some((Pid(1), "bin/init".to_string())));
        let root = kernel.processes.root();
        assert_eq!(root.zombies(&kernel.scheduler), [Pid(1)]);
    }

    #[test]
    fn init_without_a_program_ends_quietly() {
        let m = Machine::boot();
        let kernel = m.kernel;
        let pid = kernel.start_init("bin/missing").unwrap();
        m.settle();

        let init = kernel.processes.get(&kernel.scheduler, pid).unwrap();
        assert_eq!(init.exit_code(&kernel.scheduler), 0);
        assert!(logged("init: cannot exec bin/missing"));
    }
}
