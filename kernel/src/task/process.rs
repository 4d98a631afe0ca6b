//! Process control blocks and the fork/exec/wait/exit protocol.
//!
//! ```text
//!   fork ──► NORMAL ──exit / last thread──► EXITED ──► zombie in parent
//!                                                       │ wait()
//!                                                       ▼
//!                                               dead list ──► reaper
//! ```
//!
//! Every process field lives behind the process's own [`YieldLock`]. No
//! path holds two process locks at once: exit collects what it needs from
//! its own block, drops the lock, then takes the parent's.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use core::convert::Infallible;
use core::fmt;

use crate::Kernel;
use crate::error::{Error, Result};
use crate::fs::FileKind;
use crate::memory::AddressSpace;
use crate::sync::{SpinLock, YieldLock, YieldLockGuard};
use crate::task::context::packed_size;
use crate::task::id_pool::IdPool;
use crate::task::scheduler::Scheduler;
use crate::task::thread::{Thread, ThreadEntry, ThreadId, ThreadKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kernel main process, parent of everything.
pub const ROOT_PID: Pid = Pid(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Normal,
    Exited,
}

/// Which child a blocked `wait` is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    Any,
    Child(Pid),
}

impl WaitTarget {
    /// `wait(0)` means any child.
    pub fn from_raw(pid: u32) -> Self {
        match pid {
            0 => WaitTarget::Any,
            pid => WaitTarget::Child(Pid(pid)),
        }
    }

    fn matches(self, pid: Pid) -> bool {
        match self {
            WaitTarget::Any => true,
            WaitTarget::Child(wanted) => wanted == pid,
        }
    }
}

pub(crate) struct ProcessInner {
    name: String,
    kind: ThreadKind,
    status: ProcessStatus,
    exit_code: i32,
    parent: Weak<Process>,
    threads: BTreeMap<ThreadId, Arc<Thread>>,
    children: BTreeMap<Pid, Arc<Process>>,
    zombies: BTreeMap<Pid, Arc<Process>>,
    waiting_for: Option<WaitTarget>,
    waiter: Option<Arc<Thread>>,
    user_stacks: IdPool,
}

pub struct Process {
    pid: Pid,
    space: AddressSpace,
    inner: YieldLock<ProcessInner>,
}

impl Process {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn space(&self) -> AddressSpace {
        self.space
    }

    fn lock<'a>(&'a self, sched: &'a Scheduler) -> YieldLockGuard<'a, ProcessInner> {
        self.inner.lock(sched)
    }

    pub fn name(&self, sched: &Scheduler) -> String {
        self.lock(sched).name.clone()
    }

    /// Kernel processes become user processes on their first `exec`.
    pub fn kind(&self, sched: &Scheduler) -> ThreadKind {
        self.lock(sched).kind
    }

    pub fn status(&self, sched: &Scheduler) -> ProcessStatus {
        self.lock(sched).status
    }

    pub fn exit_code(&self, sched: &Scheduler) -> i32 {
        self.lock(sched).exit_code
    }

    pub fn parent(&self, sched: &Scheduler) -> Option<Arc<Process>> {
        self.lock(sched).parent.upgrade()
    }

    pub fn thread_count(&self, sched: &Scheduler) -> usize {
        self.lock(sched).threads.len()
    }

    pub fn has_thread(&self, sched: &Scheduler, id: ThreadId) -> bool {
        self.lock(sched).threads.contains_key(&id)
    }

    /// Live children.
    pub fn children(&self, sched: &Scheduler) -> Vec<Pid> {
        self.lock(sched).children.keys().copied().collect()
    }

    /// Exited children not yet collected by `wait`.
    pub fn zombies(&self, sched: &Scheduler) -> Vec<Pid> {
        self.lock(sched).zombies.keys().copied().collect()
    }

    pub(crate) fn alloc_user_stack(&self, sched: &Scheduler) -> Result<usize> {
        self.lock(sched)
            .user_stacks
            .alloc()
            .ok_or(Error::UserStacksExhausted)
    }

    pub(crate) fn free_user_stack(&self, sched: &Scheduler, slot: usize) {
        self.lock(sched).user_stacks.free(slot);
    }

    pub(crate) fn attach_thread(&self, sched: &Scheduler, thread: &Arc<Thread>) {
        let previous = self.lock(sched).threads.insert(thread.id(), thread.clone());
        assert!(previous.is_none(), "thread {} attached twice", thread.id());
    }

    /// Remove `thread` and give back its user stack slot. Returns how many
    /// threads remain.
    ///
    /// # Panics
    /// If `thread` is not in this process.
    fn remove_thread(&self, sched: &Scheduler, thread: &Thread) -> usize {
        let mut inner = self.lock(sched);
        let removed = inner.threads.remove(&thread.id());
        match removed {
            Some(removed) if core::ptr::eq(&*removed, thread) => {}
            _ => panic!("thread {} is not in process {}", thread.id(), self.pid),
        }
        if let Some(slot) = thread.take_user_slot() {
            inner.user_stacks.free(slot);
        }
        inner.threads.len()
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("space", &self.space)
            .finish_non_exhaustive()
    }
}

/// Owns process identity and the pid → process table.
pub struct ProcessManager {
    ids: SpinLock<IdPool>,
    table: YieldLock<BTreeMap<Pid, Arc<Process>>>,
    root: spin::Once<Arc<Process>>,
}

impl ProcessManager {
    pub fn new(initial: usize, max: usize) -> Self {
        Self {
            ids: SpinLock::new(IdPool::new(initial, max)),
            table: YieldLock::new(BTreeMap::new()),
            root: spin::Once::new(),
        }
    }

    /// The kernel main process.
    ///
    /// # Panics
    /// Before boot.
    pub fn root(&self) -> Arc<Process> {
        match self.root.get() {
            Some(root) => root.clone(),
            None => panic!("process table used before boot"),
        }
    }

    pub fn get(&self, sched: &Scheduler, pid: Pid) -> Option<Arc<Process>> {
        self.table.lock(sched).get(&pid).cloned()
    }

    /// Processes not yet destroyed, zombies included.
    pub fn count(&self, sched: &Scheduler) -> usize {
        self.table.lock(sched).len()
    }
}

impl Kernel {
    fn new_process(
        &self,
        name: &str,
        space: AddressSpace,
        parent: Option<&Arc<Process>>,
        user_stacks: IdPool,
    ) -> Result<Arc<Process>> {
        let sched = &self.scheduler;
        let pid = self.processes.ids.lock(sched).alloc().ok_or(Error::ProcessIdsExhausted)?;
        let pid = Pid(pid as u32);
        let kind = match parent {
            Some(parent) => parent.kind(sched),
            None => ThreadKind::Kernel,
        };
        let process = Arc::new(Process {
            pid,
            space,
            inner: YieldLock::new(ProcessInner {
                name: name.to_string(),
                kind,
                status: ProcessStatus::Normal,
                exit_code: 0,
                parent: parent.map(Arc::downgrade).unwrap_or_default(),
                threads: BTreeMap::new(),
                children: BTreeMap::new(),
                zombies: BTreeMap::new(),
                waiting_for: None,
                waiter: None,
                user_stacks,
            }),
        });
        self.processes.table.lock(sched).insert(pid, process.clone());
        if let Some(parent) = parent {
            parent.lock(sched).children.insert(pid, process.clone());
        }
        klog::debug!("process: created {} '{}' in space {:#x}", pid, name, space.0);
        Ok(process)
    }

    /// Create the root process, which runs in the kernel address space.
    pub(crate) fn create_root_process(&self) -> Result<Arc<Process>> {
        let root = self.new_process("kernel", self.vm.kernel_space(), None, IdPool::fixed(1))?;
        assert_eq!(root.pid(), ROOT_PID, "root process must be pid 0");
        self.processes.root.call_once(|| root.clone());
        Ok(root)
    }

    /// Create an empty child of `parent` owning `space`.
    pub fn create_process(&self, name: &str, space: AddressSpace, parent: &Arc<Process>) -> Result<Arc<Process>> {
        let stacks = IdPool::fixed(self.config.max_user_threads);
        self.new_process(name, space, Some(parent), stacks)
    }

    /// Undo a `new_process` whose first thread could not be created.
    pub(crate) fn discard_process(&self, parent: &Arc<Process>, child: Arc<Process>) {
        let sched = &self.scheduler;
        parent.lock(sched).children.remove(&child.pid);
        self.vm.release_user_space(child.space);
        self.release_process(&child);
    }

    /// Forget `process` and give its pid and address space back. The user
    /// half of the space must already be released.
    fn release_process(&self, process: &Process) {
        let sched = &self.scheduler;
        self.processes.table.lock(sched).remove(&process.pid);
        self.processes.ids.lock(sched).free(process.pid.0 as usize);
        self.vm.free(process.space);
    }

    /// Reaper side of process teardown.
    pub(crate) fn destroy_process(&self, process: Arc<Process>) {
        klog::trace!("process: destroy {}", process.pid);
        self.release_process(&process);
    }

    /// Duplicate the calling user process. Returns the child's pid; the
    /// child's copy of the calling thread returns 0 from the same call.
    pub fn fork(&'static self) -> Result<Pid> {
        let sched = &self.scheduler;
        let current = sched.current();
        let parent = current.process().ok_or(Error::NoProcess)?;
        if current.kind() != ThreadKind::User {
            return Err(Error::NotUserThread);
        }

        let space = self.vm.clone_current().ok_or(Error::AddressSpaceClone)?;
        let (name, stacks) = {
            let inner = parent.lock(sched);
            (inner.name.clone(), inner.user_stacks.clone())
        };
        let child = match self.new_process(&name, space, Some(&parent), stacks) {
            Ok(child) => child,
            Err(err) => {
                self.vm.release_user_space(space);
                self.vm.free(space);
                return Err(err);
            }
        };
        let thread = match self.fork_thread(&current, &child) {
            Ok(thread) => thread,
            Err(err) => {
                klog::warn!("process: fork of {} failed: {}", parent.pid, err);
                self.discard_process(&parent, child);
                return Err(err);
            }
        };

        sched.add(thread);
        klog::info!("process: {} forked {}", parent.pid, child.pid);
        Ok(child.pid)
    }

    /// Replace the calling process's program with the executable at `path`.
    ///
    /// `args` is the new argv; an empty list runs the program with argv[0]
    /// = `path`. Lookup, read, image validation and an argv too large for
    /// a user stack slot all return with the process untouched. Past that
    /// point this never returns: the calling thread exits and the new
    /// program runs in a fresh user thread, or the process exits with -1 if
    /// the image cannot be set up.
    pub fn exec(&'static self, path: &str, args: &[String]) -> Result<Infallible> {
        let sched = &self.scheduler;
        let process = sched.current().process().ok_or(Error::NoProcess)?;
        if process.thread_count(sched) > 1 {
            klog::warn!("process: {} refused exec: more than one thread", process.pid);
            return Err(Error::MultiThreaded);
        }

        let stat = self.fs.stat(path)?;
        if stat.kind != FileKind::File {
            return Err(Error::NotFound);
        }
        let mut image = vec![0u8; stat.size as usize];
        if self.fs.read(path, &mut image, 0)? != image.len() {
            return Err(Error::ReadError);
        }
        self.loader.validate(&image)?;
        let argv = match args {
            [] => vec![path.to_string()],
            args => args.to_vec(),
        };
        if packed_size(argv.as_slice()) > self.config.user_stack_size {
            return Err(Error::ArgumentsTooLarge);
        }

        let replaced = self.replace_image(&process, path, argv, &image);
        drop(image);
        if let Err(err) = replaced {
            klog::error!("process: {} exec {} failed after teardown: {}", process.pid, path, err);
            drop(process);
            match self.exit(-1) {
                Ok(never) => match never {},
                Err(err) => panic!("cannot exit after failed exec: {}", err),
            }
        }
        klog::info!("process: {} exec {}", process.pid, path);
        drop(process);
        self.thread_exit()
    }

    fn replace_image(&'static self, process: &Arc<Process>, path: &str, argv: Vec<String>, image: &[u8]) -> Result<()> {
        let sched = &self.scheduler;
        self.vm.release_user_space(process.space);
        {
            let mut inner = process.lock(sched);
            inner.user_stacks.reset();
            inner.kind = ThreadKind::User;
            inner.name = path.to_string();
        }
        sched.current().take_user_slot();

        let entry = self.loader.load(&*self.vm, process.space, image)?;
        let thread = self.create_thread(
            process,
            path,
            ThreadEntry::User { entry, args: argv },
            self.config.default_priority,
        )?;
        sched.add(thread);
        Ok(())
    }

    /// Collect an exited child. `pid == 0` waits for any child. Returns the
    /// child's pid and exit code.
    pub fn wait(&self, pid: u32) -> Result<(Pid, i32)> {
        let sched = &self.scheduler;
        let current = sched.current();
        let process = current.process().ok_or(Error::NoProcess)?;
        let target = WaitTarget::from_raw(pid);

        let zombie = loop {
            let mut inner = process.lock(sched);
            match target {
                WaitTarget::Any if inner.children.is_empty() && inner.zombies.is_empty() => {
                    return Err(Error::NoChildren);
                }
                WaitTarget::Child(pid) if !inner.children.contains_key(&pid) && !inner.zombies.contains_key(&pid) => {
                    return Err(Error::NoSuchChild);
                }
                _ => {}
            }
            if let Some(waiter) = &inner.waiter {
                if !Arc::ptr_eq(waiter, &current) {
                    return Err(Error::AlreadyWaiting);
                }
            }

            let found = match target {
                WaitTarget::Any => inner.zombies.pop_first().map(|(_, zombie)| zombie),
                WaitTarget::Child(pid) => inner.zombies.remove(&pid),
            };
            if let Some(zombie) = found {
                inner.waiting_for = None;
                inner.waiter = None;
                break zombie;
            }

            inner.waiting_for = Some(target);
            inner.waiter = Some(current.clone());
            sched.block_on(move |_| drop(inner));
        };

        let (pid, code) = (zombie.pid, zombie.exit_code(sched));
        sched.bury_process(zombie);
        klog::debug!("process: {} reaped {} (code {})", process.pid, pid, code);
        Ok((pid, code))
    }

    /// Terminate the calling process with `code`.
    ///
    /// Refused for the root process and for processes with more than one
    /// thread; otherwise never returns.
    pub fn exit(&self, code: i32) -> Result<Infallible> {
        let sched = &self.scheduler;
        let process = sched.current().process().ok_or(Error::NoProcess)?;
        if process.pid == ROOT_PID {
            return Err(Error::NotPermitted);
        }
        if process.thread_count(sched) > 1 {
            klog::warn!("process: {} refused exit: more than one thread", process.pid);
            return Err(Error::MultiThreaded);
        }
        self.detach_current(&process);
        self.finish_process(process, code);
        sched.retire_current()
    }

    /// Terminate the calling thread. The last thread of a process takes the
    /// process with it (exit code 0).
    pub fn thread_exit(&self) -> ! {
        let sched = &self.scheduler;
        let finished = match sched.current().process() {
            Some(process) => {
                let remaining = self.detach_current(&process);
                (remaining == 0 && process.pid != ROOT_PID).then_some(process)
            }
            None => None,
        };
        if let Some(process) = finished {
            self.finish_process(process, 0);
        }
        sched.retire_current()
    }

    /// Take the running thread out of `process`; it keeps running in the
    /// kernel address space. Returns the threads left in the process.
    fn detach_current(&self, process: &Arc<Process>) -> usize {
        let sched = &self.scheduler;
        let current = sched.current();
        let remaining = process.remove_thread(sched, &current);
        current.set_process(None);

        let kernel_space = self.vm.kernel_space();
        current.set_space(kernel_space);
        let cpu = sched.cpu();
        let irq_was_enabled = cpu.interrupts_enabled();
        cpu.disable_interrupts();
        if self.vm.current() != kernel_space {
            self.vm.switch(kernel_space);
        }
        if irq_was_enabled {
            cpu.enable_interrupts();
        }
        remaining
    }

    /// Mark `process` EXITED, release its user memory, orphan its children
    /// and hand it to its parent as a zombie.
    fn finish_process(&self, process: Arc<Process>, code: i32) {
        let sched = &self.scheduler;
        let (children, zombies, parent) = {
            let mut inner = process.lock(sched);
            inner.status = ProcessStatus::Exited;
            inner.exit_code = code;
            (
                core::mem::take(&mut inner.children),
                core::mem::take(&mut inner.zombies),
                inner.parent.upgrade(),
            )
        };
        self.vm.release_user_space(process.space);

        for child in children.values() {
            child.lock(sched).parent = Weak::new();
            klog::warn!("process: {} orphaned by exit of {}", child.pid, process.pid);
        }
        for zombie in zombies.into_values() {
            sched.bury_process(zombie);
        }

        klog::info!("process: {} exited with code {}", process.pid, code);
        let pid = process.pid;
        let orphan = match parent {
            Some(parent) => {
                let mut inner = parent.lock(sched);
                match inner.children.remove(&pid) {
                    Some(me) => {
                        inner.zombies.insert(pid, me);
                        let waiter = match inner.waiting_for {
                            Some(target) if target.matches(pid) => inner.waiter.clone(),
                            _ => None,
                        };
                        drop(inner);
                        if let Some(waiter) = waiter {
                            sched.wake(&waiter);
                        }
                        false
                    }
                    // The parent exited first and already let go of us.
                    None => true,
                }
            }
            None => true,
        };
        if orphan {
            sched.bury_process(process);
        }
    }
}
