//! Thread control blocks and the thread manager.
//!
//! A [`Thread`] is shared as `Arc<Thread>`: the owning process's thread map,
//! the ready queue, wait queues and the dead list all hold references to the
//! same block, never copies. Its kernel stack lives as long as the block, so
//! the stack a thread runs on is only freed after the reaper has dropped the
//! last reference to a DEAD thread.

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::Kernel;
use crate::arch::{KernelEntry, ThreadStart};
use crate::error::{Error, Result};
use crate::memory::{self, AddressSpace, MapFlags};
use crate::sync::SpinLock;
use crate::task::context::{KernelStack, pack_user_stack};
use crate::task::id_pool::IdPool;
use crate::task::process::Process;
use crate::task::scheduler::Scheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The main/idle thread adopted from the boot context.
pub const IDLE_TID: ThreadId = ThreadId(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadStatus {
    Ready = 0,
    Running = 1,
    Waiting = 2,
    Dead = 3,
}

impl ThreadStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ThreadStatus::Ready,
            1 => ThreadStatus::Running,
            2 => ThreadStatus::Waiting,
            3 => ThreadStatus::Dead,
            _ => panic!("corrupt thread status {}", v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    Kernel,
    User,
}

/// What a new thread runs.
pub enum ThreadEntry {
    /// Kernel code. Returning from the closure exits the thread.
    Kernel(KernelEntry),
    /// User code at `entry`, called as `main(argc, argv)` with `args`
    /// (argv[0] first) packed onto a fresh user stack.
    User { entry: u64, args: Vec<String> },
}

const NO_SLOT: usize = usize::MAX;

pub struct Thread {
    id: ThreadId,
    name: String,
    priority: u32,
    kind: ThreadKind,
    status: AtomicU8,
    ticks: AtomicU32,
    need_resched: AtomicBool,
    preempt_count: AtomicU32,
    /// Saved kernel stack pointer while switched out.
    context: UnsafeCell<usize>,
    /// `None` only for the adopted boot thread, which runs on the boot stack.
    stack: Option<KernelStack>,
    space: AtomicU64,
    process: spin::Mutex<Option<Arc<Process>>>,
    user_slot: AtomicUsize,
}

// SAFETY: `context` is only read and written by the scheduler with
// interrupts disabled on the single CPU; everything else is atomic or locked.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    #[allow(clippy::too_many_arguments)]
    fn new(
        id: ThreadId,
        name: &str,
        priority: u32,
        kind: ThreadKind,
        context: usize,
        stack: Option<KernelStack>,
        space: AddressSpace,
        user_slot: Option<usize>,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            priority,
            kind,
            status: AtomicU8::new(ThreadStatus::Ready as u8),
            ticks: AtomicU32::new(0),
            need_resched: AtomicBool::new(false),
            preempt_count: AtomicU32::new(0),
            context: UnsafeCell::new(context),
            stack,
            space: AtomicU64::new(space.0),
            process: spin::Mutex::new(None),
            user_slot: AtomicUsize::new(user_slot.unwrap_or(NO_SLOT)),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn kind(&self) -> ThreadKind {
        self.kind
    }

    pub fn is_idle(&self) -> bool {
        self.id == IDLE_TID
    }

    pub fn status(&self) -> ThreadStatus {
        ThreadStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: ThreadStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.status() == ThreadStatus::Ready
    }

    pub fn is_running(&self) -> bool {
        self.status() == ThreadStatus::Running
    }

    pub fn is_waiting(&self) -> bool {
        self.status() == ThreadStatus::Waiting
    }

    pub fn is_dead(&self) -> bool {
        self.status() == ThreadStatus::Dead
    }

    pub fn preempt_count(&self) -> u32 {
        self.preempt_count.load(Ordering::Relaxed)
    }

    pub(crate) fn preempt_disable(&self) {
        self.preempt_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn preempt_enable(&self) {
        let before = self.preempt_count.fetch_sub(1, Ordering::Relaxed);
        assert!(before > 0, "preempt_enable without preempt_disable on thread {}", self.id);
    }

    pub fn needs_reschedule(&self) -> bool {
        self.need_resched.load(Ordering::Relaxed)
    }

    pub(crate) fn request_reschedule(&self) {
        self.need_resched.store(true, Ordering::Relaxed);
    }

    /// One timer tick; true once the timeslice is used up.
    pub(crate) fn tick(&self) -> bool {
        let ticks = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        if ticks >= self.priority {
            self.request_reschedule();
        }
        self.needs_reschedule()
    }

    /// Fresh timeslice.
    pub(crate) fn reset_slice(&self) {
        self.ticks.store(0, Ordering::Relaxed);
        self.need_resched.store(false, Ordering::Relaxed);
    }

    pub fn ticks(&self) -> u32 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub(crate) fn context_ptr(&self) -> *mut usize {
        self.context.get()
    }

    pub(crate) fn saved_context(&self) -> usize {
        // SAFETY: only read by the scheduler, which is the only writer.
        unsafe { *self.context.get() }
    }

    pub fn kernel_stack_top(&self) -> Option<u64> {
        self.stack.as_ref().map(KernelStack::top)
    }

    /// Address space this thread runs in.
    pub fn space(&self) -> AddressSpace {
        AddressSpace(self.space.load(Ordering::Acquire))
    }

    pub(crate) fn set_space(&self, space: AddressSpace) {
        self.space.store(space.0, Ordering::Release);
    }

    pub fn process(&self) -> Option<Arc<Process>> {
        self.process.lock().clone()
    }

    pub(crate) fn set_process(&self, process: Option<Arc<Process>>) -> Option<Arc<Process>> {
        core::mem::replace(&mut *self.process.lock(), process)
    }

    /// Index of this thread's user stack slot in its process.
    pub fn user_slot(&self) -> Option<usize> {
        match self.user_slot.load(Ordering::Relaxed) {
            NO_SLOT => None,
            slot => Some(slot),
        }
    }

    pub(crate) fn take_user_slot(&self) -> Option<usize> {
        match self.user_slot.swap(NO_SLOT, Ordering::Relaxed) {
            NO_SLOT => None,
            slot => Some(slot),
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status())
            .field("kind", &self.kind)
            .finish()
    }
}

/// Owns thread identity.
pub struct ThreadManager {
    ids: SpinLock<IdPool>,
}

impl ThreadManager {
    pub fn new(initial: usize, max: usize) -> Self {
        let mut pool = IdPool::new(initial, max);
        pool.claim(IDLE_TID.0 as usize);
        Self {
            ids: SpinLock::new(pool),
        }
    }

    /// Adopt the running boot context as the main/idle thread.
    pub(crate) fn adopt_boot_thread(&self, priority: u32, space: AddressSpace) -> Arc<Thread> {
        let thread = Thread::new(IDLE_TID, "main", priority, ThreadKind::Kernel, 0, None, space, None);
        thread.set_status(ThreadStatus::Running);
        Arc::new(thread)
    }

    fn alloc_id(&self, sched: &Scheduler) -> Result<ThreadId> {
        let id = self.ids.lock(sched).alloc().ok_or(Error::ThreadIdsExhausted)?;
        Ok(ThreadId(id as u32))
    }

    fn free_id(&self, sched: &Scheduler, id: ThreadId) {
        self.ids.lock(sched).free(id.0 as usize);
    }

    /// Thread ids currently allocated (the idle thread included).
    pub fn live(&self, sched: &Scheduler) -> usize {
        self.ids.lock(sched).used()
    }

    /// Release a retired thread's id. Its kernel stack goes with the last
    /// reference.
    ///
    /// # Panics
    /// If the thread could still be scheduled.
    pub(crate) fn destroy_thread(&self, sched: &Scheduler, thread: Arc<Thread>) {
        assert!(thread.is_dead(), "destroying thread {} which is not dead", thread.id);
        klog::trace!("thread: destroy {} ({})", thread.id, thread.name);
        self.free_id(sched, thread.id);
    }
}

impl Kernel {
    /// Create a thread in `process`. It is not runnable until handed to
    /// [`Scheduler::add`].
    pub fn create_thread(
        &'static self,
        process: &Arc<Process>,
        name: &str,
        entry: ThreadEntry,
        priority: u32,
    ) -> Result<Arc<Thread>> {
        let sched = &self.scheduler;
        let id = self.threads.alloc_id(sched)?;
        let thread = self.build_thread(id, process, name, entry, priority);
        match &thread {
            Ok(_) => klog::debug!("thread: created {} '{}' in process {}", id, name, process.pid()),
            Err(err) => {
                klog::warn!("thread: cannot create '{}': {}", name, err);
                self.threads.free_id(sched, id);
            }
        }
        thread
    }

    fn build_thread(
        &'static self,
        id: ThreadId,
        process: &Arc<Process>,
        name: &str,
        entry: ThreadEntry,
        priority: u32,
    ) -> Result<Arc<Thread>> {
        let mut stack = self.new_kernel_stack()?;
        let space = process.space();
        let (kind, context, slot) = match entry {
            ThreadEntry::Kernel(body) => {
                let kernel = self;
                let body: KernelEntry = Box::new(move || {
                    body();
                    kernel.thread_exit()
                });
                let context = self.scheduler.cpu().prepare_context(&mut stack, ThreadStart::Kernel(body));
                (ThreadKind::Kernel, context, None)
            }
            ThreadEntry::User { entry, args } => {
                let slot = process.alloc_user_stack(&self.scheduler)?;
                match self.prepare_user_stack(&mut stack, space, slot, entry, &args) {
                    Ok(context) => (ThreadKind::User, context, Some(slot)),
                    Err(err) => {
                        process.free_user_stack(&self.scheduler, slot);
                        return Err(err);
                    }
                }
            }
        };

        let thread = Arc::new(Thread::new(id, name, priority, kind, context, Some(stack), space, slot));
        thread.set_process(Some(process.clone()));
        process.attach_thread(&self.scheduler, &thread);
        Ok(thread)
    }

    /// A zeroed kernel stack, every page mapped up front so the stack never
    /// faults while it grows.
    fn new_kernel_stack(&self) -> Result<KernelStack> {
        let stack = KernelStack::new(self.config.kernel_stack_size).ok_or(Error::OutOfMemory)?;
        let kernel_space = self.vm.kernel_space();
        for page in stack.pages() {
            self.vm.map_page(kernel_space, page, MapFlags::WRITABLE)?;
        }
        Ok(stack)
    }

    /// Top of user stack slot `slot`.
    pub fn user_stack_top(&self, slot: usize) -> u64 {
        self.config.user_stack_top - slot as u64 * self.config.user_stack_size
    }

    /// Map user stack slot `slot` of `space`, pack `args` onto it with the
    /// thread-exit stub as the return address, and build a context that
    /// enters ring 3 at `entry`. Returns the saved stack pointer.
    pub(crate) fn prepare_user_stack(
        &self,
        stack: &mut KernelStack,
        space: AddressSpace,
        slot: usize,
        entry: u64,
        args: &[String],
    ) -> Result<usize> {
        let top = self.user_stack_top(slot);
        let size = self.config.user_stack_size;
        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        let image = pack_user_stack(top, &argv, self.config.thread_exit_stub, size)?;

        memory::map_range(&*self.vm, space, top - size, size, MapFlags::USER | MapFlags::WRITABLE)?;
        self.vm.write_user(space, image.sp, &image.bytes)?;

        let cpu = self.scheduler.cpu();
        let context = cpu.prepare_context(stack, ThreadStart::User { entry });
        cpu.set_user_stack(stack, image.sp, image.argc, image.argv);
        klog::trace!("thread: user stack slot {} sp {:#x} argc {}", slot, image.sp, image.argc);
        Ok(context)
    }

    /// Clone the calling user thread into `child`. The copy resumes from
    /// the same system call with a result of 0.
    pub(crate) fn fork_thread(&'static self, current: &Arc<Thread>, child: &Arc<Process>) -> Result<Arc<Thread>> {
        let parent_stack = match (&current.stack, current.kind) {
            (Some(stack), ThreadKind::User) => stack,
            _ => return Err(Error::NotUserThread),
        };
        let sched = &self.scheduler;
        let id = self.threads.alloc_id(sched)?;
        let stack = self.new_kernel_stack().map(|mut stack| {
            stack.copy_from(parent_stack);
            stack
        });
        let mut stack = match stack {
            Ok(stack) => stack,
            Err(err) => {
                self.threads.free_id(sched, id);
                return Err(err);
            }
        };
        let context = sched.cpu().prepare_context(&mut stack, ThreadStart::ForkReturn);

        let thread = Arc::new(Thread::new(
            id,
            &current.name,
            current.priority,
            ThreadKind::User,
            context,
            Some(stack),
            child.space(),
            current.user_slot(),
        ));
        thread.set_process(Some(child.clone()));
        child.attach_thread(sched, &thread);
        klog::debug!("thread: forked {} -> {} in process {}", current.id, id, child.pid());
        Ok(thread)
    }
}
