// =============================================================================
// taskcore — Round-Robin Scheduler
// =============================================================================
//
// One CPU, one ready queue, strict FIFO. Priority is only the length of a
// thread's timeslice in timer ticks, never a queue position.
//
//   schedule()   safe-point reschedule; does nothing while the current
//                thread has preemption disabled or no reschedule pending
//   yield_now()  unconditional switch; with nothing else runnable the idle
//                thread is queued so the switch always has a target
//   block_on()   WAITING + park + yield, without a lost-wakeup window
//   wake()       WAITING → READY at the tail (or head, `wake_to_front`)
//
// The ready queue and the current pointer live in an `IrqCell`: interrupt
// handlers wake threads too. The switch plan is computed inside the cell
// and the register swap happens after leaving it, still with interrupts
// off, so no lock is ever held across a context switch.
//
// Exited threads and processes go on the dead lists. The reaper thread
// frees them: a thread cannot free the stack it is running on.
// =============================================================================

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::Kernel;
use crate::arch::Cpu;
use crate::memory::{AddressSpace, AddressSpaces};
use crate::sync::{CondVar, IrqCell, YieldLock};
use crate::task::process::Process;
use crate::task::thread::{Thread, ThreadStatus};

struct RunQueue {
    current: Option<Arc<Thread>>,
    idle: Option<Arc<Thread>>,
    ready: VecDeque<Arc<Thread>>,
}

/// What the low-level switch needs once the queue has been updated.
struct SwitchPlan {
    from: *mut usize,
    to: usize,
    space: AddressSpace,
    kernel_stack_top: Option<u64>,
}

#[derive(Default)]
struct Graveyard {
    threads: Vec<Arc<Thread>>,
    processes: Vec<Arc<Process>>,
}

impl Graveyard {
    fn is_empty(&self) -> bool {
        self.threads.is_empty() && self.processes.is_empty()
    }
}

pub struct Scheduler {
    cpu: Arc<dyn Cpu>,
    vm: Arc<dyn AddressSpaces>,
    queue: IrqCell<RunQueue>,
    dead: YieldLock<Graveyard>,
    dead_ready: CondVar,
}

impl Scheduler {
    pub fn new(cpu: Arc<dyn Cpu>, vm: Arc<dyn AddressSpaces>) -> Self {
        Self {
            cpu,
            vm,
            queue: IrqCell::new(RunQueue {
                current: None,
                idle: None,
                ready: VecDeque::new(),
            }),
            dead: YieldLock::new(Graveyard {
                threads: Vec::new(),
                processes: Vec::new(),
            }),
            dead_ready: CondVar::new(),
        }
    }

    pub fn cpu(&self) -> &dyn Cpu {
        &*self.cpu
    }

    /// Install the adopted boot thread as both current and idle thread.
    pub(crate) fn start(&self, idle: Arc<Thread>) {
        self.queue.with(self.cpu(), |q| {
            q.idle = Some(idle.clone());
            q.current = Some(idle);
        });
    }

    fn with_current<R>(&self, f: impl FnOnce(&Arc<Thread>) -> R) -> Option<R> {
        self.queue.with(self.cpu(), |q| q.current.as_ref().map(f))
    }

    pub fn try_current(&self) -> Option<Arc<Thread>> {
        self.with_current(Arc::clone)
    }

    /// The running thread.
    ///
    /// # Panics
    /// Before the scheduler has been started.
    pub fn current(&self) -> Arc<Thread> {
        match self.try_current() {
            Some(thread) => thread,
            None => panic!("no current thread: scheduler not started"),
        }
    }

    /// Runnable threads waiting for the CPU.
    pub fn ready_len(&self) -> usize {
        self.queue.with(self.cpu(), |q| q.ready.len())
    }

    pub fn preempt_disable(&self) {
        self.with_current(|t| t.preempt_disable());
    }

    pub fn preempt_enable(&self) {
        self.with_current(|t| t.preempt_enable());
    }

    /// Ask for a switch at the next safe point.
    pub fn request_reschedule(&self) {
        self.with_current(|t| t.request_reschedule());
    }

    /// Timer interrupt: charge one tick to the running thread. Returns
    /// whether its timeslice is used up.
    pub fn timer_tick(&self) -> bool {
        self.with_current(|t| t.tick()).unwrap_or(false)
    }

    /// Safe-point reschedule.
    pub fn schedule(&self) {
        let due = self
            .with_current(|t| t.preempt_count() == 0 && t.needs_reschedule())
            .unwrap_or(false);
        if due {
            self.switch(false);
        }
    }

    /// Give the CPU to the next ready thread.
    pub fn yield_now(&self) {
        if self.try_current().is_some() {
            self.switch(true);
        }
    }

    /// Mark the running thread WAITING. It keeps running until it yields
    /// and only becomes runnable again through [`Scheduler::wake`].
    ///
    /// # Panics
    /// On the idle thread, which must always be able to run.
    pub fn mark_blocked(&self) {
        self.with_current(|t| {
            assert!(!t.is_idle(), "the idle thread cannot block");
            t.set_status(ThreadStatus::Waiting);
        });
    }

    /// Block the running thread until someone wakes it.
    ///
    /// `park` runs after the thread is marked WAITING and with preemption
    /// disabled: it publishes the thread where a waker will find it and
    /// releases whatever lock guards that place. A wake arriving between
    /// `park` and the switch just puts the thread back on the ready queue.
    pub fn block_on(&self, park: impl FnOnce(&Arc<Thread>)) {
        self.preempt_disable();
        let me = self.current();
        self.mark_blocked();
        park(&me);
        drop(me);
        self.yield_now();
        self.preempt_enable();
    }

    /// Make a WAITING thread runnable at the tail of the ready queue.
    /// Threads in any other state are left alone.
    pub fn wake(&self, thread: &Arc<Thread>) {
        self.wake_at(thread, false);
    }

    /// Like [`Scheduler::wake`], but at the head of the queue.
    pub fn wake_to_front(&self, thread: &Arc<Thread>) {
        self.wake_at(thread, true);
    }

    fn wake_at(&self, thread: &Arc<Thread>, front: bool) {
        self.queue.with(self.cpu(), |q| {
            if thread.status() != ThreadStatus::Waiting {
                return;
            }
            thread.set_status(ThreadStatus::Ready);
            if front {
                q.ready.push_front(thread.clone());
            } else {
                q.ready.push_back(thread.clone());
            }
        });
    }

    /// Make a new thread runnable.
    pub fn add(&self, thread: Arc<Thread>) {
        self.queue.with(self.cpu(), |q| {
            thread.set_status(ThreadStatus::Ready);
            q.ready.push_back(thread);
        });
    }

    fn switch(&self, yielding: bool) {
        let cpu = self.cpu();
        let irq_was_enabled = cpu.interrupts_enabled();
        cpu.disable_interrupts();

        let plan = self.queue.with(cpu, |q| rotate(q, yielding));
        if let Some(plan) = plan {
            if plan.space != self.vm.current() {
                self.vm.switch(plan.space);
            }
            if let Some(top) = plan.kernel_stack_top {
                cpu.set_kernel_stack_top(top);
            }
            // SAFETY: interrupts are off; `from` points into a thread block
            // kept alive by the ready queue, a wait queue or the dead list,
            // and `to` was saved by an earlier switch or `prepare_context`.
            unsafe { cpu.switch_context(plan.from, plan.to) };
        }

        if irq_was_enabled {
            cpu.enable_interrupts();
        }
    }

    /// Permanently take the running thread off the CPU. The caller must
    /// already have detached it from its process.
    pub(crate) fn retire_current(&self) -> ! {
        self.preempt_disable();
        let me = self.current();
        klog::trace!("sched: retiring thread {} ({})", me.id(), me.name());
        self.dead.lock(self).threads.push(me);
        self.dead_ready.notify(self);

        self.cpu().disable_interrupts();
        self.with_current(|t| t.set_status(ThreadStatus::Dead));
        self.switch(true);
        panic!("dead thread resumed");
    }

    /// Hand a reaped zombie to the reaper.
    pub(crate) fn bury_process(&self, process: Arc<Process>) {
        self.dead.lock(self).processes.push(process);
        self.dead_ready.notify(self);
    }

    /// Threads and processes waiting for the reaper.
    pub fn graveyard_len(&self) -> usize {
        let dead = self.dead.lock(self);
        dead.threads.len() + dead.processes.len()
    }
}

fn rotate(q: &mut RunQueue, yielding: bool) -> Option<SwitchPlan> {
    let old = q.current.clone()?;
    let idle = q.idle.clone()?;

    if yielding && q.ready.is_empty() && !old.is_idle() {
        idle.set_status(ThreadStatus::Ready);
        q.ready.push_back(idle.clone());
    }

    let next = match q.ready.pop_front() {
        Some(next) => next,
        None if old.is_running() || old.is_idle() => {
            assert!(old.is_running(), "idle thread blocked with nothing runnable");
            old.reset_slice();
            return None;
        }
        None => idle,
    };

    if Arc::ptr_eq(&next, &old) {
        // Woken between marking itself blocked and yielding.
        old.set_status(ThreadStatus::Running);
        old.reset_slice();
        return None;
    }

    if old.is_running() {
        old.set_status(ThreadStatus::Ready);
        if !old.is_idle() {
            q.ready.push_back(old.clone());
        }
    }

    next.set_status(ThreadStatus::Running);
    next.reset_slice();
    let plan = SwitchPlan {
        from: old.context_ptr(),
        to: next.saved_context(),
        space: next.space(),
        kernel_stack_top: next.kernel_stack_top(),
    };
    q.current = Some(next);
    Some(plan)
}

impl Kernel {
    /// Timer interrupt handler body.
    pub fn timer_interrupt(&self) {
        if self.scheduler.timer_tick() {
            self.scheduler.schedule();
        }
    }

    /// Body of the reaper thread: free whatever exits leave behind.
    pub(crate) fn reap_forever(&self) -> ! {
        let sched = &self.scheduler;
        loop {
            let mut dead = sched.dead_ready.wait_until(sched, sched.dead.lock(sched), |d| !d.is_empty());
            let threads = core::mem::take(&mut dead.threads);
            let processes = core::mem::take(&mut dead.processes);
            drop(dead);

            for thread in threads {
                // A retiring thread queues itself before it switches away
                // for the last time.
                while !thread.is_dead() {
                    sched.yield_now();
                }
                self.threads.destroy_thread(sched, thread);
            }
            for process in processes {
                self.destroy_process(process);
            }
            sched.yield_now();
        }
    }
}
