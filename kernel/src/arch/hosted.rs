//! Hosted CPU for unit tests.
//!
//! Every kernel context runs on its own host thread, but only the holder of
//! the baton executes: `switch_context` hands the baton to the target
//! context and parks until some later switch hands it back. The saved
//! "stack pointer" of a context is just its baton token.
//!
//! User mode is emulated with registered programs: a context built with
//! [`ThreadStart::User`] calls the program registered at its entry address
//! with the arguments given to `set_user_stack`. A program that returns
//! lands in the `on_user_return` hook, the way `main` returns into the
//! thread-exit stub.

use std::collections::{BTreeMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use super::{Cpu, ThreadStart};
use crate::task::context::KernelStack;

/// Arguments a user program starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserEntry {
    pub entry: u64,
    pub sp: u64,
    pub argc: u64,
    pub argv: u64,
}

pub type Program = Arc<dyn Fn(UserEntry) + Send + Sync>;
type Hook = Arc<dyn Fn() + Send + Sync>;
type Body = Box<dyn FnOnce() + Send>;

struct Baton {
    running: usize,
    failure: Option<String>,
}

struct Shared {
    baton: Mutex<Baton>,
    turn: Condvar,
    next_token: AtomicUsize,
    irq: AtomicBool,
    kernel_stack_top: AtomicU64,
    programs: Mutex<BTreeMap<u64, Program>>,
    user_starts: Mutex<BTreeMap<u64, UserEntry>>,
    fork_bodies: Mutex<VecDeque<Body>>,
    user_return: Mutex<Option<Hook>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn token(&self) -> usize {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Park until the baton reaches `token`.
    fn wait_turn(&self, token: usize) {
        let mut baton = locked(&self.baton);
        loop {
            if let Some(failure) = &baton.failure {
                let failure = failure.clone();
                drop(baton);
                panic!("another kernel context panicked: {failure}");
            }
            if baton.running == token {
                return;
            }
            baton = self.turn.wait(baton).unwrap_or_else(|p| p.into_inner());
        }
    }

    fn hand_to(&self, token: usize) {
        locked(&self.baton).running = token;
        self.turn.notify_all();
    }

    fn fail(&self, why: String) {
        let mut baton = locked(&self.baton);
        if baton.failure.is_none() {
            baton.failure = Some(why);
        }
        drop(baton);
        self.turn.notify_all();
    }

    fn return_from_user(&self) {
        let hook = locked(&self.user_return).clone();
        match hook {
            Some(hook) => hook(),
            None => panic!("user program returned with no return hook installed"),
        }
    }
}

/// Baton-passing CPU. Clones share the same machine.
#[derive(Clone)]
pub struct HostedCpu {
    shared: Arc<Shared>,
}

impl HostedCpu {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                baton: Mutex::new(Baton {
                    running: 0,
                    failure: None,
                }),
                turn: Condvar::new(),
                // Token 0 belongs to the boot context.
                next_token: AtomicUsize::new(1),
                irq: AtomicBool::new(true),
                kernel_stack_top: AtomicU64::new(0),
                programs: Mutex::new(BTreeMap::new()),
                user_starts: Mutex::new(BTreeMap::new()),
                fork_bodies: Mutex::new(VecDeque::new()),
                user_return: Mutex::new(None),
            }),
        }
    }

    /// Register the "machine code" found at user address `entry`.
    pub fn program(&self, entry: u64, program: impl Fn(UserEntry) + Send + Sync + 'static) {
        locked(&self.shared.programs).insert(entry, Arc::new(program));
    }

    /// What the next fork child runs once it returns to user mode.
    pub fn fork_child(&self, body: impl FnOnce() + Send + 'static) {
        locked(&self.shared.fork_bodies).push_back(Box::new(body));
    }

    /// Where user programs return to.
    pub fn on_user_return(&self, hook: impl Fn() + Send + Sync + 'static) {
        *locked(&self.shared.user_return) = Some(Arc::new(hook));
    }

    pub fn kernel_stack_top(&self) -> u64 {
        self.shared.kernel_stack_top.load(Ordering::Relaxed)
    }

    fn spawn(&self, token: usize, body: Body) {
        let shared = self.shared.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("context-{token}"))
            .spawn(move || {
                shared.wait_turn(token);
                // First entry runs with interrupts on, like the trampolines.
                shared.irq.store(true, Ordering::SeqCst);
                let outcome = catch_unwind(AssertUnwindSafe(body));
                let why = match outcome {
                    Ok(()) => "context entry returned".to_string(),
                    Err(payload) => payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic".to_string()),
                };
                shared.fail(why);
            });
        if let Err(err) = spawned {
            panic!("cannot spawn host thread for context {token}: {err}");
        }
    }
}

impl Default for HostedCpu {
    fn default() -> Self {
        Self::new()
    }
}

impl Cpu for HostedCpu {
    fn interrupts_enabled(&self) -> bool {
        self.shared.irq.load(Ordering::SeqCst)
    }

    fn disable_interrupts(&self) {
        self.shared.irq.store(false, Ordering::SeqCst);
    }

    fn enable_interrupts(&self) {
        self.shared.irq.store(true, Ordering::SeqCst);
    }

    fn wait_for_interrupt(&self) {
        std::thread::yield_now();
    }

    fn prepare_context(&self, stack: &mut KernelStack, start: ThreadStart) -> usize {
        let token = self.shared.token();
        let shared = self.shared.clone();
        let body: Body = match start {
            ThreadStart::Kernel(entry) => entry,
            ThreadStart::User { entry } => {
                let key = stack.top();
                locked(&shared.user_starts).insert(
                    key,
                    UserEntry {
                        entry,
                        sp: 0,
                        argc: 0,
                        argv: 0,
                    },
                );
                Box::new(move || {
                    let start = locked(&shared.user_starts).remove(&key);
                    let program = locked(&shared.programs).get(&entry).cloned();
                    match (start, program) {
                        (Some(start), Some(program)) if start.sp != 0 => program(start),
                        (_, None) => panic!("no program at user address {entry:#x}"),
                        _ => panic!("user context at {key:#x} started without a user stack"),
                    }
                    shared.return_from_user();
                })
            }
            ThreadStart::ForkReturn => {
                let child = locked(&shared.fork_bodies).pop_front();
                Box::new(move || {
                    match child {
                        Some(child) => child(),
                        None => panic!("fork child has no registered body"),
                    }
                    shared.return_from_user();
                })
            }
        };
        self.spawn(token, body);
        token
    }

    fn set_user_stack(&self, stack: &mut KernelStack, user_sp: u64, argc: u64, argv: u64) {
        let mut starts = locked(&self.shared.user_starts);
        match starts.get_mut(&stack.top()) {
            Some(start) => {
                start.sp = user_sp;
                start.argc = argc;
                start.argv = argv;
            }
            None => panic!("set_user_stack on a context not built for user mode"),
        }
    }

    unsafe fn switch_context(&self, from_sp: *mut usize, to_sp: usize) {
        let me = self.shared.token();
        // SAFETY: the caller guarantees `from_sp` is valid.
        unsafe { from_sp.write(me) };
        self.shared.hand_to(to_sp);
        self.shared.wait_turn(me);
    }

    fn set_kernel_stack_top(&self, top: u64) {
        self.shared.kernel_stack_top.store(top, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PAGE_SIZE;

    #[test]
    fn switching_passes_control_and_back() {
        let cpu = HostedCpu::new();
        let trace = Arc::new(Mutex::new(Vec::new()));
        let main_token = Arc::new(AtomicUsize::new(0));
        let mut stack = KernelStack::new(PAGE_SIZE).unwrap();

        let (c, t, back) = (cpu.clone(), trace.clone(), main_token.clone());
        let sp = cpu.prepare_context(
            &mut stack,
            ThreadStart::Kernel(Box::new(move || {
                t.lock().unwrap().push("worker");
                assert!(c.interrupts_enabled());
                let mut saved = 0usize;
                unsafe { c.switch_context(&mut saved, back.load(Ordering::SeqCst)) };
            })),
        );

        trace.lock().unwrap().push("main");
        cpu.disable_interrupts();
        // The next token handed out is the one our switch saves.
        main_token.store(cpu.shared.next_token.load(Ordering::SeqCst), Ordering::SeqCst);
        let mut saved = 0usize;
        unsafe { cpu.switch_context(&mut saved, sp) };
        trace.lock().unwrap().push("main-again");

        assert_eq!(*trace.lock().unwrap(), ["main", "worker", "main-again"]);
        assert_eq!(saved, main_token.load(Ordering::SeqCst));
    }

    #[test]
    fn set_user_stack_is_delivered_to_the_program() {
        let cpu = HostedCpu::new();
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        cpu.program(0x40_1000, move |start| *s.lock().unwrap() = Some(start));

        let mut stack = KernelStack::new(PAGE_SIZE).unwrap();
        let sp = cpu.prepare_context(&mut stack, ThreadStart::User { entry: 0x40_1000 });
        cpu.set_user_stack(&mut stack, 0x7000, 2, 0x7018);

        let c = cpu.clone();
        let resume = Arc::new(AtomicUsize::new(0));
        let r = resume.clone();
        cpu.on_user_return(move || {
            let mut dead = 0usize;
            unsafe { c.switch_context(&mut dead, r.load(Ordering::SeqCst)) };
        });

        let mut saved = 0usize;
        resume.store(cpu.shared.next_token.load(Ordering::SeqCst), Ordering::SeqCst);
        unsafe { cpu.switch_context(&mut saved, sp) };

        let start = seen.lock().unwrap().unwrap();
        assert_eq!((start.sp, start.argc, start.argv), (0x7000, 2, 0x7018));
    }
}
