//! Kernel keyboard input queue.
//!
//! A fixed-size ring buffer between the keyboard interrupt (producer) and
//! threads reading characters (consumers). Readers with nothing to read
//! block; every key press wakes all of them to the front of the ready
//! queue and asks for a reschedule, so the typist sees the echo at once.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::Kernel;
use crate::sync::SpinLock;
use crate::task::scheduler::Scheduler;
use crate::task::thread::Thread;

const BUF_SIZE: usize = 256;

/// A simple ring buffer for keyboard bytes.
struct RingBuffer {
    buf: [u8; BUF_SIZE],
    read: usize,
    write: usize,
    count: usize,
}

impl RingBuffer {
    const fn new() -> Self {
        Self {
            buf: [0; BUF_SIZE],
            read: 0,
            write: 0,
            count: 0,
        }
    }

    /// Push a byte into the buffer. Returns false (dropping it) if full.
    fn push(&mut self, byte: u8) -> bool {
        if self.count >= BUF_SIZE {
            return false;
        }
        self.buf[self.write] = byte;
        self.write = (self.write + 1) % BUF_SIZE;
        self.count += 1;
        true
    }

    /// Pop a byte from the buffer. Returns `None` if empty.
    fn pop(&mut self) -> Option<u8> {
        if self.count == 0 {
            return None;
        }
        let byte = self.buf[self.read];
        self.read = (self.read + 1) % BUF_SIZE;
        self.count -= 1;
        Some(byte)
    }
}

struct InputState {
    ring: RingBuffer,
    readers: Vec<Arc<Thread>>,
}

pub struct InputQueue {
    state: SpinLock<InputState>,
}

impl InputQueue {
    pub const fn new() -> Self {
        Self {
            state: SpinLock::new(InputState {
                ring: RingBuffer::new(),
                readers: Vec::new(),
            }),
        }
    }

    /// Keyboard interrupt: queue `byte` and wake every blocked reader.
    pub fn push(&self, sched: &Scheduler, byte: u8) {
        let readers = {
            let mut state = self.state.lock_irqsave(sched);
            if !state.ring.push(byte) {
                klog::warn!("input: buffer full, dropped {:#04x}", byte);
            }
            core::mem::take(&mut state.readers)
        };
        if readers.is_empty() {
            return;
        }
        // Front-inserting in reverse keeps the readers in arrival order.
        for reader in readers.iter().rev() {
            sched.wake_to_front(reader);
        }
        sched.request_reschedule();
    }

    /// Next byte, blocking until one is typed.
    pub fn read(&self, sched: &Scheduler) -> u8 {
        loop {
            let mut state = self.state.lock_irqsave(sched);
            if let Some(byte) = state.ring.pop() {
                return byte;
            }
            sched.block_on(move |me| {
                state.readers.push(me.clone());
                drop(state);
            });
        }
    }

    /// Next byte if one is buffered.
    pub fn try_read(&self, sched: &Scheduler) -> Option<u8> {
        self.state.lock_irqsave(sched).ring.pop()
    }

    pub fn blocked_readers(&self, sched: &Scheduler) -> usize {
        self.state.lock_irqsave(sched).readers.len()
    }
}

impl Default for InputQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    /// Keyboard interrupt handler body. Only ASCII reaches readers.
    pub fn keyboard_interrupt(&self, ch: char) {
        if ch.is_ascii() {
            self.input.push(&self.scheduler, ch as u8);
        }
    }

    /// Blocking single-character read.
    pub fn read_char(&self) -> u8 {
        self.input.read(&self.scheduler)
    }
}
