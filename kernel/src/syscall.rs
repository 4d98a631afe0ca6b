//! System call decoding and dispatch.
//!
//! The architecture entry stub saves the user registers and calls
//! [`Kernel::syscall`] with the number from RAX and up to five arguments.
//! The return value goes back in RAX: a non-negative result, or a negative
//! errno from [`Error::errno`].
//!
//! User pointers are never dereferenced directly; strings and buffers are
//! copied through the VM service in the calling thread's address space, so
//! a bad pointer fails with `BadAddress` instead of faulting the kernel.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::convert::Infallible;

use crate::Kernel;
use crate::error::{Error, Result};
use crate::fs::FileKind;
use crate::memory::{AddressSpace, PAGE_SIZE};

/// Longest path (including the terminating NUL) accepted from user mode.
pub const MAX_PATH: usize = 256;
/// Longest single argv string accepted by `exec`.
pub const MAX_ARG_LEN: usize = 1024;
/// Most argv entries accepted by `exec`.
pub const MAX_ARGS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    /// `exit(code)`
    Exit,
    /// `fork() -> child pid` (0 in the child)
    Fork,
    /// `exec(path, argv)`; `argv` is a NULL-terminated pointer array or NULL
    Exec,
    Yield,
    /// `read(path, buf, offset, len) -> bytes read`
    Read,
    /// `write(path, buf, offset, len) -> bytes written`
    Write,
    /// `stat(path, out)`; `out` receives `{ size: u64, kind: u64 }`
    Stat,
    /// `listdir(path, buf, len) -> bytes`; one name per line
    ListDir,
    /// `wait(pid, status) -> pid`; `pid` 0 means any child, `status` may be NULL
    Wait,
    ThreadExit,
    /// `read_char() -> byte`, blocking
    ReadChar,
}

impl Syscall {
    pub fn from_number(nr: u64) -> Option<Self> {
        Some(match nr {
            0 => Syscall::Exit,
            1 => Syscall::Fork,
            2 => Syscall::Exec,
            3 => Syscall::Yield,
            4 => Syscall::Read,
            5 => Syscall::Write,
            6 => Syscall::Stat,
            7 => Syscall::ListDir,
            9 => Syscall::Wait,
            10 => Syscall::ThreadExit,
            11 => Syscall::ReadChar,
            _ => return None,
        })
    }

    pub fn number(self) -> u64 {
        match self {
            Syscall::Exit => 0,
            Syscall::Fork => 1,
            Syscall::Exec => 2,
            Syscall::Yield => 3,
            Syscall::Read => 4,
            Syscall::Write => 5,
            Syscall::Stat => 6,
            Syscall::ListDir => 7,
            Syscall::Wait => 9,
            Syscall::ThreadExit => 10,
            Syscall::ReadChar => 11,
        }
    }
}

/// `stat` kind codes written to user memory.
const KIND_FILE: u64 = 0;
const KIND_DIRECTORY: u64 = 1;

fn never(never: Infallible) -> isize {
    match never {}
}

impl Kernel {
    /// Entry point for system call number `nr`.
    pub fn syscall(&'static self, nr: u64, args: [u64; 5]) -> isize {
        let Some(call) = Syscall::from_number(nr) else {
            klog::warn!("syscall: unknown number {}", nr);
            return Error::InvalidArgument.errno();
        };
        klog::trace!("syscall: {:?} {:#x?}", call, args);
        match self.dispatch(call, args) {
            Ok(value) => value,
            Err(err) => {
                klog::debug!("syscall: {:?} failed: {}", call, err);
                err.errno()
            }
        }
    }

    fn dispatch(&'static self, call: Syscall, args: [u64; 5]) -> Result<isize> {
        let [a0, a1, a2, a3, _] = args;
        match call {
            Syscall::Exit => self.exit(a0 as i32).map(never),
            Syscall::Fork => self.fork().map(|pid| pid.0 as isize),
            Syscall::Exec => {
                let space = self.caller_space();
                let path = self.user_str(space, a0, MAX_PATH)?;
                let argv = self.user_argv(space, a1)?;
                self.exec(&path, &argv).map(never)
            }
            Syscall::Yield => {
                self.scheduler.yield_now();
                Ok(0)
            }
            Syscall::Read => self.sys_read(a0, a1, a2 as usize, a3 as usize),
            Syscall::Write => self.sys_write(a0, a1, a2 as usize, a3 as usize),
            Syscall::Stat => self.sys_stat(a0, a1),
            Syscall::ListDir => self.sys_listdir(a0, a1, a2 as usize),
            Syscall::Wait => {
                let space = self.caller_space();
                // A zombie is gone once reaped, so a bad status pointer has
                // to fail before the wait.
                if a1 != 0 {
                    self.vm.write_user(space, a1, &0i32.to_le_bytes())?;
                }
                let (pid, code) = self.wait(a0 as u32)?;
                if a1 != 0 {
                    self.vm.write_user(space, a1, &code.to_le_bytes())?;
                }
                Ok(pid.0 as isize)
            }
            Syscall::ThreadExit => self.thread_exit(),
            Syscall::ReadChar => Ok(self.read_char() as isize),
        }
    }

    fn caller_space(&self) -> AddressSpace {
        self.scheduler.current().space()
    }

    fn sys_read(&self, path: u64, buf: u64, offset: usize, len: usize) -> Result<isize> {
        let space = self.caller_space();
        let path = self.user_str(space, path, MAX_PATH)?;
        check_buffer(buf, len)?;

        let mut chunk = vec![0u8; len.min(PAGE_SIZE)];
        let mut done = 0;
        while done < len {
            let want = (len - done).min(chunk.len());
            let n = self.fs.read(&path, &mut chunk[..want], offset + done)?;
            if n == 0 {
                break;
            }
            self.vm.write_user(space, buf + done as u64, &chunk[..n])?;
            done += n;
            if n < want {
                break;
            }
        }
        Ok(done as isize)
    }

    fn sys_write(&self, path: u64, buf: u64, offset: usize, len: usize) -> Result<isize> {
        let space = self.caller_space();
        let path = self.user_str(space, path, MAX_PATH)?;
        check_buffer(buf, len)?;

        let mut chunk = vec![0u8; len.min(PAGE_SIZE)];
        let mut done = 0;
        while done < len {
            let want = (len - done).min(chunk.len());
            self.vm.read_user(space, buf + done as u64, &mut chunk[..want])?;
            let n = self.fs.write(&path, &chunk[..want], offset + done)?;
            done += n;
            if n < want {
                break;
            }
        }
        Ok(done as isize)
    }

    fn sys_stat(&self, path: u64, out: u64) -> Result<isize> {
        let space = self.caller_space();
        let path = self.user_str(space, path, MAX_PATH)?;
        let stat = self.fs.stat(&path)?;
        let kind = match stat.kind {
            FileKind::File => KIND_FILE,
            FileKind::Directory => KIND_DIRECTORY,
        };
        let mut record = [0u8; 16];
        record[..8].copy_from_slice(&(stat.size as u64).to_le_bytes());
        record[8..].copy_from_slice(&kind.to_le_bytes());
        check_buffer(out, record.len())?;
        self.vm.write_user(space, out, &record)?;
        Ok(0)
    }

    /// Names that do not fit in `len` are left out whole.
    fn sys_listdir(&self, path: u64, buf: u64, len: usize) -> Result<isize> {
        let space = self.caller_space();
        let path = self.user_str(space, path, MAX_PATH)?;
        check_buffer(buf, len)?;

        let mut out = Vec::new();
        for name in self.fs.list_dir(&path)? {
            if out.len() + name.len() + 1 > len {
                break;
            }
            out.extend_from_slice(name.as_bytes());
            out.push(b'\n');
        }
        if !out.is_empty() {
            self.vm.write_user(space, buf, &out)?;
        }
        Ok(out.len() as isize)
    }

    /// Copy a NUL-terminated UTF-8 string of at most `max` bytes (NUL
    /// included) out of user memory.
    fn user_str(&self, space: AddressSpace, addr: u64, max: usize) -> Result<String> {
        if addr == 0 {
            return Err(Error::BadAddress);
        }
        let mut bytes = Vec::new();
        let mut chunk = [0u8; 64];
        let mut va = addr;
        while bytes.len() < max {
            // Never read across a page boundary past the terminator.
            let page_left = PAGE_SIZE - (va as usize % PAGE_SIZE);
            let n = chunk.len().min(page_left).min(max - bytes.len());
            self.vm.read_user(space, va, &mut chunk[..n])?;
            if let Some(end) = chunk[..n].iter().position(|&b| b == 0) {
                bytes.extend_from_slice(&chunk[..end]);
                return String::from_utf8(bytes).map_err(|_| Error::InvalidArgument);
            }
            bytes.extend_from_slice(&chunk[..n]);
            va = va.checked_add(n as u64).ok_or(Error::BadAddress)?;
        }
        Err(Error::InvalidArgument)
    }

    /// Copy a NULL-terminated array of string pointers. A NULL array is an
    /// empty argv.
    fn user_argv(&self, space: AddressSpace, addr: u64) -> Result<Vec<String>> {
        let mut argv = Vec::new();
        if addr == 0 {
            return Ok(argv);
        }
        for i in 0..=MAX_ARGS as u64 {
            let slot = i
                .checked_mul(8)
                .and_then(|off| addr.checked_add(off))
                .ok_or(Error::BadAddress)?;
            let mut ptr = [0u8; 8];
            self.vm.read_user(space, slot, &mut ptr)?;
            let ptr = u64::from_le_bytes(ptr);
            if ptr == 0 {
                return Ok(argv);
            }
            if argv.len() == MAX_ARGS {
                break;
            }
            argv.push(self.user_str(space, ptr, MAX_ARG_LEN)?);
        }
        Err(Error::ArgumentsTooLarge)
    }
}

fn check_buffer(addr: u64, len: usize) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    match addr.checked_add(len as u64) {
        Some(_) if addr != 0 => Ok(()),
        _ => Err(Error::BadAddress),
    }
}
