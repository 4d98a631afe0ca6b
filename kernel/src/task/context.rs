//! Kernel stacks and user-stack argument packing.
//!
//! Both are raw memory layouts. Everything here works on byte images so the
//! layout contracts can be checked without running on the target.

use alloc::alloc::{Layout, alloc_zeroed, dealloc};
use alloc::vec;
use alloc::vec::Vec;
use core::ptr::NonNull;

use crate::error::{Error, Result};
use crate::memory::PAGE_SIZE;

/// A dedicated, page-aligned kernel stack. Freed on drop.
pub struct KernelStack {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: the stack memory is exclusively owned by this value.
unsafe impl Send for KernelStack {}
unsafe impl Sync for KernelStack {}

impl KernelStack {
    /// Allocate a zeroed stack of `size` bytes (a whole number of pages).
    pub fn new(size: usize) -> Option<Self> {
        let layout = Layout::from_size_align(size, PAGE_SIZE).ok()?;
        if size == 0 {
            return None;
        }
        // Allocate directly on the heap: building a large array on the
        // current (kernel) stack first would overflow it.
        // SAFETY: layout has a non-zero size.
        let base = NonNull::new(unsafe { alloc_zeroed(layout) })?;
        Some(Self { base, size })
    }

    pub fn bottom(&self) -> u64 {
        self.base.as_ptr() as u64
    }

    /// Top of the stack (stacks grow downward).
    pub fn top(&self) -> u64 {
        self.bottom() + self.size as u64
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Start addresses of every page of the stack.
    pub fn pages(&self) -> impl Iterator<Item = u64> + use<> {
        let bottom = self.bottom();
        (0..self.size / PAGE_SIZE).map(move |i| bottom + (i * PAGE_SIZE) as u64)
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: base..base+size is our allocation.
        unsafe { core::slice::from_raw_parts(self.base.as_ptr(), self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: base..base+size is our allocation, borrowed mutably.
        unsafe { core::slice::from_raw_parts_mut(self.base.as_ptr(), self.size) }
    }

    /// Byte-for-byte copy of another stack of the same size.
    pub fn copy_from(&mut self, other: &KernelStack) {
        self.as_mut_slice().copy_from_slice(other.as_slice());
    }

    /// Write `value` `offset` bytes above the bottom of the stack.
    ///
    /// # Panics
    /// If the value would extend past the top.
    pub fn write<T: Copy>(&mut self, offset: usize, value: T) {
        assert!(offset + size_of::<T>() <= self.size, "stack write out of bounds");
        // SAFETY: bounds checked above; unaligned write tolerates any offset.
        unsafe { self.base.as_ptr().add(offset).cast::<T>().write_unaligned(value) }
    }

    /// Read a `T` `offset` bytes above the bottom of the stack.
    pub fn read<T: Copy>(&self, offset: usize) -> T {
        assert!(offset + size_of::<T>() <= self.size, "stack read out of bounds");
        // SAFETY: bounds checked above; T is plain data.
        unsafe { self.base.as_ptr().add(offset).cast::<T>().read_unaligned() }
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe {
            dealloc(
                self.base.as_ptr(),
                Layout::from_size_align_unchecked(self.size, PAGE_SIZE),
            )
        }
    }
}

/// The packed initial contents of a user stack.
///
/// From `sp` upward: return address, argc, argv pointer, the argv array
/// (NULL-terminated), padding, then the argument strings ending at the slot
/// top. `sp` is 8 mod 16, as if `main` had just been `call`ed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserStackImage {
    pub sp: u64,
    pub argc: u64,
    pub argv: u64,
    /// Bytes to copy to `[sp, top)`.
    pub bytes: Vec<u8>,
}

/// Upper bound on the bytes [`pack_user_stack`] needs for `args`.
pub fn packed_size<S: AsRef<str>>(args: &[S]) -> u64 {
    let strings: usize = args.iter().map(|a| a.as_ref().len() + 1).sum();
    let words = 3 + args.len() + 1;
    // Worst case adds 7 bytes of string alignment and 15 of array alignment.
    (strings + words * 8 + 22) as u64
}

/// Pack `args` (argv[0] first) below `top`, with `return_address` as the
/// address `main` returns to. Fails when more than `limit` bytes are needed.
pub fn pack_user_stack(top: u64, args: &[&str], return_address: u64, limit: u64) -> Result<UserStackImage> {
    let needed = packed_size(args);
    if needed > limit || needed > top {
        return Err(Error::ArgumentsTooLarge);
    }

    // Lay strings out downward from the top, argv[0] highest.
    let mut cursor = top;
    let mut pointers = Vec::with_capacity(args.len());
    for arg in args {
        cursor -= arg.len() as u64 + 1;
        pointers.push(cursor);
    }
    let strings_start = cursor & !7;

    // argv array 16-aligned, so sp = argv - 24 is 8 mod 16.
    let argv = (strings_start - (args.len() as u64 + 1) * 8) & !15;
    let sp = argv - 24;

    let mut bytes = vec![0u8; (top - sp) as usize];
    let mut put = |addr: u64, data: &[u8]| {
        let at = (addr - sp) as usize;
        bytes[at..at + data.len()].copy_from_slice(data);
    };
    for (arg, &addr) in args.iter().zip(&pointers) {
        put(addr, arg.as_bytes());
    }
    put(sp, &return_address.to_le_bytes());
    put(sp + 8, &(args.len() as u64).to_le_bytes());
    put(sp + 16, &argv.to_le_bytes());
    for (i, &addr) in pointers.iter().enumerate() {
        put(argv + i as u64 * 8, &addr.to_le_bytes());
    }

    Ok(UserStackImage {
        sp,
        argc: args.len() as u64,
        argv,
        bytes,
    })
}
