//! Address-space services consumed by the task core.
//!
//! Page tables, frame allocation and copy-on-write are owned by the VM
//! subsystem. The core only needs the narrow surface in [`AddressSpaces`]:
//! clone the caller's space for `fork`, drop user mappings for `exec` and
//! `exit`, map stack and image pages, copy bytes into user memory, switch
//! CR3 on a context switch and free a dead process's root table.

use bitflags::bitflags;

/// Size of one page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Round `addr` down to its page boundary.
pub const fn page_floor(addr: u64) -> u64 {
    addr & !(PAGE_SIZE as u64 - 1)
}

/// Opaque handle to an address space (the root table's physical address on
/// x86_64). Only compared and passed back to the VM service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressSpace(pub u64);

bitflags! {
    /// Permissions requested for a new mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const WRITABLE   = 1 << 0;
        /// Accessible from ring 3.
        const USER       = 1 << 1;
        const EXECUTABLE = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// No frame left to back the page.
    OutOfMemory,
    /// User copy touched an unmapped address.
    NotMapped,
}

/// The VM collaborator.
///
/// Every method may be called with interrupts disabled; `switch` always is.
pub trait AddressSpaces: Send + Sync {
    /// The kernel-only space threads run in once detached from a process.
    fn kernel_space(&self) -> AddressSpace;

    /// The space currently loaded on the CPU.
    fn current(&self) -> AddressSpace;

    /// Copy-on-write clone of the current space, `None` when out of memory.
    fn clone_current(&self) -> Option<AddressSpace>;

    /// Unmap and free every user page of `space`, keeping the kernel half
    /// and the root table.
    fn release_user_space(&self, space: AddressSpace);

    /// Back `va` with a zeroed frame. Mapping an already present page is a
    /// no-op, so kernel heap pages can be "mapped" eagerly.
    fn map_page(&self, space: AddressSpace, va: u64, flags: MapFlags) -> Result<(), MemoryError>;

    /// Copy `bytes` to user address `va` of `space`.
    fn write_user(&self, space: AddressSpace, va: u64, bytes: &[u8]) -> Result<(), MemoryError>;

    /// Copy user memory of `space` starting at `va` into `buf`.
    fn read_user(&self, space: AddressSpace, va: u64, buf: &mut [u8]) -> Result<(), MemoryError>;

    /// Load `space` on the CPU.
    fn switch(&self, space: AddressSpace);

    /// Free the root table of a space whose user half is already released.
    fn free(&self, space: AddressSpace);
}

/// Map every page overlapping `[start, start + len)`.
pub fn map_range(
    vm: &dyn AddressSpaces,
    space: AddressSpace,
    start: u64,
    len: u64,
    flags: MapFlags,
) -> Result<(), MemoryError> {
    let end = start + len;
    let mut page = page_floor(start);
    while page < end {
        vm.map_page(space, page, flags)?;
        page += PAGE_SIZE as u64;
    }
    Ok(())
}
