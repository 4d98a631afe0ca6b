//! Hosted test machine: a booted kernel over [`HostedCpu`], an in-memory
//! VM and a tar ramdisk, plus builders for tar and ELF images.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use crate::arch::hosted::{HostedCpu, UserEntry};
use crate::fs::elf::ElfLoader;
use crate::fs::tar::TarFs;
use crate::memory::{AddressSpace, AddressSpaces, MapFlags, MemoryError, PAGE_SIZE, page_floor};
use crate::task::thread::{Thread, ThreadEntry};
use crate::{Kernel, KernelConfig, Result, Services};

// ── Log capture ─────────────────────────────────────────────────

struct MemorySink(StdMutex<String>);

impl klog::Sink for MemorySink {
    fn write_str(&self, s: &str) {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).push_str(s);
    }
}

static LOG: MemorySink = MemorySink(StdMutex::new(String::new()));

/// Whether any test kernel has logged a line containing `needle`.
pub fn logged(needle: &str) -> bool {
    LOG.0.lock().unwrap_or_else(|p| p.into_inner()).contains(needle)
}

// ── Address spaces ──────────────────────────────────────────────

pub const KERNEL_SPACE: AddressSpace = AddressSpace(0x1000);

struct Page {
    flags: MapFlags,
    /// Kernel-only pages (kernel stacks) are recorded but not backed.
    bytes: Option<Box<[u8]>>,
}

struct VmState {
    current: AddressSpace,
    next_space: u64,
    pages: BTreeMap<(AddressSpace, u64), Page>,
    switches: Vec<AddressSpace>,
    released: Vec<AddressSpace>,
    freed: Vec<AddressSpace>,
    fail_clones: bool,
    fail_user_maps: bool,
}

impl VmState {
    /// Visit `[va, va + len)` page by page; `f` gets each backed piece and
    /// its offset into the range.
    fn each_piece(
        &mut self,
        space: AddressSpace,
        va: u64,
        len: usize,
        mut f: impl FnMut(&mut [u8], usize),
    ) -> core::result::Result<(), MemoryError> {
        let mut done = 0;
        while done < len {
            let addr = va.checked_add(done as u64).ok_or(MemoryError::NotMapped)?;
            let page = page_floor(addr);
            let offset = (addr - page) as usize;
            let n = (PAGE_SIZE - offset).min(len - done);
            let bytes = self
                .pages
                .get_mut(&(space, page))
                .and_then(|p| p.bytes.as_mut())
                .ok_or(MemoryError::NotMapped)?;
            f(&mut bytes[offset..offset + n], done);
            done += n;
        }
        Ok(())
    }
}

/// Page-granular VM that keeps user memory in host buffers and records
/// every clone, switch, release and free.
pub struct HostedVm {
    state: StdMutex<VmState>,
}

impl HostedVm {
    pub fn new() -> Self {
        Self {
            state: StdMutex::new(VmState {
                current: KERNEL_SPACE,
                next_space: 0x2000,
                pages: BTreeMap::new(),
                switches: Vec::new(),
                released: Vec::new(),
                freed: Vec::new(),
                fail_clones: false,
                fail_user_maps: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, VmState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Make every following `clone_current` fail as if out of memory.
    pub fn fail_clones(&self, fail: bool) {
        self.state().fail_clones = fail;
    }

    /// Make every following user `map_page` fail as if out of memory.
    pub fn fail_user_maps(&self, fail: bool) {
        self.state().fail_user_maps = fail;
    }

    pub fn is_mapped(&self, space: AddressSpace, va: u64) -> bool {
        self.state().pages.contains_key(&(space, page_floor(va)))
    }

    pub fn flags(&self, space: AddressSpace, va: u64) -> Option<MapFlags> {
        self.state().pages.get(&(space, page_floor(va))).map(|p| p.flags)
    }

    /// User pages still mapped in `space`.
    pub fn user_pages(&self, space: AddressSpace) -> usize {
        self.state()
            .pages
            .iter()
            .filter(|((s, _), page)| *s == space && page.flags.contains(MapFlags::USER))
            .count()
    }

    /// The NUL-terminated string at `addr`.
    pub fn read_c_string(&self, space: AddressSpace, addr: u64) -> String {
        let mut bytes = Vec::new();
        let mut va = addr;
        loop {
            let mut byte = [0u8];
            self.read_user(space, va, &mut byte).unwrap();
            if byte[0] == 0 {
                break;
            }
            bytes.push(byte[0]);
            va += 1;
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn switches(&self) -> Vec<AddressSpace> {
        self.state().switches.clone()
    }

    pub fn released(&self) -> Vec<AddressSpace> {
        self.state().released.clone()
    }

    pub fn freed(&self) -> Vec<AddressSpace> {
        self.state().freed.clone()
    }
}

impl Default for HostedVm {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpaces for HostedVm {
    fn kernel_space(&self) -> AddressSpace {
        KERNEL_SPACE
    }

    fn current(&self) -> AddressSpace {
        self.state().current
    }

    fn clone_current(&self) -> Option<AddressSpace> {
        let mut state = self.state();
        if state.fail_clones {
            return None;
        }
        let space = AddressSpace(state.next_space);
        state.next_space += 0x1000;
        let current = state.current;
        let copies: Vec<_> = state
            .pages
            .iter()
            .filter(|((s, _), page)| *s == current && page.flags.contains(MapFlags::USER))
            .map(|((_, va), page)| {
                let copy = Page {
                    flags: page.flags,
                    bytes: page.bytes.clone(),
                };
                ((space, *va), copy)
            })
            .collect();
        state.pages.extend(copies);
        Some(space)
    }

    fn release_user_space(&self, space: AddressSpace) {
        let mut state = self.state();
        state
            .pages
            .retain(|(s, _), page| *s != space || !page.flags.contains(MapFlags::USER));
        state.released.push(space);
    }

    fn map_page(&self, space: AddressSpace, va: u64, flags: MapFlags) -> core::result::Result<(), MemoryError> {
        let backed = space != KERNEL_SPACE || flags.contains(MapFlags::USER);
        let mut state = self.state();
        if state.fail_user_maps && flags.contains(MapFlags::USER) {
            return Err(MemoryError::OutOfMemory);
        }
        state.pages.entry((space, page_floor(va))).or_insert_with(|| Page {
            flags,
            bytes: backed.then(|| vec![0u8; PAGE_SIZE].into_boxed_slice()),
        });
        Ok(())
    }

    fn write_user(&self, space: AddressSpace, va: u64, bytes: &[u8]) -> core::result::Result<(), MemoryError> {
        self.state()
            .each_piece(space, va, bytes.len(), |dst, at| dst.copy_from_slice(&bytes[at..at + dst.len()]))
    }

    fn read_user(&self, space: AddressSpace, va: u64, buf: &mut [u8]) -> core::result::Result<(), MemoryError> {
        let len = buf.len();
        self.state()
            .each_piece(space, va, len, |src, at| buf[at..at + src.len()].copy_from_slice(src))
    }

    fn switch(&self, space: AddressSpace) {
        let mut state = self.state();
        state.current = space;
        state.switches.push(space);
    }

    fn free(&self, space: AddressSpace) {
        assert_ne!(space, KERNEL_SPACE, "freeing the kernel address space");
        let mut state = self.state();
        state.pages.retain(|(s, _), _| *s != space);
        state.freed.push(space);
    }
}

// ── Images ──────────────────────────────────────────────────────

fn put(buf: &mut [u8], at: usize, bytes: &[u8]) {
    buf[at..at + bytes.len()].copy_from_slice(bytes);
}

/// A USTAR archive of `files`; `None` contents make a directory entry.
pub fn tar_image(files: &[(&str, Option<&[u8]>)]) -> &'static [u8] {
    let mut image = Vec::new();
    for (name, contents) in files {
        let data = contents.unwrap_or_default();
        let mut header = [0u8; 512];
        put(&mut header, 0, name.as_bytes());
        put(&mut header, 100, b"0000644\0");
        put(&mut header, 124, format!("{:011o}\0", data.len()).as_bytes());
        put(&mut header, 156, if contents.is_some() { b"0" } else { b"5" });
        put(&mut header, 257, b"ustar\0");
        put(&mut header, 263, b"00");
        put(&mut header, 148, b"        ");
        let sum: u32 = header.iter().map(|&b| b as u32).sum();
        put(&mut header, 148, format!("{:06o}\0 ", sum).as_bytes());

        image.extend_from_slice(&header);
        image.extend_from_slice(data);
        image.resize(image.len().div_ceil(512) * 512, 0);
    }
    image.resize(image.len() + 1024, 0);
    Box::leak(image.into_boxed_slice())
}

/// A static ELF64 x86_64 executable with one R+X PT_LOAD segment holding
/// `payload` at `vaddr`, followed by 12 bytes of bss.
pub fn elf_image(entry: u64, vaddr: u64, payload: &[u8]) -> Vec<u8> {
    const EHDR: usize = 64;
    const PHDR: usize = 56;
    let data_offset = EHDR + PHDR;

    let mut image = vec![0u8; data_offset];
    put(&mut image, 0, &[0x7f, b'E', b'L', b'F', 2, 1, 1]);
    put(&mut image, 16, &2u16.to_le_bytes()); // ET_EXEC
    put(&mut image, 18, &62u16.to_le_bytes()); // EM_X86_64
    put(&mut image, 20, &1u32.to_le_bytes());
    put(&mut image, 24, &entry.to_le_bytes());
    put(&mut image, 32, &(EHDR as u64).to_le_bytes());
    put(&mut image, 52, &(EHDR as u16).to_le_bytes());
    put(&mut image, 54, &(PHDR as u16).to_le_bytes());
    put(&mut image, 56, &1u16.to_le_bytes());

    let phdr = EHDR;
    put(&mut image, phdr, &1u32.to_le_bytes()); // PT_LOAD
    put(&mut image, phdr + 4, &5u32.to_le_bytes()); // R+X
    put(&mut image, phdr + 8, &(data_offset as u64).to_le_bytes());
    put(&mut image, phdr + 16, &vaddr.to_le_bytes());
    put(&mut image, phdr + 24, &vaddr.to_le_bytes());
    put(&mut image, phdr + 32, &(payload.len() as u64).to_le_bytes());
    put(&mut image, phdr + 40, &(payload.len() as u64 + 12).to_le_bytes());
    put(&mut image, phdr + 48, &(PAGE_SIZE as u64).to_le_bytes());

    image.extend_from_slice(payload);
    image
}

// ── Machine ─────────────────────────────────────────────────────

/// A booted kernel. The test thread is the boot context: thread 0, idle.
pub struct Machine {
    pub kernel: &'static Kernel,
    pub cpu: HostedCpu,
    pub vm: Arc<HostedVm>,
}

impl Machine {
    pub fn boot() -> Self {
        Self::boot_with(KernelConfig::default(), &[])
    }

    pub fn boot_with(config: KernelConfig, files: &[(&str, Option<&[u8]>)]) -> Self {
        match Self::try_boot_with(config, files) {
            Ok(machine) => machine,
            Err(err) => panic!("boot failed: {err}"),
        }
    }

    pub fn try_boot_with(config: KernelConfig, files: &[(&str, Option<&[u8]>)]) -> Result<Self> {
        klog::init(&LOG, config.log_level);
        let cpu = HostedCpu::new();
        let vm = Arc::new(HostedVm::new());
        let services = Services {
            cpu: Arc::new(cpu.clone()),
            vm: vm.clone(),
            fs: Arc::new(TarFs::new(tar_image(files))),
            loader: Arc::new(ElfLoader),
        };
        let kernel = Kernel::boot(config, services)?;
        cpu.on_user_return(move || kernel.thread_exit());
        Ok(Self { kernel, cpu, vm })
    }

    /// Boot with an ELF executable at each path whose single segment
    /// starts on the page of its entry address.
    pub fn with_binaries(binaries: &[(&str, u64)]) -> Self {
        let images: Vec<Vec<u8>> = binaries
            .iter()
            .map(|&(_, entry)| elf_image(entry, entry & !(PAGE_SIZE as u64 - 1), b"\xc3"))
            .collect();
        let files: Vec<(&str, Option<&[u8]>)> = binaries
            .iter()
            .zip(&images)
            .map(|(&(path, _), image)| (path, Some(image.as_slice())))
            .collect();
        Self::boot_with(KernelConfig::default(), &files)
    }

    /// A runnable kernel thread in the root process.
    pub fn spawn(&self, name: &str, body: impl FnOnce() + Send + 'static) -> Arc<Thread> {
        let root = self.kernel.processes.root();
        let priority = self.kernel.config().default_priority;
        let thread = self
            .kernel
            .create_thread(&root, name, ThreadEntry::Kernel(Box::new(body)), priority)
            .unwrap();
        self.kernel.scheduler.add(thread.clone());
        thread
    }

    /// The user program at `entry`.
    pub fn program(&self, entry: u64, program: impl Fn(UserEntry) + Send + Sync + 'static) {
        self.cpu.program(entry, program);
    }

    /// Run until nothing but the boot thread is runnable.
    pub fn settle(&self) {
        while self.kernel.scheduler.ready_len() > 0 {
            self.kernel.scheduler.yield_now();
        }
    }

    /// Settle, then wait until the reaper has freed everything dead.
    pub fn reap(&self) {
        self.settle();
        while self.kernel.scheduler.graveyard_len() > 0 {
            self.kernel.scheduler.yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::tar::TarIter;

    #[test]
    fn tar_headers_carry_a_valid_checksum() {
        let image = tar_image(&[("a", Some(b"xyz".as_slice())), ("d/", None)]);
        let header = &image[..512];
        let stored = u32::from_str_radix(std::str::from_utf8(&header[148..154]).unwrap(), 8).unwrap();
        let mut blanked = header.to_vec();
        put(&mut blanked, 148, b"        ");
        assert_eq!(stored, blanked.iter().map(|&b| b as u32).sum::<u32>());
        assert_eq!(TarIter::new(image).count(), 2);
    }

    #[test]
    fn user_pages_are_copied_on_clone_and_dropped_on_release() {
        let vm = HostedVm::new();
        let a = vm.clone_current().unwrap();
        vm.switch(a);
        vm.map_page(a, 0x40_0000, MapFlags::USER | MapFlags::WRITABLE).unwrap();
        vm.write_user(a, 0x40_0ffd, b"hi").unwrap();
        assert_eq!(vm.write_user(a, 0x50_0000, b"hi"), Err(MemoryError::NotMapped));

        let b = vm.clone_current().unwrap();
        assert_eq!(vm.read_c_string(b, 0x40_0ffd), "hi");
        vm.release_user_space(a);
        assert_eq!(vm.user_pages(a), 0);
        assert_eq!(vm.user_pages(b), 1);
        assert_eq!(vm.switches(), [a]);
    }
}
