//! Minimal ELF64 parser and loader for user-mode executables.
//!
//! Supports loading statically-linked ELF64 executables with PT_LOAD segments.
//! Only the subset needed to load flat user binaries is implemented.

use crate::memory::{self, AddressSpace, AddressSpaces, MapFlags, MemoryError};

/// ELF magic number: 0x7f 'E' 'L' 'F'.
const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// ELF class: 64-bit.
const ELFCLASS64: u8 = 2;

/// ELF data encoding: little-endian.
const ELFDATA2LSB: u8 = 1;

/// ELF type: executable.
const ET_EXEC: u16 = 2;

/// ELF machine: x86-64.
const EM_X86_64: u16 = 62;

/// Program header type: loadable segment.
const PT_LOAD: u32 = 1;

/// Program header flags.
const PF_X: u32 = 1; // Execute
const PF_W: u32 = 2; // Write

/// First non-canonical address; segments must end below it.
const USER_LIMIT: u64 = 0x0000_8000_0000_0000;

/// ELF64 file header (first 64 bytes).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct Elf64Header {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

/// ELF64 program header (56 bytes).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct Elf64Phdr {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

impl Elf64Phdr {
    /// Returns true if this is a PT_LOAD segment.
    pub fn is_load(&self) -> bool {
        self.p_type == PT_LOAD
    }

    fn map_flags(&self) -> MapFlags {
        let mut flags = MapFlags::USER;
        if self.p_flags & PF_W != 0 {
            flags |= MapFlags::WRITABLE;
        }
        if self.p_flags & PF_X != 0 {
            flags |= MapFlags::EXECUTABLE;
        }
        flags
    }
}

/// Information extracted from a validated ELF64 executable.
pub struct ElfInfo<'a> {
    /// Raw ELF data.
    pub data: &'a [u8],
    /// Entry point virtual address.
    pub entry: u64,
    /// Program headers.
    pub phdrs: &'a [Elf64Phdr],
}

/// Errors that can occur while parsing or loading an ELF image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    TooSmall,
    BadMagic,
    Not64Bit,
    NotLittleEndian,
    NotExecutable,
    NotX86_64,
    BadPhdr,
    /// A PT_LOAD segment reaches past the file or into kernel space.
    BadSegment,
    /// The VM service could not back a segment page.
    Map(MemoryError),
}

/// Parse and validate an ELF64 executable from a byte slice.
pub fn parse(data: &[u8]) -> Result<ElfInfo<'_>, ElfError> {
    if data.len() < core::mem::size_of::<Elf64Header>() {
        return Err(ElfError::TooSmall);
    }

    // SAFETY: we checked size; the struct is packed so alignment is 1.
    let hdr = unsafe { &*(data.as_ptr() as *const Elf64Header) };

    if hdr.e_ident[0..4] != ELF_MAGIC {
        return Err(ElfError::BadMagic);
    }
    if hdr.e_ident[4] != ELFCLASS64 {
        return Err(ElfError::Not64Bit);
    }
    if hdr.e_ident[5] != ELFDATA2LSB {
        return Err(ElfError::NotLittleEndian);
    }
    if hdr.e_type != ET_EXEC {
        return Err(ElfError::NotExecutable);
    }
    if hdr.e_machine != EM_X86_64 {
        return Err(ElfError::NotX86_64);
    }

    let phoff = hdr.e_phoff as usize;
    let phnum = hdr.e_phnum as usize;
    let phentsize = hdr.e_phentsize as usize;

    if phentsize != core::mem::size_of::<Elf64Phdr>() {
        return Err(ElfError::BadPhdr);
    }

    let phdrs_end = phnum
        .checked_mul(phentsize)
        .and_then(|len| len.checked_add(phoff))
        .ok_or(ElfError::BadPhdr)?;
    if phdrs_end > data.len() {
        return Err(ElfError::BadPhdr);
    }

    // SAFETY: bounds checked, packed struct, alignment 1.
    let phdrs = unsafe {
        core::slice::from_raw_parts(data.as_ptr().add(phoff) as *const Elf64Phdr, phnum)
    };

    let info = ElfInfo {
        data,
        entry: hdr.e_entry,
        phdrs,
    };
    for phdr in info.load_segments() {
        check_segment(data, phdr)?;
    }
    Ok(info)
}

impl ElfInfo<'_> {
    pub fn load_segments(&self) -> impl Iterator<Item = &Elf64Phdr> {
        self.phdrs.iter().filter(|p| p.is_load())
    }
}

fn check_segment(data: &[u8], phdr: &Elf64Phdr) -> Result<(), ElfError> {
    let file_end = phdr.p_offset.checked_add(phdr.p_filesz);
    let mem_end = phdr.p_vaddr.checked_add(phdr.p_memsz);
    match (file_end, mem_end) {
        (Some(file_end), Some(mem_end))
            if file_end <= data.len() as u64
                && phdr.p_filesz <= phdr.p_memsz
                && mem_end <= USER_LIMIT =>
        {
            Ok(())
        }
        _ => Err(ElfError::BadSegment),
    }
}

/// Turns executable images into mapped user memory.
pub trait ExecutableLoader: Send + Sync {
    /// Check that `image` would load, without touching any address space.
    fn validate(&self, image: &[u8]) -> Result<(), ElfError>;

    /// Map and fill every loadable segment of `image` in `space`; returns
    /// the entry point.
    fn load(&self, vm: &dyn AddressSpaces, space: AddressSpace, image: &[u8]) -> Result<u64, ElfError>;
}

/// Loader for static ELF64 x86_64 executables.
#[derive(Debug, Default, Clone, Copy)]
pub struct ElfLoader;

impl ExecutableLoader for ElfLoader {
    fn validate(&self, image: &[u8]) -> Result<(), ElfError> {
        parse(image).map(|_| ())
    }

    fn load(&self, vm: &dyn AddressSpaces, space: AddressSpace, image: &[u8]) -> Result<u64, ElfError> {
        let elf = parse(image)?;
        for phdr in elf.load_segments() {
            let (vaddr, memsz) = (phdr.p_vaddr, phdr.p_memsz);
            let (offset, filesz) = (phdr.p_offset as usize, phdr.p_filesz as usize);
            memory::map_range(vm, space, vaddr, memsz, phdr.map_flags()).map_err(ElfError::Map)?;
            // Fresh pages are zeroed, which covers .bss past p_filesz.
            if filesz > 0 {
                vm.write_user(space, vaddr, &elf.data[offset..offset + filesz])
                    .map_err(ElfError::Map)?;
            }
            klog::trace!("elf: segment {:#x}+{:#x} ({} file bytes)", vaddr, memsz, filesz);
        }
        Ok(elf.entry)
    }
}
