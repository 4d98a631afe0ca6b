//! USTAR tar archive filesystem.
//!
//! Parses a POSIX.1-2001 (USTAR) tar archive that has been loaded into memory
//! (e.g. the boot ramdisk module). Read-only; sufficient for `exec`, `stat`,
//! `read` and `list_dir` on boot-time programs.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use super::{FileKind, FileStat, FileSystem, FsError, normalize};

/// Size of a single tar block (header or data padding unit).
const BLOCK: usize = 512;

/// Offset and size of the `magic` field in a USTAR header.
const MAGIC_OFFSET: usize = 257;
const MAGIC_LEN: usize = 5; // "ustar" (without trailing NUL variant byte)

/// Type flag of a directory entry.
const TYPE_DIRECTORY: u8 = b'5';

/// A parsed TAR entry header.
#[derive(Debug)]
pub struct TarEntry<'a> {
    /// File name with `./`, `/` decorations removed.
    pub name: &'a str,
    /// File size in bytes (decoded from the octal `size` field).
    pub size: usize,
    /// Type flag character (e.g. `'0'` = regular file, `'5'` = directory).
    pub typeflag: u8,
    /// Byte slice of the file contents (may be empty for directories).
    pub data: &'a [u8],
}

impl TarEntry<'_> {
    pub fn kind(&self) -> FileKind {
        if self.typeflag == TYPE_DIRECTORY {
            FileKind::Directory
        } else {
            FileKind::File
        }
    }
}

/// Iterator over the entries of a USTAR tar archive.
pub struct TarIter<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> TarIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }
}

impl<'a> Iterator for TarIter<'a> {
    type Item = TarEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            // Need at least one full header block.
            if self.offset + BLOCK > self.buf.len() {
                return None;
            }

            let header = &self.buf[self.offset..self.offset + BLOCK];

            // A zero block marks the end of archive.
            if header.iter().all(|&b| b == 0) {
                return None;
            }

            let magic = &header[MAGIC_OFFSET..MAGIC_OFFSET + MAGIC_LEN];
            if magic != b"ustar" {
                // Not a valid header: skip this block and try the next.
                self.offset += BLOCK;
                continue;
            }

            let name_bytes = &header[0..100];
            let name_end = name_bytes.iter().position(|&b| b == 0).unwrap_or(100);
            let name = core::str::from_utf8(&name_bytes[..name_end]).unwrap_or("<invalid>");

            let size = parse_octal(&header[124..136]);
            let typeflag = header[156];

            let data_start = self.offset + BLOCK;
            let data_end = data_start + size;
            let data = if size > 0 && data_end <= self.buf.len() {
                &self.buf[data_start..data_end]
            } else {
                &[]
            };

            // Advance past header + data (data padded to BLOCK boundary).
            self.offset += BLOCK + size.div_ceil(BLOCK) * BLOCK;

            return Some(TarEntry {
                name: normalize(name),
                size,
                typeflag,
                data,
            });
        }
    }
}

/// Parse an octal ASCII string (with possible NUL/space padding) into `usize`.
fn parse_octal(field: &[u8]) -> usize {
    let mut value: usize = 0;
    for &b in field {
        if b == 0 || b == b' ' {
            break;
        }
        if (b'0'..=b'7').contains(&b) {
            value = value * 8 + (b - b'0') as usize;
        }
    }
    value
}

/// Read-only filesystem over an in-memory tar image.
pub struct TarFs {
    image: &'static [u8],
}

impl TarFs {
    pub fn new(image: &'static [u8]) -> Self {
        Self { image }
    }

    fn find(&self, path: &str) -> Option<TarEntry<'static>> {
        let wanted = normalize(path);
        TarIter::new(self.image).find(|entry| entry.name == wanted)
    }

    /// Directories are implied by the paths of the files inside them, so an
    /// archive without explicit directory entries still lists correctly.
    fn is_directory(&self, dir: &str) -> bool {
        dir.is_empty()
            || TarIter::new(self.image).any(|entry| {
                (entry.name == dir && entry.kind() == FileKind::Directory)
                    || entry
                        .name
                        .strip_prefix(dir)
                        .is_some_and(|rest| rest.starts_with('/'))
            })
    }
}

impl FileSystem for TarFs {
    fn stat(&self, path: &str) -> Result<FileStat, FsError> {
        if let Some(entry) = self.find(path) {
            return Ok(FileStat {
                size: entry.size,
                kind: entry.kind(),
            });
        }
        if self.is_directory(normalize(path)) {
            return Ok(FileStat {
                size: 0,
                kind: FileKind::Directory,
            });
        }
        Err(FsError::NotFound)
    }

    fn read(&self, path: &str, buf: &mut [u8], offset: usize) -> Result<usize, FsError> {
        let entry = self.find(path).ok_or(FsError::NotFound)?;
        if entry.kind() == FileKind::Directory {
            return Err(FsError::IsADirectory);
        }
        if entry.data.len() != entry.size {
            // Truncated archive: the header promises more than the image holds.
            return Err(FsError::Io);
        }
        if offset >= entry.data.len() {
            return Ok(0);
        }
        let count = buf.len().min(entry.data.len() - offset);
        buf[..count].copy_from_slice(&entry.data[offset..offset + count]);
        Ok(count)
    }

    fn write(&self, _path: &str, _buf: &[u8], _offset: usize) -> Result<usize, FsError> {
        Err(FsError::ReadOnly)
    }

    fn list_dir(&self, path: &str) -> Result<Vec<String>, FsError> {
        let dir = normalize(path);
        if !self.is_directory(dir) {
            return match self.find(dir) {
                Some(_) => Err(FsError::NotADirectory),
                None => Err(FsError::NotFound),
            };
        }
        let mut names: Vec<String> = Vec::new();
        for entry in TarIter::new(self.image) {
            let rest = if dir.is_empty() {
                Some(entry.name)
            } else {
                entry.name.strip_prefix(dir).and_then(|r| r.strip_prefix('/'))
            };
            let Some(rest) = rest.filter(|r| !r.is_empty()) else {
                continue;
            };
            let child = rest.split('/').next().unwrap_or(rest);
            if !names.iter().any(|n| n == child) {
                names.push(child.to_string());
            }
        }
        Ok(names)
    }
}
