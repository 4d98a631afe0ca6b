//! Filesystem and executable-loading services.
//!
//! `exec` reads programs through a [`FileSystem`] and hands the bytes to an
//! [`elf::ExecutableLoader`]. Both are injected at boot; [`tar::TarFs`] is the
//! read-only boot ramdisk backend.

pub mod elf;
pub mod tar;

use alloc::string::String;
use alloc::vec::Vec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
}

/// Result of [`FileSystem::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: usize,
    pub kind: FileKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    NotADirectory,
    IsADirectory,
    ReadOnly,
    Io,
}

/// A mounted filesystem backend.
pub trait FileSystem: Send + Sync {
    fn stat(&self, path: &str) -> Result<FileStat, FsError>;

    /// Read up to `buf.len()` bytes starting at `offset`; returns the count
    /// copied (0 at or past end of file).
    fn read(&self, path: &str, buf: &mut [u8], offset: usize) -> Result<usize, FsError>;

    fn write(&self, path: &str, buf: &[u8], offset: usize) -> Result<usize, FsError>;

    /// Names of the direct children of directory `path`.
    fn list_dir(&self, path: &str) -> Result<Vec<String>, FsError>;
}

/// Strip leading `./` and `/` plus trailing `/` so `"/bin/"`, `"./bin"` and
/// `"bin"` name the same entry. The root becomes `""`.
pub fn normalize(path: &str) -> &str {
    let mut path = path;
    loop {
        if let Some(rest) = path.strip_prefix("./") {
            path = rest;
        } else if let Some(rest) = path.strip_prefix('/') {
            path = rest;
        } else {
            break;
        }
    }
    path.trim_end_matches('/')
}

#[cfg(test)]
mod tests {
    use super::normalize;

    #[test]
    fn normalize_strips_decorations() {
        assert_eq!(normalize("./bin/init"), "bin/init");
        assert_eq!(normalize("/bin/"), "bin");
        assert_eq!(normalize("/"), "");
        assert_eq!(normalize("."), ".");
    }
}
