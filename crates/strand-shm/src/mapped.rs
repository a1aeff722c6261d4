//! Memory-mapped files.
//!
//! Log buffers and the command-and-control file live in files that the
//! driver creates and clients map. Each mapping is `MAP_SHARED`, so every
//! process mapping the same file sees the same bytes.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};

use strand_core::Region;
use thiserror::Error;

/// Errors creating or mapping a file.
#[derive(Error, Debug)]
pub enum MapError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot map empty file {0}")]
    Empty(PathBuf),
}

/// A shared read/write mapping of a whole file.
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
    path: PathBuf,
}

// SAFETY: the mapping is plain shared memory; all access goes through
// `AtomicBuffer`, which only uses atomics and bulk copies.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Create a new zero-filled file of `len` bytes and map it.
    ///
    /// Fails if the file already exists.
    pub fn create(path: &Path, len: usize) -> Result<Self, MapError> {
        if len == 0 {
            return Err(MapError::Empty(path.to_path_buf()));
        }
        let io_err = |source| MapError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(io_err)?;
        file.set_len(len as u64).map_err(io_err)?;

        Self::map(&file, len, path)
    }

    /// Map an existing file in full.
    pub fn open(path: &Path) -> Result<Self, MapError> {
        let io_err = |source| MapError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(io_err)?;
        let len = file.metadata().map_err(io_err)?.len() as usize;
        if len == 0 {
            return Err(MapError::Empty(path.to_path_buf()));
        }

        Self::map(&file, len, path)
    }

    fn map(file: &File, len: usize, path: &Path) -> Result<Self, MapError> {
        use std::os::unix::io::AsRawFd;

        // SAFETY: fd is valid for the duration of the call; the kernel picks
        // the address and the mapping outlives the file handle.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(MapError::Io {
                path: path.to_path_buf(),
                source: io::Error::last_os_error(),
            });
        }

        let ptr = NonNull::new(addr as *mut u8).ok_or_else(|| MapError::Io {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::Other, "mmap returned null"),
        })?;

        Ok(Self {
            ptr,
            len,
            path: path.to_path_buf(),
        })
    }

    /// The backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

// SAFETY: the mapping is page aligned and stays valid until `drop`.
unsafe impl Region for MappedRegion {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped once.
        let ret = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) };
        if ret != 0 {
            tracing::warn!(
                "munmap of {} failed: {}",
                self.path.display(),
                io::Error::last_os_error()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use strand_core::AtomicBuffer;

    use super::*;

    #[test]
    fn test_create_and_reopen_share_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("region.dat");

        let first = AtomicBuffer::new(Arc::new(MappedRegion::create(&path, 4096).unwrap()));
        first.put_i64_ordered(8, 1234);

        let second = AtomicBuffer::new(Arc::new(MappedRegion::open(&path).unwrap()));
        assert_eq!(second.capacity(), 4096);
        assert_eq!(second.get_i64_volatile(8), 1234);

        second.put_i32(0, 7);
        assert_eq!(first.get_i32_volatile(0), 7);
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region.dat");
        let _first = MappedRegion::create(&path, 64).unwrap();
        assert!(matches!(MappedRegion::create(&path, 64), Err(MapError::Io { .. })));
    }

    #[test]
    fn test_empty_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.dat");
        assert!(matches!(MappedRegion::create(&path, 0), Err(MapError::Empty(_))));

        std::fs::write(&path, b"").unwrap();
        assert!(matches!(MappedRegion::open(&path), Err(MapError::Empty(_))));
    }
}
