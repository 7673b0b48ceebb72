//! Anonymous shared memory created with `memfd_create`.
//!
//! The node itself never allocates buffer memory; the driver does and sends
//! the descriptors with `AddMemory`. [`MemFd`] is the allocation side of that
//! exchange, used by drivers, tools and tests.

use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use std::ffi::CString;

/// A sized memfd.
///
/// # Example
///
/// ```rust,ignore
/// use parallax_remote::memory::MemFd;
///
/// let memfd = MemFd::new("buffers", 64 * 1024)?;
/// memfd.write_at(0, &[1, 2, 3])?;
/// let fd = memfd.try_clone_fd()?; // send this one with AddMemory
/// ```
#[derive(Debug)]
pub struct MemFd {
    fd: OwnedFd,
    len: usize,
    name: String,
}

impl MemFd {
    /// Create a memfd of `size` bytes.
    ///
    /// `name` is only visible in `/proc/<pid>/fd/`.
    pub fn new(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArgument("memfd size must be greater than 0".into()));
        }

        let cname = CString::new(name).map_err(|e| Error::InvalidArgument(e.to_string()))?;
        let fd = rustix::fs::memfd_create(&cname, rustix::fs::MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, size as u64)?;

        Ok(Self {
            fd,
            len: size,
            name: name.to_string(),
        })
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; zero sized memfds are rejected by [`MemFd::new`].
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Debug name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Duplicate the descriptor (close-on-exec).
    pub fn try_clone_fd(&self) -> Result<OwnedFd> {
        Ok(rustix::io::fcntl_dupfd_cloexec(&self.fd, 0)?)
    }

    /// Write `data` at `offset` without mapping the memory.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_bounds(offset, data.len())?;
        let mut written = 0;
        while written < data.len() {
            written += rustix::io::pwrite(&self.fd, &data[written..], offset + written as u64)?;
        }
        Ok(())
    }

    /// Read `buf.len()` bytes at `offset`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, buf.len())?;
        let mut read = 0;
        while read < buf.len() {
            let n = rustix::io::pread(&self.fd, &mut buf[read..], offset + read as u64)?;
            if n == 0 {
                return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
            read += n;
        }
        Ok(())
    }

    fn check_bounds(&self, offset: u64, len: usize) -> Result<()> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.len as u64 => Ok(()),
            _ => Err(Error::InvalidArgument(format!(
                "{}+{} out of bounds of memfd '{}' ({} bytes)",
                offset, len, self.name, self.len
            ))),
        }
    }
}

impl AsFd for MemFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
