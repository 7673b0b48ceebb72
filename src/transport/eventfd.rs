//! eventfd wrapper used for wake-ups in both directions.

use crate::error::{Error, Result};
use rustix::event::{EventfdFlags, eventfd};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};

/// A Linux eventfd carrying 8 byte counter tokens.
#[derive(Debug)]
pub struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    /// Create a non-blocking eventfd with counter 0.
    pub fn new() -> Result<Self> {
        let fd = eventfd(0, EventfdFlags::NONBLOCK | EventfdFlags::CLOEXEC)?;
        Ok(Self { fd })
    }

    /// Wrap a descriptor received from the peer.
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Duplicate the descriptor, e.g. to hand it to the peer.
    pub fn try_clone_fd(&self) -> Result<OwnedFd> {
        Ok(rustix::io::fcntl_dupfd_cloexec(&self.fd, 0)?)
    }

    /// Add 1 to the counter.
    ///
    /// Safe to call from the realtime thread.
    pub fn notify(&self) -> Result<()> {
        let val: u64 = 1;
        rustix::io::write(&self.fd, &val.to_ne_bytes())?;
        Ok(())
    }

    /// Read and reset the counter.
    ///
    /// Returns `None` if the counter is zero (non-blocking descriptors only).
    pub fn read_token(&self) -> Result<Option<u64>> {
        let mut buf = [0u8; 8];
        match rustix::io::read(&self.fd, &mut buf) {
            Ok(8) => Ok(Some(u64::from_ne_bytes(buf))),
            Ok(n) => Err(Error::Protocol(format!("short eventfd read of {} bytes", n))),
            Err(rustix::io::Errno::WOULDBLOCK) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns `true` if the eventfd was signaled, `false` if it would block.
    pub fn try_wait(&self) -> Result<bool> {
        Ok(self.read_token()?.is_some())
    }
}

impl AsFd for EventFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
