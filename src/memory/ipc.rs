//! File descriptor passing over Unix sockets (`SCM_RIGHTS`).
//!
//! The control channel carries memory and eventfd descriptors next to the
//! serialized messages that reference them.

use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::net::{
    RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags, recvmsg, sendmsg,
};
use std::io::{IoSlice, IoSliceMut};
use std::mem::MaybeUninit;

/// Maximum number of file descriptors attached to a single message.
pub const MAX_FDS_PER_MESSAGE: usize = 8;

const ANCILLARY_SPACE: usize = 128;

/// Send `data` with `fds` attached.
///
/// `data` must not be empty when fds are attached; the kernel drops
/// ancillary data on zero-length writes.
pub fn send_with_fds<S: AsFd, Fd: AsFd>(socket: S, data: &[u8], fds: &[Fd]) -> Result<usize> {
    if fds.len() > MAX_FDS_PER_MESSAGE {
        return Err(Error::InvalidArgument(format!(
            "too many fds: {} > {}",
            fds.len(),
            MAX_FDS_PER_MESSAGE
        )));
    }
    if data.is_empty() && !fds.is_empty() {
        return Err(Error::InvalidArgument("fds need a non-empty payload".into()));
    }

    let borrowed: Vec<BorrowedFd<'_>> = fds.iter().map(|fd| fd.as_fd()).collect();

    let mut space: [MaybeUninit<u8>; ANCILLARY_SPACE] =
        [const { MaybeUninit::uninit() }; ANCILLARY_SPACE];
    let mut ancillary = SendAncillaryBuffer::new(&mut space);
    if !borrowed.is_empty() && !ancillary.push(SendAncillaryMessage::ScmRights(&borrowed)) {
        return Err(Error::InvalidArgument(
            "failed to add fds to ancillary buffer".into(),
        ));
    }

    let iov = [IoSlice::new(data)];
    let sent = sendmsg(socket, &iov, &mut ancillary, SendFlags::NOSIGNAL)?;
    Ok(sent)
}

/// Receive into `buf`, collecting any attached fds into `fds`.
///
/// Returns the number of bytes read; zero means the peer closed the socket.
pub fn recv_with_fds<S: AsFd>(socket: S, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> Result<usize> {
    if buf.is_empty() {
        return Err(Error::InvalidArgument("receive buffer cannot be empty".into()));
    }

    let mut space: [MaybeUninit<u8>; ANCILLARY_SPACE] =
        [const { MaybeUninit::uninit() }; ANCILLARY_SPACE];
    let mut ancillary = RecvAncillaryBuffer::new(&mut space);

    let mut iov = [IoSliceMut::new(buf)];
    let result = recvmsg(socket, &mut iov, &mut ancillary, RecvFlags::CMSG_CLOEXEC)?;

    for msg in ancillary.drain() {
        if let RecvAncillaryMessage::ScmRights(rights) = msg {
            fds.extend(rights);
        }
    }

    Ok(result.bytes)
}
