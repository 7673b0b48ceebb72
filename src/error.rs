//! Error types for the remote node transport.
//!
//! Every control-context operation returns [`Result`]. When a failure has to
//! travel back to the driver it is turned into a negative errno with
//! [`Error::errno`] and sent in a `Done` reply.

use crate::port::Direction;
use thiserror::Error;

/// Result type alias using this crate's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for remote node operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A memory region with this id is already registered.
    #[error("duplicate memory id {0}")]
    DuplicateMemory(u32),

    /// No memory region with this id is registered.
    #[error("unknown memory id {0}")]
    UnknownMemory(u32),

    /// The node has no such port.
    #[error("unknown {direction} port {port_id}")]
    UnknownPort {
        /// Port direction.
        direction: Direction,
        /// Port id.
        port_id: u32,
    },

    /// No mix is bound for this (direction, port, mix) triple.
    #[error("unknown mix {mix_id} on {direction} port {port_id}")]
    UnknownMix {
        /// Port direction.
        direction: Direction,
        /// Port id.
        port_id: u32,
        /// Mix id.
        mix_id: u32,
    },

    /// The wire description of a buffer is inconsistent or truncated.
    #[error("malformed buffer: {0}")]
    MalformedBuffer(String),

    /// An argument is out of range (buffer id, io size, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not implemented by this node.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// A control message could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A bounded pool has no free entries left.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// mmap of a memory region failed.
    #[error("failed to map memory {id} ({offset}+{size}): {source}")]
    Map {
        /// Region id.
        id: u32,
        /// Requested offset.
        offset: u64,
        /// Requested size.
        size: usize,
        /// Underlying errno.
        source: rustix::io::Errno,
    },

    /// The notification channel of the node is gone.
    #[error("transport closed")]
    TransportClosed,

    /// The realtime data loop is not running anymore.
    #[error("data loop stopped")]
    LoopStopped,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// Negative errno used as the result code of a `Done` reply.
    pub fn errno(&self) -> i32 {
        let code = match self {
            Error::DuplicateMemory(_) => libc::EEXIST,
            Error::UnknownMemory(_)
            | Error::UnknownPort { .. }
            | Error::UnknownMix { .. }
            | Error::MalformedBuffer(_)
            | Error::InvalidArgument(_)
            | Error::Protocol(_) => libc::EINVAL,
            Error::NotSupported(_) => libc::ENOTSUP,
            Error::ResourceExhausted(_) => libc::ENOSPC,
            Error::Map { source, .. } => source.raw_os_error(),
            Error::TransportClosed | Error::LoopStopped => libc::EPIPE,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::System(e) => e.raw_os_error(),
        };
        -code
    }
}
