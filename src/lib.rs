//! # Parallax Remote
//!
//! The node side of an out-of-process processing node: buffers described by
//! the graph driver are rebuilt from shared memory, installed on port mixes
//! and cycled between driver and node without copies.
//!
//! ## Features
//!
//! - **Shared memory regions**: fds passed over Unix sockets, reference counted
//!   and mapped once per window
//! - **Wire compatible buffers**: metas, chunks and data planes rebuilt from a
//!   remote description
//! - **Port mixes**: several logical streams on one physical port
//! - **Realtime loop**: node processing driven by eventfd wake-ups, with
//!   invoke-and-wait from the control context
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use parallax_remote::prelude::*;
//!
//! let (mut socket, _) = ControlSocket::pair()?;
//! let source = BufferSource::new().with_fill(|data| {
//!     data.fill(0);
//!     data.len()
//! });
//! let (mut node, outbox) = RemoteNode::new(NodeConfig::default(), source)?;
//! node.serve(&mut socket, &outbox)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod buffer;
pub mod config;
pub mod error;
pub mod memory;
pub mod node;
pub mod ownership;
pub mod port;
pub mod rt;
pub mod sync;
pub mod transport;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::buffer::{Buffer, BufferBuilder, BufferRef, WireBuffer, WireBufferRef};
    pub use crate::config::{NodeConfig, RtConfig};
    pub use crate::error::{Error, Result};
    pub use crate::memory::{MemFd, MemoryKind, RegionRegistry};
    pub use crate::node::{BufferSource, NodeImpl, ProcessContext, ProcessStatus, RemoteNode};
    pub use crate::port::{Direction, IoBuffers, IoKind, MixKey, Param};
    pub use crate::transport::{Command, ControlMessage, ControlSocket};
}

pub use error::{Error, Result};
