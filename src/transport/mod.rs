//! Driver/node communication: control messages and the realtime channel.
//!
//! - [`control`]: framed control messages with fd passing
//! - [`TransportChannel`]: the eventfd pair that drives processing cycles

pub mod control;

mod channel;
mod eventfd;

pub use channel::{Condition, TransportChannel};
pub use control::{Command, ControlMessage, ControlSocket, Received};
pub use eventfd::EventFd;
