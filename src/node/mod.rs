//! Exported nodes.
//!
//! - [`NodeImpl`]: what a node implementation provides
//! - [`RemoteNode`]: handles the driver's messages for one exported node
//! - [`BufferSource`]: a reference output-only implementation

mod implementation;
mod remote;
mod source;

pub use implementation::{
    Emitter, EnumParams, NodeEvent, NodeImpl, ParamResult, ProcessContext, ProcessStatus,
};
pub use remote::RemoteNode;
pub use source::BufferSource;
