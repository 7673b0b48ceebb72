//! The interface between the remote node and the code doing the work.
//!
//! A [`NodeImpl`] lives on the realtime data loop. Every control-context call
//! into it goes through [`DataLoop::invoke`](crate::rt::DataLoop::invoke), so
//! implementations never see two calls at once and need no locking.
//!
//! Results that are not available when a call returns (asynchronous parameter
//! enumeration) are reported through the [`Emitter`] handed to the call.

use crate::buffer::BufferRef;
use crate::error::{Error, Result};
use crate::memory::MappedRange;
use crate::port::{Direction, IoBuffers, IoKind, MixKey, Param, PortInfo};
use crate::rt::ActiveMix;
use crate::transport::Command;
use std::ops::{BitOr, BitOrAssign};

/// Outcome of one `process` call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcessStatus(u32);

impl ProcessStatus {
    /// Nothing happened.
    pub const OK: Self = Self(0);
    /// The node wants input.
    pub const NEED_BUFFER: Self = Self(1 << 0);
    /// The node published output; the driver is signaled.
    pub const HAVE_BUFFER: Self = Self(1 << 1);

    /// True if all bits of `other` are set.
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bits.
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for ProcessStatus {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ProcessStatus {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// What the data loop gives `process` for one cycle.
#[derive(Debug)]
pub struct ProcessContext<'a> {
    mixes: &'a [ActiveMix],
    cycle: u64,
}

impl<'a> ProcessContext<'a> {
    pub(crate) fn new(mixes: &'a [ActiveMix], cycle: u64) -> Self {
        Self { mixes, cycle }
    }

    /// Active mixes in activation order.
    pub fn mixes(&self) -> &'a [ActiveMix] {
        self.mixes
    }

    /// I/O area of an active mix.
    pub fn io(&self, key: &MixKey) -> Option<&'a IoBuffers> {
        self.mixes.iter().find(|m| m.key == *key).map(|m| &m.io)
    }

    /// Cycle counter, starting at 1.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }
}

/// Answer to a parameter enumeration.
#[derive(Debug)]
pub enum EnumParams {
    /// All results, in order.
    Ready(Vec<Param>),
    /// Results follow as [`NodeEvent::Result`] with this sequence number.
    Pending(u32),
}

/// One asynchronous enumeration result.
#[derive(Clone, Debug, PartialEq)]
pub struct ParamResult {
    /// Port direction.
    pub direction: Direction,
    /// Port id.
    pub port_id: u32,
    /// Index of this result.
    pub index: u32,
    /// Index to continue from.
    pub next: u32,
    /// The parameter.
    pub param: Param,
}

/// Event from the data loop to the control context.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeEvent {
    /// A result for an asynchronous request.
    Result {
        /// Sequence number of the pending request.
        seq: u32,
        /// The result.
        result: ParamResult,
    },
    /// Completion of an asynchronous sequence.
    Done {
        /// Sequence number.
        seq: u32,
        /// 0 or a negative errno.
        res: i32,
    },
    /// The transport hung up; the node is unusable until a new one arrives.
    TransportLost {
        /// Id of the node in the graph.
        node_id: u32,
        /// Generation of the transport that hung up.
        generation: u64,
    },
}

/// Sender side of the node event channel.
#[derive(Clone, Debug)]
pub struct Emitter {
    tx: kanal::Sender<NodeEvent>,
}

impl Emitter {
    pub(crate) fn new(tx: kanal::Sender<NodeEvent>) -> Self {
        Self { tx }
    }

    /// Emit one enumeration result.
    pub fn result(&self, seq: u32, result: ParamResult) {
        self.emit(NodeEvent::Result { seq, result });
    }

    /// Emit the completion of `seq`.
    pub fn done(&self, seq: u32, res: i32) {
        self.emit(NodeEvent::Done { seq, res });
    }

    pub(crate) fn emit(&self, event: NodeEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("node event dropped, control side gone");
        }
    }
}

/// The node implementation driven by a [`RemoteNode`](super::RemoteNode).
pub trait NodeImpl: Send {
    /// Ports of the node with their current info.
    fn ports(&self) -> Vec<(Direction, u32, PortInfo)>;

    /// Maximum number of (input, output) ports.
    fn max_ports(&self) -> (u32, u32) {
        let ports = self.ports();
        let inputs = ports.iter().filter(|p| p.0 == Direction::Input).count() as u32;
        (inputs, ports.len() as u32 - inputs)
    }

    /// Node-level parameters.
    fn params(&self) -> Vec<Param> {
        Vec::new()
    }

    /// Current parameters of a port.
    fn port_params(&self, _direction: Direction, _port_id: u32) -> Vec<Param> {
        Vec::new()
    }

    /// Current info of a port.
    fn port_info(&self, direction: Direction, port_id: u32) -> Option<PortInfo> {
        self.ports()
            .into_iter()
            .find(|p| p.0 == direction && p.1 == port_id)
            .map(|p| p.2)
    }

    /// Enumerate parameters `id` of a port from index `start`, at most `num`
    /// (0 for all).
    fn port_enum_params(
        &mut self,
        direction: Direction,
        port_id: u32,
        id: u32,
        start: u32,
        num: u32,
        emitter: &Emitter,
    ) -> Result<EnumParams>;

    /// Set or clear (empty payload) a port parameter.
    fn port_set_param(&mut self, direction: Direction, port_id: u32, param: &Param) -> Result<()>;

    /// Replace the buffers of a mix. An empty slice drops all of them.
    fn port_use_buffers(&mut self, key: MixKey, buffers: &[BufferRef]) -> Result<()>;

    /// Bind or clear an I/O area of a mix other than the buffers area.
    fn port_set_io(&mut self, _key: MixKey, _kind: IoKind, _area: Option<MappedRange>) -> Result<()> {
        Ok(())
    }

    /// Bind or clear a node-scope I/O area.
    fn set_io(&mut self, _kind: IoKind, _area: Option<MappedRange>) -> Result<()> {
        Ok(())
    }

    /// The driver is done with `buffer_id` of an output port.
    fn port_reuse_buffer(&mut self, _port_id: u32, _buffer_id: u32) -> Result<()> {
        Err(Error::NotSupported("port reuse buffer".into()))
    }

    /// Run a command.
    fn send_command(&mut self, command: Command) -> Result<()>;

    /// Emit a `Done` after everything emitted for `seq` and return its
    /// sequence number.
    fn sync(&mut self, seq: u32, emitter: &Emitter) -> Result<u32> {
        emitter.done(seq, 0);
        Ok(seq)
    }

    /// One processing cycle. Called on the data loop only.
    fn process(&mut self, ctx: &ProcessContext<'_>) -> ProcessStatus;
}
