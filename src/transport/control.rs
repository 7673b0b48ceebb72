//! Control messages between the driver and an exported node.
//!
//! Messages are rkyv-serialized and framed with a little-endian `u32` length
//! prefix. Descriptors travel next to the bytes as `SCM_RIGHTS` and are
//! matched to messages by order: `AddMemory` carries one, `Transport` two
//! (read side first).
//!
//! # Example
//!
//! ```rust,ignore
//! use parallax_remote::transport::{ControlMessage, ControlSocket};
//!
//! let (mut driver, mut node) = ControlSocket::pair()?;
//! driver.send(&ControlMessage::AddMemory { mem_id: 0, kind: 2, flags: 3 }, &[memfd.as_fd()])?;
//! let received = node.recv()?.expect("peer closed");
//! assert_eq!(received.fds.len(), 1);
//! ```

use crate::buffer::WireBufferRef;
use crate::error::{Error, Result};
use crate::memory::ipc::{recv_with_fds, send_with_fds};
use crate::port::{Direction, Param, PortInfo};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use std::collections::VecDeque;
use std::os::unix::net::UnixStream;

/// Largest frame accepted from the peer.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const RECV_CHUNK: usize = 4096;

/// Node command sent by the driver.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
pub enum Command {
    /// Start processing.
    Start,
    /// Stop processing, keep buffers.
    Pause,
    /// Any other command id.
    Other(u32),
}

/// A control message, in either direction.
#[derive(Clone, Debug, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub enum ControlMessage {
    // Driver -> node
    /// Register a memory region. Carries one fd.
    AddMemory {
        /// Region id.
        mem_id: u32,
        /// Raw memory kind.
        kind: u32,
        /// Readable/writable flags.
        flags: u32,
    },

    /// Install the notification channel. Carries two fds: read, write.
    Transport {
        /// Id of the node in the graph.
        node_id: u32,
    },

    /// Bind or clear a node-scope I/O area.
    SetIo {
        /// Raw I/O area kind.
        id: u32,
        /// Region id, `INVALID_ID` to clear.
        mem_id: u32,
        /// Offset in the region.
        offset: u32,
        /// Size of the area.
        size: u32,
    },

    /// Bind or clear a mix-scope I/O area.
    PortSetIo {
        /// Sequence number for the reply.
        seq: u32,
        /// Port direction.
        direction: Direction,
        /// Port id.
        port_id: u32,
        /// Mix id.
        mix_id: u32,
        /// Raw I/O area kind.
        id: u32,
        /// Region id, `INVALID_ID` to clear.
        mem_id: u32,
        /// Offset in the region.
        offset: u32,
        /// Size of the area.
        size: u32,
    },

    /// Install a buffer set on a mix. An empty list clears it.
    PortUseBuffers {
        /// Sequence number for the reply.
        seq: u32,
        /// Port direction.
        direction: Direction,
        /// Port id.
        port_id: u32,
        /// Mix id.
        mix_id: u32,
        /// Buffer descriptions.
        buffers: Vec<WireBufferRef>,
    },

    /// Set a parameter on a port.
    PortSetParam {
        /// Sequence number for the reply.
        seq: u32,
        /// Port direction.
        direction: Direction,
        /// Port id.
        port_id: u32,
        /// The parameter. An empty payload clears it.
        param: Param,
    },

    /// Send a command to the node.
    Command {
        /// Sequence number for the reply.
        seq: u32,
        /// The command.
        command: Command,
    },

    /// Enumerate parameters of a port.
    PortEnumParams {
        /// Sequence number for the results and the reply.
        seq: u32,
        /// Port direction.
        direction: Direction,
        /// Port id.
        port_id: u32,
        /// Parameter id to enumerate.
        id: u32,
        /// First index.
        start: u32,
        /// Maximum number of results, 0 for all.
        num: u32,
    },

    /// The driver is done with a buffer of an output port.
    PortReuseBuffer {
        /// Output port id.
        port_id: u32,
        /// Buffer id.
        buffer_id: u32,
    },

    /// Add a port. Not supported by exported nodes.
    AddPort {
        /// Sequence number for the reply.
        seq: u32,
        /// Port direction.
        direction: Direction,
        /// Port id.
        port_id: u32,
    },

    /// Remove a port. Not supported by exported nodes.
    RemovePort {
        /// Sequence number for the reply.
        seq: u32,
        /// Port direction.
        direction: Direction,
        /// Port id.
        port_id: u32,
    },

    /// Set a node-level parameter. Not supported by exported nodes.
    SetParam {
        /// Sequence number for the reply.
        seq: u32,
        /// The parameter.
        param: Param,
    },

    // Node -> driver
    /// Node-level info.
    Update {
        /// Maximum number of input ports.
        max_input_ports: u32,
        /// Maximum number of output ports.
        max_output_ports: u32,
        /// Node parameters.
        params: Vec<Param>,
    },

    /// Port info and parameters.
    PortUpdate {
        /// Port direction.
        direction: Direction,
        /// Port id.
        port_id: u32,
        /// All parameters of the port.
        params: Vec<Param>,
        /// Port info, if changed.
        info: Option<PortInfo>,
    },

    /// One result of a parameter enumeration.
    PortParam {
        /// Sequence number of the request.
        seq: u32,
        /// Port direction.
        direction: Direction,
        /// Port id.
        port_id: u32,
        /// The parameter.
        param: Param,
    },

    /// Completion of a request.
    Done {
        /// Sequence number of the request.
        seq: u32,
        /// 0 or a negative errno.
        res: i32,
    },

    /// Ask the driver to (de)activate the node.
    SetActive {
        /// Requested state.
        active: bool,
    },
}

impl ControlMessage {
    /// Number of descriptors that travel with this message.
    pub fn fd_count(&self) -> usize {
        match self {
            ControlMessage::AddMemory { .. } => 1,
            ControlMessage::Transport { .. } => 2,
            _ => 0,
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::AddMemory { .. } => "add-memory",
            ControlMessage::Transport { .. } => "transport",
            ControlMessage::SetIo { .. } => "set-io",
            ControlMessage::PortSetIo { .. } => "port-set-io",
            ControlMessage::PortUseBuffers { .. } => "port-use-buffers",
            ControlMessage::PortSetParam { .. } => "port-set-param",
            ControlMessage::Command { .. } => "command",
            ControlMessage::PortEnumParams { .. } => "port-enum-params",
            ControlMessage::PortReuseBuffer { .. } => "port-reuse-buffer",
            ControlMessage::AddPort { .. } => "add-port",
            ControlMessage::RemovePort { .. } => "remove-port",
            ControlMessage::SetParam { .. } => "set-param",
            ControlMessage::Update { .. } => "update",
            ControlMessage::PortUpdate { .. } => "port-update",
            ControlMessage::PortParam { .. } => "port-param",
            ControlMessage::Done { .. } => "done",
            ControlMessage::SetActive { .. } => "set-active",
        }
    }
}

/// Frame a message for sending.
pub fn frame_message(msg: &ControlMessage) -> Result<Vec<u8>> {
    let serialized = rkyv::to_bytes::<rkyv::rancor::Error>(msg)
        .map_err(|e| Error::Protocol(format!("serialization failed: {}", e)))?;
    if serialized.len() > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "frame of {} bytes exceeds {}",
            serialized.len(),
            MAX_FRAME_SIZE
        )));
    }
    let len = serialized.len() as u32;

    let mut framed = Vec::with_capacity(4 + serialized.len());
    framed.extend_from_slice(&len.to_le_bytes());
    framed.extend_from_slice(&serialized);
    Ok(framed)
}

/// Unframe a message from a buffer.
///
/// Returns the message and the number of bytes consumed, or `None` if the
/// buffer does not hold a complete frame yet.
pub fn unframe_message(buf: &[u8]) -> Result<Option<(ControlMessage, usize)>> {
    if buf.len() < 4 {
        return Ok(None);
    }

    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!("frame length {} too large", len)));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }

    // Copy to aligned buffer for rkyv
    let mut aligned = rkyv::util::AlignedVec::<8>::new();
    aligned.extend_from_slice(&buf[4..4 + len]);

    let msg = rkyv::from_bytes::<ControlMessage, rkyv::rancor::Error>(&aligned)
        .map_err(|e| Error::Protocol(format!("deserialization failed: {}", e)))?;

    Ok(Some((msg, 4 + len)))
}

/// A decoded message with its descriptors.
#[derive(Debug)]
pub struct Received {
    /// The message.
    pub message: ControlMessage,
    /// Descriptors that came with it, in send order.
    pub fds: Vec<OwnedFd>,
}

/// Blocking control socket.
#[derive(Debug)]
pub struct ControlSocket {
    stream: UnixStream,
    rx: Vec<u8>,
    fds: VecDeque<OwnedFd>,
}

impl ControlSocket {
    /// Wrap a connected stream.
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            rx: Vec::new(),
            fds: VecDeque::new(),
        }
    }

    /// A connected pair.
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::new(a), Self::new(b)))
    }

    /// Send `msg` with its descriptors.
    pub fn send(&mut self, msg: &ControlMessage, fds: &[BorrowedFd<'_>]) -> Result<()> {
        if fds.len() != msg.fd_count() {
            return Err(Error::InvalidArgument(format!(
                "{} needs {} fds, got {}",
                msg.name(),
                msg.fd_count(),
                fds.len()
            )));
        }

        let frame = frame_message(msg)?;
        let mut sent = send_with_fds(&self.stream, &frame, fds)?;
        while sent < frame.len() {
            let none: &[BorrowedFd<'_>] = &[];
            sent += send_with_fds(&self.stream, &frame[sent..], none)?;
        }
        tracing::trace!("sent {} ({} bytes, {} fds)", msg.name(), frame.len(), fds.len());
        Ok(())
    }

    /// Decode a message that is already buffered, without reading.
    pub fn try_next(&mut self) -> Result<Option<Received>> {
        let Some((message, used)) = unframe_message(&self.rx)? else {
            return Ok(None);
        };
        self.rx.drain(..used);

        let wanted = message.fd_count();
        if self.fds.len() < wanted {
            return Err(Error::Protocol(format!(
                "{} needs {} fds, {} received",
                message.name(),
                wanted,
                self.fds.len()
            )));
        }
        let fds = self.fds.drain(..wanted).collect();
        Ok(Some(Received { message, fds }))
    }

    /// Block until a full message arrived.
    ///
    /// Returns `None` when the peer closed the socket between messages.
    pub fn recv(&mut self) -> Result<Option<Received>> {
        let mut chunk = [0u8; RECV_CHUNK];
        loop {
            if let Some(received) = self.try_next()? {
                return Ok(Some(received));
            }

            let mut fds = Vec::new();
            let n = recv_with_fds(&self.stream, &mut chunk, &mut fds)?;
            self.fds.extend(fds);
            if n == 0 {
                if self.rx.is_empty() {
                    return Ok(None);
                }
                return Err(Error::Protocol(format!(
                    "peer closed with {} bytes of a partial frame",
                    self.rx.len()
                )));
            }
            self.rx.extend_from_slice(&chunk[..n]);
        }
    }

    /// Descriptors received but not claimed by a message yet.
    pub fn pending_fds(&self) -> usize {
        self.fds.len()
    }
}

impl AsFd for ControlSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}
