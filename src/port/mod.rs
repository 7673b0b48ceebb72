//! Ports, mixes and shared I/O areas.
//!
//! A [`Port`] is local bookkeeping for one port of the exported node: its info
//! and the parameters set on it. The logical streams multiplexed onto a port
//! are mixes, kept in a bounded [`MixPool`]. Each mix owns its buffers and the
//! I/O areas the driver bound to it.

mod io;
mod mix;

pub use io::{IO_BUFFERS_SIZE, IoBinding, IoBuffers, IoKind, Status};
pub use mix::{Mix, MixPool, MixState};

use std::fmt;

/// Direction of a port.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, rkyv::Archive, rkyv::Serialize,
    rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
#[repr(u8)]
pub enum Direction {
    /// Data flows into the node.
    Input = 0,
    /// Data flows out of the node.
    Output = 1,
}

impl Direction {
    /// Decode the wire value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Direction::Input),
            1 => Some(Direction::Output),
            _ => None,
        }
    }

    /// Index for per-direction tables.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => f.write_str("input"),
            Direction::Output => f.write_str("output"),
        }
    }
}

/// Identifies one mix: a logical stream on a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MixKey {
    /// Port direction.
    pub direction: Direction,
    /// Port id.
    pub port_id: u32,
    /// Mix id on that port.
    pub mix_id: u32,
}

impl MixKey {
    /// Create a mix key.
    pub const fn new(direction: Direction, port_id: u32, mix_id: u32) -> Self {
        Self {
            direction,
            port_id,
            mix_id,
        }
    }

    /// True if the mix lives on the given port.
    #[inline]
    pub fn is_on(&self, direction: Direction, port_id: u32) -> bool {
        self.direction == direction && self.port_id == port_id
    }
}

impl fmt::Display for MixKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.direction, self.port_id, self.mix_id)
    }
}

/// Port capability flags.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, rkyv::Archive, rkyv::Serialize,
    rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
pub struct PortFlags(u32);

impl PortFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// Port can be removed.
    pub const REMOVABLE: Self = Self(1 << 0);
    /// Processing on this port is optional.
    pub const OPTIONAL: Self = Self(1 << 1);
    /// Port can allocate buffer memory.
    pub const CAN_ALLOC_BUFFERS: Self = Self(1 << 2);
    /// Port can use buffers allocated elsewhere.
    pub const CAN_USE_BUFFERS: Self = Self(1 << 3);
    /// Port processes buffers in place.
    pub const IN_PLACE: Self = Self(1 << 4);
    /// Port does not keep references to buffers.
    pub const NO_REF: Self = Self(1 << 5);
    /// Output is produced in real time.
    pub const LIVE: Self = Self(1 << 6);
    /// Port is connected to a physical device.
    pub const PHYSICAL: Self = Self(1 << 7);
    /// Data is not forwarded beyond this port.
    pub const TERMINAL: Self = Self(1 << 8);

    /// Raw bits.
    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Flags from raw bits.
    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// True if all flags in `other` are set.
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// These flags without the ones in `other`.
    #[inline]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl std::ops::BitOr for PortFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Snapshot of a port's capabilities.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
pub struct PortInfo {
    /// Capability flags.
    pub flags: PortFlags,
    /// Native rate, 0 if unknown.
    pub rate: u32,
}

impl PortInfo {
    /// Info with the given flags.
    pub fn new(flags: PortFlags) -> Self {
        Self { flags, rate: 0 }
    }

    /// Set the rate.
    pub fn with_rate(mut self, rate: u32) -> Self {
        self.rate = rate;
        self
    }
}

/// Well-known parameter ids.
pub mod param_id {
    /// List of supported parameter ids.
    pub const LIST: u32 = 1;
    /// Enumerated formats.
    pub const ENUM_FORMAT: u32 = 3;
    /// Current format.
    pub const FORMAT: u32 = 4;
    /// Buffer requirements.
    pub const BUFFERS: u32 = 5;
    /// Metadata requirements.
    pub const META: u32 = 6;
    /// Supported I/O areas.
    pub const IO: u32 = 7;
}

/// An opaque typed parameter.
///
/// The payload is serialized by the graph and carried without interpretation.
#[derive(Clone, Debug, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub struct Param {
    /// Parameter id (see [`param_id`]).
    pub id: u32,
    /// Flags sent along with the parameter.
    pub flags: u32,
    /// Serialized parameter object.
    pub pod: Vec<u8>,
}

impl Param {
    /// Create a parameter.
    pub fn new(id: u32, pod: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            flags: 0,
            pod: pod.into(),
        }
    }
}

/// Local bookkeeping for one port of the node.
#[derive(Debug, Clone)]
pub struct Port {
    direction: Direction,
    port_id: u32,
    info: PortInfo,
    params: Vec<Param>,
}

impl Port {
    /// Create a port.
    pub fn new(direction: Direction, port_id: u32, info: PortInfo) -> Self {
        Self {
            direction,
            port_id,
            info,
            params: Vec::new(),
        }
    }

    /// Port direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Port id.
    pub fn port_id(&self) -> u32 {
        self.port_id
    }

    /// Current info.
    pub fn info(&self) -> PortInfo {
        self.info
    }

    /// Replace the info.
    pub fn set_info(&mut self, info: PortInfo) {
        self.info = info;
    }

    /// Info as announced to the driver: exported ports never allocate.
    pub fn exported_info(&self) -> PortInfo {
        PortInfo {
            flags: self.info.flags.without(PortFlags::CAN_ALLOC_BUFFERS),
            ..self.info
        }
    }

    /// Parameters currently set on the port.
    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// Store a parameter, replacing earlier ones with the same id.
    ///
    /// An empty payload clears the parameter.
    pub fn set_param(&mut self, param: Param) {
        self.params.retain(|p| p.id != param.id);
        if !param.pod.is_empty() {
            self.params.push(param);
        }
    }

    /// Replace all parameters.
    pub fn set_params(&mut self, params: Vec<Param>) {
        self.params = params;
    }
}
