//! Shared I/O areas bound to nodes and mixes.
//!
//! The driver places small structures in shared memory and binds them with
//! `SetIo`/`PortSetIo`. The one this crate interprets is [`IoBuffers`], the
//! per-mix `{ status, buffer_id }` pair both sides use every cycle.

use crate::error::{Error, Result};
use crate::memory::{MappedRange, RegionHandle, RegionRegistry};
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

/// Kind of an I/O area.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IoKind {
    /// Per-mix buffer exchange ([`IoBuffers`]).
    Buffers,
    /// Clock information.
    Clock,
    /// Graph position.
    Position,
    /// Anything else, passed to the node implementation untouched.
    Other(u32),
}

impl IoKind {
    /// Decode the wire value.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => IoKind::Buffers,
            3 => IoKind::Clock,
            7 => IoKind::Position,
            other => IoKind::Other(other),
        }
    }

    /// The wire value.
    pub fn as_raw(self) -> u32 {
        match self {
            IoKind::Buffers => 1,
            IoKind::Clock => 3,
            IoKind::Position => 7,
            IoKind::Other(raw) => raw,
        }
    }
}

/// Status field of an [`IoBuffers`] area.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// Nothing pending.
    Idle,
    /// The consumer wants a buffer.
    NeedBuffer,
    /// `buffer_id` holds a published buffer.
    HaveBuffer,
    /// Negative errno or unknown value written by the peer.
    Other(i32),
}

impl Status {
    /// Decode the raw field.
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => Status::Idle,
            1 => Status::NeedBuffer,
            2 => Status::HaveBuffer,
            other => Status::Other(other),
        }
    }

    /// The raw field.
    pub fn as_raw(self) -> i32 {
        match self {
            Status::Idle => 0,
            Status::NeedBuffer => 1,
            Status::HaveBuffer => 2,
            Status::Other(raw) => raw,
        }
    }
}

/// Size of an [`IoBuffers`] area.
pub const IO_BUFFERS_SIZE: usize = 8;

/// View of a `{ i32 status, u32 buffer_id }` area in shared memory.
///
/// Both fields are accessed atomically; `buffer_id` is written before the
/// status that publishes it.
#[derive(Clone, Debug)]
pub struct IoBuffers {
    range: MappedRange,
}

impl IoBuffers {
    /// Interpret `range` as an I/O buffers area.
    pub fn new(range: MappedRange) -> Result<Self> {
        if range.len() < IO_BUFFERS_SIZE {
            return Err(Error::InvalidArgument(format!(
                "io buffers area of {} bytes, needs {}",
                range.len(),
                IO_BUFFERS_SIZE
            )));
        }
        if range.as_ptr() as usize % std::mem::align_of::<AtomicI32>() != 0 {
            return Err(Error::InvalidArgument("misaligned io buffers area".into()));
        }
        Ok(Self { range })
    }

    #[inline]
    fn status_field(&self) -> &AtomicI32 {
        // SAFETY: checked size and alignment in `new`; the mapping lives as
        // long as `self.range`.
        unsafe { &*self.range.as_ptr().cast::<AtomicI32>() }
    }

    #[inline]
    fn id_field(&self) -> &AtomicU32 {
        // SAFETY: as above, offset 4 of an 8 byte, 4-aligned area.
        unsafe { &*self.range.as_ptr().add(4).cast::<AtomicU32>() }
    }

    /// Current status.
    #[inline]
    pub fn status(&self) -> Status {
        Status::from_raw(self.status_field().load(Ordering::Acquire))
    }

    /// Set the status.
    #[inline]
    pub fn set_status(&self, status: Status) {
        self.status_field().store(status.as_raw(), Ordering::Release);
    }

    /// Current buffer id.
    #[inline]
    pub fn buffer_id(&self) -> u32 {
        self.id_field().load(Ordering::Acquire)
    }

    /// Set the buffer id without touching the status.
    #[inline]
    pub fn set_buffer_id(&self, id: u32) {
        self.id_field().store(id, Ordering::Release);
    }

    /// Publish `id` with [`Status::HaveBuffer`].
    #[inline]
    pub fn publish(&self, id: u32) {
        self.set_buffer_id(id);
        self.set_status(Status::HaveBuffer);
    }

    /// The underlying memory.
    pub fn range(&self) -> &MappedRange {
        &self.range
    }
}

/// An I/O area bound by the driver.
///
/// Holds a reference on the region the area lives in.
#[must_use = "io bindings hold a region reference that must be released"]
#[derive(Debug)]
pub struct IoBinding {
    handle: RegionHandle,
    range: MappedRange,
}

impl IoBinding {
    /// Bind `range` of the region referenced by `handle`.
    pub fn new(handle: RegionHandle, range: MappedRange) -> Self {
        Self { handle, range }
    }

    /// Region the area lives in.
    pub fn region_id(&self) -> u32 {
        self.handle.id()
    }

    /// The area.
    pub fn range(&self) -> &MappedRange {
        &self.range
    }

    /// Drop the area and give its region reference back.
    pub fn release(self, registry: &mut RegionRegistry) {
        drop(self.range);
        registry.release(self.handle);
    }
}
