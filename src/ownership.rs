//! Buffer ownership between the node and the driver.
//!
//! Every installed buffer is either free (owned by the producer, may be
//! filled) or outstanding (published to, or held by, the peer). Ownership moves
//! through the mix's [`IoBuffers`] area:
//!
//! - the producer publishes one buffer at a time with `HaveBuffer`; while the
//!   status still reads `HaveBuffer` nothing new is produced (backpressure)
//! - before publishing, the previously published id is taken back
//! - the consumer takes a published buffer by setting `NeedBuffer`, and hands
//!   it back with an explicit recycle
//!
//! Recycling an id that is not outstanding does nothing, so a buffer can never
//! enter the free stack twice.
//!
//! # Example
//!
//! ```rust,ignore
//! use parallax_remote::ownership::{BufferSlots, Produced, produce};
//!
//! let mut slots = BufferSlots::new(n_buffers);
//! match produce(&io, &mut slots, |id| fill(id)) {
//!     Produced::Published(id) => { /* signal the driver */ }
//!     Produced::Backpressure | Produced::Empty => {}
//! }
//! ```

use crate::error::{Error, Result};
use crate::port::{IoBuffers, Status};

/// Buffer id meaning "no buffer".
pub const INVALID_ID: u32 = u32::MAX;

/// Free/outstanding state of a mix's buffers.
#[derive(Debug, Clone, Default)]
pub struct BufferSlots {
    outstanding: Vec<bool>,
    free: Vec<u32>,
}

impl BufferSlots {
    /// `n` buffers, all free.
    pub fn new(n: u32) -> Self {
        let mut slots = Self::default();
        slots.reset(n);
        slots
    }

    /// Forget all state and track `n` free buffers.
    ///
    /// Buffers are handed out in id order.
    pub fn reset(&mut self, n: u32) {
        self.outstanding.clear();
        self.outstanding.resize(n as usize, false);
        self.free.clear();
        self.free.extend((0..n).rev());
    }

    /// Number of tracked buffers.
    pub fn len(&self) -> usize {
        self.outstanding.len()
    }

    /// True if no buffers are tracked.
    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }

    /// Number of free buffers.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// True if `id` is outstanding.
    pub fn is_outstanding(&self, id: u32) -> bool {
        self.outstanding.get(id as usize).copied().unwrap_or(false)
    }

    /// Take a free buffer, marking it outstanding.
    pub fn dequeue(&mut self) -> Option<u32> {
        let id = self.free.pop()?;
        self.outstanding[id as usize] = true;
        Some(id)
    }

    /// Return `id` to the free stack.
    ///
    /// Returns `Ok(false)` if it was not outstanding.
    pub fn recycle(&mut self, id: u32) -> Result<bool> {
        let Some(slot) = self.outstanding.get_mut(id as usize) else {
            return Err(Error::InvalidArgument(format!(
                "buffer id {} out of range ({} buffers)",
                id,
                self.outstanding.len()
            )));
        };
        if !*slot {
            tracing::trace!("buffer {} already free", id);
            return Ok(false);
        }
        *slot = false;
        self.free.push(id);
        Ok(true)
    }
}

/// Outcome of one [`produce`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Produced {
    /// The previous buffer was not taken yet.
    Backpressure,
    /// No free buffer to fill.
    Empty,
    /// A buffer was filled and published.
    Published(u32),
}

/// Run one producer step on `io`.
///
/// `fill` is called with the id of the buffer to fill before it is published.
pub fn produce<F>(io: &IoBuffers, slots: &mut BufferSlots, fill: F) -> Produced
where
    F: FnOnce(u32),
{
    if io.status() == Status::HaveBuffer {
        return Produced::Backpressure;
    }

    let previous = io.buffer_id();
    if previous != INVALID_ID {
        match slots.recycle(previous) {
            Ok(true) => tracing::trace!("recycle consumed buffer {}", previous),
            Ok(false) => {}
            Err(e) => tracing::warn!("ignoring buffer id left by the peer: {}", e),
        }
        io.set_buffer_id(INVALID_ID);
    }

    let Some(id) = slots.dequeue() else {
        return Produced::Empty;
    };
    fill(id);
    io.publish(id);
    Produced::Published(id)
}

/// Take a published buffer from `io`.
///
/// The caller owns the returned id until it recycles it.
pub fn consume(io: &IoBuffers) -> Option<u32> {
    if io.status() != Status::HaveBuffer {
        return None;
    }
    let id = io.buffer_id();
    io.set_status(Status::NeedBuffer);
    (id != INVALID_ID).then_some(id)
}
