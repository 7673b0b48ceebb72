//! Mixes: logical streams multiplexed onto a port.
//!
//! Mixes live in a bounded arena with a free index stack. A mix is created on
//! the first message that names its `(direction, port, mix)` triple and goes
//! back to the free stack when it is cleared.
//!
//! ```text
//! Free ──ensure──► Inactive ──io bound──► Active
//!   ▲                 ▲ ◄──io cleared────── │
//!   └────remove───────┴─────────────────────┘
//! ```

use super::MixKey;
use super::io::{IoBinding, IoBuffers, IoKind};
use crate::buffer::{Buffer, BufferRef};
use crate::error::{Error, Result};
use crate::memory::RegionRegistry;
use std::collections::HashMap;

/// Activation state of a mix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MixState {
    /// Slot unused.
    Free,
    /// Bound to a port, not scheduled.
    Inactive,
    /// Scheduled on the realtime loop.
    Active,
}

/// One mix and everything it owns.
#[derive(Debug)]
pub struct Mix {
    key: MixKey,
    state: MixState,
    buffers: Vec<Buffer>,
    io: HashMap<IoKind, IoBinding>,
}

impl Mix {
    fn new(key: MixKey) -> Self {
        Self {
            key,
            state: MixState::Inactive,
            buffers: Vec::new(),
            io: HashMap::new(),
        }
    }

    /// Mix key.
    pub fn key(&self) -> MixKey {
        self.key
    }

    /// Activation state.
    pub fn state(&self) -> MixState {
        self.state
    }

    /// True if scheduled on the realtime loop.
    pub fn is_active(&self) -> bool {
        self.state == MixState::Active
    }

    pub(crate) fn set_state(&mut self, state: MixState) {
        self.state = state;
    }

    /// Installed buffers.
    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    /// References to the installed buffers for the data path.
    pub fn buffer_refs(&self) -> Vec<BufferRef> {
        self.buffers.iter().map(Buffer::to_ref).collect()
    }

    /// Replace the buffer set, returning the old one.
    pub fn replace_buffers(&mut self, buffers: Vec<Buffer>) -> Vec<Buffer> {
        std::mem::replace(&mut self.buffers, buffers)
    }

    /// Release all installed buffers.
    pub fn clear_buffers(&mut self, registry: &mut RegionRegistry) {
        if !self.buffers.is_empty() {
            tracing::debug!("mix {}: clear {} buffers", self.key, self.buffers.len());
        }
        for buffer in self.buffers.drain(..) {
            buffer.release(registry);
        }
    }

    /// I/O area of `kind`, if bound.
    pub fn io(&self, kind: IoKind) -> Option<&IoBinding> {
        self.io.get(&kind)
    }

    /// The buffers I/O area, if bound.
    pub fn io_buffers(&self) -> Option<IoBuffers> {
        self.io
            .get(&IoKind::Buffers)
            .and_then(|b| IoBuffers::new(b.range().clone()).ok())
    }

    /// Bind or clear an I/O area, returning the previous binding.
    pub fn set_io(&mut self, kind: IoKind, binding: Option<IoBinding>) -> Option<IoBinding> {
        match binding {
            Some(binding) => self.io.insert(kind, binding),
            None => self.io.remove(&kind),
        }
    }

    /// True if the mix is inactive and holds neither buffers nor I/O areas.
    pub fn is_unused(&self) -> bool {
        !self.is_active() && self.buffers.is_empty() && self.io.is_empty()
    }

    /// Release buffers and I/O bindings.
    pub fn release(mut self, registry: &mut RegionRegistry) {
        self.clear_buffers(registry);
        for (_, binding) in self.io.drain() {
            binding.release(registry);
        }
    }
}

/// Bounded arena of mixes.
#[derive(Debug)]
pub struct MixPool {
    slots: Vec<Option<Mix>>,
    free: Vec<usize>,
    index: HashMap<MixKey, usize>,
    capacity: usize,
}

impl MixPool {
    /// A pool holding at most `capacity` mixes.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            capacity,
        }
    }

    /// Maximum number of mixes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of mixes in use.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// True if no mix is in use.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Look up a mix.
    pub fn find(&self, key: &MixKey) -> Option<&Mix> {
        let slot = *self.index.get(key)?;
        self.slots[slot].as_ref()
    }

    /// Look up a mix mutably.
    pub fn find_mut(&mut self, key: &MixKey) -> Option<&mut Mix> {
        let slot = *self.index.get(key)?;
        self.slots[slot].as_mut()
    }

    /// State of a mix, [`MixState::Free`] if unknown.
    pub fn state(&self, key: &MixKey) -> MixState {
        self.find(key).map_or(MixState::Free, Mix::state)
    }

    /// Look up a mix, allocating it if needed.
    pub fn ensure(&mut self, key: MixKey) -> Result<&mut Mix> {
        let slot = match self.index.get(&key) {
            Some(&slot) => slot,
            None => {
                let slot = match self.free.pop() {
                    Some(slot) => slot,
                    None if self.slots.len() < self.capacity => {
                        self.slots.push(None);
                        self.slots.len() - 1
                    }
                    None => {
                        tracing::warn!("mix pool exhausted ({} mixes), rejecting {}", self.capacity, key);
                        return Err(Error::ResourceExhausted("mix pool"));
                    }
                };
                tracing::debug!("mix {}: init in slot {}", key, slot);
                self.slots[slot] = Some(Mix::new(key));
                self.index.insert(key, slot);
                slot
            }
        };
        self.slots[slot]
            .as_mut()
            .ok_or(Error::ResourceExhausted("mix pool"))
    }

    /// Take a mix out of the pool and return its slot to the free stack.
    ///
    /// The caller releases what the mix owns.
    pub fn remove(&mut self, key: &MixKey) -> Option<Mix> {
        let slot = self.index.remove(key)?;
        let mix = self.slots[slot].take();
        self.free.push(slot);
        mix
    }

    /// Keys of all mixes, sorted.
    pub fn keys(&self) -> Vec<MixKey> {
        let mut keys: Vec<MixKey> = self.index.keys().copied().collect();
        keys.sort();
        keys
    }

    /// Keys of the mixes on one port, sorted.
    pub fn keys_on(&self, direction: super::Direction, port_id: u32) -> Vec<MixKey> {
        let mut keys: Vec<MixKey> = self
            .index
            .keys()
            .filter(|k| k.is_on(direction, port_id))
            .copied()
            .collect();
        keys.sort();
        keys
    }
}
