//! A reference producer node.
//!
//! `BufferSource` has a single output port. Every cycle it publishes one
//! buffer per active mix through the buffer ownership protocol, filling the
//! planes through a caller supplied function and stamping the header meta.
//!
//! ```rust,ignore
//! use parallax_remote::node::BufferSource;
//!
//! let source = BufferSource::new()
//!     .with_param(Param::new(param_id::ENUM_FORMAT, format_pod))
//!     .with_fill(|data| {
//!         data.fill(0x80);
//!         data.len()
//!     });
//! ```

use super::implementation::{
    Emitter, EnumParams, NodeImpl, ParamResult, ProcessContext, ProcessStatus,
};
use crate::buffer::{BufferInner, BufferRef, Chunk, MetaHeader, MetaType};
use crate::error::{Error, Result};
use crate::ownership::{BufferSlots, Produced, produce};
use crate::port::{Direction, MixKey, Param, PortFlags, PortInfo, param_id};
use crate::transport::Command;
use std::collections::HashMap;

type FillFn = Box<dyn FnMut(&mut [u8]) -> usize + Send>;

struct Stream {
    buffers: Vec<BufferRef>,
    slots: BufferSlots,
}

/// Single output port producer.
pub struct BufferSource {
    info: PortInfo,
    params: Vec<Param>,
    format: Option<Param>,
    streams: HashMap<MixKey, Stream>,
    started: bool,
    async_params: bool,
    next_seq: u32,
    header_seq: u32,
    fill: FillFn,
}

impl Default for BufferSource {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferSource {
    /// Id of the only port.
    pub const PORT_ID: u32 = 0;

    /// A source that marks every plane as completely filled.
    pub fn new() -> Self {
        Self {
            info: PortInfo::new(PortFlags::CAN_USE_BUFFERS | PortFlags::LIVE),
            params: Vec::new(),
            format: None,
            streams: HashMap::new(),
            started: false,
            async_params: false,
            next_seq: 1,
            header_seq: 0,
            fill: Box::new(|data| data.len()),
        }
    }

    /// Set the port flags.
    pub fn with_port_flags(mut self, flags: PortFlags) -> Self {
        self.info.flags = flags;
        self
    }

    /// Set the port rate.
    pub fn with_rate(mut self, rate: u32) -> Self {
        self.info.rate = rate;
        self
    }

    /// Offer a parameter for enumeration.
    pub fn with_param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    /// Answer enumerations asynchronously through the emitter.
    pub fn with_async_params(mut self, enabled: bool) -> Self {
        self.async_params = enabled;
        self
    }

    /// Fill function: writes a plane and returns the number of valid bytes.
    pub fn with_fill<F>(mut self, fill: F) -> Self
    where
        F: FnMut(&mut [u8]) -> usize + Send + 'static,
    {
        self.fill = Box::new(fill);
        self
    }

    /// True between `Start` and `Pause`.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Current format.
    pub fn format(&self) -> Option<&Param> {
        self.format.as_ref()
    }

    /// Number of mixes with buffers.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Free buffers of a mix.
    pub fn free_buffers(&self, key: &MixKey) -> Option<usize> {
        self.streams.get(key).map(|s| s.slots.free_count())
    }

    fn check_port(direction: Direction, port_id: u32) -> Result<()> {
        if direction != Direction::Output || port_id != Self::PORT_ID {
            return Err(Error::UnknownPort { direction, port_id });
        }
        Ok(())
    }

    fn candidates(&self, id: u32) -> Vec<Param> {
        if id == param_id::FORMAT {
            return self.format.iter().cloned().collect();
        }
        self.params.iter().filter(|p| p.id == id).cloned().collect()
    }
}

fn fill_buffer(buffer: &BufferInner, fill: &mut FillFn, header_seq: &mut u32, cycle: u64) {
    for plane in buffer.datas() {
        let size = match plane.memory() {
            Some(memory) => {
                // SAFETY: the buffer was just dequeued, the driver does not
                // touch it until it is published. Output planes are mapped
                // writable.
                let data = unsafe { memory.as_mut_slice() };
                fill(data).min(data.len())
            }
            None => 0,
        };
        plane.set_chunk(Chunk {
            offset: 0,
            size: size as u32,
            stride: 0,
        });
    }

    if let Some(meta) = buffer.find_meta(MetaType::Header) {
        meta.set_header(&MetaHeader {
            flags: 0,
            seq: *header_seq,
            pts: cycle as i64,
            dts_offset: 0,
        });
    }
    *header_seq = header_seq.wrapping_add(1);
}

impl NodeImpl for BufferSource {
    fn ports(&self) -> Vec<(Direction, u32, PortInfo)> {
        vec![(Direction::Output, Self::PORT_ID, self.info)]
    }

    fn port_params(&self, direction: Direction, port_id: u32) -> Vec<Param> {
        if Self::check_port(direction, port_id).is_err() {
            return Vec::new();
        }
        self.params.iter().chain(self.format.iter()).cloned().collect()
    }

    fn port_enum_params(
        &mut self,
        direction: Direction,
        port_id: u32,
        id: u32,
        start: u32,
        num: u32,
        emitter: &Emitter,
    ) -> Result<EnumParams> {
        Self::check_port(direction, port_id)?;

        let limit = if num == 0 { usize::MAX } else { num as usize };
        let params: Vec<Param> = self
            .candidates(id)
            .into_iter()
            .skip(start as usize)
            .take(limit)
            .collect();

        if !self.async_params {
            return Ok(EnumParams::Ready(params));
        }

        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        for (i, param) in params.into_iter().enumerate() {
            let index = start + i as u32;
            emitter.result(
                seq,
                ParamResult {
                    direction,
                    port_id,
                    index,
                    next: index + 1,
                    param,
                },
            );
        }
        Ok(EnumParams::Pending(seq))
    }

    fn port_set_param(&mut self, direction: Direction, port_id: u32, param: &Param) -> Result<()> {
        Self::check_port(direction, port_id)?;
        if param.id != param_id::FORMAT {
            return Err(Error::NotSupported(format!("param {}", param.id)));
        }

        if param.pod.is_empty() {
            tracing::debug!("source: clear format");
            self.format = None;
            self.started = false;
            self.streams.clear();
        } else {
            tracing::debug!("source: set format ({} bytes)", param.pod.len());
            self.format = Some(param.clone());
        }
        Ok(())
    }

    fn port_use_buffers(&mut self, key: MixKey, buffers: &[BufferRef]) -> Result<()> {
        Self::check_port(key.direction, key.port_id)?;

        if buffers.is_empty() {
            if self.streams.remove(&key).is_some() {
                tracing::debug!("source: mix {} cleared", key);
            }
            return Ok(());
        }
        if self.format.is_none() {
            return Err(Error::InvalidArgument("no format set".into()));
        }
        if let Some(b) = buffers
            .iter()
            .find(|b| !b.datas().iter().any(|d| d.memory().is_some()))
        {
            return Err(Error::InvalidArgument(format!(
                "buffer {} needs mapped memory",
                b.id()
            )));
        }

        tracing::debug!("source: mix {} uses {} buffers", key, buffers.len());
        self.streams.insert(
            key,
            Stream {
                buffers: buffers.to_vec(),
                slots: BufferSlots::new(buffers.len() as u32),
            },
        );
        Ok(())
    }

    fn port_reuse_buffer(&mut self, port_id: u32, buffer_id: u32) -> Result<()> {
        Self::check_port(Direction::Output, port_id)?;
        if self.streams.is_empty() {
            return Err(Error::InvalidArgument("no buffers".into()));
        }
        // The driver does not name the mix; mixes with fewer buffers skip the id
        let mut known = false;
        for (key, stream) in &mut self.streams {
            if buffer_id as usize >= stream.slots.len() {
                continue;
            }
            known = true;
            if stream.slots.recycle(buffer_id)? {
                tracing::trace!("source: mix {} recycle buffer {}", key, buffer_id);
            }
        }
        if !known {
            return Err(Error::InvalidArgument(format!(
                "buffer {} out of range for every mix",
                buffer_id
            )));
        }
        Ok(())
    }

    fn send_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Start => {
                if self.format.is_none() {
                    return Err(Error::InvalidArgument("start without format".into()));
                }
                self.started = true;
            }
            Command::Pause => self.started = false,
            Command::Other(id) => return Err(Error::NotSupported(format!("command {}", id))),
        }
        tracing::debug!("source: {:?}", command);
        Ok(())
    }

    fn sync(&mut self, _seq: u32, emitter: &Emitter) -> Result<u32> {
        let end = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        emitter.done(end, 0);
        Ok(end)
    }

    fn process(&mut self, ctx: &ProcessContext<'_>) -> ProcessStatus {
        if !self.started {
            return ProcessStatus::OK;
        }

        let mut status = ProcessStatus::OK;
        for mix in ctx.mixes() {
            let Some(stream) = self.streams.get_mut(&mix.key) else {
                continue;
            };
            let Stream { buffers, slots } = stream;
            let fill = &mut self.fill;
            let header_seq = &mut self.header_seq;

            match produce(&mix.io, slots, |id| {
                if let Some(buffer) = buffers.get(id as usize) {
                    fill_buffer(buffer, fill, header_seq, ctx.cycle());
                }
            }) {
                Produced::Published(id) => {
                    tracing::trace!("source: mix {} publish buffer {}", mix.key, id);
                    status |= ProcessStatus::HAVE_BUFFER;
                }
                Produced::Backpressure => {
                    tracing::trace!("source: mix {} not consumed yet", mix.key);
                }
                Produced::Empty => {
                    tracing::trace!("source: mix {} out of buffers", mix.key);
                }
            }
        }
        status
    }
}
