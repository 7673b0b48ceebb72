//! Reconstruction of buffers from their wire description.
//!
//! [`BufferBuilder`] turns a [`WireBufferRef`] into a [`Buffer`]: it acquires
//! every memory region the description references, maps the windows and
//! resolves metas, chunk headers and data planes to bounds-checked views.
//! A build either succeeds completely or releases everything it acquired.

use super::meta::Meta;
use super::wire::{BufferLayout, CHUNK_SIZE, DataType, MetaType, WireBufferRef};
use crate::error::{Error, Result};
use crate::memory::{MappedRange, ProtFlags, RegionHandle, RegionRegistry};
use crate::port::{Direction, MixKey};
use smallvec::SmallVec;
use std::sync::Arc;

/// Valid data of a plane for the current cycle.
///
/// Same layout as on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Chunk {
    /// Offset of valid data in the plane.
    pub offset: u32,
    /// Size of valid data.
    pub size: u32,
    /// Stride of the data, 0 if unknown.
    pub stride: i32,
}

/// One data plane of a buffer.
#[derive(Debug, Clone)]
pub struct DataPlane {
    kind: DataType,
    flags: u32,
    region: Option<u32>,
    map_offset: u32,
    max_size: u32,
    data_id: Option<u32>,
    memory: Option<MappedRange>,
    chunk: MappedRange,
}

impl DataPlane {
    /// Plane type.
    pub fn kind(&self) -> DataType {
        self.kind
    }

    /// Plane flags.
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Memory id backing the plane (`MemFd`, `DmaBuf`).
    pub fn region(&self) -> Option<u32> {
        self.region
    }

    /// Offset of the plane in its memory.
    pub fn map_offset(&self) -> u32 {
        self.map_offset
    }

    /// Usable size.
    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    /// Out-of-band id of an `Id` plane.
    pub fn data_id(&self) -> Option<u32> {
        self.data_id
    }

    /// CPU view of the plane, if it is mapped.
    pub fn memory(&self) -> Option<&MappedRange> {
        self.memory.as_ref()
    }

    /// Read the chunk header.
    pub fn chunk(&self) -> Chunk {
        Chunk {
            offset: self.chunk.read_u32(0),
            size: self.chunk.read_u32(4),
            stride: self.chunk.read_i32(8),
        }
    }

    /// Rewrite the chunk header.
    pub fn set_chunk(&self, chunk: Chunk) {
        self.chunk.write_u32(0, chunk.offset);
        self.chunk.write_u32(4, chunk.size);
        self.chunk.write_i32(8, chunk.stride);
    }
}

/// The immutable part of a buffer, shared with the data path.
#[derive(Debug)]
pub struct BufferInner {
    id: u32,
    metas: Vec<Meta>,
    datas: Vec<DataPlane>,
}

impl BufferInner {
    /// Buffer id (index in the installed set).
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Metadata blocks.
    pub fn metas(&self) -> &[Meta] {
        &self.metas
    }

    /// First meta block of `kind`.
    pub fn find_meta(&self, kind: MetaType) -> Option<&Meta> {
        self.metas.iter().find(|m| m.kind() == kind)
    }

    /// Data planes.
    pub fn datas(&self) -> &[DataPlane] {
        &self.datas
    }
}

/// Reference to a buffer as seen by the data path.
pub type BufferRef = Arc<BufferInner>;

/// A buffer installed on a mix.
///
/// Holds one [`RegionHandle`] per memory region it references; they must be
/// given back with [`Buffer::release`].
#[must_use = "buffers hold region references that must be released"]
#[derive(Debug)]
pub struct Buffer {
    mix: MixKey,
    inner: BufferRef,
    regions: SmallVec<[RegionHandle; 2]>,
}

impl Buffer {
    /// Buffer id.
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// The mix the buffer was installed on.
    pub fn mix(&self) -> MixKey {
        self.mix
    }

    /// A reference for the data path.
    pub fn to_ref(&self) -> BufferRef {
        Arc::clone(&self.inner)
    }

    /// Metadata blocks.
    pub fn metas(&self) -> &[Meta] {
        &self.inner.metas
    }

    /// Data planes.
    pub fn datas(&self) -> &[DataPlane] {
        &self.inner.datas
    }

    /// Ids of the regions this buffer holds, in acquisition order.
    pub fn region_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.regions.iter().map(|h| h.id())
    }

    /// Give every region reference back to the registry.
    pub fn release(self, registry: &mut RegionRegistry) {
        tracing::trace!("release buffer {} of mix {}", self.inner.id, self.mix);
        for handle in self.regions {
            registry.release(handle);
        }
    }
}

/// Builds the buffers of one `UseBuffers` request.
pub struct BufferBuilder<'a> {
    registry: &'a mut RegionRegistry,
    mix: MixKey,
    prot: ProtFlags,
    lock_memory: bool,
}

impl<'a> BufferBuilder<'a> {
    /// Builder for buffers of `mix`.
    ///
    /// Memory is mapped readable, and writable for output ports.
    pub fn new(registry: &'a mut RegionRegistry, mix: MixKey) -> Self {
        let prot = match mix.direction {
            Direction::Output => ProtFlags::READ | ProtFlags::WRITE,
            Direction::Input => ProtFlags::READ,
        };
        Self {
            registry,
            mix,
            prot,
            lock_memory: false,
        }
    }

    /// `mlock` buffer windows after mapping them.
    pub fn with_lock_memory(mut self, lock: bool) -> Self {
        self.lock_memory = lock;
        self
    }

    /// Build all buffers, ids assigned by position.
    ///
    /// On failure every buffer built so far is released.
    pub fn build_all(&mut self, wires: &[WireBufferRef]) -> Result<Vec<Buffer>> {
        let mut buffers = Vec::with_capacity(wires.len());
        for (id, wire) in wires.iter().enumerate() {
            match self.build(id as u32, wire) {
                Ok(buffer) => buffers.push(buffer),
                Err(e) => {
                    for buffer in buffers {
                        buffer.release(self.registry);
                    }
                    return Err(e);
                }
            }
        }
        Ok(buffers)
    }

    /// Build one buffer.
    ///
    /// On failure the region reference counts are back to their values before
    /// the call.
    pub fn build(&mut self, id: u32, wire: &WireBufferRef) -> Result<Buffer> {
        let mut regions = SmallVec::new();
        match self.build_inner(id, wire, &mut regions) {
            Ok(inner) => Ok(Buffer {
                mix: self.mix,
                inner: Arc::new(inner),
                regions,
            }),
            Err(e) => {
                tracing::warn!("buffer {} of mix {}: {}", id, self.mix, e);
                for handle in regions {
                    self.registry.release(handle);
                }
                Err(e)
            }
        }
    }

    fn build_inner(
        &mut self,
        id: u32,
        wire: &WireBufferRef,
        regions: &mut SmallVec<[RegionHandle; 2]>,
    ) -> Result<BufferInner> {
        if wire.size == 0 {
            return Err(Error::MalformedBuffer(format!("buffer {} has an empty window", id)));
        }

        let handle = self
            .registry
            .acquire(wire.mem_id)
            .ok_or(Error::UnknownMemory(wire.mem_id))?;
        regions.push(handle);

        let base = self.registry.map(
            &regions[0],
            u64::from(wire.offset),
            wire.size as usize,
            self.prot,
        )?;
        if self.lock_memory {
            if let Err(e) = base.mapping().lock() {
                tracing::warn!(
                    "failed to mlock memory {} {}+{}: {}",
                    wire.mem_id,
                    wire.offset,
                    wire.size,
                    e
                );
            }
        }

        tracing::debug!("add buffer {} mem {} {}+{}", id, wire.mem_id, wire.offset, wire.size);

        let layout = BufferLayout::compute(&wire.buffer);
        if layout.end() > base.len() {
            return Err(Error::MalformedBuffer(format!(
                "metas and chunks need {} bytes, window has {}",
                layout.end(),
                base.len()
            )));
        }

        let mut metas = Vec::with_capacity(wire.buffer.metas.len());
        for (i, meta) in wire.buffer.metas.iter().enumerate() {
            let kind = MetaType::from_raw(meta.kind)
                .ok_or_else(|| Error::MalformedBuffer(format!("unknown meta type {}", meta.kind)))?;
            let size = meta.size as usize;
            if size < kind.min_size() {
                return Err(Error::MalformedBuffer(format!(
                    "{:?} meta of {} bytes, needs {}",
                    kind,
                    size,
                    kind.min_size()
                )));
            }
            let view = layout
                .meta_offset(i)
                .and_then(|offset| base.subrange(offset, size))
                .ok_or_else(|| Error::MalformedBuffer(format!("meta {} out of bounds", i)))?;
            metas.push(Meta::new(kind, view));
        }

        let mut datas = Vec::with_capacity(wire.buffer.datas.len());
        for (j, d) in wire.buffer.datas.iter().enumerate() {
            let chunk = base
                .subrange(layout.chunk_offset(j), CHUNK_SIZE)
                .ok_or_else(|| Error::MalformedBuffer(format!("chunk {} out of bounds", j)))?;
            let kind = DataType::from_raw(d.kind)
                .ok_or_else(|| Error::MalformedBuffer(format!("unknown data type {}", d.kind)))?;

            let mut plane = DataPlane {
                kind,
                flags: d.flags,
                region: None,
                map_offset: d.map_offset,
                max_size: d.max_size,
                data_id: None,
                memory: None,
                chunk,
            };

            match kind {
                DataType::MemPtr => {
                    let memory = base
                        .subrange(d.data as usize, d.max_size as usize)
                        .ok_or_else(|| {
                            Error::MalformedBuffer(format!(
                                "data {} ({}+{}) outside window of {} bytes",
                                j,
                                d.data,
                                d.max_size,
                                base.len()
                            ))
                        })?;
                    tracing::trace!(" data {} -> mem {:p} maxsize {}", j, memory.as_ptr(), d.max_size);
                    plane.memory = Some(memory);
                }
                DataType::MemFd | DataType::DmaBuf => {
                    let mem_id = d.data;
                    let handle = self
                        .registry
                        .acquire(mem_id)
                        .ok_or(Error::UnknownMemory(mem_id))?;
                    regions.push(handle);
                    plane.region = Some(mem_id);

                    if kind == DataType::MemFd && d.max_size > 0 {
                        let memory = match inline_offset(wire, d.data, d.map_offset, d.max_size) {
                            Some(offset) => base.subrange(offset, d.max_size as usize),
                            None => None,
                        };
                        let memory = match memory {
                            Some(memory) => memory,
                            None => {
                                let handle = &regions[regions.len() - 1];
                                self.registry.map(
                                    handle,
                                    u64::from(d.map_offset),
                                    d.max_size as usize,
                                    self.prot,
                                )?
                            }
                        };
                        plane.memory = Some(memory);
                    }
                    tracing::trace!(" data {} -> mem {} maxsize {}", j, mem_id, d.max_size);
                }
                DataType::Id => {
                    plane.data_id = Some(d.data);
                }
            }
            datas.push(plane);
        }

        Ok(BufferInner { id, metas, datas })
    }
}

/// Offset inside the buffer window of a plane that lives in the same memory.
fn inline_offset(wire: &WireBufferRef, mem_id: u32, map_offset: u32, max_size: u32) -> Option<usize> {
    if mem_id != wire.mem_id || map_offset < wire.offset {
        return None;
    }
    let start = map_offset - wire.offset;
    let end = start.checked_add(max_size)?;
    (end <= wire.size).then_some(start as usize)
}
