//! Wire description of buffers.
//!
//! The driver describes every buffer it hands to the node as a list of
//! metadata blocks and data planes, plus the memory window holding them. The
//! layout inside that window is fixed: meta blocks first, each at the
//! accumulated offset with its size rounded up to 8, followed by one 12 byte
//! chunk header per data plane. Both sides compute offsets with
//! [`BufferLayout`], so a peer that lays out memory the same way sees the
//! same bytes.

use smallvec::SmallVec;

/// Size of a chunk header on the wire: `u32 offset, u32 size, i32 stride`.
pub const CHUNK_SIZE: usize = 12;

/// Alignment of meta blocks.
pub const META_ALIGN: usize = 8;

/// Type of a metadata block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetaType {
    /// Flags, sequence number and timestamps.
    Header,
    /// A typed pointer.
    Pointer,
    /// Video cropping rectangle.
    VideoCrop,
    /// Ring buffer indices.
    Ringbuffer,
    /// Description of shared data memory.
    Shared,
}

impl MetaType {
    /// Decode the wire value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(MetaType::Header),
            2 => Some(MetaType::Pointer),
            3 => Some(MetaType::VideoCrop),
            4 => Some(MetaType::Ringbuffer),
            5 => Some(MetaType::Shared),
            _ => None,
        }
    }

    /// The wire value.
    pub fn as_raw(self) -> u32 {
        match self {
            MetaType::Header => 1,
            MetaType::Pointer => 2,
            MetaType::VideoCrop => 3,
            MetaType::Ringbuffer => 4,
            MetaType::Shared => 5,
        }
    }

    /// Minimum size of a block of this type.
    pub fn min_size(self) -> usize {
        match self {
            MetaType::Header => 24,
            MetaType::Pointer => 16,
            MetaType::VideoCrop => 16,
            MetaType::Ringbuffer => 16,
            MetaType::Shared => 24,
        }
    }
}

/// Type of a data plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataType {
    /// Memory inside the buffer's own window, `data` is an offset.
    MemPtr,
    /// Mappable memfd, `data` is a memory id.
    MemFd,
    /// DMA-BUF, `data` is a memory id.
    DmaBuf,
    /// No memory, `data` is an id with out-of-band meaning.
    Id,
}

impl DataType {
    /// Decode the wire value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(DataType::MemPtr),
            2 => Some(DataType::MemFd),
            3 => Some(DataType::DmaBuf),
            4 => Some(DataType::Id),
            _ => None,
        }
    }

    /// The wire value.
    pub fn as_raw(self) -> u32 {
        match self {
            DataType::MemPtr => 1,
            DataType::MemFd => 2,
            DataType::DmaBuf => 3,
            DataType::Id => 4,
        }
    }
}

/// A metadata block as described on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub struct WireMeta {
    /// Raw [`MetaType`].
    pub kind: u32,
    /// Size in bytes.
    pub size: u32,
}

impl WireMeta {
    /// A block of `kind` with its minimum size.
    pub fn new(kind: MetaType) -> Self {
        Self {
            kind: kind.as_raw(),
            size: kind.min_size() as u32,
        }
    }
}

/// A data plane as described on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub struct WireData {
    /// Raw [`DataType`].
    pub kind: u32,
    /// Plane flags.
    pub flags: u32,
    /// Offset of the plane in its memory.
    pub map_offset: u32,
    /// Usable size of the plane.
    pub max_size: u32,
    /// Offset (`MemPtr`), memory id (`MemFd`, `DmaBuf`) or id (`Id`).
    pub data: u32,
}

impl WireData {
    /// Plane at `offset` inside the buffer window.
    pub fn mem_ptr(offset: u32, max_size: u32) -> Self {
        Self {
            kind: DataType::MemPtr.as_raw(),
            flags: 0,
            map_offset: 0,
            max_size,
            data: offset,
        }
    }

    /// Plane in memfd `mem_id` at `map_offset`.
    pub fn mem_fd(mem_id: u32, map_offset: u32, max_size: u32) -> Self {
        Self {
            kind: DataType::MemFd.as_raw(),
            flags: 0,
            map_offset,
            max_size,
            data: mem_id,
        }
    }

    /// Plane in DMA-BUF `mem_id`.
    pub fn dma_buf(mem_id: u32, map_offset: u32, max_size: u32) -> Self {
        Self {
            kind: DataType::DmaBuf.as_raw(),
            ..Self::mem_fd(mem_id, map_offset, max_size)
        }
    }

    /// Plane without memory.
    pub fn id(id: u32) -> Self {
        Self {
            kind: DataType::Id.as_raw(),
            flags: 0,
            map_offset: 0,
            max_size: 0,
            data: id,
        }
    }
}

/// Metas and planes of one buffer.
#[derive(Clone, Debug, Default, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub struct WireBuffer {
    /// Metadata blocks in layout order.
    pub metas: Vec<WireMeta>,
    /// Data planes in layout order.
    pub datas: Vec<WireData>,
}

impl WireBuffer {
    /// An empty description.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a metadata block.
    pub fn with_meta(mut self, meta: WireMeta) -> Self {
        self.metas.push(meta);
        self
    }

    /// Append a data plane.
    pub fn with_data(mut self, data: WireData) -> Self {
        self.datas.push(data);
        self
    }
}

/// A buffer description together with the memory window holding it.
#[derive(Clone, Debug, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub struct WireBufferRef {
    /// Memory holding metas, chunks and `MemPtr` planes.
    pub mem_id: u32,
    /// Offset of the window in that memory.
    pub offset: u32,
    /// Size of the window.
    pub size: u32,
    /// Layout of the buffer.
    pub buffer: WireBuffer,
}

/// Offsets of metas and chunks inside a buffer window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferLayout {
    meta_offsets: SmallVec<[usize; 4]>,
    chunks: usize,
    n_datas: usize,
}

impl BufferLayout {
    /// Compute the layout of `buffer`.
    pub fn compute(buffer: &WireBuffer) -> Self {
        let mut offset = 0usize;
        let mut meta_offsets = SmallVec::with_capacity(buffer.metas.len());
        for meta in &buffer.metas {
            meta_offsets.push(offset);
            offset += (meta.size as usize).next_multiple_of(META_ALIGN);
        }
        Self {
            meta_offsets,
            chunks: offset,
            n_datas: buffer.datas.len(),
        }
    }

    /// Offset of meta block `index`.
    pub fn meta_offset(&self, index: usize) -> Option<usize> {
        self.meta_offsets.get(index).copied()
    }

    /// Offset of the first chunk header.
    pub fn chunks_offset(&self) -> usize {
        self.chunks
    }

    /// Offset of the chunk header of plane `index`.
    pub fn chunk_offset(&self, index: usize) -> usize {
        self.chunks + CHUNK_SIZE * index
    }

    /// Bytes needed for metas and chunk headers.
    pub fn end(&self) -> usize {
        self.chunk_offset(self.n_datas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_rounds_metas_to_8() {
        let buffer = WireBuffer::new()
            .with_meta(WireMeta::new(MetaType::Header))
            .with_meta(WireMeta { kind: 2, size: 17 })
            .with_meta(WireMeta::new(MetaType::VideoCrop))
            .with_data(WireData::mem_ptr(256, 1024))
            .with_data(WireData::mem_ptr(1280, 1024));

        let layout = BufferLayout::compute(&buffer);
        assert_eq!(layout.meta_offset(0), Some(0));
        assert_eq!(layout.meta_offset(1), Some(24));
        assert_eq!(layout.meta_offset(2), Some(48));
        assert_eq!(layout.meta_offset(3), None);
        assert_eq!(layout.chunks_offset(), 64);
        assert_eq!(layout.chunk_offset(1), 76);
        assert_eq!(layout.end(), 88);
    }

    #[test]
    fn test_layout_without_metas() {
        let buffer = WireBuffer::new().with_data(WireData::id(3));
        let layout = BufferLayout::compute(&buffer);
        assert_eq!(layout.chunks_offset(), 0);
        assert_eq!(layout.end(), CHUNK_SIZE);
    }

    #[test]
    fn test_type_raw_values() {
        for kind in [
            MetaType::Header,
            MetaType::Pointer,
            MetaType::VideoCrop,
            MetaType::Ringbuffer,
            MetaType::Shared,
        ] {
            assert_eq!(MetaType::from_raw(kind.as_raw()), Some(kind));
        }
        assert_eq!(MetaType::from_raw(0), None);
        assert_eq!(DataType::from_raw(2), Some(DataType::MemFd));
        assert_eq!(DataType::from_raw(0), None);
        assert_eq!(WireData::dma_buf(4, 0, 16).kind, DataType::DmaBuf.as_raw());
    }
}
