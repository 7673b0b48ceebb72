//! Typed views of buffer metadata blocks.

use super::wire::MetaType;
use crate::memory::MappedRange;

/// Data is not continuous with the previous buffer.
pub const HEADER_FLAG_DISCONT: u32 = 1 << 0;
/// Data might be corrupted.
pub const HEADER_FLAG_CORRUPTED: u32 = 1 << 1;
/// Media specific marker.
pub const HEADER_FLAG_MARKER: u32 = 1 << 2;
/// Data contains a codec specific header.
pub const HEADER_FLAG_HEADER: u32 = 1 << 3;
/// Data is media neutral filler.
pub const HEADER_FLAG_GAP: u32 = 1 << 4;
/// Data cannot be decoded independently.
pub const HEADER_FLAG_DELTA_UNIT: u32 = 1 << 5;

/// Contents of a [`MetaType::Header`] block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetaHeader {
    /// `HEADER_FLAG_*` bits.
    pub flags: u32,
    /// Sequence number.
    pub seq: u32,
    /// Presentation timestamp in nanoseconds.
    pub pts: i64,
    /// Decode timestamp relative to `pts`.
    pub dts_offset: i64,
}

/// Contents of a [`MetaType::VideoCrop`] block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VideoCrop {
    /// Left edge.
    pub x: i32,
    /// Top edge.
    pub y: i32,
    /// Width of the visible region.
    pub width: i32,
    /// Height of the visible region.
    pub height: i32,
}

/// A metadata block inside a buffer's memory.
#[derive(Debug, Clone)]
pub struct Meta {
    kind: MetaType,
    view: MappedRange,
}

impl Meta {
    pub(crate) fn new(kind: MetaType, view: MappedRange) -> Self {
        debug_assert!(view.len() >= kind.min_size());
        Self { kind, view }
    }

    /// Block type.
    pub fn kind(&self) -> MetaType {
        self.kind
    }

    /// Block size in bytes.
    pub fn size(&self) -> usize {
        self.view.len()
    }

    /// The memory of the block.
    pub fn view(&self) -> &MappedRange {
        &self.view
    }

    /// Read the header, if this is a header block.
    pub fn header(&self) -> Option<MetaHeader> {
        (self.kind == MetaType::Header).then(|| MetaHeader {
            flags: self.view.read_u32(0),
            seq: self.view.read_u32(4),
            pts: self.view.read_i64(8),
            dts_offset: self.view.read_i64(16),
        })
    }

    /// Write the header. Returns false if this is not a header block.
    pub fn set_header(&self, header: &MetaHeader) -> bool {
        if self.kind != MetaType::Header {
            return false;
        }
        self.view.write_u32(0, header.flags);
        self.view.write_u32(4, header.seq);
        self.view.write_i64(8, header.pts);
        self.view.write_i64(16, header.dts_offset);
        true
    }

    /// Read the crop rectangle, if this is a crop block.
    pub fn video_crop(&self) -> Option<VideoCrop> {
        (self.kind == MetaType::VideoCrop).then(|| VideoCrop {
            x: self.view.read_i32(0),
            y: self.view.read_i32(4),
            width: self.view.read_i32(8),
            height: self.view.read_i32(12),
        })
    }

    /// Write the crop rectangle. Returns false if this is not a crop block.
    pub fn set_video_crop(&self, crop: &VideoCrop) -> bool {
        if self.kind != MetaType::VideoCrop {
            return false;
        }
        self.view.write_i32(0, crop.x);
        self.view.write_i32(4, crop.y);
        self.view.write_i32(8, crop.width);
        self.view.write_i32(12, crop.height);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemFd, MemoryKind, RegionRegistry};
    use rustix::mm::ProtFlags;

    fn view(size: usize) -> (RegionRegistry, MappedRange) {
        let memfd = MemFd::new("test-meta", 4096).unwrap();
        let mut registry = RegionRegistry::new();
        registry
            .register(0, MemoryKind::MemFd, memfd.try_clone_fd().unwrap(), 0)
            .unwrap();
        let handle = registry.acquire(0).unwrap();
        let range = registry
            .map(&handle, 0, size, ProtFlags::READ | ProtFlags::WRITE)
            .unwrap();
        // The range keeps the mapping alive; the handle stays counted.
        std::mem::forget(handle);
        (registry, range)
    }

    #[test]
    fn test_header_roundtrip_layout() {
        let (_registry, range) = view(24);
        let meta = Meta::new(MetaType::Header, range.clone());

        let header = MetaHeader {
            flags: HEADER_FLAG_DISCONT | HEADER_FLAG_GAP,
            seq: 9,
            pts: 1_000_000,
            dts_offset: -40,
        };
        assert!(meta.set_header(&header));
        assert_eq!(meta.header(), Some(header));

        // Wire layout: flags, seq, pts, dts_offset
        assert_eq!(range.read_u32(0), HEADER_FLAG_DISCONT | HEADER_FLAG_GAP);
        assert_eq!(range.read_u32(4), 9);
        assert_eq!(range.read_i64(8), 1_000_000);
        assert_eq!(range.read_i64(16), -40);
    }

    #[test]
    fn test_accessors_check_kind() {
        let (_registry, range) = view(24);
        let meta = Meta::new(MetaType::VideoCrop, range);
        assert!(meta.header().is_none());
        assert!(!meta.set_header(&MetaHeader::default()));

        let crop = VideoCrop {
            x: 2,
            y: 4,
            width: 640,
            height: 480,
        };
        assert!(meta.set_video_crop(&crop));
        assert_eq!(meta.video_crop(), Some(crop));
        assert_eq!(meta.size(), 24);
    }
}
