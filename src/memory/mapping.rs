//! Memory mappings of shared regions.
//!
//! A [`Mapping`] owns one `mmap` of a page-aligned window of a file
//! descriptor and unmaps it on drop. Mappings are shared through
//! `Arc<Mapping>`: the registry caches one per region and every buffer or I/O
//! binding that points into it keeps its own clone, so the window stays mapped
//! for as long as anything can dereference it.
//!
//! [`MappedRange`] is the bounds-checked view handed to the rest of the crate.

use rustix::fd::BorrowedFd;
use rustix::mm::{MapFlags, ProtFlags};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for map/unmap/close operations of a registry.
#[derive(Debug, Default)]
pub struct MapCounters {
    maps: AtomicU64,
    unmaps: AtomicU64,
    closes: AtomicU64,
}

impl MapCounters {
    pub(crate) fn record_close(&self) {
        self.closes.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot of the counters.
    pub fn snapshot(&self) -> MapStats {
        MapStats {
            maps: self.maps.load(Ordering::Relaxed),
            unmaps: self.unmaps.load(Ordering::Relaxed),
            closes: self.closes.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`MapCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapStats {
    /// Number of successful `mmap` calls.
    pub maps: u64,
    /// Number of `munmap` calls.
    pub unmaps: u64,
    /// Number of region file descriptors closed.
    pub closes: u64,
}

/// A page-aligned mapping window.
///
/// `offset` and `size` are what gets passed to `mmap`; `start` is the distance
/// from the aligned offset to the offset that was asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRange {
    /// Page-aligned file offset.
    pub offset: u64,
    /// Offset of the requested start inside the mapping.
    pub start: usize,
    /// Page-rounded size of the mapping.
    pub size: usize,
}

impl MapRange {
    /// Compute the mapping window covering `[offset, offset + size)`.
    pub fn new(offset: u64, size: usize, page_size: usize) -> Self {
        debug_assert!(page_size.is_power_of_two());
        let aligned = offset & !(page_size as u64 - 1);
        let start = (offset - aligned) as usize;
        let size = (start + size).next_multiple_of(page_size);
        Self {
            offset: aligned,
            start,
            size,
        }
    }

    /// True if both ranges map exactly the same pages.
    #[inline]
    pub fn same_window(&self, other: &MapRange) -> bool {
        self.offset == other.offset && self.size == other.size
    }
}

/// One `mmap` of a shared memory window.
pub struct Mapping {
    base: NonNull<u8>,
    range: MapRange,
    prot: ProtFlags,
    counters: Arc<MapCounters>,
}

impl Mapping {
    /// Map `range` of `fd` with `prot`, `MAP_SHARED`.
    pub(crate) fn new(
        fd: BorrowedFd<'_>,
        range: MapRange,
        prot: ProtFlags,
        counters: Arc<MapCounters>,
    ) -> rustix::io::Result<Self> {
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                range.size,
                prot,
                MapFlags::SHARED,
                fd,
                range.offset,
            )?
        };
        let base = NonNull::new(ptr.cast::<u8>()).ok_or(rustix::io::Errno::NOMEM)?;
        counters.maps.fetch_add(1, Ordering::Relaxed);

        Ok(Self {
            base,
            range,
            prot,
            counters,
        })
    }

    /// The mapped window.
    #[inline]
    pub fn range(&self) -> MapRange {
        self.range
    }

    /// Protection the window was mapped with.
    #[inline]
    pub fn prot(&self) -> ProtFlags {
        self.prot
    }

    /// Start of the mapping (page aligned).
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Lock the mapped pages into RAM.
    pub fn lock(&self) -> rustix::io::Result<()> {
        unsafe { rustix::mm::mlock(self.base.as_ptr().cast(), self.range.size) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        let res = unsafe { rustix::mm::munmap(self.base.as_ptr().cast(), self.range.size) };
        if let Err(e) = res {
            tracing::warn!("failed to unmap {:?}: {}", self.range, e);
        }
        self.counters.unmaps.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("base", &self.base)
            .field("range", &self.range)
            .field("prot", &self.prot)
            .finish()
    }
}

// SAFETY: the mapping is plain shared memory; concurrent access is governed by
// the buffer ownership protocol, not by this handle.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

/// A bounds-checked window into a [`Mapping`].
///
/// Cloning is cheap (Arc increment). The mapping stays alive as long as any
/// range into it exists.
#[derive(Clone)]
pub struct MappedRange {
    mapping: Arc<Mapping>,
    /// Offset from the mapping base.
    start: usize,
    len: usize,
}

impl MappedRange {
    pub(crate) fn new(mapping: Arc<Mapping>, start: usize, len: usize) -> Self {
        assert!(
            start + len <= mapping.range.size,
            "mapped range exceeds mapping bounds"
        );
        Self {
            mapping,
            start,
            len,
        }
    }

    /// Pointer to the first byte of the range.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        unsafe { self.mapping.base().add(self.start) }
    }

    /// Length of the range in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the range is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The mapping this range points into.
    #[inline]
    pub fn mapping(&self) -> &Arc<Mapping> {
        &self.mapping
    }

    /// True if both ranges point into the same mapping.
    pub fn same_mapping(&self, other: &MappedRange) -> bool {
        Arc::ptr_eq(&self.mapping, &other.mapping)
    }

    /// A sub-range, or `None` if it does not fit.
    pub fn subrange(&self, offset: usize, len: usize) -> Option<MappedRange> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        Some(Self {
            mapping: Arc::clone(&self.mapping),
            start: self.start + offset,
            len,
        })
    }

    /// View the range as bytes.
    ///
    /// # Safety
    ///
    /// The caller must own the memory for reading under the buffer ownership
    /// protocol; the remote peer may write to it otherwise.
    pub unsafe fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len) }
    }

    /// View the range as mutable bytes.
    ///
    /// # Safety
    ///
    /// The caller must own the memory for writing under the buffer ownership
    /// protocol, and the mapping must have been created writable.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.as_ptr(), self.len) }
    }

    pub(crate) fn read_u32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.len);
        unsafe { std::ptr::read_unaligned(self.as_ptr().add(offset).cast::<u32>()) }
    }

    pub(crate) fn read_i32(&self, offset: usize) -> i32 {
        self.read_u32(offset) as i32
    }

    pub(crate) fn read_i64(&self, offset: usize) -> i64 {
        assert!(offset + 8 <= self.len);
        unsafe { std::ptr::read_unaligned(self.as_ptr().add(offset).cast::<i64>()) }
    }

    pub(crate) fn write_u32(&self, offset: usize, value: u32) {
        assert!(offset + 4 <= self.len);
        unsafe { std::ptr::write_unaligned(self.as_ptr().add(offset).cast::<u32>(), value) }
    }

    pub(crate) fn write_i32(&self, offset: usize, value: i32) {
        self.write_u32(offset, value as u32)
    }

    pub(crate) fn write_i64(&self, offset: usize, value: i64) {
        assert!(offset + 8 <= self.len);
        unsafe { std::ptr::write_unaligned(self.as_ptr().add(offset).cast::<i64>(), value) }
    }
}

impl fmt::Debug for MappedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRange")
            .field("ptr", &self.as_ptr())
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemFd;
    use rustix::fd::AsFd;

    #[test]
    fn test_map_range_alignment() {
        let range = MapRange::new(0, 4096, 4096);
        assert_eq!(range, MapRange { offset: 0, start: 0, size: 4096 });

        let range = MapRange::new(5000, 100, 4096);
        assert_eq!(range.offset, 4096);
        assert_eq!(range.start, 904);
        assert_eq!(range.size, 4096);

        // Crosses a page boundary
        let range = MapRange::new(4000, 200, 4096);
        assert_eq!(range.offset, 0);
        assert_eq!(range.start, 4000);
        assert_eq!(range.size, 8192);
    }

    #[test]
    fn test_same_window() {
        let a = MapRange::new(10, 20, 4096);
        let b = MapRange::new(100, 200, 4096);
        let c = MapRange::new(4096, 20, 4096);
        assert!(a.same_window(&b));
        assert!(!a.same_window(&c));
    }

    #[test]
    fn test_mapping_counts_and_unmaps_on_drop() {
        let memfd = MemFd::new("test-mapping", 8192).unwrap();
        let counters = Arc::new(MapCounters::default());
        let range = MapRange::new(0, 8192, rustix::param::page_size());

        let mapping = Mapping::new(
            memfd.as_fd(),
            range,
            ProtFlags::READ | ProtFlags::WRITE,
            Arc::clone(&counters),
        )
        .unwrap();
        assert_eq!(counters.snapshot().maps, 1);
        assert_eq!(counters.snapshot().unmaps, 0);

        drop(mapping);
        assert_eq!(counters.snapshot().unmaps, 1);
    }

    #[test]
    fn test_mapped_range_outlives_cache_entry() {
        let memfd = MemFd::new("test-range", 4096).unwrap();
        let counters = Arc::new(MapCounters::default());
        let mapping = Arc::new(
            Mapping::new(
                memfd.as_fd(),
                MapRange::new(0, 4096, rustix::param::page_size()),
                ProtFlags::READ | ProtFlags::WRITE,
                Arc::clone(&counters),
            )
            .unwrap(),
        );

        let range = MappedRange::new(Arc::clone(&mapping), 0, 4096);
        drop(mapping);
        // Still mapped through the range
        assert_eq!(counters.snapshot().unmaps, 0);
        range.write_u32(16, 0xdead_beef);
        assert_eq!(range.read_u32(16), 0xdead_beef);

        drop(range);
        assert_eq!(counters.snapshot().unmaps, 1);
    }

    #[test]
    fn test_subrange_bounds() {
        let memfd = MemFd::new("test-sub", 4096).unwrap();
        let mapping = Arc::new(
            Mapping::new(
                memfd.as_fd(),
                MapRange::new(0, 4096, rustix::param::page_size()),
                ProtFlags::READ | ProtFlags::WRITE,
                Arc::new(MapCounters::default()),
            )
            .unwrap(),
        );
        let range = MappedRange::new(mapping, 0, 1024);

        let sub = range.subrange(512, 512).unwrap();
        assert_eq!(sub.len(), 512);
        assert_eq!(sub.as_ptr() as usize, range.as_ptr() as usize + 512);
        assert!(sub.same_mapping(&range));

        assert!(range.subrange(512, 513).is_none());
        assert!(range.subrange(usize::MAX, 2).is_none());
    }
}
