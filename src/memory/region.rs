//! Registry of shared memory regions received from the driver.
//!
//! Each region is identified by the id the driver chose in `AddMemory` and
//! owns a duplicated file descriptor. Consumers never hold the descriptor: they
//! [`acquire`](RegionRegistry::acquire) a [`RegionHandle`] and give it back with
//! [`release`](RegionRegistry::release). When the last handle of a region is
//! released the region is removed, its cached mapping is dropped and the
//! descriptor is closed, exactly once.
//!
//! # Example
//!
//! ```rust,ignore
//! use parallax_remote::memory::{MemFd, MemoryKind, RegionRegistry};
//! use rustix::mm::ProtFlags;
//!
//! let memfd = MemFd::new("pool", 4096)?;
//! let mut registry = RegionRegistry::new();
//! registry.register(1, MemoryKind::MemFd, memfd.try_clone_fd()?, 0)?;
//!
//! let handle = registry.acquire(1).expect("registered");
//! let range = registry.map(&handle, 0, 4096, ProtFlags::READ)?;
//! // ...
//! drop(range);
//! registry.release(handle); // last reference: fd closed
//! ```

use super::mapping::{MapCounters, MapRange, MapStats, MappedRange, Mapping};
use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::mm::ProtFlags;
use std::collections::HashMap;
use std::sync::Arc;

/// Region may be mapped for reading.
pub const MEMORY_FLAG_READABLE: u32 = 1 << 0;
/// Region may be mapped for writing.
pub const MEMORY_FLAG_WRITABLE: u32 = 1 << 1;

/// Kind of memory behind a region's descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// memfd, mappable.
    MemFd,
    /// DMA-BUF, mappable by the CPU only if the exporter allows it.
    DmaBuf,
    /// Anything else; carried but not interpreted.
    Other(u32),
}

impl MemoryKind {
    /// Decode the wire value (same numbering as buffer data types).
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            2 => MemoryKind::MemFd,
            3 => MemoryKind::DmaBuf,
            other => MemoryKind::Other(other),
        }
    }

    /// The wire value.
    pub fn as_raw(&self) -> u32 {
        match self {
            MemoryKind::MemFd => 2,
            MemoryKind::DmaBuf => 3,
            MemoryKind::Other(raw) => *raw,
        }
    }
}

/// A registered shared memory region.
#[derive(Debug)]
pub struct MemoryRegion {
    id: u32,
    kind: MemoryKind,
    fd: OwnedFd,
    flags: u32,
    ref_count: u32,
    mapping: Option<Arc<Mapping>>,
    serial: u64,
}

impl MemoryRegion {
    /// Region id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Memory kind.
    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    /// Region flags as sent by the driver.
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Number of outstanding handles.
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// The region's descriptor.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// True if a mapping is cached for this region.
    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }
}

/// Counted reference to a registered region.
///
/// Must be handed back with [`RegionRegistry::release`]. Handles are not
/// `Clone`: every reference is one count.
#[must_use = "region handles must be released to the registry"]
#[derive(Debug, PartialEq, Eq)]
pub struct RegionHandle {
    id: u32,
    serial: u64,
}

impl RegionHandle {
    /// Id of the referenced region.
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }
}

/// Registry of memory regions, keyed by id.
pub struct RegionRegistry {
    regions: HashMap<u32, MemoryRegion>,
    next_serial: u64,
    page_size: usize,
    counters: Arc<MapCounters>,
}

impl RegionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            regions: HashMap::new(),
            next_serial: 1,
            page_size: rustix::param::page_size(),
            counters: Arc::new(MapCounters::default()),
        }
    }

    /// Register a region.
    ///
    /// The registry takes ownership of `fd`. A duplicate id is rejected and
    /// the new descriptor is closed; the first registration stays.
    pub fn register(&mut self, id: u32, kind: MemoryKind, fd: OwnedFd, flags: u32) -> Result<()> {
        if self.regions.contains_key(&id) {
            tracing::warn!("duplicate mem {}, flags {}", id, flags);
            return Err(Error::DuplicateMemory(id));
        }

        tracing::debug!("add mem {} ({:?}), flags {}", id, kind, flags);

        let serial = self.next_serial;
        self.next_serial += 1;
        self.regions.insert(
            id,
            MemoryRegion {
                id,
                kind,
                fd,
                flags,
                ref_count: 0,
                mapping: None,
                serial,
            },
        );
        Ok(())
    }

    /// Take a counted reference to region `id`.
    pub fn acquire(&mut self, id: u32) -> Option<RegionHandle> {
        let region = self.regions.get_mut(&id)?;
        region.ref_count += 1;
        Some(RegionHandle {
            id,
            serial: region.serial,
        })
    }

    /// Give back a reference. The last one clears the region.
    pub fn release(&mut self, handle: RegionHandle) {
        let Some(region) = self.regions.get_mut(&handle.id) else {
            tracing::warn!("release of unknown mem {}", handle.id);
            return;
        };
        if region.serial != handle.serial {
            tracing::warn!("release of stale handle for mem {}", handle.id);
            return;
        }
        if region.ref_count == 0 {
            tracing::warn!("mem {} released with zero references", handle.id);
            return;
        }

        region.ref_count -= 1;
        if region.ref_count == 0 {
            self.clear(handle.id);
        }
    }

    /// Map `[offset, offset + size)` of the referenced region.
    ///
    /// The cached mapping is reused when it covers the same pages with a
    /// compatible protection. Otherwise it is replaced; ranges handed out
    /// earlier keep the old mapping alive until they are dropped.
    pub fn map(
        &mut self,
        handle: &RegionHandle,
        offset: u64,
        size: usize,
        prot: ProtFlags,
    ) -> Result<MappedRange> {
        if size == 0 {
            return Err(Error::InvalidArgument(format!(
                "zero sized mapping of mem {}",
                handle.id
            )));
        }
        let region = match self.regions.get_mut(&handle.id) {
            Some(region) if region.serial == handle.serial => region,
            _ => return Err(Error::UnknownMemory(handle.id)),
        };

        let range = MapRange::new(offset, size, self.page_size);

        if let Some(mapping) = &region.mapping {
            if mapping.range().same_window(&range) && mapping.prot().contains(prot) {
                tracing::trace!("mem {}: reuse mapping {:?}", region.id, range);
                return Ok(MappedRange::new(Arc::clone(mapping), range.start, size));
            }
        }

        // Drop the cached window first so a sole owner is unmapped before the
        // new mmap.
        region.mapping = None;

        let mapping = Mapping::new(region.fd.as_fd(), range, prot, Arc::clone(&self.counters))
            .map_err(|source| {
                tracing::error!("failed to mmap mem {} ({}+{}): {}", region.id, offset, size, source);
                Error::Map {
                    id: region.id,
                    offset,
                    size,
                    source,
                }
            })?;
        let mapping = Arc::new(mapping);
        region.mapping = Some(Arc::clone(&mapping));

        tracing::debug!("mem {}: mapped {} {} at {:p}", region.id, offset, size, mapping.base());
        Ok(MappedRange::new(mapping, range.start, size))
    }

    /// Look up a region.
    pub fn get(&self, id: u32) -> Option<&MemoryRegion> {
        self.regions.get(&id)
    }

    /// True if `id` is registered.
    pub fn contains(&self, id: u32) -> bool {
        self.regions.contains_key(&id)
    }

    /// Current reference count of `id`.
    pub fn ref_count(&self, id: u32) -> Option<u32> {
        self.regions.get(&id).map(|r| r.ref_count)
    }

    /// Descriptor of the region a handle refers to.
    pub fn fd(&self, handle: &RegionHandle) -> Option<BorrowedFd<'_>> {
        self.regions
            .get(&handle.id)
            .filter(|r| r.serial == handle.serial)
            .map(|r| r.fd.as_fd())
    }

    /// Number of registered regions.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// True if no region is registered.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Map/unmap/close counters.
    pub fn stats(&self) -> MapStats {
        self.counters.snapshot()
    }

    /// Drop every region regardless of its reference count.
    ///
    /// Only for node teardown, after all buffers and I/O bindings have been
    /// released. Outstanding handles become stale.
    pub fn purge(&mut self) {
        let ids: Vec<u32> = self.regions.keys().copied().collect();
        for id in ids {
            if let Some(region) = self.regions.get(&id) {
                if region.ref_count > 0 {
                    tracing::warn!("purging mem {} with {} references", id, region.ref_count);
                }
            }
            self.clear(id);
        }
    }

    fn clear(&mut self, id: u32) {
        if let Some(region) = self.regions.remove(&id) {
            tracing::debug!("clear mem {}", id);
            // Mapping first, then the descriptor.
            drop(region.mapping);
            drop(region.fd);
            self.counters.record_close();
        }
    }
}

impl Default for RegionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RegionRegistry {
    fn drop(&mut self) {
        self.purge();
    }
}
