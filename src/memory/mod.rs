//! Shared memory received from the driver.
//!
//! # Architecture
//!
//! - [`RegionRegistry`]: regions by id, reference counted through [`RegionHandle`]s
//! - [`Mapping`]: one `mmap` window, unmapped when the last [`MappedRange`] drops
//! - [`MemFd`]: allocation side, for drivers and tests
//! - [`ipc`]: `SCM_RIGHTS` descriptor passing
//!
//! # Example
//!
//! ```rust,ignore
//! use parallax_remote::memory::{MemoryKind, RegionRegistry};
//! use rustix::mm::ProtFlags;
//!
//! let mut registry = RegionRegistry::new();
//! registry.register(id, MemoryKind::MemFd, fd, flags)?;
//!
//! let handle = registry.acquire(id).expect("registered");
//! let range = registry.map(&handle, offset, size, ProtFlags::READ)?;
//! ```

pub mod ipc;
mod mapping;
mod memfd;
mod region;

pub use mapping::{MapCounters, MapRange, MapStats, MappedRange, Mapping};
pub use memfd::MemFd;
pub use region::{
    MEMORY_FLAG_READABLE, MEMORY_FLAG_WRITABLE, MemoryKind, MemoryRegion, RegionHandle,
    RegionRegistry,
};
pub use rustix::mm::ProtFlags;
