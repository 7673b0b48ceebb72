//! Buffers shared with the driver.
//!
//! - [`wire`]: the description the driver sends and the fixed in-memory layout
//! - [`Meta`]: typed metadata views
//! - [`BufferBuilder`]: wire description to [`Buffer`], all or nothing
//!
//! # Example
//!
//! ```rust,ignore
//! use parallax_remote::buffer::{BufferBuilder, WireBuffer, WireBufferRef, WireData, WireMeta, MetaType};
//!
//! let wire = WireBufferRef {
//!     mem_id: 1,
//!     offset: 0,
//!     size: 4096,
//!     buffer: WireBuffer::new()
//!         .with_meta(WireMeta::new(MetaType::Header))
//!         .with_data(WireData::mem_ptr(64, 1024)),
//! };
//! let buffers = BufferBuilder::new(&mut registry, mix).build_all(&[wire])?;
//! ```

mod builder;
mod meta;
pub mod wire;

pub use builder::{Buffer, BufferBuilder, BufferInner, BufferRef, Chunk, DataPlane};
pub use meta::{
    HEADER_FLAG_CORRUPTED, HEADER_FLAG_DELTA_UNIT, HEADER_FLAG_DISCONT, HEADER_FLAG_GAP,
    HEADER_FLAG_HEADER, HEADER_FLAG_MARKER, Meta, MetaHeader, VideoCrop,
};
pub use wire::{
    BufferLayout, CHUNK_SIZE, DataType, MetaType, WireBuffer, WireBufferRef, WireData, WireMeta,
};
