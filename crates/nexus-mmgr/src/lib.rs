//! # nexus-mmgr
//!
//! Scoped memory contexts for the NexusDB engine.
//!
//! Query processing allocates many small, short-lived objects. Instead of
//! freeing each one, the engine allocates them from a memory context and
//! reclaims the whole context when the query or transaction ends.
//!
//! This crate provides:
//!
//! - **AllocSet**: a size-classed arena with power-of-two freelists, a
//!   dedicated-block path for large requests and built-in corruption checks
//! - **MemoryContext**: the trait every context implementation provides
//! - **MemoryContextTree**: a hierarchy of contexts with children-first
//!   reset and destroy
//! - **MemoryManager**: the standard contexts and the current context
//! - **SharedAllocSet**: an arena behind a mutex for cross-thread use
//!
//! ## Example
//!
//! ```rust
//! use nexus_common::config::AllocSetConfig;
//! use nexus_mmgr::{AllocSet, ALLOC_CHUNK_LIMIT};
//!
//! let mut set = AllocSet::new("example", &AllocSetConfig::default()).unwrap();
//!
//! let small = set.alloc(100).unwrap();
//! let large = set.alloc(ALLOC_CHUNK_LIMIT + 1).unwrap();
//! assert_eq!(set.chunk_capacity(small).unwrap(), 128);
//!
//! set.free(large).unwrap();
//! assert_eq!(set.check(), 0);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

mod aset;
mod backing;
mod block;
mod chunk;
mod context;
mod diag;
mod freelist;
mod manager;
mod shared;
mod tree;

pub use aset::AllocSet;
pub use backing::{
    checked_max_align, max_align, system_backing, BackingAllocator, RawRegion, SystemAllocator,
};
pub use block::BLOCK_HDR_SZ;
pub use chunk::{ChunkPtr, CHUNK_HDR_SZ};
pub use context::{ContextKind, MemoryContext, MemoryContextStats};
pub use diag::{CollectingSink, DiagnosticSink, Severity, TracingSink};
pub use freelist::{class_size, free_index};
pub use manager::{MemoryManager, StandardContext};
pub use shared::SharedAllocSet;
pub use tree::MemoryContextTree;

pub use nexus_common::{
    ContextId, ErrorCode, NexusError, NexusResult, ALLOC_CHUNK_LIMIT, ALLOC_MIN_BITS,
    ALLOC_NUM_FREELISTS, CHUNK_DIRTY, CHUNK_MAGIC,
};
