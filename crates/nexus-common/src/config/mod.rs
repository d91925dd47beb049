//! Configuration for the NexusDB memory manager.
//!
//! This module provides configuration structures for arenas and for the
//! standard context hierarchy.

mod memory;

pub use memory::{AllocSetConfig, MemoryConfig, MemoryConfigBuilder};
