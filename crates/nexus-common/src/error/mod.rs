//! Error handling for the NexusDB memory manager.
//!
//! This module provides a unified error type and result alias used
//! across the memory manager crates.

mod nexus;

pub use nexus::{ErrorCode, NexusError};

/// Result type alias for memory manager operations.
pub type NexusResult<T> = std::result::Result<T, NexusError>;
