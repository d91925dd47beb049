//! # nexus-common
//!
//! Common types, errors, and configuration for the NexusDB memory manager.
//!
//! This crate provides the foundational definitions shared by the memory
//! manager crates. It includes:
//!
//! - **Types**: Identifiers such as `ContextId`
//! - **Errors**: Unified error handling with `NexusError`
//! - **Config**: Arena and context hierarchy configuration
//! - **Constants**: Size classes, alignment and debugging byte patterns
//!
//! ## Example
//!
//! ```rust
//! use nexus_common::config::AllocSetConfig;
//! use nexus_common::error::NexusResult;
//! use nexus_common::ALLOC_CHUNK_LIMIT;
//!
//! fn example() -> NexusResult<()> {
//!     let config = AllocSetConfig::small();
//!     config.validate()?;
//!     assert_eq!(ALLOC_CHUNK_LIMIT, 8192);
//!     Ok(())
//! }
//! # example().unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod constants;
pub mod error;
pub mod types;

// Re-export commonly used items at the crate root
pub use constants::*;
pub use error::{ErrorCode, NexusError, NexusResult};
pub use types::ContextId;
