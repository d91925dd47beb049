//! Type definitions shared by the memory manager crates.

mod ids;

pub use ids::ContextId;
