//! Memory manager error types.
//!
//! Provides the error types for all context and arena operations.

use std::fmt;
use thiserror::Error;

use crate::types::ContextId;

/// Error codes for categorizing errors.
///
/// These codes can be used for programmatic error handling and
/// are stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // General errors (0x0000 - 0x00FF)
    /// Unknown or unspecified error.
    Unknown = 0x0000,
    /// Internal error (bug).
    Internal = 0x0001,
    /// Operation not supported.
    NotSupported = 0x0002,
    /// Invalid argument provided.
    InvalidArgument = 0x0003,
    /// Invalid configuration.
    InvalidConfig = 0x0004,

    // I/O errors (0x0100 - 0x01FF)
    /// General I/O error.
    Io = 0x0100,

    // Memory errors (0x0700 - 0x07FF)
    /// The backing allocator could not supply memory.
    OutOfMemory = 0x0700,
    /// A chunk was handed to a context that does not own it.
    ChunkNotOwned = 0x0701,
    /// A chunk was freed twice.
    DoubleFree = 0x0702,
    /// Chunk or block metadata was overwritten.
    MemoryCorruption = 0x0703,
    /// Context not found in its tree.
    ContextNotFound = 0x0704,
    /// Context was destroyed and can no longer be used.
    ContextDestroyed = 0x0705,
}

impl ErrorCode {
    /// Returns the numeric code.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns the error category name.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match (*self as u16) >> 8 {
            0x00 => "General",
            0x01 => "I/O",
            0x07 => "Memory",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The main error type for the memory manager.
///
/// Exhaustion is the only failure a well-behaved caller can see; the
/// remaining memory variants report misuse (foreign pointers, double frees)
/// or detected corruption.
///
/// # Example
///
/// ```rust
/// use nexus_common::error::{NexusError, NexusResult};
///
/// fn reserve(requested: usize) -> NexusResult<()> {
///     Err(NexusError::OutOfMemory {
///         requested,
///         context: "QueryContext".to_string(),
///     })
/// }
///
/// assert!(reserve(64).unwrap_err().is_fatal());
/// ```
#[derive(Debug, Error)]
pub enum NexusError {
    // ==========================================================================
    // General Errors
    // ==========================================================================
    /// Internal error - this indicates a bug.
    #[error("internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },

    /// Operation not supported.
    #[error("operation not supported: {operation}")]
    NotSupported {
        /// The unsupported operation.
        operation: String,
    },

    /// Invalid argument provided.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Error message.
        message: String,
    },

    // ==========================================================================
    // I/O Errors
    // ==========================================================================
    /// I/O error from the underlying system.
    #[error("I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    // ==========================================================================
    // Memory Errors
    // ==========================================================================
    /// The backing allocator could not supply the requested bytes.
    #[error("out of memory: failed on request of size {requested} in memory context \"{context}\"")]
    OutOfMemory {
        /// Number of bytes requested by the caller.
        requested: usize,
        /// Name of the context that was asked.
        context: String,
    },

    /// The handle does not refer to a live chunk of the context: it came
    /// from another context, or it predates a reset or free.
    #[error("chunk is not owned by memory context \"{context}\"")]
    ChunkNotOwned {
        /// Name of the context that was asked.
        context: String,
    },

    /// The chunk is already on a freelist.
    #[error("chunk freed twice in memory context \"{context}\"")]
    DoubleFree {
        /// Name of the context that was asked.
        context: String,
    },

    /// Chunk or block metadata has been overwritten.
    #[error("memory corruption in memory context \"{context}\": {message}")]
    MemoryCorruption {
        /// Name of the context that detected the corruption.
        context: String,
        /// Description of the corruption.
        message: String,
    },

    /// No context with this id exists in the tree.
    #[error("memory context {id} not found")]
    ContextNotFound {
        /// The missing context.
        id: ContextId,
    },

    /// The context has been destroyed.
    #[error("memory context \"{context}\" has been destroyed")]
    ContextDestroyed {
        /// Name of the destroyed context.
        context: String,
    },

    // ==========================================================================
    // Configuration Errors
    // ==========================================================================
    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Error message.
        message: String,
    },
}

impl NexusError {
    /// Returns the error code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Internal { .. } => ErrorCode::Internal,
            Self::NotSupported { .. } => ErrorCode::NotSupported,
            Self::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Self::Io { .. } => ErrorCode::Io,
            Self::OutOfMemory { .. } => ErrorCode::OutOfMemory,
            Self::ChunkNotOwned { .. } => ErrorCode::ChunkNotOwned,
            Self::DoubleFree { .. } => ErrorCode::DoubleFree,
            Self::MemoryCorruption { .. } => ErrorCode::MemoryCorruption,
            Self::ContextNotFound { .. } => ErrorCode::ContextNotFound,
            Self::ContextDestroyed { .. } => ErrorCode::ContextDestroyed,
            Self::InvalidConfig { .. } => ErrorCode::InvalidConfig,
        }
    }

    /// Returns true if the current scope cannot continue after this error.
    ///
    /// Exhaustion and corruption both leave the caller without usable
    /// memory; everything else is a programming error the caller can report.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::OutOfMemory { .. } | Self::MemoryCorruption { .. }
        )
    }

    /// Returns true if this error was caused by handing a chunk to the wrong
    /// context or reusing it after free.
    #[must_use]
    pub const fn is_misuse(&self) -> bool {
        matches!(
            self,
            Self::ChunkNotOwned { .. }
                | Self::DoubleFree { .. }
                | Self::ContextNotFound { .. }
                | Self::ContextDestroyed { .. }
        )
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates an out of memory error.
    #[must_use]
    pub fn out_of_memory(requested: usize, context: impl Into<String>) -> Self {
        Self::OutOfMemory {
            requested,
            context: context.into(),
        }
    }

    /// Creates a memory corruption error.
    #[must_use]
    pub fn corruption(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MemoryCorruption {
            context: context.into(),
            message: message.into(),
        }
    }
}
