//! Memory manager configuration structures.
//!
//! These structures define the growth parameters of every arena and the
//! settings of the standard context hierarchy.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::constants::{
    ALLOCSET_DEFAULT_INITSIZE, ALLOCSET_DEFAULT_MAXSIZE, ALLOCSET_DEFAULT_MINSIZE,
    ALLOCSET_SMALL_INITSIZE, ALLOCSET_SMALL_MAXSIZE, ALLOCSET_SMALL_MINSIZE, ALLOC_MIN_BLOCK_SIZE,
};
use crate::error::{NexusError, NexusResult};

/// Growth parameters of a single arena.
///
/// # Example
///
/// ```rust
/// use nexus_common::config::AllocSetConfig;
///
/// let config = AllocSetConfig::default();
/// assert_eq!(config.init_block_size, 8192);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocSetConfig {
    /// Size of the keeper block allocated at construction.
    /// No keeper is created when this is too small to hold one chunk.
    /// Default: 8192 (8 KB)
    #[serde(default = "default_min_context_size")]
    pub min_context_size: usize,

    /// Size of the first regular block.
    /// Default: 8192 (8 KB)
    #[serde(default = "default_init_block_size")]
    pub init_block_size: usize,

    /// Cap for the doubling block size.
    /// Default: 8388608 (8 MB)
    #[serde(default = "default_max_block_size")]
    pub max_block_size: usize,
}

fn default_min_context_size() -> usize {
    ALLOCSET_DEFAULT_MINSIZE
}

fn default_init_block_size() -> usize {
    ALLOCSET_DEFAULT_INITSIZE
}

fn default_max_block_size() -> usize {
    ALLOCSET_DEFAULT_MAXSIZE
}

impl Default for AllocSetConfig {
    fn default() -> Self {
        Self {
            min_context_size: default_min_context_size(),
            init_block_size: default_init_block_size(),
            max_block_size: default_max_block_size(),
        }
    }
}

impl AllocSetConfig {
    /// Creates a configuration from explicit sizes.
    #[must_use]
    pub const fn new(min_context_size: usize, init_block_size: usize, max_block_size: usize) -> Self {
        Self {
            min_context_size,
            init_block_size,
            max_block_size,
        }
    }

    /// Parameters for contexts that are expected to stay small.
    #[must_use]
    pub const fn small() -> Self {
        Self::new(
            ALLOCSET_SMALL_MINSIZE,
            ALLOCSET_SMALL_INITSIZE,
            ALLOCSET_SMALL_MAXSIZE,
        )
    }

    /// Parameters for the error context: a keeper block that survives resets
    /// so that error reporting still has memory after exhaustion.
    #[must_use]
    pub const fn error_reserve() -> Self {
        Self::new(8 * 1024, 8 * 1024, 8 * 1024)
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> NexusResult<()> {
        if self.init_block_size == 0 {
            return Err(NexusError::invalid_config(
                "init_block_size must be greater than 0",
            ));
        }

        if self.max_block_size < self.init_block_size {
            return Err(NexusError::invalid_config(format!(
                "max_block_size ({}) must be at least init_block_size ({})",
                self.max_block_size, self.init_block_size
            )));
        }

        Ok(())
    }
}

/// Configuration of the standard memory context hierarchy.
///
/// # Example
///
/// ```rust
/// use nexus_common::config::MemoryConfig;
///
/// let config = MemoryConfig::builder()
///     .memory_limit(64 * 1024 * 1024)
///     .check_on_reset(true)
///     .build();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Upper bound on bytes obtained from the system, if any.
    #[serde(default)]
    pub memory_limit: Option<usize>,

    /// Run a consistency check over a subtree before every end-of-scope reset.
    #[serde(default)]
    pub check_on_reset: bool,

    /// Parameters for general purpose contexts.
    #[serde(default)]
    pub default_context: AllocSetConfig,

    /// Parameters for contexts that are expected to stay small.
    #[serde(default = "AllocSetConfig::small")]
    pub small_context: AllocSetConfig,

    /// Parameters for the error context.
    #[serde(default = "AllocSetConfig::error_reserve")]
    pub error_context: AllocSetConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            memory_limit: None,
            check_on_reset: false,
            default_context: AllocSetConfig::default(),
            small_context: AllocSetConfig::small(),
            error_context: AllocSetConfig::error_reserve(),
        }
    }
}

impl MemoryConfig {
    /// Creates a new default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configuration for testing: small blocks, checks enabled.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            default_context: AllocSetConfig::new(0, 1024, 64 * 1024),
            check_on_reset: true,
            ..Default::default()
        }
    }

    /// Creates a builder for configuration.
    #[must_use]
    pub fn builder() -> MemoryConfigBuilder {
        MemoryConfigBuilder::new()
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> NexusResult<()> {
        self.default_context.validate()?;
        self.small_context.validate()?;
        self.error_context.validate()?;

        if let Some(limit) = self.memory_limit {
            if limit < ALLOC_MIN_BLOCK_SIZE {
                return Err(NexusError::invalid_config(format!(
                    "memory_limit must be at least {} bytes",
                    ALLOC_MIN_BLOCK_SIZE
                )));
            }
        }

        Ok(())
    }

    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> NexusResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> NexusResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| NexusError::invalid_config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Saves configuration to a file.
    pub fn save(&self, path: &Path) -> NexusResult<()> {
        let content = self.to_toml()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Converts configuration to TOML string.
    pub fn to_toml(&self) -> NexusResult<String> {
        toml::to_string_pretty(self).map_err(|e| NexusError::invalid_config(e.to_string()))
    }
}

/// Builder for memory configuration.
#[derive(Default)]
pub struct MemoryConfigBuilder {
    config: MemoryConfig,
}

impl MemoryConfigBuilder {
    /// Creates a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the parameters for general purpose contexts.
    #[must_use]
    pub fn default_context(mut self, config: AllocSetConfig) -> Self {
        self.config.default_context = config;
        self
    }

    /// Sets the parameters for small contexts.
    #[must_use]
    pub fn small_context(mut self, config: AllocSetConfig) -> Self {
        self.config.small_context = config;
        self
    }

    /// Sets the parameters for the error context.
    #[must_use]
    pub fn error_context(mut self, config: AllocSetConfig) -> Self {
        self.config.error_context = config;
        self
    }

    /// Caps the bytes obtained from the system.
    #[must_use]
    pub fn memory_limit(mut self, bytes: usize) -> Self {
        self.config.memory_limit = Some(bytes);
        self
    }

    /// Enables consistency checks before end-of-scope resets.
    #[must_use]
    pub fn check_on_reset(mut self, enabled: bool) -> Self {
        self.config.check_on_reset = enabled;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> MemoryConfig {
        self.config
    }
}
