//! Standard memory contexts.
//!
//! The [`MemoryManager`] builds the well-known context hierarchy at start-up
//! and tracks which context is current:
//!
//! ```text
//! TopMemoryContext
//! ├── ErrorContext
//! ├── PostmasterContext
//! ├── CacheMemoryContext
//! ├── QueryContext
//! ├── TopTransactionContext
//! │   └── TransactionCommandContext
//! └── DynHashContext
//! ```
//!
//! Query and transaction boundaries reset the matching subtree in one call.

use std::fmt;
use std::sync::Arc;

use nexus_common::config::{AllocSetConfig, MemoryConfig};
use nexus_common::{ContextId, NexusError, NexusResult};
use tracing::{debug, warn};

use crate::backing::{BackingAllocator, SystemAllocator};
use crate::chunk::ChunkPtr;
use crate::context::MemoryContextStats;
use crate::diag::{DiagnosticSink, Severity, TracingSink};
use crate::tree::MemoryContextTree;

/// The well-known contexts created by [`MemoryManager::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StandardContext {
    /// Root of the hierarchy; lives as long as the manager.
    TopMemory,
    /// Reserved for building error reports after exhaustion.
    Error,
    /// Start-up and configuration data.
    Postmaster,
    /// Catalog and relation caches.
    CacheMemory,
    /// Reset at the end of every query.
    Query,
    /// Reset at the end of every transaction.
    TopTransaction,
    /// Per-command data inside a transaction.
    TransactionCommand,
    /// Storage of dynamic hash tables.
    DynHash,
}

impl StandardContext {
    /// Every standard context, parents before children.
    pub const ALL: [StandardContext; 8] = [
        Self::TopMemory,
        Self::Error,
        Self::Postmaster,
        Self::CacheMemory,
        Self::Query,
        Self::TopTransaction,
        Self::TransactionCommand,
        Self::DynHash,
    ];

    /// Returns the context name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::TopMemory => "TopMemoryContext",
            Self::Error => "ErrorContext",
            Self::Postmaster => "PostmasterContext",
            Self::CacheMemory => "CacheMemoryContext",
            Self::Query => "QueryContext",
            Self::TopTransaction => "TopTransactionContext",
            Self::TransactionCommand => "TransactionCommandContext",
            Self::DynHash => "DynHashContext",
        }
    }

    /// Returns the standard parent, `None` for the root.
    #[must_use]
    pub const fn parent(&self) -> Option<StandardContext> {
        match self {
            Self::TopMemory => None,
            Self::TransactionCommand => Some(Self::TopTransaction),
            _ => Some(Self::TopMemory),
        }
    }

    const fn index(self) -> usize {
        self as usize
    }

    fn config(self, config: &MemoryConfig) -> AllocSetConfig {
        match self {
            Self::Error => config.error_context,
            Self::TopMemory | Self::DynHash => config.small_context,
            _ => config.default_context,
        }
    }
}

impl fmt::Display for StandardContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Owner of the standard context hierarchy and the current context.
///
/// # Example
///
/// ```rust
/// use nexus_common::config::MemoryConfig;
/// use nexus_mmgr::{MemoryManager, StandardContext};
///
/// let mut mm = MemoryManager::new(MemoryConfig::default()).unwrap();
/// let query = mm.context(StandardContext::Query);
/// mm.switch_to(query).unwrap();
///
/// let ptr = mm.alloc(64).unwrap();
/// mm.data_mut(ptr).unwrap()[0] = 42;
///
/// mm.end_query().unwrap();
/// ```
pub struct MemoryManager {
    config: MemoryConfig,
    tree: MemoryContextTree,
    standard: [ContextId; StandardContext::ALL.len()],
    current: ContextId,
}

impl MemoryManager {
    /// Builds the standard hierarchy over the system allocator, bounded by
    /// `memory_limit` if set, logging through `tracing`.
    pub fn new(config: MemoryConfig) -> NexusResult<Self> {
        let backing = SystemAllocator::shared(config.memory_limit);
        Self::with_parts(config, backing, Arc::new(TracingSink))
    }

    /// Builds the standard hierarchy with explicit collaborators.
    pub fn with_parts(
        config: MemoryConfig,
        backing: Arc<dyn BackingAllocator>,
        sink: Arc<dyn DiagnosticSink>,
    ) -> NexusResult<Self> {
        config.validate()?;

        let top = StandardContext::TopMemory;
        let mut tree =
            MemoryContextTree::with_parts(top.name(), &top.config(&config), backing, sink)?;

        let mut standard = [tree.root(); StandardContext::ALL.len()];
        for kind in StandardContext::ALL.into_iter().skip(1) {
            let parent = kind.parent().map_or(tree.root(), |p| standard[p.index()]);
            standard[kind.index()] = tree.create(parent, kind.name(), &kind.config(&config))?;
        }

        debug!("Initialized {} standard memory contexts", standard.len());

        Ok(Self {
            config,
            current: standard[top.index()],
            tree,
            standard,
        })
    }

    /// Returns the configuration the manager was built with.
    #[must_use]
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Returns the id of a standard context.
    #[inline]
    #[must_use]
    pub fn context(&self, kind: StandardContext) -> ContextId {
        self.standard[kind.index()]
    }

    /// Returns the current context.
    #[inline]
    #[must_use]
    pub fn current(&self) -> ContextId {
        self.current
    }

    /// Makes `id` current and returns the previously current context.
    pub fn switch_to(&mut self, id: ContextId) -> NexusResult<ContextId> {
        if !self.tree.contains(id) {
            return Err(NexusError::ContextNotFound { id });
        }
        Ok(std::mem::replace(&mut self.current, id))
    }

    /// Allocates `size` zeroed bytes in the current context.
    pub fn alloc(&mut self, size: usize) -> NexusResult<ChunkPtr> {
        self.tree.alloc(self.current, size)
    }

    /// Resizes a chunk of the current context.
    pub fn realloc(&mut self, ptr: ChunkPtr, new_size: usize) -> NexusResult<ChunkPtr> {
        self.tree.realloc(self.current, ptr, new_size)
    }

    /// Frees a chunk of the current context.
    pub fn free(&mut self, ptr: ChunkPtr) -> NexusResult<()> {
        self.tree.free(self.current, ptr)
    }

    /// Returns the bytes of a chunk of the current context.
    pub fn data(&self, ptr: ChunkPtr) -> NexusResult<&[u8]> {
        self.tree.data(self.current, ptr)
    }

    /// Returns the bytes of a chunk of the current context, mutably.
    pub fn data_mut(&mut self, ptr: ChunkPtr) -> NexusResult<&mut [u8]> {
        self.tree.data_mut(self.current, ptr)
    }

    /// Creates a general purpose arena under `parent`.
    pub fn create_context(
        &mut self,
        parent: ContextId,
        name: impl Into<String>,
    ) -> NexusResult<ContextId> {
        let config = self.config.default_context;
        self.tree.create(parent, name, &config)
    }

    /// Destroys a context created with [`MemoryManager::create_context`]
    /// together with its descendants. If the current context is among them,
    /// the parent of `id` becomes current.
    pub fn delete_context(&mut self, id: ContextId) -> NexusResult<()> {
        if self.standard.contains(&id) {
            return Err(NexusError::invalid_argument(format!(
                "standard memory context \"{}\" cannot be deleted",
                self.tree.name(id)?
            )));
        }

        let parent = self.tree.parent(id)?;
        if self.tree.is_in_subtree(id, self.current) {
            self.current = parent.unwrap_or(self.context(StandardContext::TopMemory));
        }
        self.tree.destroy_subtree(id)
    }

    /// Reclaims everything allocated during the current query.
    ///
    /// Returns the number of problems the pre-reset check reported, which
    /// is always zero unless `check_on_reset` is enabled.
    pub fn end_query(&mut self) -> NexusResult<usize> {
        self.end_scope(StandardContext::Query)
    }

    /// Reclaims everything allocated during the current transaction,
    /// including per-command data.
    pub fn end_transaction(&mut self) -> NexusResult<usize> {
        self.end_scope(StandardContext::TopTransaction)
    }

    fn end_scope(&mut self, kind: StandardContext) -> NexusResult<usize> {
        let id = self.context(kind);

        let problems = if self.config.check_on_reset {
            self.tree.check_subtree(id)?
        } else {
            0
        };
        if problems > 0 {
            warn!("{} problems found in {} before reset", problems, kind);
        }

        self.tree.reset_subtree(id)?;
        Ok(problems)
    }

    /// Checks every context and returns the total number of notices.
    pub fn check_all(&self) -> NexusResult<usize> {
        self.tree.check_subtree(self.tree.root())
    }

    /// Emits statistics for every context followed by a grand total, and
    /// returns the per-context figures with their depth.
    pub fn stats_all(&self) -> NexusResult<Vec<(usize, MemoryContextStats)>> {
        let all = self.tree.stats_subtree(self.tree.root())?;

        let mut total = MemoryContextStats::named("Grand total");
        for (_, stats) in &all {
            total += stats;
        }
        self.tree.sink().emit(Severity::Log, &total.to_string());

        Ok(all)
    }

    /// Returns the context tree.
    #[must_use]
    pub fn tree(&self) -> &MemoryContextTree {
        &self.tree
    }

    /// Returns the context tree, mutably.
    #[must_use]
    pub fn tree_mut(&mut self) -> &mut MemoryContextTree {
        &mut self.tree
    }
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("current", &self.current)
            .field("contexts", &self.tree.len())
            .field("memory_limit", &self.config.memory_limit)
            .finish()
    }
}
