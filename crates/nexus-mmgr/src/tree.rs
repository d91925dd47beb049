//! The memory context hierarchy.
//!
//! Contexts form a tree rooted at a single context. Every node is stored in
//! an owning table keyed by [`ContextId`]; a node records its parent and the
//! ordered list of its children, newest first. Resetting or destroying a
//! subtree processes each child's subtree completely, in list order, before
//! the node itself, so descendants are always cleaned up before their
//! ancestors observe the result.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use nexus_common::config::AllocSetConfig;
use nexus_common::{ContextId, NexusError, NexusResult};
use tracing::debug;

use crate::aset::AllocSet;
use crate::backing::{system_backing, BackingAllocator};
use crate::chunk::ChunkPtr;
use crate::context::{ContextKind, MemoryContext, MemoryContextStats};
use crate::diag::{DiagnosticSink, TracingSink};

struct ContextNode {
    parent: Option<ContextId>,
    children: VecDeque<ContextId>,
    context: Box<dyn MemoryContext>,
}

/// A tree of memory contexts.
///
/// # Example
///
/// ```rust
/// use nexus_common::config::AllocSetConfig;
/// use nexus_mmgr::MemoryContextTree;
///
/// let mut tree = MemoryContextTree::new("TopMemoryContext", &AllocSetConfig::small()).unwrap();
/// let root = tree.root();
/// let query = tree.create(root, "QueryContext", &AllocSetConfig::default()).unwrap();
///
/// let ptr = tree.alloc(query, 128).unwrap();
/// tree.data_mut(query, ptr).unwrap()[0] = 1;
///
/// tree.reset_subtree(query).unwrap();
/// assert_eq!(tree.children(root).unwrap(), vec![query]);
/// ```
pub struct MemoryContextTree {
    nodes: HashMap<ContextId, ContextNode>,
    root: ContextId,
    next_id: ContextId,
    backing: Arc<dyn BackingAllocator>,
    sink: Arc<dyn DiagnosticSink>,
}

impl MemoryContextTree {
    /// Creates a tree whose root is an arena over the system allocator.
    pub fn new(root_name: impl Into<String>, config: &AllocSetConfig) -> NexusResult<Self> {
        Self::with_parts(root_name, config, system_backing(), Arc::new(TracingSink))
    }

    /// Creates a tree with explicit collaborators, shared by every arena it
    /// creates.
    pub fn with_parts(
        root_name: impl Into<String>,
        config: &AllocSetConfig,
        backing: Arc<dyn BackingAllocator>,
        sink: Arc<dyn DiagnosticSink>,
    ) -> NexusResult<Self> {
        let root = AllocSet::with_parts(root_name, config, backing.clone(), sink.clone())?;
        Ok(Self::with_root(Box::new(root), backing, sink))
    }

    /// Creates a tree around an existing root context.
    #[must_use]
    pub fn with_root(
        root: Box<dyn MemoryContext>,
        backing: Arc<dyn BackingAllocator>,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Self {
        let id = ContextId::FIRST;
        let mut nodes = HashMap::new();
        nodes.insert(
            id,
            ContextNode {
                parent: None,
                children: VecDeque::new(),
                context: root,
            },
        );

        Self {
            nodes,
            root: id,
            next_id: id.next(),
            backing,
            sink,
        }
    }

    /// Returns the root id. After the root was destroyed the id no longer
    /// resolves.
    #[inline]
    #[must_use]
    pub fn root(&self) -> ContextId {
        self.root
    }

    /// Creates an arena as the newest child of `parent`.
    pub fn create(
        &mut self,
        parent: ContextId,
        name: impl Into<String>,
        config: &AllocSetConfig,
    ) -> NexusResult<ContextId> {
        self.node(parent)?;
        let set = AllocSet::with_parts(name, config, self.backing.clone(), self.sink.clone())?;
        self.create_with(parent, Box::new(set))
    }

    /// Inserts any context implementation as the newest child of `parent`.
    pub fn create_with(
        &mut self,
        parent: ContextId,
        context: Box<dyn MemoryContext>,
    ) -> NexusResult<ContextId> {
        let id = self.next_id;
        self.node_mut(parent)?.children.push_front(id);
        self.next_id = id.next();

        debug!(
            "Created {} context \"{}\" as {} under {}",
            context.kind(),
            context.name(),
            id,
            parent
        );

        self.nodes.insert(
            id,
            ContextNode {
                parent: Some(parent),
                children: VecDeque::new(),
                context,
            },
        );
        Ok(id)
    }

    // =========================================================================
    // Per-context Dispatch
    // =========================================================================

    /// Returns the context behind `id`.
    pub fn context(&self, id: ContextId) -> NexusResult<&dyn MemoryContext> {
        Ok(&*self.node(id)?.context)
    }

    /// Returns the context behind `id`, mutably.
    pub fn context_mut(&mut self, id: ContextId) -> NexusResult<&mut dyn MemoryContext> {
        Ok(&mut *self.node_mut(id)?.context)
    }

    /// Allocates `size` zeroed bytes in `id`.
    pub fn alloc(&mut self, id: ContextId, size: usize) -> NexusResult<ChunkPtr> {
        self.context_mut(id)?.alloc(size)
    }

    /// Frees a chunk of `id`.
    pub fn free(&mut self, id: ContextId, ptr: ChunkPtr) -> NexusResult<()> {
        self.context_mut(id)?.free(ptr)
    }

    /// Resizes a chunk of `id`.
    pub fn realloc(&mut self, id: ContextId, ptr: ChunkPtr, new_size: usize) -> NexusResult<ChunkPtr> {
        self.context_mut(id)?.realloc(ptr, new_size)
    }

    /// Returns the bytes of a chunk of `id`.
    pub fn data(&self, id: ContextId, ptr: ChunkPtr) -> NexusResult<&[u8]> {
        self.context(id)?.data(ptr)
    }

    /// Returns the bytes of a chunk of `id`, mutably.
    pub fn data_mut(&mut self, id: ContextId, ptr: ChunkPtr) -> NexusResult<&mut [u8]> {
        self.context_mut(id)?.data_mut(ptr)
    }

    /// Resets `id` alone, leaving its descendants untouched.
    pub fn reset(&mut self, id: ContextId) -> NexusResult<()> {
        self.context_mut(id)?.reset();
        Ok(())
    }

    /// Checks `id` alone.
    pub fn check(&self, id: ContextId) -> NexusResult<usize> {
        Ok(self.context(id)?.check())
    }

    /// Reports statistics of `id` alone.
    pub fn stats(&self, id: ContextId) -> NexusResult<MemoryContextStats> {
        Ok(self.context(id)?.stats())
    }

    // =========================================================================
    // Subtree Operations
    // =========================================================================

    /// Resets every descendant of `id`, deepest first, then `id` itself.
    pub fn reset_subtree(&mut self, id: ContextId) -> NexusResult<()> {
        self.node(id)?;
        for current in self.post_order(id) {
            if let Some(node) = self.nodes.get_mut(&current) {
                node.context.reset();
            }
        }
        Ok(())
    }

    /// Destroys every descendant of `id`, deepest first, then `id` itself.
    /// None of the ids resolve afterwards. Destroying the root empties the
    /// tree.
    pub fn destroy_subtree(&mut self, id: ContextId) -> NexusResult<()> {
        let parent = self.node(id)?.parent;
        if let Some(parent) = parent {
            if let Some(node) = self.nodes.get_mut(&parent) {
                node.children.retain(|&c| c != id);
            }
        }

        let order = self.post_order(id);
        self.destroy_nodes(&order);
        Ok(())
    }

    /// Resets every descendant of `id`, but not `id` itself.
    pub fn reset_children(&mut self, id: ContextId) -> NexusResult<()> {
        for child in self.children(id)? {
            self.reset_subtree(child)?;
        }
        Ok(())
    }

    /// Destroys every descendant of `id`, but not `id` itself.
    pub fn destroy_children(&mut self, id: ContextId) -> NexusResult<()> {
        for child in self.children(id)? {
            self.destroy_subtree(child)?;
        }
        Ok(())
    }

    /// Moves `id` with its subtree under `new_parent`, as its newest child.
    pub fn set_parent(&mut self, id: ContextId, new_parent: ContextId) -> NexusResult<()> {
        let old_parent = self.node(id)?.parent.ok_or_else(|| {
            NexusError::invalid_argument("the root context cannot be re-parented")
        })?;
        self.node(new_parent)?;

        if self.is_in_subtree(id, new_parent) {
            return Err(NexusError::invalid_argument(format!(
                "cannot move context {id} under its own descendant {new_parent}"
            )));
        }
        if old_parent == new_parent {
            return Ok(());
        }

        self.node_mut(old_parent)?.children.retain(|&c| c != id);
        self.node_mut(new_parent)?.children.push_front(id);
        self.node_mut(id)?.parent = Some(new_parent);
        Ok(())
    }

    /// Checks every context of the subtree and returns the total number of
    /// notices.
    pub fn check_subtree(&self, id: ContextId) -> NexusResult<usize> {
        self.node(id)?;
        Ok(self
            .post_order(id)
            .into_iter()
            .filter_map(|c| self.nodes.get(&c))
            .map(|node| node.context.check())
            .sum())
    }

    /// Reports statistics of every context of the subtree, parents before
    /// children, with their depth below `id`.
    pub fn stats_subtree(&self, id: ContextId) -> NexusResult<Vec<(usize, MemoryContextStats)>> {
        self.node(id)?;

        let mut out = Vec::new();
        let mut stack = vec![(id, 0usize)];
        while let Some((current, depth)) = stack.pop() {
            let Some(node) = self.nodes.get(&current) else {
                continue;
            };
            out.push((depth, node.context.stats()));
            for &child in node.children.iter().rev() {
                stack.push((child, depth + 1));
            }
        }
        Ok(out)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Returns the parent of `id`, `None` for the root.
    pub fn parent(&self, id: ContextId) -> NexusResult<Option<ContextId>> {
        Ok(self.node(id)?.parent)
    }

    /// Returns the children of `id`, newest first.
    pub fn children(&self, id: ContextId) -> NexusResult<Vec<ContextId>> {
        Ok(self.node(id)?.children.iter().copied().collect())
    }

    /// Returns the name of `id`.
    pub fn name(&self, id: ContextId) -> NexusResult<&str> {
        Ok(self.node(id)?.context.name())
    }

    /// Returns the implementation kind of `id`.
    pub fn kind(&self, id: ContextId) -> NexusResult<ContextKind> {
        Ok(self.node(id)?.context.kind())
    }

    /// Returns true if `id` names a live context.
    #[must_use]
    pub fn contains(&self, id: ContextId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Number of live contexts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true once the root was destroyed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of ancestors of `id`.
    pub fn depth(&self, id: ContextId) -> NexusResult<usize> {
        let mut depth = 0;
        let mut current = self.node(id)?.parent;
        while let Some(parent) = current {
            depth += 1;
            current = self.node(parent)?.parent;
        }
        Ok(depth)
    }

    /// Returns true if `id` is `subtree_root` or one of its descendants.
    #[must_use]
    pub fn is_in_subtree(&self, subtree_root: ContextId, mut id: ContextId) -> bool {
        loop {
            if id == subtree_root {
                return true;
            }
            match self.nodes.get(&id).and_then(|node| node.parent) {
                Some(parent) => id = parent,
                None => return false,
            }
        }
    }

    /// Returns the backing allocator shared by the tree's arenas.
    #[must_use]
    pub fn backing(&self) -> &Arc<dyn BackingAllocator> {
        &self.backing
    }

    /// Returns the diagnostic sink shared by the tree's arenas.
    #[must_use]
    pub fn sink(&self) -> &Arc<dyn DiagnosticSink> {
        &self.sink
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn node(&self, id: ContextId) -> NexusResult<&ContextNode> {
        self.nodes.get(&id).ok_or(NexusError::ContextNotFound { id })
    }

    fn node_mut(&mut self, id: ContextId) -> NexusResult<&mut ContextNode> {
        self.nodes.get_mut(&id).ok_or(NexusError::ContextNotFound { id })
    }

    /// Subtree of `id`: each child's subtree in list order, then `id`.
    fn post_order(&self, id: ContextId) -> Vec<ContextId> {
        let mut order = Vec::new();
        let mut stack = vec![(id, false)];

        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                order.push(current);
                continue;
            }
            stack.push((current, true));
            if let Some(node) = self.nodes.get(&current) {
                for &child in node.children.iter().rev() {
                    stack.push((child, false));
                }
            }
        }

        order
    }

    fn destroy_nodes(&mut self, order: &[ContextId]) {
        for id in order {
            if let Some(mut node) = self.nodes.remove(id) {
                node.context.destroy();
                debug!("Destroyed context \"{}\" ({})", node.context.name(), id);
            }
        }
    }
}

impl Drop for MemoryContextTree {
    fn drop(&mut self) {
        if self.nodes.contains_key(&self.root) {
            let order = self.post_order(self.root);
            self.destroy_nodes(&order);
        }
    }
}

impl fmt::Debug for MemoryContextTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryContextTree")
            .field("root", &self.root)
            .field("contexts", &self.nodes.len())
            .field("next_id", &self.next_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::SystemAllocator;
    use crate::diag::CollectingSink;
    use parking_lot::Mutex;

    /// Arena wrapper that records resets and destroys.
    struct RecordingContext {
        inner: AllocSet,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingContext {
        fn boxed(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Box<dyn MemoryContext> {
            Box::new(Self {
                inner: AllocSet::new(name, &AllocSetConfig::small()).unwrap(),
                log: log.clone(),
            })
        }
    }

    impl MemoryContext for RecordingContext {
        fn kind(&self) -> ContextKind {
            ContextKind::Custom
        }

        fn name(&self) -> &str {
            self.inner.name()
        }

        fn alloc(&mut self, size: usize) -> NexusResult<ChunkPtr> {
            self.inner.alloc(size)
        }

        fn free(&mut self, ptr: ChunkPtr) -> NexusResult<()> {
            self.inner.free(ptr)
        }

        fn realloc(&mut self, ptr: ChunkPtr, new_size: usize) -> NexusResult<ChunkPtr> {
            self.inner.realloc(ptr, new_size)
        }

        fn data(&self, ptr: ChunkPtr) -> NexusResult<&[u8]> {
            self.inner.data(ptr)
        }

        fn data_mut(&mut self, ptr: ChunkPtr) -> NexusResult<&mut [u8]> {
            self.inner.data_mut(ptr)
        }

        fn reset(&mut self) {
            self.log.lock().push(format!("reset {}", self.inner.name()));
            self.inner.reset();
        }

        fn destroy(&mut self) {
            self.log.lock().push(format!("destroy {}", self.inner.name()));
            self.inner.destroy();
        }

        fn check(&self) -> usize {
            self.inner.check()
        }

        fn stats(&self) -> MemoryContextStats {
            self.inner.usage()
        }
    }

    /// root -> [A, B], A -> [A1]
    fn recording_tree() -> (MemoryContextTree, Arc<Mutex<Vec<String>>>, [ContextId; 4]) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut tree = MemoryContextTree::with_root(
            RecordingContext::boxed("root", &log),
            system_backing(),
            Arc::new(CollectingSink::new()),
        );
        let root = tree.root();
        // Newest first: create B before A
        let b = tree.create_with(root, RecordingContext::boxed("B", &log)).unwrap();
        let a = tree.create_with(root, RecordingContext::boxed("A", &log)).unwrap();
        let a1 = tree.create_with(a, RecordingContext::boxed("A1", &log)).unwrap();
        (tree, log, [root, a, b, a1])
    }

    #[test]
    fn test_structure() {
        let (tree, _, [root, a, b, a1]) = recording_tree();

        assert_eq!(tree.len(), 4);
        assert_eq!(tree.children(root).unwrap(), vec![a, b]);
        assert_eq!(tree.children(a).unwrap(), vec![a1]);
        assert_eq!(tree.parent(a1).unwrap(), Some(a));
        assert_eq!(tree.parent(root).unwrap(), None);
        assert_eq!(tree.depth(a1).unwrap(), 2);
        assert_eq!(tree.name(a1).unwrap(), "A1");
        assert_eq!(tree.kind(b).unwrap(), ContextKind::Custom);
    }

    #[test]
    fn test_reset_order() {
        let (mut tree, log, [root, ..]) = recording_tree();

        tree.reset_subtree(root).unwrap();
        assert_eq!(
            *log.lock(),
            vec!["reset A1", "reset A", "reset B", "reset root"]
        );
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn test_destroy_order() {
        let (mut tree, log, [root, a, b, a1]) = recording_tree();

        tree.destroy_subtree(a).unwrap();
        assert_eq!(*log.lock(), vec!["destroy A1", "destroy A"]);
        assert!(!tree.contains(a));
        assert!(!tree.contains(a1));
        assert_eq!(tree.children(root).unwrap(), vec![b]);

        let err = tree.alloc(a1, 10).unwrap_err();
        assert!(matches!(err, NexusError::ContextNotFound { .. }));

        log.lock().clear();
        tree.destroy_subtree(root).unwrap();
        assert_eq!(*log.lock(), vec!["destroy B", "destroy root"]);
        assert!(tree.is_empty());
    }

    #[test]
    fn test_reset_and_destroy_children() {
        let (mut tree, log, [root, a, b, a1]) = recording_tree();

        tree.reset_children(a).unwrap();
        assert_eq!(*log.lock(), vec!["reset A1"]);

        log.lock().clear();
        tree.destroy_children(root).unwrap();
        assert_eq!(*log.lock(), vec!["destroy A1", "destroy A", "destroy B"]);
        assert!(tree.contains(root));
        assert!(!tree.contains(a1));
        assert!(!tree.contains(b));
        assert!(tree.children(root).unwrap().is_empty());
    }

    #[test]
    fn test_drop_destroys_children_first() {
        let (tree, log, _) = recording_tree();
        drop(tree);
        assert_eq!(
            *log.lock(),
            vec!["destroy A1", "destroy A", "destroy B", "destroy root"]
        );
    }

    #[test]
    fn test_set_parent() {
        let (mut tree, _, [root, a, b, a1]) = recording_tree();

        tree.set_parent(a1, b).unwrap();
        assert_eq!(tree.parent(a1).unwrap(), Some(b));
        assert!(tree.children(a).unwrap().is_empty());
        assert_eq!(tree.children(b).unwrap(), vec![a1]);

        // Cycles and the root are rejected
        assert!(tree.set_parent(b, a1).is_err());
        assert!(tree.set_parent(b, b).is_err());
        assert!(tree.set_parent(root, a).is_err());
    }

    #[test]
    fn test_allocation_dispatch() {
        let backing = Arc::new(SystemAllocator::new());
        let mut tree = MemoryContextTree::with_parts(
            "root",
            &AllocSetConfig::small(),
            backing.clone(),
            Arc::new(CollectingSink::new()),
        )
        .unwrap();
        let root = tree.root();
        let child = tree.create(root, "child", &AllocSetConfig::small()).unwrap();
        assert_eq!(tree.kind(child).unwrap(), ContextKind::AllocSet);

        let p = tree.alloc(child, 100).unwrap();
        tree.data_mut(child, p).unwrap().fill(3);
        let p = tree.realloc(child, p, 300).unwrap();
        assert_eq!(tree.data(child, p).unwrap()[99], 3);

        // Chunks belong to exactly one context
        assert!(tree.free(root, p).is_err());
        tree.free(child, p).unwrap();
        assert_eq!(tree.check_subtree(root).unwrap(), 0);

        tree.destroy_subtree(child).unwrap();
        tree.reset(root).unwrap();
        assert_eq!(backing.bytes_allocated(), 0);
    }

    #[test]
    fn test_stats_subtree() {
        let (tree, _, [root, ..]) = recording_tree();

        let stats = tree.stats_subtree(root).unwrap();
        let names: Vec<(usize, &str)> = stats.iter().map(|(d, s)| (*d, s.name.as_str())).collect();
        assert_eq!(names, vec![(0, "root"), (1, "A"), (2, "A1"), (1, "B")]);

        assert!(tree.stats_subtree(ContextId::new(99)).is_err());
    }

    #[test]
    fn test_unknown_parent() {
        let (mut tree, _, _) = recording_tree();
        let err = tree
            .create(ContextId::new(99), "orphan", &AllocSetConfig::small())
            .unwrap_err();
        assert!(matches!(err, NexusError::ContextNotFound { .. }));
        assert_eq!(tree.len(), 4);
    }
}
