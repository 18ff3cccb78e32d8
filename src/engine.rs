//! The top-level shared value:
//! one [`Engine`] per server, owning the command tree and the pub/sub bus,
//! so tests can spin up as many isolated engines as they like instead of
//! reaching for process-wide state.

use crate::access::Access;
use crate::error::Result;
use crate::node::{Node, NodeArena, NodeId, NodeKind};
use crate::pubsub::Bus;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Tracks which session (if any) currently holds exclusive access, and at
/// what level.
#[derive(Default)]
struct ExclusiveSlot {
    holder: Option<(u64, Access)>,
}

/// The engine: the command tree, the pub/sub bus, and the exclusive-access
/// slot. Cheap to clone (an `Arc` internally); pass `Arc<Engine>` around
/// rather than `Engine` itself.
pub struct Engine {
    arena: RwLock<NodeArena>,
    bus: Bus,
    exclusive: Mutex<ExclusiveSlot>,
    next_session_id: AtomicU64,
    /// The process-global variable scope, the last of the three scopes a
    /// variable lookup searches.
    globals: Mutex<indexmap::IndexMap<String, String>>,
}

impl Engine {
    pub fn new() -> Arc<Engine> {
        Arc::new(Engine {
            arena: RwLock::new(NodeArena::new()),
            bus: Bus::new(),
            exclusive: Mutex::new(ExclusiveSlot::default()),
            next_session_id: AtomicU64::new(1),
            globals: Mutex::new(indexmap::IndexMap::new()),
        })
    }

    pub fn get_global(&self, name: &str) -> Option<String> {
        self.globals.lock().get(name).cloned()
    }

    pub fn set_global(&self, name: &str, value: String) {
        self.globals.lock().insert(name.to_string(), value);
    }

    pub fn has_global(&self, name: &str) -> bool {
        self.globals.lock().contains_key(name)
    }

    pub fn remove_global(&self, name: &str) {
        self.globals.lock().shift_remove(name);
    }

    /// A bare engine with no built-in commands mounted, for unit tests that
    /// only need a `NodeId`/`Context` to exist.
    #[cfg(test)]
    pub fn new_for_test() -> Arc<Engine> {
        Engine::new()
    }

    pub fn arena(&self) -> parking_lot::RwLockReadGuard<'_, NodeArena> {
        self.arena.read()
    }

    pub fn arena_mut(&self) -> parking_lot::RwLockWriteGuard<'_, NodeArena> {
        self.arena.write()
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Resolves `path` relative to `scope`, returning the node id and the
    /// accumulated `defaults` map. Takes the write lock rather than the
    /// read lock because resolution may lazily instantiate a class-map
    /// child along the way.
    pub fn locate(&self, scope: NodeId, path: &str) -> Result<(NodeId, indexmap::IndexMap<String, String>)> {
        self.arena.write().locate(scope, path)
    }

    /// Registers `factory` as the lazy class for `full_name` under
    /// `parent`; see [`NodeArena::register_class`].
    pub fn register_class(&self, parent: NodeId, full_name: &str, factory: crate::node::NodeFactory) -> Result<()> {
        self.arena.write().register_class(parent, full_name, factory)
    }

    /// Mounts `node` as a named child of `parent`.
    pub fn mount(&self, parent: NodeId, full_name: &str, node: Node, replace_existing: bool) -> Result<NodeId> {
        self.arena.write().insert_child(parent, full_name, node, replace_existing)
    }

    pub fn root(&self) -> NodeId {
        self.arena.read().root()
    }

    /// Attempts to acquire exclusive access for `session_id` at `level`.
    /// Fails if another session already holds exclusive access at or above
    /// `level`.
    pub fn acquire_exclusive(&self, session_id: u64, level: Access) -> Result<()> {
        let mut slot = self.exclusive.lock();
        if let Some((holder_id, holder_level)) = slot.holder {
            if holder_id != session_id && holder_level >= level {
                return Err(crate::error::Error::ExclusiveAccessHeld { held_level: holder_level });
            }
        }
        slot.holder = Some((session_id, level));
        Ok(())
    }

    /// Releases exclusive access if `session_id` currently holds it;
    /// otherwise a no-op.
    pub fn release_exclusive(&self, session_id: u64) {
        let mut slot = self.exclusive.lock();
        if matches!(slot.holder, Some((id, _)) if id == session_id) {
            slot.holder = None;
        }
    }

    pub fn exclusive_holder(&self) -> Option<(u64, Access)> {
        self.exclusive.lock().holder
    }

    /// Whether `branch.kind` is a leaf (a thin wrapper over
    /// `NodeArena::get` used by dispatch code that only cares about the
    /// kind, not the full node).
    pub fn is_leaf(&self, id: NodeId) -> bool {
        matches!(self.arena.read().get(id).kind, NodeKind::Leaf(_))
    }

    /// Reads a branch-scoped variable.
    /// `branch` must be a `Branch` node; non-branch nodes (or a missing
    /// key) resolve to `None`.
    pub fn branch_data_get(&self, branch: NodeId, name: &str) -> Option<String> {
        self.arena.read().get(branch).kind.as_branch().and_then(|b| b.data.get(name).cloned())
    }

    pub fn branch_data_set(&self, branch: NodeId, name: &str, value: String) {
        if let Some(b) = self.arena.write().get_mut(branch).kind.as_branch_mut() {
            b.data.insert(name.to_string(), value);
        }
    }

    pub fn branch_data_has(&self, branch: NodeId, name: &str) -> bool {
        self.arena.read().get(branch).kind.as_branch().map_or(false, |b| b.data.contains_key(name))
    }

    pub fn branch_data_remove(&self, branch: NodeId, name: &str) {
        if let Some(b) = self.arena.write().get_mut(branch).kind.as_branch_mut() {
            b.data.shift_remove(name);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::leaf::{Leaf, LeafCapabilities};
    use indexmap::IndexMap;

    fn leaf_node() -> Node {
        Node {
            full_name: String::new(),
            parent: None,
            defaults: IndexMap::new(),
            hidden: false,
            access: Access::Guest,
            modify_access: Access::Administrator,
            kind: NodeKind::Leaf(Leaf::stub(LeafCapabilities::default())),
        }
    }

    #[test]
    fn exclusive_access_blocks_lower_priority_session() {
        let engine = Engine::new();
        engine.acquire_exclusive(1, Access::Controller).unwrap();
        let err = engine.acquire_exclusive(2, Access::Controller).unwrap_err();
        assert!(matches!(err, crate::error::Error::ExclusiveAccessHeld { .. }));
        engine.release_exclusive(1);
        engine.acquire_exclusive(2, Access::Controller).unwrap();
    }

    #[test]
    fn mount_and_locate_round_trip() {
        let engine = Engine::new();
        let root = engine.root();
        let id = engine.mount(root, "POWer", leaf_node(), false).unwrap();
        let (located, _) = engine.locate(root, "POWer").unwrap();
        assert_eq!(id, located);
    }
}
