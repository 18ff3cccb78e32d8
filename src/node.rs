//! The command tree: an arena of [`Branch`]/[`Leaf`] nodes addressed by
//! stable [`NodeId`] indices rather than parent/child pointers, so a
//! branch's children can reference their parent without a cycle of
//! reference-counted handles.

use crate::access::Access;
use crate::error::{Error, Result};
use crate::leaf::Leaf;
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;

/// A stable index into a [`NodeArena`]. Cheap to copy, store, and compare;
/// never invalidated by later insertions (removal is logical, via
/// `NodeKind::Branch::instances`, not physical).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A thunk that lazily builds a branch's not-yet-instantiated child. Called
/// at most once per class, the first time `locate` resolves through one of
/// its aliases; the built node is then promoted into `Branch::instances`
/// and the factory is not consulted again for that alias.
pub type NodeFactory = Arc<dyn Fn() -> Node + Send + Sync>;

/// A branch's children, keyed case-insensitively by every alias that
/// resolves to them (full name, intermediate short form, and all-lowercase
/// strip all map to the same node).
#[derive(Default)]
pub struct Branch {
    pub(crate) instances: IndexMap<String, NodeId>,
    /// Lazy child classes: registered up front under the same three alias
    /// keys as `instances`, but not built until first resolved.
    pub(crate) classes: IndexMap<String, NodeFactory>,
    /// Per-branch scoped variables, resolved between session-local and
    /// process-global scopes.
    pub data: IndexMap<String, String>,
}

impl fmt::Debug for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Branch")
            .field("instances", &self.instances)
            .field("classes", &self.classes.keys().collect::<Vec<_>>())
            .field("data", &self.data)
            .finish()
    }
}

/// Either kind of node payload a [`Node`] can carry.
pub enum NodeKind {
    Branch(Branch),
    Leaf(Leaf),
}

impl NodeKind {
    pub fn as_branch(&self) -> Option<&Branch> {
        match self {
            NodeKind::Branch(b) => Some(b),
            NodeKind::Leaf(_) => None,
        }
    }

    pub fn as_branch_mut(&mut self) -> Option<&mut Branch> {
        match self {
            NodeKind::Branch(b) => Some(b),
            NodeKind::Leaf(_) => None,
        }
    }

    pub fn as_leaf(&self) -> Option<&Leaf> {
        match self {
            NodeKind::Leaf(l) => Some(l),
            NodeKind::Branch(_) => None,
        }
    }

    pub fn as_leaf_mut(&mut self) -> Option<&mut Leaf> {
        match self {
            NodeKind::Leaf(l) => Some(l),
            NodeKind::Branch(_) => None,
        }
    }
}

/// One tree node: the fields common to branches and leaves, plus its
/// [`NodeKind`] payload.
pub struct Node {
    pub full_name: String,
    pub parent: Option<NodeId>,
    pub defaults: IndexMap<String, String>,
    pub hidden: bool,
    pub access: Access,
    /// Minimum access required to redefine or remove a *dynamic* child of
    /// this node (macros, runtime-added branches).
    pub modify_access: Access,
    pub kind: NodeKind,
}

impl Node {
    pub fn is_branch(&self) -> bool {
        matches!(self.kind, NodeKind::Branch(_))
    }
}

/// Derives the two auto-aliases from a class-style identifier: the
/// intermediate form keeps every upper-case letter and strips vowels
/// (`aeiouAEIOU`) from the lower-case runs; the short form keeps only the
/// upper-case letters. Non-alphabetic characters pass through both
/// unchanged.
pub fn derive_aliases(full_name: &str) -> (String, String) {
    let mut intermediate = String::with_capacity(full_name.len());
    let mut short = String::with_capacity(full_name.len());
    for c in full_name.chars() {
        if c.is_uppercase() {
            intermediate.push(c);
            short.push(c);
        } else if c.is_lowercase() {
            if !"aeiou".contains(c) {
                intermediate.push(c);
            }
        } else {
            intermediate.push(c);
            short.push(c);
        }
    }
    (intermediate, short)
}

/// Maps a trailing "class" token to its SCPI suffix symbol and back.
/// `Common` maps to a leading `*` instead of a trailing symbol.
pub const SUFFIX_TRANSLATIONS: &[(&str, char)] = &[
    ("Set", '='),
    ("Add", '+'),
    ("Remove", '-'),
    ("Clear", '~'),
    ("Query", '?'),
    ("Count", '#'),
    ("Enumerate", '*'),
    ("List", '@'),
    ("Exists", '!'),
    ("Load", '<'),
    ("Save", '>'),
];

/// Translates a trailing `Common`-class-style token (e.g. `"MacroSet"`) into
/// its wire spelling (`"Macro="`), or a leading `Common` token into `*name`.
/// Returns the input unchanged if no known suffix/prefix token matches.
pub fn translate_class_name(identifier: &str) -> String {
    if let Some(rest) = identifier.strip_prefix("Common") {
        return format!("*{}", rest);
    }
    for (token, symbol) in SUFFIX_TRANSLATIONS {
        if let Some(rest) = identifier.strip_suffix(token) {
            if !rest.is_empty() {
                return format!("{}{}", rest, symbol);
            }
        }
    }
    identifier.to_string()
}

/// The inverse of [`translate_class_name`]: recovers the class-style
/// identifier from a wire-spelled name, if it ends in (or begins with) a
/// known symbol.
pub fn untranslate_class_name(wire_name: &str) -> String {
    if let Some(rest) = wire_name.strip_prefix('*') {
        return format!("Common{}", rest);
    }
    if let Some(last) = wire_name.chars().last() {
        for (token, symbol) in SUFFIX_TRANSLATIONS {
            if last == *symbol {
                let rest = &wire_name[..wire_name.len() - last.len_utf8()];
                return format!("{}{}", rest, token);
            }
        }
    }
    wire_name.to_string()
}

/// Owns every node in the command tree. Dynamic add/remove is guarded by
/// whatever mutex the caller wraps an `Engine`'s arena in; the
/// arena itself performs no locking.
pub struct NodeArena {
    nodes: Vec<Node>,
    root: NodeId,
}

impl NodeArena {
    /// Creates an arena with a single, empty root branch.
    pub fn new() -> Self {
        let root_node = Node {
            full_name: String::new(),
            parent: None,
            defaults: IndexMap::new(),
            hidden: false,
            access: Access::Guest,
            modify_access: Access::Administrator,
            kind: NodeKind::Branch(Branch::default()),
        };
        NodeArena { nodes: vec![root_node], root: NodeId(0) }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    /// Registers `node` as a child of `parent`, deriving and wiring up its
    /// three aliases. Fails with `NoUpperCaseLetters` if the short form
    /// would be empty, or `DuplicateShortName` if an alias collides with an
    /// unrelated existing child (unless `replace_existing`).
    pub fn insert_child(
        &mut self,
        parent: NodeId,
        full_name: &str,
        mut node: Node,
        replace_existing: bool,
    ) -> Result<NodeId> {
        let (intermediate, short) = derive_aliases(full_name);
        if short.is_empty() {
            return Err(Error::NoUpperCaseLetters { name: full_name.to_string() });
        }
        let keys = [full_name.to_lowercase(), intermediate.to_lowercase(), short.to_lowercase()];

        {
            let branch = self
                .get(parent)
                .kind
                .as_branch()
                .ok_or_else(|| Error::NotABranch { name: self.get(parent).full_name.clone() })?;
            for key in &keys {
                if let Some(&existing) = branch.instances.get(key) {
                    if !replace_existing {
                        if key == &full_name.to_lowercase() {
                            return Err(Error::AlreadyExists { name: full_name.to_string() });
                        }
                        return Err(Error::DuplicateShortName { short: key.clone() });
                    }
                    let _ = existing;
                }
            }
        }

        node.full_name = full_name.to_string();
        node.parent = Some(parent);
        self.nodes.push(node);
        let id = NodeId((self.nodes.len() - 1) as u32);

        let branch = self.get_mut(parent).kind.as_branch_mut().expect("checked above");
        for key in keys {
            branch.instances.insert(key, id);
        }
        Ok(id)
    }

    /// Registers `factory` as the lazy class for `full_name` under
    /// `parent`, under the same three alias keys `insert_child` would use.
    /// Not built until `locate` first resolves through one of those
    /// aliases. Fails with `NoUpperCaseLetters` under the same condition
    /// as `insert_child`.
    pub fn register_class(&mut self, parent: NodeId, full_name: &str, factory: NodeFactory) -> Result<()> {
        let (intermediate, short) = derive_aliases(full_name);
        if short.is_empty() {
            return Err(Error::NoUpperCaseLetters { name: full_name.to_string() });
        }
        let keys = [full_name.to_lowercase(), intermediate.to_lowercase(), short.to_lowercase()];
        let branch = self
            .get_mut(parent)
            .kind
            .as_branch_mut()
            .ok_or_else(|| Error::NotABranch { name: self.get(parent).full_name.clone() })?;
        for key in keys {
            branch.classes.insert(key, factory.clone());
        }
        Ok(())
    }

    /// Removes a child of `parent` by any of its aliases, requiring
    /// `requester_access >= modify_access` of `parent`.
    pub fn remove_child(&mut self, parent: NodeId, name: &str, requester_access: Access) -> Result<()> {
        let modify_access = self.get(parent).modify_access;
        if requester_access < modify_access {
            return Err(Error::InsufficientAccess { required: modify_access, current: requester_access });
        }
        let branch = self
            .get_mut(parent)
            .kind
            .as_branch_mut()
            .ok_or_else(|| Error::NotABranch { name: name.to_string() })?;
        let key = name.to_lowercase();
        let target = branch
            .instances
            .get(&key)
            .copied()
            .ok_or_else(|| Error::UnknownCommand { branch: String::new(), command: name.to_string() })?;
        branch.instances.retain(|_, v| *v != target);
        Ok(())
    }

    /// Resolves a dotted/colon-delimited path from `scope`. Returns the
    /// resolved node id and the merged `defaults` map accumulated from
    /// every visited node along the path.
    ///
    /// A segment that misses the current branch's instance map but hits
    /// its class map is lazily instantiated and promoted into the
    /// instance map before resolution continues, so later lookups for the
    /// same alias skip the factory entirely.
    pub fn locate(&mut self, scope: NodeId, path: &str) -> Result<(NodeId, IndexMap<String, String>)> {
        let mut current = scope;
        let mut defaults = IndexMap::new();

        if path.starts_with(':') {
            current = self.root;
        }

        for segment in path.split(':') {
            if segment.is_empty() {
                continue;
            }
            let key = segment.to_lowercase();
            let branch = self
                .get(current)
                .kind
                .as_branch()
                .ok_or_else(|| Error::NotABranch { name: self.get(current).full_name.clone() })?;

            let next = if let Some(&existing) = branch.instances.get(&key) {
                existing
            } else if let Some(factory) = branch.classes.get(&key).cloned() {
                self.instantiate_class(current, factory)?
            } else {
                return Err(Error::UnknownCommand {
                    branch: self.get(current).full_name.clone(),
                    command: segment.to_string(),
                });
            };
            defaults.extend(self.get(current).defaults.clone());
            current = next;
        }
        defaults.extend(self.get(current).defaults.clone());
        Ok((current, defaults))
    }

    /// Builds `factory`'s node and mounts it as a child of `parent`,
    /// registering the same three alias keys `insert_child` derives from
    /// its `full_name` so it's found directly on the next lookup.
    fn instantiate_class(&mut self, parent: NodeId, factory: NodeFactory) -> Result<NodeId> {
        let node = factory();
        let full_name = node.full_name.clone();
        self.insert_child(parent, &full_name, node, false)
    }

    /// Lists the visible (non-`hidden`) children of a branch, sorted by
    /// full name, for `HELP`.
    pub fn children(&self, branch: NodeId, include_hidden: bool) -> Vec<NodeId> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        if let Some(b) = self.get(branch).kind.as_branch() {
            for &id in b.instances.values() {
                if seen.insert(id) {
                    if include_hidden || !self.get(id).hidden {
                        out.push(id);
                    }
                }
            }
        }
        out.sort_by(|a, b| self.get(*a).full_name.cmp(&self.get(*b).full_name));
        out
    }
}

impl Default for NodeArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::leaf::{Leaf, LeafCapabilities};

    fn leaf_node(full_name: &str) -> Node {
        Node {
            full_name: full_name.to_string(),
            parent: None,
            defaults: IndexMap::new(),
            hidden: false,
            access: Access::Guest,
            modify_access: Access::Administrator,
            kind: NodeKind::Leaf(Leaf::stub(LeafCapabilities::default())),
        }
    }

    fn branch_node(full_name: &str) -> Node {
        Node {
            full_name: full_name.to_string(),
            parent: None,
            defaults: IndexMap::new(),
            hidden: false,
            access: Access::Guest,
            modify_access: Access::Administrator,
            kind: NodeKind::Branch(Branch::default()),
        }
    }

    #[test]
    fn alias_derivation() {
        let (intermediate, short) = derive_aliases("LASer");
        assert_eq!(intermediate, "LASr");
        assert_eq!(short, "LAS");
    }

    #[test]
    fn suffix_translation_roundtrip() {
        assert_eq!(translate_class_name("MacroSet"), "Macro=");
        assert_eq!(untranslate_class_name("Macro="), "MacroSet");
        assert_eq!(translate_class_name("CommonVersion"), "*Version");
        assert_eq!(untranslate_class_name("*Version"), "CommonVersion");
    }

    #[test]
    fn resolution_is_alias_and_case_insensitive() {
        let mut arena = NodeArena::new();
        let root = arena.root();
        let laser = arena.insert_child(root, "LASer", branch_node(""), false).unwrap();
        let _power = arena.insert_child(laser, "POWer", leaf_node(""), false).unwrap();

        let (by_full, _) = arena.locate(root, "LASer:POWer").unwrap();
        let (by_short, _) = arena.locate(root, "las:pow").unwrap();
        let (by_intermediate, _) = arena.locate(root, "LASr:POWr").unwrap();
        assert_eq!(by_full, by_short);
        assert_eq!(by_full, by_intermediate);
    }

    #[test]
    fn leading_colon_rewinds_to_root() {
        let mut arena = NodeArena::new();
        let root = arena.root();
        let laser = arena.insert_child(root, "LASer", branch_node(""), false).unwrap();
        arena.insert_child(laser, "POWer", leaf_node(""), false).unwrap();
        let (resolved, _) = arena.locate(laser, ":LASer:POWer").unwrap();
        let (direct, _) = arena.locate(root, "LASer:POWer").unwrap();
        assert_eq!(resolved, direct);
    }

    #[test]
    fn no_upper_case_letters_rejected() {
        let mut arena = NodeArena::new();
        let root = arena.root();
        let err = arena.insert_child(root, "lowercase", branch_node(""), false);
        assert!(matches!(err, Err(Error::NoUpperCaseLetters { .. })));
    }

    #[test]
    fn unknown_command_surfaces_branch_context() {
        let mut arena = NodeArena::new();
        let root = arena.root();
        let err = arena.locate(root, "NOPE").unwrap_err();
        assert!(matches!(err, Error::UnknownCommand { command, .. } if command == "NOPE"));
    }

    #[test]
    fn class_map_lazily_instantiates_on_first_locate() {
        let mut arena = NodeArena::new();
        let root = arena.root();
        arena
            .register_class(root, "LASer", Arc::new(|| branch_node("LASer")))
            .unwrap();
        assert!(arena.get(root).kind.as_branch().unwrap().instances.is_empty());

        let (id, _) = arena.locate(root, "LASer").unwrap();
        assert!(arena.get(root).kind.as_branch().unwrap().instances.contains_key("laser"));

        // A second lookup, through a different alias, finds the now-real
        // instance directly without touching the factory again.
        let (again, _) = arena.locate(root, "las").unwrap();
        assert_eq!(id, again);
    }
}
