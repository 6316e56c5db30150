//! Arena tree model for syntactically annotated sentences
//!
//! A [`Tree`] owns all of its nodes in a flat arena addressed by [`NodeId`];
//! parent and sibling relations are plain index back-references derived from
//! the single authoritative child sequence, so deletion and re-assembly are
//! index operations rather than reference-count juggling.  Structural
//! equality and hashing ignore the process-unique node uids.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use thiserror::Error;

use crate::label::{self, IndexKind, MalformedLabel};

/// Index of a node within its tree's arena
pub type NodeId = usize;

/// Leaf texts (up to a trailing index) that mark a movement trace
pub const TRACE_MARKERS: [&str; 4] = ["*T*", "*ICH*", "*CL*", "*"];
/// Leaf texts that mark silent constituents
pub const SILENT_MARKERS: [&str; 3] = ["*con*", "*exp*", "*pro*"];

/// Metadata key holding a coindexation index
pub const INDEX_KEY: &str = "INDEX";
/// Metadata key holding the index kind (`regular` or `gap`)
pub const IDX_TYPE_KEY: &str = "IDX-TYPE";
/// Metadata key holding a tree's corpus identifier
pub const ID_KEY: &str = "ID";

static NEXT_UID: AtomicU64 = AtomicU64::new(1);

fn next_uid() -> u64 {
    NEXT_UID.fetch_add(1, Ordering::Relaxed)
}

/// Errors raised by tree reads and mutations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TreeError {
    /// Read of an absent metadata key without a default
    #[error("unknown metadata key: {0}")]
    UnknownMetadataKey(String),
    /// A mutation that would break the parent/child or sibling invariants
    #[error("structural violation: {0}")]
    StructuralViolation(String),
    #[error(transparent)]
    Label(#[from] MalformedLabel),
}

/// Ordered key/value annotations attached to a node.
///
/// Entries keep insertion order (comment-style annotations are
/// order-preserving in the source text); equality is dictionary-style,
/// ignoring order.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    entries: Vec<(String, String)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up `key`, failing with [`TreeError::UnknownMetadataKey`] when it
    /// is absent.
    pub fn get(&self, key: &str) -> Result<&str, TreeError> {
        self.try_get(key)
            .ok_or_else(|| TreeError::UnknownMetadataKey(key.to_string()))
    }

    pub fn try_get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Look up `key`, returning `default` when it is absent.
    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.try_get(key).unwrap_or(default)
    }

    /// Set `key` to `value`, keeping the key's position if it already exists.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl PartialEq for Metadata {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .all(|(k, v)| other.try_get(k) == Some(v.as_str()))
    }
}

impl Eq for Metadata {}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = Metadata::new();
        for (k, v) in iter {
            metadata.set(k, v);
        }
        metadata
    }
}

/// What a node is: a terminal with surface text, or a constituent with an
/// ordered child sequence.
#[derive(Debug, Clone)]
pub enum NodeKind {
    Leaf { text: String },
    NonTerminal { children: Vec<NodeId> },
}

/// A single node in a tree's arena
#[derive(Debug, Clone)]
pub struct Node {
    label: String,
    metadata: Metadata,
    kind: NodeKind,
    parent: Option<NodeId>,
    uid: u64,
}

impl Node {
    /// Process-unique identity, assigned once at construction and never
    /// considered by structural equality.
    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    pub fn text(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Leaf { text } => Some(text),
            NodeKind::NonTerminal { .. } => None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf { .. })
    }

    fn new(label: String, metadata: Metadata, kind: NodeKind, parent: Option<NodeId>) -> Node {
        Node {
            label,
            metadata,
            kind,
            parent,
            uid: next_uid(),
        }
    }
}

/// A parse tree: an arena of nodes plus the root index
#[derive(Debug, Clone)]
pub struct Tree {
    nodes: Vec<Node>,
    root: NodeId,
}

impl Tree {
    /// Construct a single-leaf tree.  A trailing coindexation index on the
    /// label is moved into the `INDEX`/`IDX-TYPE` metadata.
    pub fn leaf(label: &str, text: &str) -> Tree {
        let (label, index) = label::label_and_index(label);
        let node = Node::new(
            label,
            index_metadata(index),
            NodeKind::Leaf { text: text.to_string() },
            None,
        );
        Tree { nodes: vec![node], root: 0 }
    }

    /// Construct a non-terminal over `children`, consuming their arenas.
    /// A trailing coindexation index on the label is moved into metadata.
    pub fn non_terminal(label: &str, children: Vec<Tree>) -> Tree {
        let (label, index) = label::label_and_index(label);
        let node = Node::new(
            label,
            index_metadata(index),
            NodeKind::NonTerminal { children: Vec::new() },
            None,
        );
        let mut nodes = vec![node];
        let child_ids: Vec<NodeId> = children
            .into_iter()
            .map(|child| graft(&mut nodes, child, 0))
            .collect();
        match &mut nodes[0].kind {
            NodeKind::NonTerminal { children } => *children = child_ids,
            NodeKind::Leaf { .. } => unreachable!(),
        }
        Tree { nodes, root: 0 }
    }

    /// [`Tree::leaf`] with initial metadata; an index on the label wins
    /// over `INDEX`/`IDX-TYPE` entries in `metadata`.
    pub fn leaf_with(label: &str, text: &str, metadata: Metadata) -> Tree {
        let mut tree = Tree::leaf(label, text);
        let root = tree.root();
        merge_metadata(&mut tree, root, metadata);
        tree
    }

    /// [`Tree::non_terminal`] with initial metadata.
    pub fn non_terminal_with(label: &str, children: Vec<Tree>, metadata: Metadata) -> Tree {
        let mut tree = Tree::non_terminal(label, children);
        let root = tree.root();
        merge_metadata(&mut tree, root, metadata);
        tree
    }

    /// Raw root constructor used when re-assembling trees from storage:
    /// the label is stored verbatim (indices already live in metadata).
    pub(crate) fn with_root(label: String, text: Option<String>) -> Tree {
        let kind = match text {
            Some(text) => NodeKind::Leaf { text },
            None => NodeKind::NonTerminal { children: Vec::new() },
        };
        Tree {
            nodes: vec![Node::new(label, Metadata::new(), kind, None)],
            root: 0,
        }
    }

    /// Raw child append used when re-assembling trees from storage.
    pub(crate) fn push_child(&mut self, parent: NodeId, label: String, text: Option<String>) -> NodeId {
        let kind = match text {
            Some(text) => NodeKind::Leaf { text },
            None => NodeKind::NonTerminal { children: Vec::new() },
        };
        let id = self.nodes.len();
        self.nodes
            .push(Node::new(label, Metadata::new(), kind, Some(parent)));
        match &mut self.nodes[parent].kind {
            NodeKind::NonTerminal { children } => children.push(id),
            NodeKind::Leaf { .. } => panic!("push_child on a leaf"),
        }
        id
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn label(&self, id: NodeId) -> &str {
        &self.nodes[id].label
    }

    pub fn metadata(&self, id: NodeId) -> &Metadata {
        &self.nodes[id].metadata
    }

    pub fn metadata_mut(&mut self, id: NodeId) -> &mut Metadata {
        &mut self.nodes[id].metadata
    }

    pub fn text(&self, id: NodeId) -> Option<&str> {
        self.nodes[id].text()
    }

    pub fn is_leaf(&self, id: NodeId) -> bool {
        self.nodes[id].is_leaf()
    }

    /// Children of `id`, in sibling order (empty for leaves).
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        match &self.nodes[id].kind {
            NodeKind::NonTerminal { children } => children,
            NodeKind::Leaf { .. } => &[],
        }
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    /// Position of `id` within its parent's child sequence.
    fn sibling_rank(&self, id: NodeId) -> Option<usize> {
        let parent = self.nodes[id].parent?;
        self.children(parent).iter().position(|&c| c == id)
    }

    pub fn left_sibling(&self, id: NodeId) -> Option<NodeId> {
        let parent = self.nodes[id].parent?;
        let rank = self.sibling_rank(id)?;
        if rank == 0 {
            None
        } else {
            Some(self.children(parent)[rank - 1])
        }
    }

    pub fn right_sibling(&self, id: NodeId) -> Option<NodeId> {
        let parent = self.nodes[id].parent?;
        let rank = self.sibling_rank(id)?;
        self.children(parent).get(rank + 1).copied()
    }

    /// Distance from the root (the root itself has depth 0).
    pub fn depth(&self, id: NodeId) -> usize {
        let mut depth = 0;
        let mut current = id;
        while let Some(parent) = self.nodes[current].parent {
            depth += 1;
            current = parent;
        }
        depth
    }

    /// Number of nodes reachable from the root.
    pub fn node_count(&self) -> usize {
        self.pre_order().count()
    }

    /// All nodes reachable from the root, in pre-order.
    pub fn pre_order(&self) -> PreOrder<'_> {
        PreOrder { tree: self, stack: vec![self.root] }
    }

    /// Proper descendants of `id`, in pre-order.
    pub fn descendants(&self, id: NodeId) -> PreOrder<'_> {
        let stack = self.children(id).iter().rev().copied().collect();
        PreOrder { tree: self, stack }
    }

    /// True iff `ancestor` properly dominates `id`.
    pub fn is_ancestor(&self, ancestor: NodeId, id: NodeId) -> bool {
        let mut current = self.nodes[id].parent;
        while let Some(node) = current {
            if node == ancestor {
                return true;
            }
            current = self.nodes[node].parent;
        }
        false
    }

    /// Replace the label of `id`, extracting a trailing index into metadata.
    /// Empty labels are rejected.
    pub fn set_label(&mut self, id: NodeId, new: &str) -> Result<(), TreeError> {
        let new = new.trim();
        if new.is_empty() {
            return Err(TreeError::Label(MalformedLabel(new.to_string())));
        }
        let (bare, index) = label::label_and_index(new);
        self.nodes[id].label = bare;
        if let Some((kind, n)) = index {
            self.set_index(id, kind, n);
        }
        Ok(())
    }

    /// This node's coindexation index, read from metadata.
    pub fn index(&self, id: NodeId) -> Option<(IndexKind, u32)> {
        let n = self.nodes[id].metadata.try_get(INDEX_KEY)?.parse().ok()?;
        let kind = match self.nodes[id].metadata.try_get(IDX_TYPE_KEY) {
            Some("gap") => IndexKind::Gap,
            _ => IndexKind::Regular,
        };
        Some((kind, n))
    }

    pub fn set_index(&mut self, id: NodeId, kind: IndexKind, n: u32) {
        let metadata = &mut self.nodes[id].metadata;
        metadata.set(INDEX_KEY, n.to_string());
        metadata.set(IDX_TYPE_KEY, kind.as_str());
    }

    pub fn remove_index(&mut self, id: NodeId) {
        let metadata = &mut self.nodes[id].metadata;
        metadata.remove(INDEX_KEY);
        metadata.remove(IDX_TYPE_KEY);
    }

    /// Attach `subtree` as a child of `parent` at position `pos`; later
    /// siblings shift right.  Returns the id of the attached root.
    pub fn insert_child(
        &mut self,
        parent: NodeId,
        pos: usize,
        subtree: Tree,
    ) -> Result<NodeId, TreeError> {
        let arity = match &self.nodes[parent].kind {
            NodeKind::Leaf { .. } => {
                return Err(TreeError::StructuralViolation(
                    "cannot attach children to a leaf".to_string(),
                ));
            }
            NodeKind::NonTerminal { children } => children.len(),
        };
        if pos > arity {
            return Err(TreeError::StructuralViolation(format!(
                "child position {pos} out of range 0..={arity}"
            )));
        }
        let child = graft(&mut self.nodes, subtree, parent);
        match &mut self.nodes[parent].kind {
            NodeKind::NonTerminal { children } => children.insert(pos, child),
            NodeKind::Leaf { .. } => unreachable!(),
        }
        Ok(child)
    }

    /// Detach and return the child of `parent` at position `pos`; later
    /// siblings shift left.
    pub fn remove_child(&mut self, parent: NodeId, pos: usize) -> Result<Tree, TreeError> {
        let arity = self.children(parent).len();
        if pos >= arity {
            return Err(TreeError::StructuralViolation(format!(
                "child position {pos} out of range 0..{arity}"
            )));
        }
        let child = match &mut self.nodes[parent].kind {
            NodeKind::NonTerminal { children } => children.remove(pos),
            NodeKind::Leaf { .. } => unreachable!(),
        };
        self.nodes[child].parent = None;
        Ok(self.extract(child))
    }

    /// Move `node` so it becomes the child of `new_parent` at position `pos`.
    ///
    /// Rejects detaching the root, attaching under a leaf, and reparenting a
    /// node under itself or its own descendant.
    pub fn reparent(
        &mut self,
        node: NodeId,
        new_parent: NodeId,
        pos: usize,
    ) -> Result<(), TreeError> {
        if node == self.root {
            return Err(TreeError::StructuralViolation(
                "cannot reparent the root".to_string(),
            ));
        }
        if new_parent == node || self.is_ancestor(node, new_parent) {
            return Err(TreeError::StructuralViolation(
                "cannot reparent a node under its own descendant".to_string(),
            ));
        }
        if self.nodes[new_parent].is_leaf() {
            return Err(TreeError::StructuralViolation(
                "cannot attach children to a leaf".to_string(),
            ));
        }
        let old_parent = self.nodes[node]
            .parent
            .ok_or_else(|| TreeError::StructuralViolation("node is detached".to_string()))?;
        let old_rank = self.sibling_rank(node).unwrap();
        let arity = self.children(new_parent).len() - usize::from(old_parent == new_parent);
        if pos > arity {
            return Err(TreeError::StructuralViolation(format!(
                "child position {pos} out of range 0..={arity}"
            )));
        }
        match &mut self.nodes[old_parent].kind {
            NodeKind::NonTerminal { children } => {
                children.remove(old_rank);
            }
            NodeKind::Leaf { .. } => unreachable!(),
        }
        match &mut self.nodes[new_parent].kind {
            NodeKind::NonTerminal { children } => children.insert(pos, node),
            NodeKind::Leaf { .. } => unreachable!(),
        }
        self.nodes[node].parent = Some(new_parent);
        Ok(())
    }

    /// Copy the subtree rooted at `id` into a fresh arena, keeping uids.
    fn extract(&self, id: NodeId) -> Tree {
        fn copy(tree: &Tree, id: NodeId, parent: Option<NodeId>, out: &mut Vec<Node>) -> NodeId {
            let src = &tree.nodes[id];
            let new_id = out.len();
            out.push(Node {
                label: src.label.clone(),
                metadata: src.metadata.clone(),
                kind: NodeKind::Leaf { text: String::new() },
                parent,
                uid: src.uid,
            });
            let kind = match &src.kind {
                NodeKind::Leaf { text } => NodeKind::Leaf { text: text.clone() },
                NodeKind::NonTerminal { children } => NodeKind::NonTerminal {
                    children: children
                        .iter()
                        .map(|&c| copy(tree, c, Some(new_id), out))
                        .collect(),
                },
            };
            out[new_id].kind = kind;
            new_id
        }
        let mut nodes = Vec::new();
        let root = copy(self, id, None, &mut nodes);
        Tree { nodes, root }
    }

    /// True iff the leaf at `id` is a movement trace.
    pub fn is_trace(&self, id: NodeId) -> bool {
        self.text(id).is_some_and(is_trace_text)
    }

    /// True iff the leaf at `id` carries no surface text: the zero marker,
    /// a trace, or a silent constituent.
    pub fn is_empty_category(&self, id: NodeId) -> bool {
        self.text(id)
            .is_some_and(|text| text == "0" || is_trace_text(text) || SILENT_MARKERS.contains(&text))
    }

    fn is_text_leaf(&self, id: NodeId) -> bool {
        let bare = self.nodes[id].label.split('-').next().unwrap_or("");
        self.is_leaf(id) && !self.is_empty_category(id) && bare != "CODE" && bare != "CODING"
    }

    /// Reconstructed surface text: empty-category markers drop out, and the
    /// remaining leaf texts join with single spaces in left-to-right order.
    pub fn urtext(&self, id: NodeId) -> String {
        let leaf_text = |leaf: NodeId| {
            if self.is_text_leaf(leaf) {
                self.text(leaf)
            } else {
                None
            }
        };
        match &self.nodes[id].kind {
            NodeKind::Leaf { .. } => leaf_text(id).unwrap_or_default().to_string(),
            NodeKind::NonTerminal { .. } => {
                let mut out = String::new();
                for node in self.descendants(id) {
                    if let Some(text) = leaf_text(node) {
                        if !out.is_empty() {
                            out.push(' ');
                        }
                        out.push_str(text);
                    }
                }
                out
            }
        }
    }

    /// The order-preserving nested projection of the whole tree.
    pub fn to_data(&self) -> TreeData {
        self.node_data(self.root)
    }

    /// The nested projection of the subtree rooted at `id`.
    pub fn node_data(&self, id: NodeId) -> TreeData {
        let node = &self.nodes[id];
        let metadata = node
            .metadata
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let (text, children) = match &node.kind {
            NodeKind::Leaf { text } => (Some(text.clone()), Vec::new()),
            NodeKind::NonTerminal { children } => {
                (None, children.iter().map(|&c| self.node_data(c)).collect())
            }
        };
        TreeData {
            label: node.label.clone(),
            metadata,
            text,
            children,
            urtext: self.urtext(id),
        }
    }

    /// Structural equality of two subtrees.
    pub(crate) fn node_eq(&self, id: NodeId, other: &Tree, other_id: NodeId) -> bool {
        let a = &self.nodes[id];
        let b = &other.nodes[other_id];
        if a.label != b.label || a.metadata != b.metadata {
            return false;
        }
        match (&a.kind, &b.kind) {
            (NodeKind::Leaf { text: ta }, NodeKind::Leaf { text: tb }) => ta == tb,
            (NodeKind::NonTerminal { children: ca }, NodeKind::NonTerminal { children: cb }) => {
                ca.len() == cb.len()
                    && ca.iter().zip(cb).all(|(&x, &y)| self.node_eq(x, other, y))
            }
            _ => false,
        }
    }
}

/// Append `tree`'s arena to `nodes`, remapping indices, and hook its root
/// under `parent`.  Returns the remapped root id.
fn graft(nodes: &mut Vec<Node>, tree: Tree, parent: NodeId) -> NodeId {
    let offset = nodes.len();
    let root = tree.root + offset;
    for mut node in tree.nodes {
        node.parent = node.parent.map(|p| p + offset);
        if let NodeKind::NonTerminal { children } = &mut node.kind {
            for child in children.iter_mut() {
                *child += offset;
            }
        }
        nodes.push(node);
    }
    nodes[root].parent = Some(parent);
    root
}

fn merge_metadata(tree: &mut Tree, id: NodeId, metadata: Metadata) {
    let index_keys = [INDEX_KEY, IDX_TYPE_KEY];
    let label_has_index = tree.index(id).is_some();
    for (key, value) in metadata.iter() {
        if label_has_index && index_keys.contains(&key) {
            continue;
        }
        tree.metadata_mut(id).set(key, value);
    }
}

fn index_metadata(index: Option<(IndexKind, u32)>) -> Metadata {
    let mut metadata = Metadata::new();
    if let Some((kind, n)) = index {
        metadata.set(INDEX_KEY, n.to_string());
        metadata.set(IDX_TYPE_KEY, kind.as_str());
    }
    metadata
}

/// True iff a leaf text (up to a trailing index) marks a movement trace.
pub(crate) fn is_trace_text(text: &str) -> bool {
    let head = text.split('-').next().unwrap_or("");
    TRACE_MARKERS.contains(&head)
}

impl PartialEq for Tree {
    fn eq(&self, other: &Self) -> bool {
        self.node_eq(self.root, other, other.root)
    }
}

impl Eq for Tree {}

impl Hash for Tree {
    fn hash<H: Hasher>(&self, state: &mut H) {
        fn node_hash<H: Hasher>(tree: &Tree, id: NodeId, state: &mut H) {
            let node = &tree.nodes[id];
            node.label.hash(state);
            // metadata equality ignores order, so hash sorted entries
            let mut entries: Vec<(&str, &str)> = node.metadata.iter().collect();
            entries.sort_unstable();
            entries.hash(state);
            match &node.kind {
                NodeKind::Leaf { text } => {
                    0u8.hash(state);
                    text.hash(state);
                }
                NodeKind::NonTerminal { children } => {
                    1u8.hash(state);
                    children.len().hash(state);
                    for &child in children {
                        node_hash(tree, child, state);
                    }
                }
            }
        }
        node_hash(self, self.root, state);
    }
}

impl fmt::Display for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::penn::render(self))
    }
}

/// Pre-order traversal over a tree's reachable nodes
pub struct PreOrder<'a> {
    tree: &'a Tree,
    stack: Vec<NodeId>,
}

impl Iterator for PreOrder<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.stack.pop()?;
        let children = self.tree.children(id);
        self.stack.extend(children.iter().rev());
        Some(id)
    }
}

/// Serializable, order-preserving nested projection of a tree, for
/// consumers that render without any core logic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeData {
    pub label: String,
    pub metadata: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeData>,
    pub urtext: String,
}
