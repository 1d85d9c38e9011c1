//! Hash tree used by anti-entropy to find which keys differ between replicas.
//!
//! The tree covers the whole 32-bit key-hash space and is split in halves down
//! to `depth` levels, giving at most `2^depth` leaves. Nodes exist only for
//! ranges that ever received a key. Every node carries two hashes:
//!
//! - the key hash, derived only from the set of keys under the node
//! - the value hash, derived only from the versions of those keys
//!
//! A changed key hash means a key was added or removed below; an unchanged key
//! hash with a changed value hash means an existing key was rewritten.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::{xxh3_64, Xxh3};

use crate::error::TreeError;
use crate::types::StateSnapshot;

pub const MAX_HASH_DEPTH: u8 = 30;

/// Something that can be indexed by the tree.
pub trait TreeEntry: Clone + Send + Sync {
    fn key(&self) -> &str;
    fn version(&self) -> u64;
    fn snapshot(&self) -> StateSnapshot;
}

/// Leaf member of a tree rebuilt from a peer's image. Only the key and the
/// version the peer holds are known.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteEntry {
    pub key: String,
    pub version: u64,
}

impl TreeEntry for RemoteEntry {
    fn key(&self) -> &str {
        &self.key
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot::key_only(self.key.clone(), self.version)
    }
}

/// Half-open hash range `[left, right)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Range {
    pub left: i64,
    pub right: i64,
}

impl Range {
    pub fn full() -> Self {
        Self {
            left: i32::MIN as i64,
            right: i32::MAX as i64 + 1,
        }
    }

    pub fn contains(&self, position: i64) -> bool {
        self.left <= position && position < self.right
    }

    pub fn len(&self) -> i64 {
        self.right - self.left
    }

    fn mid(&self) -> i64 {
        self.left + self.len() / 2
    }

    pub fn left_half(&self) -> Self {
        Self {
            left: self.left,
            right: self.mid(),
        }
    }

    pub fn right_half(&self) -> Self {
        Self {
            left: self.mid(),
            right: self.right,
        }
    }
}

/// Position of a key in the hash space.
pub fn key_position(key: &str) -> i64 {
    xxh3_64(key.as_bytes()) as u32 as i32 as i64
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeHash {
    pub key_hash: u64,
    pub value_hash: u64,
}

impl NodeHash {
    pub const EMPTY: NodeHash = NodeHash {
        key_hash: 0,
        value_hash: 0,
    };

    fn combine(left: NodeHash, right: NodeHash) -> NodeHash {
        if left == Self::EMPTY && right == Self::EMPTY {
            return Self::EMPTY;
        }
        let mut keys = Xxh3::new();
        keys.update(&left.key_hash.to_le_bytes());
        keys.update(&right.key_hash.to_le_bytes());
        let mut values = Xxh3::new();
        values.update(&left.value_hash.to_le_bytes());
        values.update(&right.value_hash.to_le_bytes());
        NodeHash {
            key_hash: keys.digest(),
            value_hash: values.digest(),
        }
    }

    fn of_members<T: TreeEntry>(members: &BTreeMap<String, T>) -> NodeHash {
        if members.is_empty() {
            return Self::EMPTY;
        }
        let mut keys = Xxh3::new();
        let mut values = Xxh3::new();
        // BTreeMap iteration is key-ordered, so insertion order cannot leak in.
        for (key, entry) in members {
            keys.update(&(key.len() as u64).to_le_bytes());
            keys.update(key.as_bytes());
            values.update(&entry.version().to_le_bytes());
        }
        NodeHash {
            key_hash: keys.digest(),
            value_hash: values.digest(),
        }
    }
}

enum Body<T> {
    Inner {
        left: OnceLock<Box<TreeNode<T>>>,
        right: OnceLock<Box<TreeNode<T>>>,
    },
    Leaf {
        members: Mutex<BTreeMap<String, T>>,
    },
}

struct TreeNode<T> {
    range: Range,
    hash: RwLock<NodeHash>,
    body: Body<T>,
}

impl<T: TreeEntry> TreeNode<T> {
    fn new(range: Range, leaf: bool) -> Self {
        let body = if leaf {
            Body::Leaf {
                members: Mutex::new(BTreeMap::new()),
            }
        } else {
            Body::Inner {
                left: OnceLock::new(),
                right: OnceLock::new(),
            }
        };
        Self {
            range,
            hash: RwLock::new(NodeHash::EMPTY),
            body,
        }
    }

    fn hash(&self) -> NodeHash {
        *self.hash.read()
    }

    fn rehash(&self) -> NodeHash {
        let hash = match &self.body {
            Body::Leaf { members } => NodeHash::of_members(&members.lock()),
            Body::Inner { left, right } => {
                let left = left.get().map(|n| n.rehash()).unwrap_or_default();
                let right = right.get().map(|n| n.rehash()).unwrap_or_default();
                NodeHash::combine(left, right)
            }
        };
        *self.hash.write() = hash;
        hash
    }

    fn collect_into(&self, out: &mut BTreeMap<String, T>) {
        match &self.body {
            Body::Leaf { members } => {
                out.extend(members.lock().iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            Body::Inner { left, right } => {
                if let Some(node) = left.get() {
                    node.collect_into(out);
                }
                if let Some(node) = right.get() {
                    node.collect_into(out);
                }
            }
        }
    }

    fn members(&self) -> BTreeMap<String, T> {
        let mut out = BTreeMap::new();
        self.collect_into(&mut out);
        out
    }

    fn write_image(&self, out: &mut Vec<ImageNode>) {
        match &self.body {
            Body::Leaf { members } => {
                let members = members
                    .lock()
                    .values()
                    .map(|e| RemoteEntry {
                        key: e.key().to_string(),
                        version: e.version(),
                    })
                    .collect();
                out.push(ImageNode {
                    range: self.range,
                    hash: self.hash(),
                    kind: ImageKind::Leaf { members },
                });
            }
            Body::Inner { left, right } => {
                out.push(ImageNode {
                    range: self.range,
                    hash: self.hash(),
                    kind: ImageKind::Inner {
                        has_left: left.get().is_some(),
                        has_right: right.get().is_some(),
                    },
                });
                if let Some(node) = left.get() {
                    node.write_image(out);
                }
                if let Some(node) = right.get() {
                    node.write_image(out);
                }
            }
        }
    }
}

/// Preorder serialization of a tree: ranges, both hashes, and for leaves the
/// `(key, version)` pairs they hold.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TreeImage {
    pub depth: u8,
    pub nodes: Vec<ImageNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageNode {
    pub range: Range,
    pub hash: NodeHash,
    pub kind: ImageKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ImageKind {
    Inner { has_left: bool, has_right: bool },
    Leaf { members: Vec<RemoteEntry> },
}

/// Result of comparing a reference tree against another one: what the other
/// side must add, remove and overwrite to match the reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Difference {
    pub added: Vec<StateSnapshot>,
    pub removed: Vec<StateSnapshot>,
    pub updated: Vec<StateSnapshot>,
}

impl Difference {
    pub fn has_differences(&self) -> bool {
        !(self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty())
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.updated.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_differences()
    }

    fn diff_members<A: TreeEntry, B: TreeEntry>(
        &mut self,
        local: &BTreeMap<String, A>,
        remote: &BTreeMap<String, B>,
    ) {
        for (key, entry) in local {
            match remote.get(key) {
                None => self.added.push(entry.snapshot()),
                Some(other) if other.version() != entry.version() => {
                    self.updated.push(entry.snapshot())
                }
                Some(_) => {}
            }
        }
        for (key, entry) in remote {
            if !local.contains_key(key) {
                self.removed.push(entry.snapshot());
            }
        }
    }
}

pub struct HashTree<T> {
    depth: u8,
    root: TreeNode<T>,
    readonly: bool,
}

impl<T: TreeEntry> HashTree<T> {
    pub fn new(depth: u8) -> Result<Self, TreeError> {
        Self::with_range(Range::full(), depth)
    }

    pub fn with_range(range: Range, depth: u8) -> Result<Self, TreeError> {
        // Each level halves the range, leaves must still cover at least two hashes.
        if depth == 0 || depth > MAX_HASH_DEPTH || range.len() < (2i64 << depth) {
            return Err(TreeError::InvalidDepth {
                depth,
                left: range.left,
                right: range.right,
            });
        }
        Ok(Self {
            depth,
            root: TreeNode::new(range, false),
            readonly: false,
        })
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Root hashes as of the last `load_hash`.
    pub fn root_hash(&self) -> NodeHash {
        self.root.hash()
    }

    /// Walks to the leaf covering `position`, creating missing nodes on the
    /// way. Only the slot being filled is contended, so inserts into disjoint
    /// ranges never wait on each other.
    fn leaf_for(&self, position: i64) -> &TreeNode<T> {
        let mut node = &self.root;
        let mut level = 0u8;
        loop {
            let Body::Inner { left, right } = &node.body else {
                return node;
            };
            level += 1;
            let leaf = level >= self.depth;
            let left_range = node.range.left_half();
            node = if left_range.contains(position) {
                left.get_or_init(|| Box::new(TreeNode::new(left_range, leaf)))
            } else {
                let right_range = node.range.right_half();
                right.get_or_init(|| Box::new(TreeNode::new(right_range, leaf)))
            };
        }
    }

    fn find_leaf(&self, position: i64) -> Option<&TreeNode<T>> {
        let mut node = &self.root;
        loop {
            let Body::Inner { left, right } = &node.body else {
                return Some(node);
            };
            node = if node.range.left_half().contains(position) {
                left.get()?
            } else {
                right.get()?
            };
        }
    }

    pub fn put(&self, entry: T) -> Result<(), TreeError> {
        if self.readonly {
            return Err(TreeError::ReadOnly);
        }
        let leaf = self.leaf_for(key_position(entry.key()));
        if let Body::Leaf { members } = &leaf.body {
            members.lock().insert(entry.key().to_string(), entry);
        }
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<Option<T>, TreeError> {
        if self.readonly {
            return Err(TreeError::ReadOnly);
        }
        let Some(leaf) = self.find_leaf(key_position(key)) else {
            return Ok(None);
        };
        match &leaf.body {
            Body::Leaf { members } => Ok(members.lock().remove(key)),
            Body::Inner { .. } => Ok(None),
        }
    }

    pub fn get(&self, key: &str) -> Option<T> {
        let leaf = self.find_leaf(key_position(key))?;
        match &leaf.body {
            Body::Leaf { members } => members.lock().get(key).cloned(),
            Body::Inner { .. } => None,
        }
    }

    /// Recomputes both hashes bottom-up through the populated part of the tree.
    /// Must run before comparing or serializing a local tree.
    pub fn load_hash(&self) -> Result<NodeHash, TreeError> {
        if self.readonly {
            return Err(TreeError::ReadOnly);
        }
        Ok(self.root.rehash())
    }

    /// Every entry of the tree, keyed by key.
    pub fn entries(&self) -> BTreeMap<String, T> {
        self.root.members()
    }

    /// Number of materialized leaves.
    pub fn leaf_count(&self) -> usize {
        fn count<T>(node: &TreeNode<T>) -> usize {
            match &node.body {
                Body::Leaf { .. } => 1,
                Body::Inner { left, right } => {
                    left.get().map_or(0, |n| count(n)) + right.get().map_or(0, |n| count(n))
                }
            }
        }
        count(&self.root)
    }

    /// Compares `self` (the reference) with `other`. The result tells `other`'s
    /// owner how to converge on `self`. Both trees must have current hashes.
    pub fn difference<U: TreeEntry>(&self, other: &HashTree<U>) -> Difference {
        let mut difference = Difference::default();
        diff_nodes(Some(&self.root), Some(&other.root), &mut difference);
        difference
    }

    pub fn to_image(&self) -> TreeImage {
        let mut nodes = Vec::new();
        self.root.write_image(&mut nodes);
        TreeImage {
            depth: self.depth,
            nodes,
        }
    }
}

impl HashTree<RemoteEntry> {
    /// Rebuilds a read-only mirror of a peer's tree. Hashes are recomputed from
    /// the shipped leaves rather than trusted.
    pub fn from_image(image: TreeImage) -> anyhow::Result<Self> {
        let mut nodes = image.nodes.into_iter();
        let root = read_node(&mut nodes, 0, image.depth)?;
        if !matches!(root.body, Body::Inner { .. }) {
            anyhow::bail!("Tree image root is a leaf");
        }
        if nodes.next().is_some() {
            anyhow::bail!("Tree image has trailing nodes");
        }
        root.rehash();
        Ok(Self {
            depth: image.depth,
            root,
            readonly: true,
        })
    }
}

fn read_node(
    nodes: &mut impl Iterator<Item = ImageNode>,
    level: u8,
    depth: u8,
) -> anyhow::Result<TreeNode<RemoteEntry>> {
    let Some(image) = nodes.next() else {
        anyhow::bail!("Tree image truncated at level {level}");
    };
    if level > depth {
        anyhow::bail!("Tree image deeper than its hash depth {depth}");
    }
    match image.kind {
        ImageKind::Leaf { members } => {
            let members = members.into_iter().map(|e| (e.key.clone(), e)).collect();
            Ok(TreeNode {
                range: image.range,
                hash: RwLock::new(image.hash),
                body: Body::Leaf {
                    members: Mutex::new(members),
                },
            })
        }
        ImageKind::Inner {
            has_left,
            has_right,
        } => {
            let left = OnceLock::new();
            let right = OnceLock::new();
            if has_left {
                let _ = left.set(Box::new(read_node(nodes, level + 1, depth)?));
            }
            if has_right {
                let _ = right.set(Box::new(read_node(nodes, level + 1, depth)?));
            }
            Ok(TreeNode {
                range: image.range,
                hash: RwLock::new(image.hash),
                body: Body::Inner { left, right },
            })
        }
    }
}

fn diff_nodes<A: TreeEntry, B: TreeEntry>(
    local: Option<&TreeNode<A>>,
    remote: Option<&TreeNode<B>>,
    out: &mut Difference,
) {
    match (local, remote) {
        (None, None) => {}
        (Some(local), None) => out.diff_members(&local.members(), &BTreeMap::<String, B>::new()),
        (None, Some(remote)) => out.diff_members(&BTreeMap::<String, A>::new(), &remote.members()),
        (Some(local), Some(remote)) => {
            if local.hash() == remote.hash() {
                return;
            }
            match (&local.body, &remote.body) {
                (
                    Body::Inner {
                        left: l1,
                        right: r1,
                    },
                    Body::Inner {
                        left: l2,
                        right: r2,
                    },
                ) if local.range == remote.range => {
                    diff_nodes(l1.get().map(|n| &**n), l2.get().map(|n| &**n), out);
                    diff_nodes(r1.get().map(|n| &**n), r2.get().map(|n| &**n), out);
                }
                // Leaves, or trees split differently: compare membership directly.
                // Each side is copied out before the other is locked.
                _ => {
                    let local = local.members();
                    let remote = remote.members();
                    out.diff_members(&local, &remote);
                }
            }
        }
    }
}
