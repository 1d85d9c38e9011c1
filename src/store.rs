use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fs_err::{self as fs, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::TreeError;
use crate::state::{NodeContext, StateNode, WatchNotifier};
use crate::tree::{Difference, HashTree};
use crate::types::{
    NodeType, ServerId, StateSnapshot, DEFAULT_INVALIDATE_STATUS, DEFAULT_STATUS,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStatus {
    pub server_id: ServerId,
    pub n_nodes: usize,
    pub max_xid: u64,
    pub leaves: usize,
}

/// What an anti-entropy apply changed locally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub added: usize,
    pub removed: usize,
    pub updated: usize,
}

/// Upper bound on what decoding a snapshot may allocate.
const SNAPSHOT_LIMIT: usize = 1024 * 1024 * 1024;

fn snapshot_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<SNAPSHOT_LIMIT>()
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    magic: [u8; 4],
    version: u32,
    server_id: ServerId,
    max_xid: u64,
    nodes: Vec<StateSnapshot>,
    checksum: u32,
}

impl SnapshotFile {
    const VERSION: u32 = 1;
    const MAGIC: [u8; 4] = *b"HPKV";

    fn checksum(nodes: &[StateSnapshot]) -> Result<u32> {
        let encoded = bincode::serde::encode_to_vec(nodes, snapshot_config())?;
        Ok(crc32fast::hash(&encoded))
    }

    fn from_store(store: &StateStore) -> Result<Self> {
        let nodes = store.snapshots();
        Ok(Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            server_id: store.server_id,
            max_xid: store.max_xid(),
            checksum: Self::checksum(&nodes)?,
            nodes,
        })
    }

    fn validate(&self, expected_server: ServerId) -> Result<()> {
        if self.magic != Self::MAGIC {
            bail!("Invalid snapshot magic header");
        }
        if self.version != Self::VERSION {
            bail!(
                "Unsupported snapshot version: expected {}, found {}",
                Self::VERSION,
                self.version
            );
        }
        if self.server_id != expected_server {
            bail!(
                "Snapshot server_id mismatch: expected {}, found {}",
                expected_server,
                self.server_id
            );
        }
        if Self::checksum(&self.nodes)? != self.checksum {
            bail!("Snapshot checksum mismatch");
        }
        Ok(())
    }
}

/// All state nodes of a server plus the hash tree indexing them.
///
/// - Keys are unique; create-if-absent is atomic per key
/// - Every insert or removal is mirrored into the tree while the key's map
///   shard is held, so the tree never disagrees with the map about a key
/// - `max_xid` is the highest version ever accepted, used to reject stale diffs
pub struct StateStore {
    server_id: ServerId,
    nodes: DashMap<String, Arc<StateNode>>,
    tree: HashTree<Arc<StateNode>>,
    ctx: Arc<NodeContext>,
}

impl StateStore {
    /// Binds lease timers to the current tokio runtime and fails outside one.
    pub fn new(server_id: ServerId, hash_depth: u8, notifier: Arc<dyn WatchNotifier>) -> Result<Self> {
        let ctx = Arc::new(NodeContext::new(notifier)?);
        Ok(Self::with_context(server_id, hash_depth, ctx)?)
    }

    pub fn with_context(
        server_id: ServerId,
        hash_depth: u8,
        ctx: Arc<NodeContext>,
    ) -> Result<Self, TreeError> {
        Ok(Self {
            server_id,
            nodes: DashMap::new(),
            tree: HashTree::new(hash_depth)?,
            ctx,
        })
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    pub fn tree(&self) -> &HashTree<Arc<StateNode>> {
        &self.tree
    }

    pub fn max_xid(&self) -> u64 {
        self.ctx.max_xid()
    }

    /// Moves the staleness watermark forward, never back.
    pub fn raise_xid(&self, xid: u64) {
        self.ctx.observe_xid(xid);
    }

    pub fn get(&self, key: &str) -> Option<Arc<StateNode>> {
        self.nodes.get(key).map(|node| node.value().clone())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.nodes.iter().map(|n| n.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Snapshots of every node, ordered by key.
    pub fn snapshots(&self) -> Vec<StateSnapshot> {
        let nodes: Vec<Arc<StateNode>> = self.nodes.iter().map(|n| n.value().clone()).collect();
        let mut snapshots: Vec<StateSnapshot> = nodes.iter().map(|n| n.snapshot()).collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    fn index(&self, node: Arc<StateNode>) {
        // The store's own tree is never a read-only mirror.
        if let Err(err) = self.tree.put(node) {
            error!("Failed to index state node: {err}");
        }
    }

    fn unindex(&self, key: &str) {
        if let Err(err) = self.tree.remove(key) {
            error!("Failed to unindex state node: {err}");
        }
    }

    /// Creates the node unless the key already exists. Returns the node for the
    /// key and whether this call created it.
    pub fn create(
        &self,
        key: &str,
        node_type: NodeType,
        status: i32,
        invalidate_status: i32,
        owner: Option<String>,
        epoch: i64,
    ) -> (Arc<StateNode>, bool) {
        match self.nodes.entry(key.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let node = StateNode::new(
                    key.to_string(),
                    node_type,
                    status,
                    invalidate_status,
                    owner,
                    epoch,
                    self.ctx.clone(),
                );
                self.index(node.clone());
                entry.insert(node.clone());
                debug!(key, epoch, "Created state node");
                (node, true)
            }
        }
    }

    /// Node for `key`, created with default statuses when absent.
    pub fn get_or_create(&self, key: &str, epoch: i64) -> Arc<StateNode> {
        if let Some(node) = self.get(key) {
            return node;
        }
        let (node, _) = self.create(
            key,
            NodeType::Temporary,
            DEFAULT_STATUS,
            DEFAULT_INVALIDATE_STATUS,
            None,
            epoch,
        );
        node
    }

    /// Inserts or replaces the node stored under its key.
    pub fn put(&self, node: Arc<StateNode>) -> Option<Arc<StateNode>> {
        let key = node.key().to_string();
        self.ctx.observe_xid(node.version());
        let previous = match self.nodes.entry(key) {
            Entry::Occupied(mut entry) => {
                self.index(node.clone());
                Some(entry.insert(node))
            }
            Entry::Vacant(entry) => {
                self.index(node.clone());
                entry.insert(node);
                None
            }
        };
        if let Some(previous) = &previous {
            previous.cancel();
        }
        previous
    }

    pub fn remove(&self, key: &str) -> Option<Arc<StateNode>> {
        let Entry::Occupied(entry) = self.nodes.entry(key.to_string()) else {
            return None;
        };
        self.unindex(key);
        let (_, node) = entry.remove_entry();
        node.cancel();
        debug!(key, "Removed state node");
        Some(node)
    }

    /// Applies a difference computed against this store's tree, without any
    /// staleness check. Added keys are created (or overwritten when the local
    /// copy is older), removed keys are deleted, updated keys are overwritten
    /// only when the incoming version is higher.
    pub fn apply_difference(&self, difference: &Difference) -> ApplyStats {
        let mut stats = ApplyStats::default();

        for snapshot in &difference.added {
            match self.nodes.entry(snapshot.key.clone()) {
                Entry::Occupied(entry) => {
                    if entry.get().update_if_newer(snapshot.clone()) {
                        stats.updated += 1;
                    }
                }
                Entry::Vacant(entry) => {
                    let node = StateNode::from_snapshot(snapshot.clone(), self.ctx.clone());
                    self.index(node.clone());
                    entry.insert(node);
                    stats.added += 1;
                }
            }
        }

        for snapshot in &difference.removed {
            if self.remove(&snapshot.key).is_some() {
                stats.removed += 1;
            }
        }

        for snapshot in &difference.updated {
            let Some(node) = self.get(&snapshot.key) else {
                continue;
            };
            if node.update_if_newer(snapshot.clone()) {
                stats.updated += 1;
            }
        }

        stats
    }

    /// Writes every node to `path` through a temp file and an atomic rename.
    pub fn persist(&self, path: &Path) -> Result<()> {
        let snapshot = SnapshotFile::from_store(self)?;
        let encoded = bincode::serde::encode_to_vec(&snapshot, snapshot_config())?;

        let tmp_path = path.with_extension("snapshot.tmp");
        write_synced(&tmp_path, &encoded)?;
        fs::rename(&tmp_path, path)?;
        sync_parent_dir(path);

        info!(
            nodes = snapshot.nodes.len(),
            max_xid = snapshot.max_xid,
            "Persisted snapshot to {}",
            path.display()
        );
        Ok(())
    }

    /// Rebuilds a store from a snapshot written by [`StateStore::persist`].
    /// Returns an empty store when the file does not exist.
    pub fn load(
        path: &Path,
        server_id: ServerId,
        hash_depth: u8,
        ctx: Arc<NodeContext>,
    ) -> Result<Self> {
        let store = Self::with_context(server_id, hash_depth, ctx)?;
        if !path.exists() {
            return Ok(store);
        }

        let buf = fs::read(path)?;
        let (snapshot, _): (SnapshotFile, _) =
            bincode::serde::decode_from_slice(&buf, snapshot_config())
                .context("Failed to deserialize snapshot")?;
        snapshot.validate(server_id)?;

        for node in snapshot.nodes {
            store.put(StateNode::from_snapshot(node, store.ctx.clone()));
        }
        store.raise_xid(snapshot.max_xid);

        info!(
            "Loaded {} state nodes from {}, max_xid={}",
            store.len(),
            path.display(),
            store.max_xid()
        );
        Ok(store)
    }

    pub fn status(&self) -> StoreStatus {
        StoreStatus {
            server_id: self.server_id,
            n_nodes: self.nodes.len(),
            max_xid: self.max_xid(),
            leaves: self.tree.leaf_count(),
        }
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

/// Makes a rename inside the directory durable. A failure leaves a valid
/// snapshot that might not survive a crash.
fn sync_parent_dir(path: &Path) {
    let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) else {
        return;
    };
    if let Err(e) = File::open(dir).and_then(|dir| dir.sync_all()) {
        warn!("Failed to sync directory {}: {e}", dir.display());
    }
}
