use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::ServerId;

pub const DEFAULT_HASH_DEPTH: u8 = 12;
pub const DEFAULT_REPLICATION_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_SYNC_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_SYNC_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_SYNC_WORKERS: usize = 4;

/// Node configuration, passed explicitly to every component constructor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server_id: ServerId,
    /// Other members of the cluster (excluding self)
    pub peers: Vec<ServerId>,
    pub hash_depth: u8,
    /// Bound on quorum acknowledgment collection
    pub replication_timeout_ms: u64,
    /// Bound on a diff round trip (`REQUIRE_DIFF`)
    pub sync_timeout_ms: u64,
    /// Bound on a single request of the push path (`REQUIRE_TREE`, `APPLY_DIFF`)
    pub rpc_timeout_ms: u64,
    pub sync_interval_ms: u64,
    pub sync_workers: usize,
    /// Overrides the strict-majority quorum
    pub quorum_size: Option<usize>,
    pub snapshot_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_id: 1,
            peers: Vec::new(),
            hash_depth: DEFAULT_HASH_DEPTH,
            replication_timeout_ms: DEFAULT_REPLICATION_TIMEOUT_MS,
            sync_timeout_ms: DEFAULT_SYNC_TIMEOUT_MS,
            rpc_timeout_ms: DEFAULT_RPC_TIMEOUT_MS,
            sync_interval_ms: DEFAULT_SYNC_INTERVAL_MS,
            sync_workers: DEFAULT_SYNC_WORKERS,
            quorum_size: None,
            snapshot_path: None,
        }
    }
}

impl Config {
    pub fn new(server_id: ServerId, peers: Vec<ServerId>) -> Self {
        let peers = peers.into_iter().filter(|&id| id != server_id).collect();
        Self {
            server_id,
            peers,
            ..Default::default()
        }
    }

    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Members that must hold a write for it to be durable, self included.
    pub fn quorum_size(&self) -> usize {
        self.quorum_size
            .unwrap_or_else(|| self.cluster_size() / 2 + 1)
    }

    /// Peer acknowledgments the leader waits for; the local apply counts as one vote.
    pub fn required_acks(&self) -> usize {
        self.quorum_size().saturating_sub(1)
    }

    pub fn replication_timeout(&self) -> Duration {
        Duration::from_millis(self.replication_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }
}
