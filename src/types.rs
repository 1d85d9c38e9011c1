use std::fmt;

use serde::{Deserialize, Serialize};

pub type ServerId = u32;

/// Status a node starts with when it is created implicitly by a CAS or watch
/// request against an absent key.
pub const DEFAULT_STATUS: i32 = 0;
pub const DEFAULT_INVALIDATE_STATUS: i32 = 0;

/// Version assigned to a node created by a local write.
pub const INITIAL_VERSION: u64 = 1;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum NodeType {
    /// Owned through a lease; falls back to its invalidate status on expiry.
    #[default]
    Temporary,
    Persistent,
}

/// Point-in-time copy of a state node, the unit exchanged by anti-entropy.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateSnapshot {
    pub key: String,
    pub version: u64,
    pub status: i32,
    pub invalidate_status: i32,
    pub owner: Option<String>,
    /// Absolute lease expiry in epoch milliseconds
    pub lease_expire_at: Option<i64>,
    pub node_type: NodeType,
    pub created_epoch: i64,
}

impl fmt::Debug for StateSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateSnapshot")
            .field("key", &self.key)
            .field("version", &self.version)
            .field("status", &self.status)
            .field("owner", &self.owner)
            .field("lease", &self.lease_expire_at.is_some())
            .finish()
    }
}

impl StateSnapshot {
    /// Snapshot that only identifies a key and the version a peer holds for it.
    pub fn key_only(key: String, version: u64) -> Self {
        Self {
            key,
            version,
            status: DEFAULT_STATUS,
            invalidate_status: DEFAULT_INVALIDATE_STATUS,
            owner: None,
            lease_expire_at: None,
            node_type: NodeType::default(),
            created_epoch: 0,
        }
    }
}

/// One-shot watch registered by a client session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Watcher {
    pub session_id: String,
    pub expected_status: i32,
}

/// Outcome of a mutation as reported back to its originator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReplyStatus {
    Success,
    StatusCas,
    OwnerCas,
    NodeMissing,
}

impl ReplyStatus {
    pub fn code(self) -> i32 {
        match self {
            ReplyStatus::Success => 0,
            ReplyStatus::StatusCas => 1,
            ReplyStatus::OwnerCas => 2,
            ReplyStatus::NodeMissing => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(ReplyStatus::Success),
            1 => Some(ReplyStatus::StatusCas),
            2 => Some(ReplyStatus::OwnerCas),
            3 => Some(ReplyStatus::NodeMissing),
            _ => None,
        }
    }
}
