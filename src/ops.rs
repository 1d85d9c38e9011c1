use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::store::StateStore;
use crate::types::{NodeType, ReplyStatus};

/// A state change proposed by a client or forwarded by the leader. This is
/// the unit replicated to the quorum.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Mutation {
    /// Create-if-absent. An existing key is left as it is.
    Create {
        key: String,
        owner: Option<String>,
        init_status: i32,
        invalidate_status: i32,
        node_type: NodeType,
    },

    /// CAS on the status, re-arming the lease.
    UpdateStatus {
        key: String,
        expect_status: i32,
        new_status: i32,
        owner: Option<String>,
        lease: i64,
    },

    /// CAS-guarded lease renewal.
    UpdateLease {
        key: String,
        expect_status: i32,
        owner: Option<String>,
        lease: i64,
    },

    /// One-shot notification when the node reaches `expect_status`.
    Watch {
        session_id: String,
        key: String,
        expect_status: i32,
    },
}

impl Mutation {
    pub fn key(&self) -> &str {
        match self {
            Mutation::Create { key, .. }
            | Mutation::UpdateStatus { key, .. }
            | Mutation::UpdateLease { key, .. }
            | Mutation::Watch { key, .. } => key,
        }
    }

    /// Whether the target key must already exist for the mutation to be
    /// accepted at all.
    pub fn requires_existing(&self) -> bool {
        matches!(self, Mutation::UpdateLease { .. } | Mutation::Watch { .. })
    }

    /// Applies the mutation to the local store, creating the target node with
    /// default statuses where needed. `epoch` stamps newly created nodes.
    ///
    /// CAS failures leave the node untouched and come back as the matching
    /// reply status.
    pub fn apply(&self, store: &StateStore, epoch: i64) -> ReplyStatus {
        let outcome = match self {
            Mutation::Create {
                key,
                owner,
                init_status,
                invalidate_status,
                node_type,
            } => {
                store.create(
                    key,
                    *node_type,
                    *init_status,
                    *invalidate_status,
                    owner.clone(),
                    epoch,
                );
                Ok(())
            }
            Mutation::UpdateStatus {
                key,
                expect_status,
                new_status,
                owner,
                lease,
            } => store
                .get_or_create(key, epoch)
                .set_status(*expect_status, *new_status, owner.as_deref(), *lease)
                .map(|_| ()),
            Mutation::UpdateLease {
                key,
                expect_status,
                owner,
                lease,
            } => store
                .get_or_create(key, epoch)
                .expand_lease(*expect_status, owner.as_deref(), *lease),
            Mutation::Watch {
                session_id,
                key,
                expect_status,
            } => {
                store.get_or_create(key, epoch).watch(session_id, *expect_status);
                Ok(())
            }
        };

        match outcome {
            Ok(()) => ReplyStatus::Success,
            Err(err) => {
                trace!(key = self.key(), "Mutation rejected: {err}");
                err.reply_status()
            }
        }
    }
}
