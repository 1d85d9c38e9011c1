//! Quorum write path.
//!
//! Every mutation is applied to the local store first. Only then, and only on
//! the leader, is it sent to the peers; the leader waits for enough replies to
//! form a strict majority together with its own vote. A failed quorum is not
//! rolled back: the local change stays and anti-entropy settles the replicas
//! later.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::error::{ReplicationError, Unavailable};
use crate::message::{Message, Payload};
use crate::ops::Mutation;
use crate::store::StateStore;
use crate::sync::Messenger;
use crate::types::{ReplyStatus, ServerId};

/// Leadership facts provided by the election layer.
pub trait LeaderState: Send + Sync + 'static {
    fn is_leader(&self) -> bool;

    /// Current election generation, stamped on newly created nodes.
    fn epoch(&self) -> i64;

    /// Fails while the server is electing or not running.
    fn assert_available(&self) -> Result<(), Unavailable>;
}

pub struct MutationReplicator<L, M> {
    store: Arc<StateStore>,
    leader: Arc<L>,
    messenger: Arc<M>,
    peers: Vec<ServerId>,
    required_acks: usize,
    timeout: Duration,
    delivery_timeout: Duration,
}

impl<L: LeaderState, M: Messenger> MutationReplicator<L, M> {
    pub fn new(config: &Config, store: Arc<StateStore>, leader: Arc<L>, messenger: Arc<M>) -> Self {
        Self {
            store,
            leader,
            messenger,
            peers: config.peers.clone(),
            required_acks: config.required_acks(),
            timeout: config.replication_timeout(),
            delivery_timeout: config.rpc_timeout(),
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn required_acks(&self) -> usize {
        self.required_acks
    }

    /// Applies `mutation` locally and, on the leader, replicates it.
    ///
    /// CAS failures and missing keys are business outcomes and come back as
    /// `Ok` with the matching status; nothing is replicated for them.
    /// `Err` means the request must be dropped.
    pub async fn replicate(&self, mutation: Mutation) -> Result<ReplyStatus, ReplicationError> {
        if mutation.requires_existing() && !self.store.contains_key(mutation.key()) {
            return Ok(ReplyStatus::NodeMissing);
        }

        self.leader.assert_available()?;

        let status = mutation.apply(&self.store, self.leader.epoch());
        if status != ReplyStatus::Success {
            return Ok(status);
        }

        if self.leader.is_leader() {
            self.synchronize_to_quorum(&mutation).await?;
        } else {
            trace!(key = mutation.key(), "Applied forwarded mutation");
        }

        Ok(status)
    }

    /// Sends `mutation` to every peer and waits for `required_acks` replies.
    ///
    /// Each send runs as its own task bounded by the delivery timeout, so
    /// reaching the quorum or giving up on it only ends the wait; the
    /// remaining peers still receive the write.
    #[tracing::instrument(skip(self, mutation), fields(key = mutation.key()))]
    async fn synchronize_to_quorum(&self, mutation: &Mutation) -> Result<(), ReplicationError> {
        let required = self.required_acks;
        let request = Message::new(Payload::Mutation(mutation.clone()));
        let mut pending: FuturesUnordered<JoinHandle<(ServerId, Result<Message>)>> = self
            .peers
            .iter()
            .map(|&peer| {
                let messenger = self.messenger.clone();
                let request = request.clone();
                let delivery_timeout = self.delivery_timeout;
                tokio::spawn(async move {
                    let reply = match tokio::time::timeout(
                        delivery_timeout,
                        messenger.send(peer, request),
                    )
                    .await
                    {
                        Ok(reply) => reply,
                        Err(_) => Err(anyhow!("no reply within {delivery_timeout:?}")),
                    };
                    (peer, reply)
                })
            })
            .collect();

        if required == 0 {
            return Ok(());
        }

        let mut acks = 0usize;
        let collect = async {
            while let Some(joined) = pending.next().await {
                let (peer, reply) = match joined {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!("Replication task failed: {e}");
                        continue;
                    }
                };
                match reply {
                    Ok(reply) if matches!(reply.payload, Payload::ReplyMutation(_)) => {
                        acks += 1;
                        if acks >= required {
                            break;
                        }
                    }
                    Ok(reply) => {
                        warn!(peer, verb = ?reply.verb(), "Unexpected reply to mutation")
                    }
                    Err(e) => debug!(peer, "Mutation replication failed: {e}"),
                }
            }
        };
        if tokio::time::timeout(self.timeout, collect).await.is_err() {
            debug!("Replication timed out after {:?}", self.timeout);
        }

        if acks < required {
            return Err(ReplicationError::NoQuorum { acks, required });
        }
        Ok(())
    }
}
