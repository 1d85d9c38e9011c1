use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{MalformedMessage, ReplicationError};
use crate::message::{Message, Payload};
use crate::replication::{LeaderState, MutationReplicator};
use crate::state::{NodeContext, WatchNotifier};
use crate::store::StateStore;
use crate::sync::{Messenger, ReconciliationService};

/// One coordination server: the store plus the two paths that change it,
/// wired from a [`Config`] and the election and transport collaborators.
pub struct Server<L, M> {
    config: Config,
    store: Arc<StateStore>,
    replicator: MutationReplicator<L, M>,
    reconciliation: Arc<ReconciliationService<M>>,
}

impl<L: LeaderState, M: Messenger> Server<L, M> {
    /// Builds the server, restoring state from `config.snapshot_path` when one
    /// is configured and present.
    pub fn new(
        config: Config,
        leader: Arc<L>,
        messenger: Arc<M>,
        notifier: Arc<dyn WatchNotifier>,
    ) -> Result<Self> {
        let ctx = Arc::new(NodeContext::new(notifier)?);
        let store = match &config.snapshot_path {
            Some(path) => StateStore::load(path, config.server_id, config.hash_depth, ctx)
                .with_context(|| format!("Failed to load snapshot from {}", path.display()))?,
            None => StateStore::with_context(config.server_id, config.hash_depth, ctx)?,
        };
        let store = Arc::new(store);

        let replicator = MutationReplicator::new(&config, store.clone(), leader, messenger.clone());
        let reconciliation = Arc::new(ReconciliationService::new(&config, store.clone(), messenger));

        info!(
            server_id = config.server_id,
            peers = config.peers.len(),
            quorum = config.quorum_size(),
            "Server initialized with {} state nodes",
            store.len()
        );

        Ok(Self {
            config,
            store,
            replicator,
            reconciliation,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn replicator(&self) -> &MutationReplicator<L, M> {
        &self.replicator
    }

    pub fn reconciliation(&self) -> &Arc<ReconciliationService<M>> {
        &self.reconciliation
    }

    pub fn start_sync_tasks(&self) -> JoinHandle<()> {
        self.reconciliation.clone().start_sync_tasks()
    }

    /// Writes a snapshot to the configured path. No-op without one.
    pub fn persist(&self) -> Result<()> {
        match &self.config.snapshot_path {
            Some(path) => self.store.persist(path),
            None => Ok(()),
        }
    }

    /// Handles one request. `None` means the request was dropped: the server
    /// is unavailable, the write missed its quorum, or the message was not a
    /// request at all. The originator is expected to retry.
    pub async fn handle(&self, message: Message) -> Option<Message> {
        let payload = match &message.payload {
            Payload::Mutation(mutation) => {
                match self.replicator.replicate(mutation.clone()).await {
                    Ok(status) => Payload::ReplyMutation(status),
                    Err(ReplicationError::NoQuorum { acks, required }) => {
                        warn!(
                            key = mutation.key(),
                            acks, required, "No quorum nodes are alive, dropping the mutation"
                        );
                        return None;
                    }
                    Err(ReplicationError::Unavailable(e)) => {
                        warn!(key = mutation.key(), "{e}, dropping the mutation");
                        return None;
                    }
                }
            }
            Payload::RequireDiff(request) => {
                match self.reconciliation.handle_require_diff(request.clone()).await {
                    Ok(result) => Payload::DiffResult(result),
                    Err(e) => {
                        warn!("Failed to compute difference: {e:#}");
                        return None;
                    }
                }
            }
            Payload::RequireTree => match self.reconciliation.handle_require_tree().await {
                Ok(image) => Payload::Tree(image),
                Err(e) => {
                    warn!("Failed to serialize tree: {e:#}");
                    return None;
                }
            },
            Payload::ApplyDiff(difference) => {
                Payload::ApplyDiffResult(self.reconciliation.handle_apply_diff(difference))
            }
            Payload::ReplyMutation(_)
            | Payload::DiffResult(_)
            | Payload::Tree(_)
            | Payload::ApplyDiffResult(_) => {
                debug!(verb = ?message.verb(), id = message.id, "Ignoring unsolicited reply");
                return None;
            }
        };
        Some(message.reply(payload))
    }

    /// Decodes a frame, handles it and encodes the reply. Decode failures are
    /// returned to the transport, which owns the connection.
    pub async fn handle_frame(&self, frame: &[u8]) -> Result<Option<Vec<u8>>, MalformedMessage> {
        let message = Message::decode(frame)?;
        match self.handle(message).await {
            Some(reply) => Ok(Some(reply.encode()?)),
            None => Ok(None),
        }
    }
}
