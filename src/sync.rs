//! Background anti-entropy between replicas.
//!
//! Two directions are supported:
//!
//! - pull: send our `(max_xid, tree)` to a peer, which diffs its own tree
//!   against it and answers with a [`DiffResult`] we apply if the peer is fresher
//! - push: fetch a peer's tree, diff our tree against it and send the
//!   [`Difference`] over for the peer to apply
//!
//! Every round trip runs as a spawned task bounded by a shared worker
//! semaphore and its own timeout, independent of the replication path.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::message::{Message, Payload};
use crate::store::{ApplyStats, StateStore};
use crate::tree::{Difference, HashTree, RemoteEntry, TreeImage};
use crate::types::ServerId;

/// Request/response transport to other servers.
pub trait Messenger: Send + Sync + 'static {
    fn send(
        &self,
        peer: ServerId,
        message: Message,
    ) -> impl Future<Output = Result<Message>> + Send;
}

/// Body of `REQUIRE_DIFF`: the sender's staleness watermark and tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequireDiff {
    pub max_xid: u64,
    pub tree: TreeImage,
}

/// What the receiver of a `REQUIRE_DIFF` returns: how the sender must change
/// to match the receiver, plus the receiver's watermark.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffResult {
    pub max_xid: u64,
    pub difference: Difference,
}

/// Handle to a reconciliation task running on the sync worker pool.
pub struct SyncHandle<T> {
    peer: ServerId,
    handle: JoinHandle<Result<T>>,
}

impl<T> SyncHandle<T> {
    pub fn peer(&self) -> ServerId {
        self.peer
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Waits for the task and returns its outcome.
    pub async fn join(self) -> Result<T> {
        self.handle
            .await
            .with_context(|| format!("Sync task for peer {} did not complete", self.peer))?
    }
}

pub struct ReconciliationService<M> {
    store: Arc<StateStore>,
    messenger: Arc<M>,
    peers: Vec<ServerId>,
    workers: Arc<Semaphore>,
    sync_timeout: Duration,
    rpc_timeout: Duration,
    sync_interval: Duration,
}

impl<M: Messenger> ReconciliationService<M> {
    pub fn new(config: &Config, store: Arc<StateStore>, messenger: Arc<M>) -> Self {
        Self {
            store,
            messenger,
            peers: config.peers.clone(),
            workers: Arc::new(Semaphore::new(config.sync_workers.max(1))),
            sync_timeout: config.sync_timeout(),
            rpc_timeout: config.rpc_timeout(),
            sync_interval: config.sync_interval(),
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    fn spawn<T, F>(&self, peer: ServerId, task: F) -> SyncHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let workers = self.workers.clone();
        let handle = tokio::spawn(async move {
            let _permit = workers
                .acquire_owned()
                .await
                .context("Sync worker pool closed")?;
            task.await
        });
        SyncHandle { peer, handle }
    }

    /// Runs CPU-bound tree work for a peer request on the blocking pool,
    /// bounded by the same permits as outgoing reconciliation.
    async fn run_on_worker<T, F>(&self, task: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let _permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .context("Sync worker pool closed")?;
        blocking(task).await
    }

    /// Sends our tree to `peer` and returns what it says we are missing.
    pub fn request_diff(&self, peer: ServerId) -> SyncHandle<DiffResult> {
        let store = self.store.clone();
        let messenger = self.messenger.clone();
        let timeout = self.sync_timeout;
        self.spawn(peer, async move { fetch_diff(&store, &*messenger, peer, timeout).await })
    }

    /// Answers a `REQUIRE_DIFF`: the difference that turns the sender's tree
    /// into ours. The hashing runs on the blocking pool under a worker permit.
    #[tracing::instrument(skip(self, request), fields(remote_xid = request.max_xid))]
    pub async fn handle_require_diff(&self, request: RequireDiff) -> Result<DiffResult> {
        let store = self.store.clone();
        self.run_on_worker(move || {
            let remote = HashTree::<RemoteEntry>::from_image(request.tree)
                .context("Failed to rebuild remote tree")?;
            store.tree().load_hash()?;
            let difference = store.tree().difference(&remote);
            debug!(
                added = difference.added.len(),
                removed = difference.removed.len(),
                updated = difference.updated.len(),
                "Computed difference for peer"
            );
            Ok(DiffResult {
                max_xid: store.max_xid(),
                difference,
            })
        })
        .await
    }

    /// Applies a pulled result unless the peer is not fresher than we are.
    /// Returns `None` when the result was ignored as stale.
    pub fn apply_diff(&self, result: &DiffResult) -> Option<ApplyStats> {
        apply_pulled(&self.store, result)
    }

    /// Pull from `peer` and apply, logging rather than returning failures.
    pub fn sync_from_remote(&self, peer: ServerId) -> SyncHandle<Option<ApplyStats>> {
        let store = self.store.clone();
        let messenger = self.messenger.clone();
        let timeout = self.sync_timeout;
        self.spawn(peer, async move {
            match fetch_diff(&store, &*messenger, peer, timeout).await {
                Ok(result) => Ok(apply_pulled(&store, &result)),
                Err(e) => {
                    warn!("Failed to sync data from peer {peer}: {e:#}");
                    Ok(None)
                }
            }
        })
    }

    /// Pushes our state to each of `peers`. Every handle resolves to whether a
    /// non-empty difference was sent and accepted.
    pub fn push_local_to_remote(&self, peers: &[ServerId]) -> Vec<SyncHandle<bool>> {
        peers
            .iter()
            .map(|&peer| {
                let store = self.store.clone();
                let messenger = self.messenger.clone();
                let timeout = self.rpc_timeout;
                self.spawn(peer, async move { push_to(&store, &*messenger, peer, timeout).await })
            })
            .collect()
    }

    /// Answers a `REQUIRE_TREE` with the current tree.
    pub async fn handle_require_tree(&self) -> Result<TreeImage> {
        let store = self.store.clone();
        self.run_on_worker(move || {
            store.tree().load_hash()?;
            Ok(store.tree().to_image())
        })
        .await
    }

    /// Answers an `APPLY_DIFF`. The sender diffed against our own tree, so the
    /// difference is applied without the staleness check.
    #[tracing::instrument(skip(self, difference), fields(changes = difference.len()))]
    pub fn handle_apply_diff(&self, difference: &Difference) -> u8 {
        let stats = self.store.apply_difference(difference);
        debug!(?stats, "Applied pushed difference");
        0
    }

    /// Starts the periodic pull from every peer.
    pub fn start_sync_tasks(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.periodic_sync().await;
        })
    }

    async fn periodic_sync(&self) {
        let mut ticker = interval(self.sync_interval);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            for &peer in &self.peers {
                // Fire and forget; failures are logged by the task itself.
                drop(self.sync_from_remote(peer));
            }
        }
    }
}

/// Callers already hold a worker permit or take one first.
async fn blocking<T, F>(task: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .context("Tree computation did not complete")?
}

async fn call<M: Messenger>(
    messenger: &M,
    peer: ServerId,
    payload: Payload,
    timeout: Duration,
) -> Result<Payload> {
    let request = Message::new(payload);
    let reply = tokio::time::timeout(timeout, messenger.send(peer, request))
        .await
        .map_err(|_| anyhow!("Request to peer {peer} timed out after {timeout:?}"))??;
    Ok(reply.payload)
}

#[tracing::instrument(skip(store, messenger, timeout))]
async fn fetch_diff<M: Messenger>(
    store: &Arc<StateStore>,
    messenger: &M,
    peer: ServerId,
    timeout: Duration,
) -> Result<DiffResult> {
    let local = store.clone();
    let request = blocking(move || {
        local.tree().load_hash()?;
        Ok(RequireDiff {
            max_xid: local.max_xid(),
            tree: local.tree().to_image(),
        })
    })
    .await?;
    match call(messenger, peer, Payload::RequireDiff(request), timeout).await? {
        Payload::DiffResult(result) => Ok(result),
        other => bail!("Peer {peer} answered REQUIRE_DIFF with {:?}", other.verb()),
    }
}

#[tracing::instrument(skip(store, messenger, timeout))]
async fn push_to<M: Messenger>(
    store: &Arc<StateStore>,
    messenger: &M,
    peer: ServerId,
    timeout: Duration,
) -> Result<bool> {
    let image = match call(messenger, peer, Payload::RequireTree, timeout).await? {
        Payload::Tree(image) => image,
        other => bail!("Peer {peer} answered REQUIRE_TREE with {:?}", other.verb()),
    };
    let local = store.clone();
    let difference = blocking(move || {
        let remote = HashTree::<RemoteEntry>::from_image(image)
            .with_context(|| format!("Failed to rebuild tree of peer {peer}"))?;
        local.tree().load_hash()?;
        Ok(local.tree().difference(&remote))
    })
    .await?;
    if !difference.has_differences() {
        debug!("Peer {peer} is up to date");
        return Ok(false);
    }

    let changes = difference.len();
    match call(messenger, peer, Payload::ApplyDiff(difference), timeout).await? {
        Payload::ApplyDiffResult(0) => {
            info!("Pushed {changes} changes to peer {peer}");
            Ok(true)
        }
        Payload::ApplyDiffResult(code) => bail!("Peer {peer} rejected pushed difference: {code}"),
        other => bail!("Peer {peer} answered APPLY_DIFF with {:?}", other.verb()),
    }
}

fn apply_pulled(store: &StateStore, result: &DiffResult) -> Option<ApplyStats> {
    let local_xid = store.max_xid();
    if result.max_xid <= local_xid {
        debug!(
            remote_xid = result.max_xid,
            local_xid, "Ignoring difference from a peer that is not fresher"
        );
        return None;
    }
    let stats = store.apply_difference(&result.difference);
    store.raise_xid(result.max_xid);
    debug!(?stats, xid = result.max_xid, "Applied pulled difference");
    Some(stats)
}
