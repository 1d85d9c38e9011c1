//! The versioned state node and its CAS / lease / watch state machine.
//!
//! Every write to a node happens under the node's own mutex, so CAS operations
//! on one key are serialized while different keys proceed independently. A
//! lease is enforced by a timer task tagged with a generation number; renewing
//! or clearing the lease aborts the running timer and bumps the generation, so
//! a timer that already woke up finds a stale generation and does nothing.
//! Expiry fires at most once per lease.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::{Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::error::CasError;
use crate::tree::TreeEntry;
use crate::types::{now_millis, NodeType, StateSnapshot, Watcher, INITIAL_VERSION};

/// Delivers watch notifications to client sessions.
///
/// Called on the blocking pool, never on a timer or request task.
pub trait WatchNotifier: Send + Sync + 'static {
    fn notify(&self, session_id: &str, key: &str, status: i32);
}

/// Notifier that drops every notification.
pub struct NoopNotifier;

impl WatchNotifier for NoopNotifier {
    fn notify(&self, _session_id: &str, _key: &str, _status: i32) {}
}

/// Shared facilities of all nodes of one store: the runtime that runs lease
/// timers, the notification sink and the highest version ever accepted.
pub struct NodeContext {
    runtime: Handle,
    notifier: Arc<dyn WatchNotifier>,
    max_xid: AtomicU64,
}

impl NodeContext {
    /// Binds to the runtime of the calling task. Fails outside a tokio
    /// runtime; use [`NodeContext::with_runtime`] there.
    pub fn new(notifier: Arc<dyn WatchNotifier>) -> Result<Self> {
        let runtime = Handle::try_current().context("No tokio runtime to run lease timers on")?;
        Ok(Self::with_runtime(runtime, notifier))
    }

    pub fn with_runtime(runtime: Handle, notifier: Arc<dyn WatchNotifier>) -> Self {
        Self {
            runtime,
            notifier,
            max_xid: AtomicU64::new(0),
        }
    }

    pub fn max_xid(&self) -> u64 {
        self.max_xid.load(Ordering::Acquire)
    }

    pub fn observe_xid(&self, xid: u64) {
        self.max_xid.fetch_max(xid, Ordering::AcqRel);
    }

    fn dispatch(&self, key: &str, status: i32, watchers: Vec<Watcher>) {
        if watchers.is_empty() {
            return;
        }
        let notifier = self.notifier.clone();
        let key = key.to_string();
        self.runtime.spawn_blocking(move || {
            for watcher in watchers {
                notifier.notify(&watcher.session_id, &key, status);
            }
        });
    }
}

struct NodeInner {
    version: u64,
    status: i32,
    invalidate_status: i32,
    owner: Option<String>,
    lease_expire_at: Option<i64>,
    node_type: NodeType,
    created_epoch: i64,
    watchers: Vec<Watcher>,
    lease_generation: u64,
    lease_timer: Option<AbortHandle>,
    removed: bool,
}

impl NodeInner {
    fn check(&self, expect: i32, owner: Option<&str>) -> Result<(), CasError> {
        if self.status != expect {
            return Err(CasError::StatusMismatch {
                expected: expect,
                actual: self.status,
            });
        }
        if let Some(current) = self.owner.as_deref() {
            if owner != Some(current) {
                return Err(CasError::OwnerMismatch {
                    current: self.owner.clone(),
                    caller: owner.map(str::to_string),
                });
            }
        }
        Ok(())
    }

    fn set_lease(&mut self, lease_millis: i64) {
        self.lease_expire_at = if lease_millis > 0 && self.node_type == NodeType::Temporary {
            Some(now_millis().saturating_add(lease_millis))
        } else {
            None
        };
    }

    fn take_watchers(&mut self, status: i32) -> Vec<Watcher> {
        let (fired, kept) = std::mem::take(&mut self.watchers)
            .into_iter()
            .partition(|w| w.expected_status == status);
        self.watchers = kept;
        fired
    }
}

pub struct StateNode {
    key: String,
    ctx: Arc<NodeContext>,
    inner: Mutex<NodeInner>,
}

impl std::fmt::Debug for StateNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("StateNode")
            .field("key", &self.key)
            .field("version", &inner.version)
            .field("status", &inner.status)
            .field("owner", &inner.owner)
            .finish()
    }
}

impl StateNode {
    pub fn new(
        key: String,
        node_type: NodeType,
        status: i32,
        invalidate_status: i32,
        owner: Option<String>,
        created_epoch: i64,
        ctx: Arc<NodeContext>,
    ) -> Arc<Self> {
        ctx.observe_xid(INITIAL_VERSION);
        Arc::new(Self {
            key,
            ctx,
            inner: Mutex::new(NodeInner {
                version: INITIAL_VERSION,
                status,
                invalidate_status,
                owner,
                lease_expire_at: None,
                node_type,
                created_epoch,
                watchers: Vec::new(),
                lease_generation: 0,
                lease_timer: None,
                removed: false,
            }),
        })
    }

    /// Rebuilds a node received from a peer or read from disk. A lease that is
    /// still running keeps its absolute expiry time.
    pub fn from_snapshot(snapshot: StateSnapshot, ctx: Arc<NodeContext>) -> Arc<Self> {
        ctx.observe_xid(snapshot.version);
        let node = Arc::new(Self {
            key: snapshot.key,
            ctx,
            inner: Mutex::new(NodeInner {
                version: snapshot.version,
                status: snapshot.status,
                invalidate_status: snapshot.invalidate_status,
                owner: snapshot.owner,
                lease_expire_at: snapshot.lease_expire_at,
                node_type: snapshot.node_type,
                created_epoch: snapshot.created_epoch,
                watchers: Vec::new(),
                lease_generation: 0,
                lease_timer: None,
                removed: false,
            }),
        });
        {
            let mut inner = node.inner.lock();
            node.arm_lease(&mut inner);
        }
        node
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    pub fn status(&self) -> i32 {
        self.inner.lock().status
    }

    pub fn owner(&self) -> Option<String> {
        self.inner.lock().owner.clone()
    }

    pub fn lease_expire_at(&self) -> Option<i64> {
        self.inner.lock().lease_expire_at
    }

    pub fn node_type(&self) -> NodeType {
        self.inner.lock().node_type
    }

    pub fn created_epoch(&self) -> i64 {
        self.inner.lock().created_epoch
    }

    pub fn watchers(&self) -> Vec<Watcher> {
        self.inner.lock().watchers.clone()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.inner.lock();
        StateSnapshot {
            key: self.key.clone(),
            version: inner.version,
            status: inner.status,
            invalidate_status: inner.invalidate_status,
            owner: inner.owner.clone(),
            lease_expire_at: inner.lease_expire_at,
            node_type: inner.node_type,
            created_epoch: inner.created_epoch,
        }
    }

    /// CAS on the status. On success the version advances by one, the lease is
    /// re-armed for `lease_millis` and watchers waiting for `new` fire.
    ///
    /// Returns the new version.
    pub fn set_status(
        self: &Arc<Self>,
        expect: i32,
        new: i32,
        owner: Option<&str>,
        lease_millis: i64,
    ) -> Result<u64, CasError> {
        let mut inner = self.inner.lock();
        inner.check(expect, owner)?;

        inner.status = new;
        inner.owner = owner.map(str::to_string);
        inner.version += 1;
        inner.set_lease(lease_millis);
        self.arm_lease(&mut inner);
        let version = inner.version;
        let fired = inner.take_watchers(new);
        drop(inner);

        self.ctx.observe_xid(version);
        trace!(key = self.key, version, status = new, "Status updated");
        self.ctx.dispatch(&self.key, new, fired);
        Ok(version)
    }

    /// CAS-guarded lease renewal. Status and version are left as they are.
    pub fn expand_lease(
        self: &Arc<Self>,
        expect: i32,
        owner: Option<&str>,
        lease_millis: i64,
    ) -> Result<(), CasError> {
        let mut inner = self.inner.lock();
        inner.check(expect, owner)?;
        inner.set_lease(lease_millis);
        self.arm_lease(&mut inner);
        Ok(())
    }

    /// Registers a one-shot watcher. Fires right away when the node already has
    /// the expected status; returns whether it did.
    pub fn watch(&self, session_id: &str, expected_status: i32) -> bool {
        let watcher = Watcher {
            session_id: session_id.to_string(),
            expected_status,
        };
        let mut inner = self.inner.lock();
        if inner.status == expected_status {
            drop(inner);
            self.ctx.dispatch(&self.key, expected_status, vec![watcher]);
            return true;
        }
        if !inner.watchers.contains(&watcher) {
            inner.watchers.push(watcher);
        }
        false
    }

    /// Unconditional overwrite used by anti-entropy. The caller has already
    /// decided that `snapshot` is authoritative.
    pub fn update(self: &Arc<Self>, snapshot: StateSnapshot) {
        let inner = self.inner.lock();
        self.overwrite(inner, snapshot);
    }

    /// Last-writer-wins by version: overwrites only when `snapshot` is newer.
    pub fn update_if_newer(self: &Arc<Self>, snapshot: StateSnapshot) -> bool {
        let inner = self.inner.lock();
        if snapshot.version <= inner.version {
            return false;
        }
        self.overwrite(inner, snapshot);
        true
    }

    fn overwrite(self: &Arc<Self>, mut inner: MutexGuard<'_, NodeInner>, snapshot: StateSnapshot) {
        let status_changed = inner.status != snapshot.status;
        inner.version = snapshot.version;
        inner.status = snapshot.status;
        inner.invalidate_status = snapshot.invalidate_status;
        inner.owner = snapshot.owner;
        inner.lease_expire_at = snapshot.lease_expire_at;
        inner.node_type = snapshot.node_type;
        inner.created_epoch = snapshot.created_epoch;
        self.arm_lease(&mut inner);
        let version = inner.version;
        let status = inner.status;
        let fired = if status_changed {
            inner.take_watchers(status)
        } else {
            Vec::new()
        };
        drop(inner);

        self.ctx.observe_xid(version);
        self.ctx.dispatch(&self.key, status, fired);
    }

    /// Detaches the node from its store and stops its lease timer.
    pub fn cancel(&self) {
        let mut inner = self.inner.lock();
        inner.removed = true;
        inner.lease_generation += 1;
        inner.lease_expire_at = None;
        if let Some(timer) = inner.lease_timer.take() {
            timer.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn lease_timer(&self) -> Option<AbortHandle> {
        self.inner.lock().lease_timer.clone()
    }

    /// Replaces the running lease timer, if any, with one for the current
    /// lease. At most one timer per node is alive at a time.
    fn arm_lease(self: &Arc<Self>, inner: &mut NodeInner) {
        inner.lease_generation += 1;
        if let Some(timer) = inner.lease_timer.take() {
            timer.abort();
        }
        if inner.removed || inner.node_type != NodeType::Temporary {
            return;
        }
        let Some(expire_at) = inner.lease_expire_at else {
            return;
        };
        let generation = inner.lease_generation;
        let delay = Duration::from_millis(expire_at.saturating_sub(now_millis()).max(0) as u64);
        let node: Weak<StateNode> = Arc::downgrade(self);
        let timer = self.ctx.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(node) = node.upgrade() {
                node.expire(generation);
            }
        });
        inner.lease_timer = Some(timer.abort_handle());
    }

    fn expire(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.removed || inner.lease_generation != generation || inner.lease_expire_at.is_none()
        {
            return;
        }
        inner.lease_timer = None;
        let status = inner.invalidate_status;
        inner.status = status;
        inner.owner = None;
        inner.lease_expire_at = None;
        inner.version += 1;
        let version = inner.version;
        let fired = inner.take_watchers(status);
        drop(inner);

        self.ctx.observe_xid(version);
        debug!(key = self.key, version, status, "Lease expired");
        self.ctx.dispatch(&self.key, status, fired);
    }
}

impl TreeEntry for Arc<StateNode> {
    fn key(&self) -> &str {
        &self.key
    }

    fn version(&self) -> u64 {
        StateNode::version(self)
    }

    fn snapshot(&self) -> StateSnapshot {
        StateNode::snapshot(self)
    }
}
