use crate::config::Config;
use crate::error::{CasError, ReplicationError, Unavailable};
use crate::message::{Message, Payload};
use crate::ops::Mutation;
use crate::replication::{LeaderState, MutationReplicator};
use crate::server::Server;
use crate::state::{NodeContext, NoopNotifier, WatchNotifier};
use crate::store::StateStore;
use crate::sync::{Messenger, ReconciliationService, RequireDiff};
use crate::tree::{HashTree, RemoteEntry};
use crate::types::{NodeType, ReplyStatus, ServerId, StateSnapshot};
use anyhow::{anyhow, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::{sleep, timeout, Duration};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

type Notification = (String, String, i32);

/// Forwards every notification into a channel the test can await.
struct ChannelNotifier(mpsc::UnboundedSender<Notification>);

impl WatchNotifier for ChannelNotifier {
    fn notify(&self, session_id: &str, key: &str, status: i32) {
        let _ = self
            .0
            .send((session_id.to_string(), key.to_string(), status));
    }
}

fn notifying_store(id: ServerId) -> (StateStore, mpsc::UnboundedReceiver<Notification>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let store = StateStore::new(id, 8, Arc::new(ChannelNotifier(tx))).unwrap();
    (store, rx)
}

fn new_store(id: ServerId) -> StateStore {
    StateStore::new(id, 8, Arc::new(NoopNotifier)).unwrap()
}

async fn next_notification(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Notification {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("notification timed out")
        .expect("notifier dropped")
}

async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Notification>) {
    assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
}

struct StaticLeader {
    leader: AtomicBool,
    available: AtomicBool,
    epoch: i64,
}

impl StaticLeader {
    fn leader() -> Arc<Self> {
        Arc::new(Self {
            leader: AtomicBool::new(true),
            available: AtomicBool::new(true),
            epoch: 7,
        })
    }

    fn follower() -> Arc<Self> {
        let state = Self::leader();
        state.leader.store(false, Ordering::SeqCst);
        state
    }
}

impl LeaderState for StaticLeader {
    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    fn epoch(&self) -> i64 {
        self.epoch
    }

    fn assert_available(&self) -> Result<(), Unavailable> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Unavailable("electing".to_string()))
        }
    }
}

/// A peer network where nobody answers.
struct NullMessenger;

impl Messenger for NullMessenger {
    async fn send(&self, peer: ServerId, _message: Message) -> Result<Message> {
        Err(anyhow!("peer {peer} unreachable"))
    }
}

/// Acknowledges mutations, except for peers that refuse outright and peers
/// that never answer.
#[derive(Default)]
struct QuorumMessenger {
    refusing: HashSet<ServerId>,
    silent: HashSet<ServerId>,
    sent: AtomicUsize,
}

impl Messenger for QuorumMessenger {
    async fn send(&self, peer: ServerId, message: Message) -> Result<Message> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        if self.refusing.contains(&peer) {
            return Err(anyhow!("connection refused by {peer}"));
        }
        if self.silent.contains(&peer) {
            std::future::pending::<()>().await;
        }
        Ok(message.reply(Payload::ReplyMutation(ReplyStatus::Success)))
    }
}

/// Acknowledges every mutation after `20ms * peer` and records who got it.
#[derive(Default)]
struct SlowMessenger {
    delivered: parking_lot::Mutex<Vec<ServerId>>,
}

impl SlowMessenger {
    fn delivered(&self) -> Vec<ServerId> {
        let mut peers = self.delivered.lock().clone();
        peers.sort_unstable();
        peers
    }
}

impl Messenger for SlowMessenger {
    async fn send(&self, peer: ServerId, message: Message) -> Result<Message> {
        sleep(Duration::from_millis(20 * peer as u64)).await;
        self.delivered.lock().push(peer);
        Ok(message.reply(Payload::ReplyMutation(ReplyStatus::Success)))
    }
}

type Follower = Server<StaticLeader, NullMessenger>;

/// Routes every request through the wire codec into in-process servers.
struct LocalNetwork {
    servers: HashMap<ServerId, Arc<Follower>>,
}

impl Messenger for LocalNetwork {
    async fn send(&self, peer: ServerId, message: Message) -> Result<Message> {
        let server = self
            .servers
            .get(&peer)
            .ok_or_else(|| anyhow!("unknown peer {peer}"))?;
        let frame = message.encode()?;
        let reply = server
            .handle_frame(&frame)
            .await?
            .ok_or_else(|| anyhow!("peer {peer} dropped the request"))?;
        Ok(Message::decode(&reply)?)
    }
}

fn follower(id: ServerId, peers: Vec<ServerId>) -> Arc<Follower> {
    let mut config = Config::new(id, peers);
    config.hash_depth = 8;
    Arc::new(
        Server::new(
            config,
            StaticLeader::follower(),
            Arc::new(NullMessenger),
            Arc::new(NoopNotifier),
        )
        .unwrap(),
    )
}

fn keys_and_versions(store: &StateStore) -> Vec<(String, u64)> {
    store
        .snapshots()
        .into_iter()
        .map(|s| (s.key, s.version))
        .collect()
}

#[tokio::test]
async fn test_set_status_is_cas_and_bumps_version() {
    let store = new_store(1);
    let (node, created) = store.create("job/1", NodeType::Temporary, 0, 0, None, 3);
    assert!(created);
    assert_eq!(node.version(), 1);
    assert_eq!(node.created_epoch(), 3);

    assert_eq!(node.set_status(0, 5, None, 0).unwrap(), 2);
    assert_eq!(node.set_status(5, 6, None, 0).unwrap(), 3);

    // Wrong expectation: nothing changes.
    let err = node.set_status(5, 7, None, 0).unwrap_err();
    assert_eq!(
        err,
        CasError::StatusMismatch {
            expected: 5,
            actual: 6
        }
    );
    assert_eq!(err.reply_status(), ReplyStatus::StatusCas);
    assert_eq!(node.version(), 3);
    assert_eq!(node.status(), 6);
    assert_eq!(store.max_xid(), 3);
}

#[tokio::test]
async fn test_owner_exclusivity() {
    let store = new_store(1);
    let node = store.get_or_create("lock/b", 1);

    node.set_status(0, 1, Some("n1"), 0).unwrap();
    assert_eq!(node.owner().as_deref(), Some("n1"));

    let err = node.set_status(1, 0, Some("n2"), 0).unwrap_err();
    assert_eq!(err.reply_status(), ReplyStatus::OwnerCas);
    let err = node.set_status(1, 0, None, 0).unwrap_err();
    assert!(matches!(err, CasError::OwnerMismatch { .. }));
    assert_eq!(node.version(), 2);
    assert_eq!(node.owner().as_deref(), Some("n1"));

    // Only the owner may move it on.
    assert_eq!(node.set_status(1, 0, Some("n1"), 0).unwrap(), 3);
    assert!(node.set_status(0, 1, Some("n2"), 0).is_err());

    // An unowned node accepts anyone.
    let free = store.get_or_create("lock/free", 1);
    assert_eq!(free.set_status(0, 1, Some("n2"), 0).unwrap(), 2);
}

#[tokio::test]
async fn test_lease_expiry_releases_lock() {
    init_tracing();
    let (store, mut rx) = notifying_store(1);
    let (node, _) = store.create("lock/a", NodeType::Temporary, 0, 1, None, 1);

    assert!(!node.watch("session-1", 1));
    assert_eq!(node.set_status(0, 1, Some("n1"), 100).unwrap(), 2);
    assert!(node.lease_expire_at().is_some());

    // The watcher for status 1 fires on the transition and is consumed.
    let fired = next_notification(&mut rx).await;
    assert_eq!(fired, ("session-1".to_string(), "lock/a".to_string(), 1));
    assert!(node.watchers().is_empty());

    sleep(Duration::from_millis(300)).await;
    assert_eq!(node.status(), 1);
    assert_eq!(node.owner(), None);
    assert_eq!(node.lease_expire_at(), None);
    assert_eq!(node.version(), 3);
    assert_eq!(store.max_xid(), 3);
    assert_quiet(&mut rx).await;

    // The lock is free again.
    assert_eq!(node.set_status(1, 1, Some("n2"), 0).unwrap(), 4);
}

#[tokio::test]
async fn test_lease_expires_exactly_once_under_renewals() {
    let (store, mut rx) = notifying_store(1);
    let (node, _) = store.create("lock/c", NodeType::Temporary, 0, 9, None, 1);
    node.set_status(0, 1, Some("n1"), 80).unwrap();
    node.watch("s", 9);

    let renewers: Vec<_> = (0..4)
        .map(|_| {
            let node = node.clone();
            tokio::spawn(async move {
                for _ in 0..10 {
                    let _ = node.expand_lease(1, Some("n1"), 80);
                    sleep(Duration::from_millis(20)).await;
                }
            })
        })
        .collect();
    for renewer in renewers {
        renewer.await.unwrap();
    }
    // Renewed throughout, so nothing expired yet.
    assert_eq!(node.status(), 1);
    assert_eq!(node.version(), 2);

    sleep(Duration::from_millis(300)).await;
    assert_eq!(node.status(), 9);
    assert_eq!(node.version(), 3);

    let fired = next_notification(&mut rx).await;
    assert_eq!(fired.2, 9);
    assert_quiet(&mut rx).await;
    assert_eq!(node.version(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_renewal_racing_expiry_expires_once() {
    let store = new_store(1);
    let (node, _) = store.create("lock/r", NodeType::Temporary, 0, 9, None, 1);
    node.set_status(0, 1, Some("n1"), 80).unwrap();

    // The renewal lands on the expiry instant. Whichever runs first, the
    // lease is released exactly once.
    let renewer = {
        let node = node.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(80)).await;
            node.expand_lease(1, Some("n1"), 80)
        })
    };
    match renewer.await.unwrap() {
        Ok(()) => assert_eq!(node.status(), 1),
        Err(e) => {
            assert!(matches!(e, CasError::StatusMismatch { actual: 9, .. }));
            assert_eq!(node.version(), 3);
        }
    }

    sleep(Duration::from_millis(500)).await;
    assert_eq!(node.status(), 9);
    assert_eq!(node.owner(), None);
    assert_eq!(node.version(), 3);
    assert_eq!(store.max_xid(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_renewal_before_expiry_postpones_it() {
    let store = new_store(1);
    let (node, _) = store.create("lock/e", NodeType::Temporary, 0, 9, None, 1);
    node.set_status(0, 1, Some("n1"), 80).unwrap();

    sleep(Duration::from_millis(60)).await;
    node.expand_lease(1, Some("n1"), 80).unwrap();

    // Past the first deadline, before the renewed one.
    sleep(Duration::from_millis(40)).await;
    assert_eq!(node.status(), 1);
    assert_eq!(node.version(), 2);

    sleep(Duration::from_millis(200)).await;
    assert_eq!(node.status(), 9);
    assert_eq!(node.version(), 3);
}

async fn wait_until_finished(timer: &AbortHandle) {
    timeout(Duration::from_secs(2), async {
        while !timer.is_finished() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("lease timer still running");
}

#[tokio::test]
async fn test_renewal_replaces_the_lease_timer() {
    let store = new_store(1);
    let node = store.get_or_create("lock/t", 1);
    node.set_status(0, 1, Some("n1"), 60_000).unwrap();
    let first = node.lease_timer().unwrap();

    for _ in 0..100 {
        node.expand_lease(1, Some("n1"), 60_000).unwrap();
    }
    let last = node.lease_timer().unwrap();
    wait_until_finished(&first).await;
    assert!(!last.is_finished());

    // Clearing the lease stops the timer as well.
    node.expand_lease(1, Some("n1"), 0).unwrap();
    assert!(node.lease_timer().is_none());
    wait_until_finished(&last).await;

    // And so does removing the node.
    node.expand_lease(1, Some("n1"), 60_000).unwrap();
    let armed = node.lease_timer().unwrap();
    store.remove("lock/t").unwrap();
    assert!(node.lease_timer().is_none());
    wait_until_finished(&armed).await;
}

#[tokio::test]
async fn test_expand_lease_keeps_version_and_status() {
    let store = new_store(1);
    let node = store.get_or_create("lease/a", 1);
    node.set_status(0, 2, Some("n1"), 60_000).unwrap();
    let first = node.lease_expire_at().unwrap();

    sleep(Duration::from_millis(20)).await;
    node.expand_lease(2, Some("n1"), 120_000).unwrap();
    assert!(node.lease_expire_at().unwrap() > first);
    assert_eq!(node.version(), 2);
    assert_eq!(node.status(), 2);

    assert!(matches!(
        node.expand_lease(3, Some("n1"), 1_000),
        Err(CasError::StatusMismatch { .. })
    ));
    assert!(matches!(
        node.expand_lease(2, Some("n2"), 1_000),
        Err(CasError::OwnerMismatch { .. })
    ));

    // A non-positive lease clears it.
    node.expand_lease(2, Some("n1"), 0).unwrap();
    assert_eq!(node.lease_expire_at(), None);
}

#[tokio::test]
async fn test_watch_fires_immediately_and_once() {
    let (store, mut rx) = notifying_store(1);
    let node = store.get_or_create("flag", 1);

    assert!(node.watch("s1", 0));
    assert_eq!(next_notification(&mut rx).await, ("s1".to_string(), "flag".to_string(), 0));
    assert!(node.watchers().is_empty());

    assert!(!node.watch("s1", 5));
    assert!(!node.watch("s1", 5));
    assert!(!node.watch("s2", 6));
    assert_eq!(node.watchers().len(), 2);

    node.set_status(0, 5, None, 0).unwrap();
    assert_eq!(next_notification(&mut rx).await, ("s1".to_string(), "flag".to_string(), 5));
    assert_quiet(&mut rx).await;
    assert_eq!(node.watchers().len(), 1);
}

#[tokio::test]
async fn test_persistent_node_ignores_leases() {
    let store = new_store(1);
    let (node, _) = store.create("config/x", NodeType::Persistent, 0, 4, None, 1);
    node.set_status(0, 1, Some("n1"), 50).unwrap();
    assert_eq!(node.lease_expire_at(), None);

    sleep(Duration::from_millis(150)).await;
    assert_eq!(node.status(), 1);
    assert_eq!(node.owner().as_deref(), Some("n1"));
    assert_eq!(node.version(), 2);
}

#[tokio::test]
async fn test_removed_node_does_not_expire() {
    let store = new_store(1);
    let (node, _) = store.create("tmp", NodeType::Temporary, 0, 3, None, 1);
    node.set_status(0, 1, Some("n1"), 50).unwrap();

    let removed = store.remove("tmp").unwrap();
    assert!(Arc::ptr_eq(&removed, &node));
    assert!(store.get("tmp").is_none());
    assert!(store.tree().get("tmp").is_none());

    sleep(Duration::from_millis(150)).await;
    assert_eq!(node.status(), 1);
    assert_eq!(node.version(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_create_if_absent() {
    let store = Arc::new(new_store(1));
    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move { store.create("race", NodeType::Temporary, i, 0, None, 1).1 })
        })
        .collect();

    let mut created = 0;
    for task in tasks {
        if task.await.unwrap() {
            created += 1;
        }
    }
    assert_eq!(created, 1);
    assert_eq!(store.len(), 1);
    assert_eq!(store.tree().entries().len(), 1);

    // An existing key is never reset by a later create.
    let node = store.get("race").unwrap();
    let status = node.status();
    node.set_status(status, 100, None, 0).unwrap();
    let (again, created) = store.create("race", NodeType::Temporary, 0, 0, None, 1);
    assert!(!created);
    assert_eq!(again.status(), 100);
}

#[tokio::test]
async fn test_two_stores_converge() {
    let a = new_store(1);
    let b = new_store(2);

    for i in 0..20 {
        a.create(&format!("a/{i}"), NodeType::Temporary, 0, 0, None, 1);
    }
    for i in 0..15 {
        let node = b.get_or_create(&format!("b/{i}"), 1);
        node.set_status(0, i, None, 0).unwrap();
    }
    // Written on both sides, newer on b.
    let shared_a = a.get_or_create("shared", 1);
    shared_a.set_status(0, 1, None, 0).unwrap();
    let shared_b = b.get_or_create("shared", 1);
    for s in 0..3 {
        shared_b.set_status(s, s + 1, None, 0).unwrap();
    }
    // Newer on a.
    a.get_or_create("a/0", 1).set_status(0, 8, None, 0).unwrap();

    a.tree().load_hash().unwrap();
    b.tree().load_hash().unwrap();
    let diff = a.tree().difference(b.tree());
    assert!(diff.has_differences());
    b.apply_difference(&diff);

    a.tree().load_hash().unwrap();
    b.tree().load_hash().unwrap();
    let diff = b.tree().difference(a.tree());
    a.apply_difference(&diff);

    assert_eq!(keys_and_versions(&a), keys_and_versions(&b));
    assert_eq!(a.get("shared").unwrap().version(), 4);
    assert_eq!(a.get("shared").unwrap().status(), 3);
    assert_eq!(b.get("a/0").unwrap().status(), 8);

    a.tree().load_hash().unwrap();
    b.tree().load_hash().unwrap();
    assert_eq!(a.tree().root_hash(), b.tree().root_hash());
    assert!(a.tree().difference(b.tree()).is_empty());
}

#[tokio::test]
async fn test_apply_difference_is_last_writer_wins() {
    let store = new_store(1);
    let node = store.get_or_create("k", 1);
    node.set_status(0, 1, None, 0).unwrap();
    node.set_status(1, 2, None, 0).unwrap();

    let mut older = node.snapshot();
    older.version = 2;
    older.status = 50;
    let mut newer = node.snapshot();
    newer.version = 9;
    newer.status = 60;
    let mut unknown = newer.clone();
    unknown.key = "not-here".to_string();

    let stats = store.apply_difference(&crate::tree::Difference {
        added: vec![],
        removed: vec![],
        updated: vec![older, unknown],
    });
    assert_eq!(stats.updated, 0);
    assert_eq!(node.status(), 2);
    assert!(!store.contains_key("not-here"));

    let stats = store.apply_difference(&crate::tree::Difference {
        added: vec![],
        removed: vec![],
        updated: vec![newer],
    });
    assert_eq!(stats.updated, 1);
    assert_eq!(node.status(), 60);
    assert_eq!(node.version(), 9);
    assert_eq!(store.max_xid(), 9);
}

#[tokio::test]
async fn test_pulled_diff_is_applied_once() {
    let local = Arc::new(new_store(1));
    let remote = Arc::new(new_store(2));
    local.create("local-only", NodeType::Temporary, 0, 0, None, 1);

    let node = remote.get_or_create("x", 1);
    for s in 0..4 {
        node.set_status(s, s + 1, None, 0).unwrap();
    }
    remote.create("y", NodeType::Persistent, 3, 3, Some("n2".into()), 1);

    let config = Config::new(1, vec![2]);
    let local_sync = ReconciliationService::new(&config, local.clone(), Arc::new(NullMessenger));
    let remote_sync = ReconciliationService::new(&config, remote.clone(), Arc::new(NullMessenger));

    local.tree().load_hash().unwrap();
    let result = remote_sync
        .handle_require_diff(RequireDiff {
            max_xid: local.max_xid(),
            tree: local.tree().to_image(),
        })
        .await
        .unwrap();
    assert_eq!(result.max_xid, 5);

    let stats = local_sync.apply_diff(&result).unwrap();
    assert_eq!(stats.added, 2);
    assert_eq!(stats.removed, 1);
    assert_eq!(local.max_xid(), 5);
    assert_eq!(keys_and_versions(&local), keys_and_versions(&remote));
    assert_eq!(local.get("y").unwrap().owner().as_deref(), Some("n2"));

    let before = local.snapshots();
    assert!(local_sync.apply_diff(&result).is_none());
    assert_eq!(local.snapshots(), before);
}

#[tokio::test]
async fn test_quorum_of_five() {
    init_tracing();
    let mut config = Config::new(1, vec![2, 3, 4, 5]);
    config.replication_timeout_ms = 200;
    assert_eq!(config.quorum_size(), 3);
    assert_eq!(config.required_acks(), 2);

    let store = Arc::new(new_store(1));
    let messenger = Arc::new(QuorumMessenger {
        refusing: HashSet::from([2]),
        silent: HashSet::from([3]),
        ..Default::default()
    });
    let replicator =
        MutationReplicator::new(&config, store.clone(), StaticLeader::leader(), messenger);

    let create = Mutation::Create {
        key: "lock/q".into(),
        owner: None,
        init_status: 0,
        invalidate_status: 0,
        node_type: NodeType::Temporary,
    };
    assert_eq!(replicator.replicate(create).await.unwrap(), ReplyStatus::Success);
    assert_eq!(store.get("lock/q").unwrap().created_epoch(), 7);

    // One more peer down: only one ack left.
    let messenger = Arc::new(QuorumMessenger {
        refusing: HashSet::from([2, 4]),
        silent: HashSet::from([3]),
        ..Default::default()
    });
    let replicator =
        MutationReplicator::new(&config, store.clone(), StaticLeader::leader(), messenger);
    let update = Mutation::UpdateStatus {
        key: "lock/q".into(),
        expect_status: 0,
        new_status: 1,
        owner: Some("n1".into()),
        lease: 0,
    };
    assert_eq!(
        replicator.replicate(update).await.unwrap_err(),
        ReplicationError::NoQuorum {
            acks: 1,
            required: 2
        }
    );
    // Not rolled back.
    let node = store.get("lock/q").unwrap();
    assert_eq!(node.status(), 1);
    assert_eq!(node.version(), 2);
}

#[tokio::test]
async fn test_mutation_reaches_peers_beyond_the_quorum() {
    let create = |key: &str| Mutation::Create {
        key: key.to_string(),
        owner: None,
        init_status: 0,
        invalidate_status: 0,
        node_type: NodeType::Persistent,
    };

    let config = Config::new(1, vec![2, 3, 4, 5]);
    let messenger = Arc::new(SlowMessenger::default());
    let replicator = MutationReplicator::new(
        &config,
        Arc::new(new_store(1)),
        StaticLeader::leader(),
        messenger.clone(),
    );
    assert_eq!(replicator.replicate(create("a")).await.unwrap(), ReplyStatus::Success);
    let early = messenger.delivered();
    assert!(early.contains(&2) && early.contains(&3));

    // The slower peers get the write after the quorum was reached.
    sleep(Duration::from_millis(500)).await;
    assert_eq!(messenger.delivered(), vec![2, 3, 4, 5]);

    // A quorum of one waits for nobody but still sends to everyone.
    let mut config = Config::new(1, vec![2, 3]);
    config.quorum_size = Some(1);
    let messenger = Arc::new(SlowMessenger::default());
    let replicator = MutationReplicator::new(
        &config,
        Arc::new(new_store(1)),
        StaticLeader::leader(),
        messenger.clone(),
    );
    assert_eq!(replicator.required_acks(), 0);
    assert_eq!(replicator.replicate(create("b")).await.unwrap(), ReplyStatus::Success);
    sleep(Duration::from_millis(300)).await;
    assert_eq!(messenger.delivered(), vec![2, 3]);
}

#[tokio::test]
async fn test_cas_failure_is_not_replicated() {
    let config = Config::new(1, vec![2, 3]);
    let store = Arc::new(new_store(1));
    let messenger = Arc::new(QuorumMessenger::default());
    let replicator =
        MutationReplicator::new(&config, store.clone(), StaticLeader::leader(), messenger.clone());

    let update = Mutation::UpdateStatus {
        key: "k".into(),
        expect_status: 4,
        new_status: 5,
        owner: None,
        lease: 0,
    };
    assert_eq!(replicator.replicate(update).await.unwrap(), ReplyStatus::StatusCas);
    assert_eq!(messenger.sent.load(Ordering::SeqCst), 0);
    // The implicit create still happened with default statuses.
    assert_eq!(store.get("k").unwrap().status(), 0);
}

#[tokio::test]
async fn test_follower_applies_without_replicating() {
    let config = Config::new(2, vec![1, 3]);
    let store = Arc::new(new_store(2));
    let messenger = Arc::new(QuorumMessenger::default());
    let replicator =
        MutationReplicator::new(&config, store.clone(), StaticLeader::follower(), messenger.clone());

    let update = Mutation::UpdateStatus {
        key: "k".into(),
        expect_status: 0,
        new_status: 3,
        owner: None,
        lease: 0,
    };
    assert_eq!(replicator.replicate(update).await.unwrap(), ReplyStatus::Success);
    assert_eq!(messenger.sent.load(Ordering::SeqCst), 0);
    assert_eq!(store.get("k").unwrap().status(), 3);
}

#[tokio::test]
async fn test_node_missing_and_unavailable() {
    let config = Config::new(1, vec![]);
    let store = Arc::new(new_store(1));
    let leader = StaticLeader::leader();
    let replicator =
        MutationReplicator::new(&config, store.clone(), leader.clone(), Arc::new(NullMessenger));
    assert_eq!(replicator.required_acks(), 0);

    let renew = Mutation::UpdateLease {
        key: "ghost".into(),
        expect_status: 0,
        owner: None,
        lease: 1000,
    };
    let watch = Mutation::Watch {
        session_id: "s".into(),
        key: "ghost".into(),
        expect_status: 1,
    };
    assert_eq!(replicator.replicate(renew).await.unwrap(), ReplyStatus::NodeMissing);
    assert_eq!(replicator.replicate(watch.clone()).await.unwrap(), ReplyStatus::NodeMissing);
    assert!(!store.contains_key("ghost"));

    store.get_or_create("ghost", 1);
    assert_eq!(replicator.replicate(watch.clone()).await.unwrap(), ReplyStatus::Success);
    assert_eq!(store.get("ghost").unwrap().watchers().len(), 1);

    leader.available.store(false, Ordering::SeqCst);
    assert!(matches!(
        replicator.replicate(watch).await,
        Err(ReplicationError::Unavailable(_))
    ));
}

#[tokio::test]
async fn test_pull_from_remote_server() {
    init_tracing();
    let remote = follower(2, vec![1]);
    for i in 0..10 {
        let node = remote.store().get_or_create(&format!("remote/{i}"), 1);
        node.set_status(0, 1, Some("n2"), 60_000).unwrap();
    }

    let network = Arc::new(LocalNetwork {
        servers: HashMap::from([(2, remote.clone())]),
    });
    let mut config = Config::new(1, vec![2]);
    config.hash_depth = 8;
    let local = Server::new(config, StaticLeader::leader(), network, Arc::new(NoopNotifier)).unwrap();

    let stats = local.reconciliation().sync_from_remote(2).join().await.unwrap().unwrap();
    assert_eq!(stats.added, 10);
    assert_eq!(keys_and_versions(local.store()), keys_and_versions(remote.store()));
    assert_eq!(local.store().max_xid(), 2);

    // Nothing fresher on the remote now.
    let again = local.reconciliation().sync_from_remote(2).join().await.unwrap();
    assert!(again.is_none());

    // Unreachable peers are logged, not returned.
    let missing = local.reconciliation().sync_from_remote(9).join().await.unwrap();
    assert!(missing.is_none());
    assert!(local.reconciliation().request_diff(9).join().await.is_err());
}

#[tokio::test]
async fn test_tree_requests_share_the_sync_workers() {
    let mut config = Config::new(1, vec![2]);
    config.sync_workers = 1;
    let store = Arc::new(new_store(1));
    store.get_or_create("k", 1);
    let messenger = Arc::new(QuorumMessenger {
        silent: HashSet::from([2]),
        ..Default::default()
    });
    let service = ReconciliationService::new(&config, store.clone(), messenger);

    // A push to a peer that never answers holds the only worker.
    let push = service.push_local_to_remote(&[2]).pop().unwrap();
    sleep(Duration::from_millis(50)).await;
    assert!(
        timeout(Duration::from_millis(100), service.handle_require_tree())
            .await
            .is_err()
    );

    push.abort();
    let image = timeout(Duration::from_secs(2), service.handle_require_tree())
        .await
        .unwrap()
        .unwrap();
    let mirror = HashTree::<RemoteEntry>::from_image(image).unwrap();
    store.tree().load_hash().unwrap();
    assert_eq!(mirror.root_hash(), store.tree().root_hash());
}

#[tokio::test]
async fn test_push_local_to_remote() {
    let b = follower(2, vec![1, 3]);
    let c = follower(3, vec![1, 2]);
    c.store().get_or_create("stale", 1);

    let network = Arc::new(LocalNetwork {
        servers: HashMap::from([(2, b.clone()), (3, c.clone())]),
    });
    let mut config = Config::new(1, vec![2, 3]);
    config.hash_depth = 8;
    let a = Server::new(config, StaticLeader::leader(), network, Arc::new(NoopNotifier)).unwrap();
    for i in 0..25 {
        a.store().create(&format!("k{i}"), NodeType::Temporary, i, 0, None, 1);
    }

    let handles = a.reconciliation().push_local_to_remote(&[2, 3]);
    assert_eq!(handles.iter().map(|h| h.peer()).collect::<Vec<_>>(), vec![2, 3]);
    for handle in handles {
        assert!(handle.join().await.unwrap());
    }
    assert_eq!(keys_and_versions(b.store()), keys_and_versions(a.store()));
    assert_eq!(keys_and_versions(c.store()), keys_and_versions(a.store()));
    assert!(!c.store().contains_key("stale"));
    assert_eq!(b.store().get("k7").unwrap().status(), 7);

    for handle in a.reconciliation().push_local_to_remote(&[2, 3]) {
        assert!(!handle.join().await.unwrap());
    }
}

#[tokio::test]
async fn test_periodic_sync_pulls_from_peers() {
    let remote = follower(2, vec![1]);
    remote.store().create("late", NodeType::Temporary, 0, 0, None, 1);

    let network = Arc::new(LocalNetwork {
        servers: HashMap::from([(2, remote.clone())]),
    });
    let mut config = Config::new(1, vec![2]);
    config.hash_depth = 8;
    config.sync_interval_ms = 50;
    let local = Server::new(config, StaticLeader::leader(), network, Arc::new(NoopNotifier)).unwrap();

    let task = local.start_sync_tasks();
    sleep(Duration::from_millis(300)).await;
    task.abort();
    assert!(local.store().contains_key("late"));
}

#[tokio::test]
async fn test_server_dispatch_over_the_wire() {
    let server = follower(1, vec![]);

    let create = Message::new(Payload::Mutation(Mutation::Create {
        key: "svc/leader".into(),
        owner: Some("n1".into()),
        init_status: 2,
        invalidate_status: 0,
        node_type: NodeType::Temporary,
    }))
    .with_session("client-9");
    let reply = server.handle_frame(&create.encode().unwrap()).await.unwrap().unwrap();
    let reply = Message::decode(&reply).unwrap();
    assert_eq!(reply.id, create.id);
    assert_eq!(reply.session_id.as_deref(), Some("client-9"));
    assert_eq!(reply.payload, Payload::ReplyMutation(ReplyStatus::Success));
    assert_eq!(server.store().get("svc/leader").unwrap().status(), 2);

    let cas = Message::new(Payload::Mutation(Mutation::UpdateStatus {
        key: "svc/leader".into(),
        expect_status: 2,
        new_status: 3,
        owner: Some("n9".into()),
        lease: 0,
    }));
    let reply = server.handle(cas).await.unwrap();
    assert_eq!(reply.payload, Payload::ReplyMutation(ReplyStatus::OwnerCas));

    let tree = server.handle(Message::new(Payload::RequireTree)).await.unwrap();
    assert!(matches!(tree.payload, Payload::Tree(_)));

    // Replies are never handled as requests.
    assert!(server
        .handle(Message::new(Payload::ApplyDiffResult(0)))
        .await
        .is_none());
    assert!(server.handle_frame(&[0, 0, 0, 1, 7]).await.is_err());
}

#[tokio::test]
async fn test_unavailable_server_drops_mutations() {
    let leader = StaticLeader::leader();
    leader.available.store(false, Ordering::SeqCst);
    let server = Server::new(
        Config::new(1, vec![]),
        leader,
        Arc::new(NullMessenger),
        Arc::new(NoopNotifier),
    )
    .unwrap();

    let msg = Message::new(Payload::Mutation(Mutation::UpdateStatus {
        key: "k".into(),
        expect_status: 0,
        new_status: 1,
        owner: None,
        lease: 0,
    }));
    assert!(server.handle(msg).await.is_none());
    assert!(!server.store().contains_key("k"));
}

#[tokio::test]
async fn test_leader_without_quorum_drops_reply() {
    let mut config = Config::new(1, vec![2, 3]);
    config.replication_timeout_ms = 100;
    let server = Server::new(
        config,
        StaticLeader::leader(),
        Arc::new(NullMessenger),
        Arc::new(NoopNotifier),
    )
    .unwrap();

    let msg = Message::new(Payload::Mutation(Mutation::UpdateStatus {
        key: "k".into(),
        expect_status: 0,
        new_status: 1,
        owner: None,
        lease: 0,
    }));
    assert!(server.handle(msg).await.is_none());
    assert_eq!(server.store().get("k").unwrap().status(), 1);
}

#[tokio::test]
async fn test_snapshot_persistence() {
    use tempfile::TempDir;

    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("state").join("node-1.snapshot");

    let store = new_store(1);
    let lock = store.get_or_create("lock/p", 4);
    lock.set_status(0, 1, Some("n1"), 60_000).unwrap();
    store.create("config/p", NodeType::Persistent, 7, 7, None, 4);
    store.persist(&path).unwrap();
    // Persisting again replaces the file and leaves no temp file behind.
    store.persist(&path).unwrap();
    assert!(!path.with_extension("snapshot.tmp").exists());

    let ctx = || Arc::new(NodeContext::new(Arc::new(NoopNotifier)).unwrap());
    let loaded = StateStore::load(&path, 1, 8, ctx()).unwrap();
    assert_eq!(loaded.snapshots(), store.snapshots());
    assert_eq!(loaded.max_xid(), store.max_xid());
    assert_eq!(loaded.status().n_nodes, 2);
    let restored: StateSnapshot = loaded.get("lock/p").unwrap().snapshot();
    assert_eq!(restored.lease_expire_at, lock.lease_expire_at());
    assert_eq!(restored.created_epoch, 4);

    loaded.tree().load_hash().unwrap();
    store.tree().load_hash().unwrap();
    assert_eq!(loaded.tree().root_hash(), store.tree().root_hash());

    // Wrong server, then a corrupted file.
    assert!(StateStore::load(&path, 2, 8, ctx()).is_err());
    fs_err::write(&path, b"not a snapshot").unwrap();
    assert!(StateStore::load(&path, 1, 8, ctx()).is_err());

    // A node count of 2^40 fails to decode instead of allocating.
    let mut forged = b"HPKV".to_vec();
    forged.extend_from_slice(&[1, 1, 0, 253]);
    forged.extend_from_slice(&(1u64 << 40).to_le_bytes());
    fs_err::write(&path, &forged).unwrap();
    assert!(StateStore::load(&path, 1, 8, ctx()).is_err());

    // A missing file yields an empty store.
    let empty = StateStore::load(&temp_dir.path().join("none"), 1, 8, ctx()).unwrap();
    assert!(empty.is_empty());
}

#[tokio::test]
async fn test_server_restores_configured_snapshot() {
    use tempfile::TempDir;

    let temp_dir = TempDir::new().unwrap();
    let mut config = Config::new(1, vec![]);
    config.snapshot_path = Some(temp_dir.path().join("hopper.snapshot"));

    let server = Server::new(
        config.clone(),
        StaticLeader::leader(),
        Arc::new(NullMessenger),
        Arc::new(NoopNotifier),
    )
    .unwrap();
    server.store().create("kept", NodeType::Persistent, 1, 1, None, 7);
    server.persist().unwrap();
    drop(server);

    let restarted = Server::new(
        config,
        StaticLeader::leader(),
        Arc::new(NullMessenger),
        Arc::new(NoopNotifier),
    )
    .unwrap();
    assert_eq!(restarted.store().get("kept").unwrap().status(), 1);
}

#[test]
fn test_config_quorum_arithmetic() {
    let config = Config::new(1, vec![1, 2, 3]);
    assert_eq!(config.peers, vec![2, 3]);
    assert_eq!(config.cluster_size(), 3);
    assert_eq!(config.quorum_size(), 2);
    assert_eq!(config.required_acks(), 1);

    let single = Config::new(1, vec![]);
    assert_eq!(single.quorum_size(), 1);
    assert_eq!(single.required_acks(), 0);

    let mut pinned = Config::new(1, vec![2, 3, 4, 5]);
    pinned.quorum_size = Some(5);
    assert_eq!(pinned.required_acks(), 4);
}

#[tokio::test]
async fn test_update_overwrites_and_rearms_lease() {
    let (store, mut rx) = notifying_store(1);
    let (node, _) = store.create("lock/u", NodeType::Temporary, 0, 2, None, 1);
    node.watch("s", 1);

    let mut incoming = node.snapshot();
    incoming.version = 1;
    incoming.status = 1;
    incoming.owner = Some("n3".to_string());
    incoming.lease_expire_at = Some(crate::types::now_millis() + 80);
    node.update(incoming);

    // Unconditional: same version still overwrites.
    assert_eq!(node.status(), 1);
    assert_eq!(node.owner().as_deref(), Some("n3"));
    assert_eq!(next_notification(&mut rx).await.2, 1);

    sleep(Duration::from_millis(250)).await;
    assert_eq!(node.status(), 2);
    assert_eq!(node.owner(), None);
    assert_eq!(node.version(), 2);
}

#[test]
fn test_store_requires_a_runtime() {
    assert!(NodeContext::new(Arc::new(NoopNotifier)).is_err());
    assert!(StateStore::new(1, 8, Arc::new(NoopNotifier)).is_err());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    let ctx = NodeContext::with_runtime(runtime.handle().clone(), Arc::new(NoopNotifier));
    let store = StateStore::with_context(1, 8, Arc::new(ctx)).unwrap();
    assert!(store.get_or_create("k", 1).lease_expire_at().is_none());
}
