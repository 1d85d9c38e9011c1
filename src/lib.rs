//! HopperKV - the state engine of a leader-based coordination service
//!
//! HopperKV keeps a cluster-wide space of small versioned state nodes, the
//! kind of thing used for locks, leader flags and membership markers. Writes
//! go through a single leader and are acknowledged by a majority; replicas that
//! miss a write catch up through hash-tree anti-entropy.
//!
//! # Key Features
//!
//! - **CAS state nodes**: every change is a compare-and-swap on an integer status
//! - **Leases**: a temporary node falls back to its invalidate status when its
//!   owner stops renewing
//! - **Watches**: one-shot notifications when a node reaches a status
//! - **Quorum writes**: the leader applies locally, then waits for a majority
//! - **Anti-entropy**: replicas compare hash trees and exchange only what differs
//! - **Transport-agnostic**: you provide the network layer and leader election
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use hopperkv::{NoopNotifier, StateStore};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = StateStore::new(1, 12, Arc::new(NoopNotifier)).unwrap();
//!
//! // Create a lock node: free = 0, released on lease expiry back to 0
//! let (node, created) = store.create("lock/a", Default::default(), 0, 0, None, 1);
//! assert!(created);
//!
//! // Take it for 5 seconds
//! let version = node.set_status(0, 1, Some("n1"), 5_000).unwrap();
//! assert_eq!(version, 2);
//!
//! // Someone else cannot
//! assert!(node.set_status(1, 1, Some("n2"), 5_000).is_err());
//! # }
//! ```
//!
//! # Architecture
//!
//! The core types you'll work with:
//! - [`StateNode`] - A versioned node with its CAS, lease and watch state machine
//! - [`StateStore`] - All nodes of a server plus the hash tree indexing them
//! - [`MutationReplicator`] - The quorum write path
//! - [`ReconciliationService`] - Pull and push anti-entropy with peers
//! - [`Server`] - Wires the above and dispatches wire messages
//!
//! # Non-goals
//!
//! HopperKV intentionally does NOT provide:
//! - Leader election (consumed through [`LeaderState`])
//! - Network transport (consumed through [`Messenger`])
//! - Byzantine fault tolerance or multi-datacenter replication
//! - Rollback of writes that missed their quorum

pub mod config;
pub mod error;
pub mod message;
pub mod ops;
pub mod replication;
pub mod server;
pub mod state;
pub mod store;
pub mod sync;
pub mod tree;
pub mod types;

pub use config::Config;
pub use error::{CasError, MalformedMessage, ReplicationError, TreeError, Unavailable};
pub use message::{Message, Payload, Verb};
pub use ops::Mutation;
pub use replication::{LeaderState, MutationReplicator};
pub use server::Server;
pub use state::{NodeContext, NoopNotifier, StateNode, WatchNotifier};
pub use store::StateStore;
pub use sync::{DiffResult, Messenger, ReconciliationService, RequireDiff, SyncHandle};
pub use tree::{Difference, HashTree};
pub use types::{NodeType, ReplyStatus, StateSnapshot};

#[cfg(test)]
mod tests;
