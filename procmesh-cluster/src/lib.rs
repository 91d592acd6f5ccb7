//! # Procmesh Cluster Runtime
//!
//! The core of a distributed multi-process compute system: launch and
//! connect a set of peer worker processes, multiplex remote calls over
//! long-lived duplex streams, resolve remote references to computed
//! values with at-most-once delivery, and supervise worker lifecycle.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                Application Code                  │
//! │     call / call_fetch / call_wait / remote_do    │
//! ├──────────────────────────────────────────────────┤
//! │  Node (identity, registry, worker table, pool)   │
//! │  • RemoteFuture resolution by reference id       │
//! │  • Join protocol and topology formation          │
//! ├──────────────────────────────────────────────────┤
//! │  Dispatcher (one task per peer connection)       │
//! │  • FIFO frame loop with boundary resync          │
//! │  • Handler faults reified as RemoteException     │
//! ├──────────────────────────────────────────────────┤
//! │  Wire format (header + body + boundary)          │
//! │  • Cookie/version handshake                      │
//! │  • CRC32C body checksums                         │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Components
//!
//! | Component | Purpose |
//! |-----------|---------|
//! | [`Node`] | One process's membership: registries, verbs, supervision |
//! | [`RemoteFuture`] | Handle to a value owned by some worker |
//! | [`ClusterManager`] | Seam to whatever launches worker processes |
//! | [`InProcessManager`] | Whole clusters inside one address space |
//! | [`wire`] | Framing, handshake, decode-fault recovery |
//!
//! ## Quick start
//!
//! ```ignore
//! use procmesh_cluster::{Cookie, InProcessManager, LaunchOptions, Node};
//!
//! let cookie = Cookie::random();
//! let manager = InProcessManager::new(cookie);
//! manager.on_worker_setup(|node| node.register_fn("add_one", |x: i64| x + 1));
//!
//! let node = Node::controller(manager, cookie);
//! let workers = node.add_workers(LaunchOptions::new(2)).await?;
//! let answer: i64 = node.call_fetch_typed(workers[0], "add_one", &41).await?;
//! assert_eq!(answer, 42);
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// Re-export core types for convenience
pub use procmesh_core::{
    CodecError, Cookie, JsonCodec, LaunchOptions, PayloadCodec, Rrid, Topology, WorkerConfig,
    WorkerId, CONTROLLER_ID, COOKIE_LEN,
};

// =============================================================================
// Modules
// =============================================================================

/// Error types for cluster operations.
pub mod error;

/// Wire framing, handshake and boundary recovery.
pub mod wire;

/// Wire-level message taxonomy.
pub mod message;

/// Remote-value registry: slots, clients, reclamation.
pub mod registry;

/// Worker records and the process-local worker table.
pub mod worker;

/// The process-scoped cluster node.
pub mod node;

/// Function registry and thunk execution.
pub mod engine;

/// Per-peer message dispatch.
mod dispatcher;

/// Join protocol and mesh formation.
mod topology;

/// Worker launch, removal, and failure cleanup.
pub mod supervisor;

/// Public RPC verbs and futures.
pub mod rpc;

/// Cluster-manager seam and the in-process manager.
pub mod manager;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use engine::{CallOutput, FuncRegistry, Handler};
pub use error::{CapturedException, ClusterError, ClusterResult, RemoteException};
pub use manager::{ClusterManager, InProcessManager, WorkerOp};
pub use message::{Message, PeerInfo};
pub use node::{FatalPolicy, Node};
pub use registry::{Buffering, Registry, RemoteValue, SlotValue};
pub use rpc::RemoteFuture;
pub use supervisor::{DEFAULT_WORKER_TIMEOUT, WORKER_TIMEOUT_ENV};
pub use wire::{
    BoxRead, BoxWrite, FrameReader, FrameWriter, MsgHeader, WireError, HEADER_LEN, MAX_BODY_SIZE,
    MSG_BOUNDARY, VERSION_LEN,
};
pub use worker::{Worker, WorkerState, WorkerTable};
