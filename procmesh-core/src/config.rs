//! Cluster configuration.
//!
//! [`WorkerConfig`] describes one launched worker, [`LaunchOptions`] a batch
//! of them, [`Topology`] the connectivity pattern established at join time,
//! and [`Cookie`] the shared secret checked during the connection handshake.

use std::collections::HashMap;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::id::WorkerId;

/// Length in bytes of the cluster cookie exchanged at connection open.
pub const COOKIE_LEN: usize = 16;

/// Shared-secret cluster cookie.
///
/// The side opening a connection writes the cookie first; the accepting
/// side compares all [`COOKIE_LEN`] bytes and closes the connection on any
/// mismatch. This is the only security boundary the runtime provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cookie([u8; COOKIE_LEN]);

impl Cookie {
    /// Create a cookie from raw bytes.
    pub const fn from_bytes(bytes: [u8; COOKIE_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a random alphanumeric cookie.
    pub fn random() -> Self {
        let mut bytes = [0u8; COOKIE_LEN];
        let mut rng = rand::thread_rng();
        for b in &mut bytes {
            *b = rng.sample(Alphanumeric);
        }
        Self(bytes)
    }

    /// The raw cookie bytes, as written on the wire.
    pub const fn as_bytes(&self) -> &[u8; COOKIE_LEN] {
        &self.0
    }

    /// Fixed-length comparison against bytes read off the wire.
    pub fn matches(&self, presented: &[u8; COOKIE_LEN]) -> bool {
        self.0 == *presented
    }
}

/// Connectivity pattern applied during the join handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Every worker connects to every other worker.
    #[default]
    AllToAll,
    /// Workers connect only to the controller.
    MasterWorker,
    /// Connectivity is left to the cluster manager.
    Custom,
}

/// Per-worker launch configuration.
///
/// Produced by a cluster manager's `launch` and consumed by `connect`; the
/// runtime treats most fields as opaque and forwards them between the two.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker id, once assigned by the controller (0 until then).
    pub id: WorkerId,
    /// Connection endpoint understood by the owning cluster manager
    /// (host:port, pipe name, in-process key...).
    pub endpoint: Option<String>,
    /// Environment variables for the launched process.
    pub env: HashMap<String, String>,
    /// Extra flags passed to the worker executable.
    pub exeflags: Vec<String>,
    /// Hint that the worker may run a process-wide compute thread pool.
    pub enable_threaded_compute: bool,
    /// Manager-private data carried alongside the config.
    pub userdata: Option<String>,
}

impl WorkerConfig {
    /// Config for a worker reachable at `endpoint`.
    pub fn at(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            ..Self::default()
        }
    }
}

/// Options for launching a batch of workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchOptions {
    /// Number of workers to launch.
    pub count: usize,
    /// Connectivity pattern established at join time.
    pub topology: Topology,
    /// Defer worker-worker connections until first use.
    pub lazy: bool,
    /// Upper bound on concurrent connection setups.
    pub max_parallel: usize,
    /// Environment variables merged into every worker's config.
    pub env: HashMap<String, String>,
    /// Extra flags merged into every worker's config.
    pub exeflags: Vec<String>,
    /// Hint that workers may run a process-wide compute thread pool.
    pub enable_threaded_compute: bool,
}

impl LaunchOptions {
    /// Options for `count` workers with the default topology.
    pub fn new(count: usize) -> Self {
        Self {
            count,
            topology: Topology::default(),
            lazy: false,
            max_parallel: 8,
            env: HashMap::new(),
            exeflags: Vec::new(),
            enable_threaded_compute: false,
        }
    }

    /// Set the connectivity pattern.
    pub fn topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    /// Defer worker-worker connections until first use.
    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    /// Bound concurrent connection setups.
    pub fn max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_matches() {
        let cookie = Cookie::from_bytes(*b"0123456789abcdef");
        assert!(cookie.matches(b"0123456789abcdef"));
        assert!(!cookie.matches(b"0123456789abcdeX"));
    }

    #[test]
    fn test_cookie_random_is_alphanumeric() {
        let cookie = Cookie::random();
        assert!(cookie.as_bytes().iter().all(|b| b.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_cookie_random_differs() {
        // Collision probability over 16 alphanumeric bytes is negligible.
        assert_ne!(Cookie::random(), Cookie::random());
    }

    #[test]
    fn test_topology_serde_tags() {
        let json = serde_json::to_string(&Topology::MasterWorker).expect("serialize");
        assert_eq!(json, "\"master_worker\"");
        let back: Topology = serde_json::from_str("\"all_to_all\"").expect("deserialize");
        assert_eq!(back, Topology::AllToAll);
    }

    #[test]
    fn test_launch_options_builder() {
        let opts = LaunchOptions::new(4)
            .topology(Topology::MasterWorker)
            .lazy(true)
            .max_parallel(0);
        assert_eq!(opts.count, 4);
        assert_eq!(opts.topology, Topology::MasterWorker);
        assert!(opts.lazy);
        assert_eq!(opts.max_parallel, 1);
    }

    #[test]
    fn test_worker_config_at() {
        let cfg = WorkerConfig::at("inproc:2");
        assert_eq!(cfg.endpoint.as_deref(), Some("inproc:2"));
        assert_eq!(cfg.id, 0);
    }
}
