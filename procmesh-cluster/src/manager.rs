//! The cluster-manager seam and the in-process manager.
//!
//! How worker processes come to exist is not the runtime's business: a
//! [`ClusterManager`] launches them, connects peers to them, observes
//! lifecycle events and kills them on request. Real deployments implement
//! this over SSH, a container scheduler, or plain `fork`/`exec`; the
//! runtime only ever sees duplex byte streams.
//!
//! [`InProcessManager`] is the provided implementation: every "process"
//! is a node in the current address space and every connection an
//! in-memory duplex pipe. It exists so whole clusters can be stood up
//! inside one test.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use procmesh_core::{Cookie, LaunchOptions, WorkerConfig, WorkerId};
use tokio::sync::mpsc;

use crate::error::{ClusterError, ClusterResult};
use crate::node::{FatalPolicy, Node};
use crate::wire::{BoxRead, BoxWrite};

/// Lifecycle hook events delivered to a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOp {
    /// The worker completed its join.
    Register,
    /// The worker left the table (removal or death).
    Deregister,
    /// The controller wants the worker interrupted.
    Interrupt,
    /// The cluster is shutting down.
    Finalize,
}

/// Launches worker processes and connects peers to them.
///
/// `launch` sends one [`WorkerConfig`] per started worker down the
/// channel as it becomes ready and returns once all are issued; the
/// controller connects to each in parallel, bounded by the launch
/// options. `connect` is also invoked worker-to-worker during mesh
/// formation, so configs must carry whatever addressing the manager
/// needs.
#[async_trait]
pub trait ClusterManager: Send + Sync + 'static {
    /// Start `opts.count` workers, streaming their configs out as they
    /// come up.
    async fn launch(
        &self,
        opts: &LaunchOptions,
        configs: mpsc::UnboundedSender<WorkerConfig>,
    ) -> ClusterResult<()>;

    /// Open a duplex connection to the worker described by `config`.
    async fn connect(
        &self,
        pid: WorkerId,
        config: &WorkerConfig,
    ) -> ClusterResult<(BoxRead, BoxWrite)>;

    /// Observe a lifecycle event for a worker.
    async fn manage(&self, pid: WorkerId, config: &WorkerConfig, op: WorkerOp);

    /// Request orderly shutdown of a worker.
    async fn kill(&self, pid: WorkerId, config: &WorkerConfig);
}

type SetupHook = Arc<dyn Fn(&Node) + Send + Sync>;

struct InProcessShared {
    cookie: Cookie,
    setup: Mutex<Option<SetupHook>>,
    /// Endpoint key → worker node.
    nodes: Mutex<HashMap<String, Node>>,
    /// Worker id → endpoint key, learned at first connect.
    pids: Mutex<HashMap<WorkerId, String>>,
    /// Connections accepted per endpoint key.
    connects: Mutex<HashMap<String, usize>>,
    next_key: AtomicU64,
}

/// A [`ClusterManager`] whose workers are nodes in this address space.
///
/// Worker nodes run with [`FatalPolicy::ShutdownNode`] so a lost
/// controller ends the node, not the test process. Register the
/// functions workers should serve with
/// [`on_worker_setup`](InProcessManager::on_worker_setup) before
/// launching.
pub struct InProcessManager {
    shared: Arc<InProcessShared>,
    self_weak: Weak<InProcessManager>,
}

impl InProcessManager {
    /// Create a manager for clusters sharing `cookie`.
    pub fn new(cookie: Cookie) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            shared: Arc::new(InProcessShared {
                cookie,
                setup: Mutex::new(None),
                nodes: Mutex::new(HashMap::new()),
                pids: Mutex::new(HashMap::new()),
                connects: Mutex::new(HashMap::new()),
                next_key: AtomicU64::new(0),
            }),
            self_weak: self_weak.clone(),
        })
    }

    /// Run `setup` on every worker node before it starts serving;
    /// typically registers the functions remote calls will name.
    pub fn on_worker_setup(&self, setup: impl Fn(&Node) + Send + Sync + 'static) {
        *self.shared.setup.lock().expect("setup hook poisoned") = Some(Arc::new(setup));
    }

    /// The node behind a worker id, once it has been connected.
    pub fn node(&self, pid: WorkerId) -> Option<Node> {
        let key = self
            .shared
            .pids
            .lock()
            .expect("pid map poisoned")
            .get(&pid)
            .cloned()?;
        self.shared
            .nodes
            .lock()
            .expect("node map poisoned")
            .get(&key)
            .cloned()
    }

    /// Kill a worker abruptly: no goodbye, streams just close.
    ///
    /// Peers observe it exactly like a crashed process.
    pub fn crash(&self, pid: WorkerId) {
        if let Some(node) = self.node(pid) {
            node.shutdown();
        }
    }

    /// How many connections were opened to a worker so far.
    pub fn connect_count(&self, pid: WorkerId) -> usize {
        let Some(key) = self
            .shared
            .pids
            .lock()
            .expect("pid map poisoned")
            .get(&pid)
            .cloned()
        else {
            return 0;
        };
        self.shared
            .connects
            .lock()
            .expect("connect counter poisoned")
            .get(&key)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl ClusterManager for InProcessManager {
    async fn launch(
        &self,
        opts: &LaunchOptions,
        configs: mpsc::UnboundedSender<WorkerConfig>,
    ) -> ClusterResult<()> {
        let manager: Arc<dyn ClusterManager> =
            self.self_weak
                .upgrade()
                .ok_or_else(|| ClusterError::LaunchFailed {
                    message: "manager dropped during launch".to_string(),
                })?;
        let setup = self.shared.setup.lock().expect("setup hook poisoned").clone();

        for _ in 0..opts.count {
            let key = format!(
                "inproc:{}",
                self.shared.next_key.fetch_add(1, Ordering::Relaxed)
            );
            let node = Node::worker(manager.clone(), self.shared.cookie, FatalPolicy::ShutdownNode);
            if let Some(setup) = &setup {
                setup(&node);
            }
            self.shared
                .nodes
                .lock()
                .expect("node map poisoned")
                .insert(key.clone(), node);

            let config = WorkerConfig::at(key);
            if configs.send(config).is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn connect(
        &self,
        pid: WorkerId,
        config: &WorkerConfig,
    ) -> ClusterResult<(BoxRead, BoxWrite)> {
        let key = match &config.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => self
                .shared
                .pids
                .lock()
                .expect("pid map poisoned")
                .get(&pid)
                .cloned()
                .ok_or(ClusterError::UnknownWorker { pid })?,
        };
        let node = self
            .shared
            .nodes
            .lock()
            .expect("node map poisoned")
            .get(&key)
            .cloned()
            .ok_or_else(|| ClusterError::LaunchFailed {
                message: format!("no in-process worker at `{key}`"),
            })?;
        if node.is_shut_down() {
            return Err(ClusterError::NotConnected { pid });
        }
        self.shared
            .pids
            .lock()
            .expect("pid map poisoned")
            .insert(pid, key.clone());
        *self
            .shared
            .connects
            .lock()
            .expect("connect counter poisoned")
            .entry(key)
            .or_insert(0) += 1;

        let (ours, theirs) = tokio::io::duplex(256 * 1024);
        let (our_read, our_write) = tokio::io::split(ours);
        let (their_read, their_write) = tokio::io::split(theirs);
        node.serve_incoming(Box::new(their_read), Box::new(their_write));
        Ok((Box::new(our_read), Box::new(our_write)))
    }

    async fn manage(&self, pid: WorkerId, _config: &WorkerConfig, op: WorkerOp) {
        tracing::debug!(pid, ?op, "manager lifecycle event");
    }

    async fn kill(&self, pid: WorkerId, _config: &WorkerConfig) {
        if let Some(node) = self.node(pid) {
            node.shutdown();
        }
    }
}
