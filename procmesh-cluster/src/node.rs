//! The process-scoped cluster node.
//!
//! A [`Node`] bundles everything one process contributes to a cluster:
//! its identity, the remote-value [`Registry`], the [`WorkerTable`], the
//! [`FuncRegistry`], the default worker pool and the handle to its
//! [`ClusterManager`]. Nothing here is a true global; tests instantiate
//! several independent nodes in one address space and wire them together
//! through an in-process manager.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use procmesh_core::{
    Cookie, JsonCodec, PayloadCodec, Rrid, Topology, WorkerId, CONTROLLER_ID,
};
use tokio::task::JoinHandle;

use crate::engine::{CallOutput, FuncRegistry};
use crate::error::{CapturedException, ClusterError, ClusterResult, RemoteException};
use crate::manager::ClusterManager;
use crate::message::Message;
use crate::registry::Registry;
use crate::wire::{BoxRead, BoxWrite, FrameReader, FrameWriter};
use crate::worker::{RefNotice, SharedWriter, Worker, WorkerTable};

/// What to do when the connection to the controller is lost or a result
/// cannot be serialized: the conditions that end a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FatalPolicy {
    /// Exit the OS process with status 1. The behavior of real worker
    /// processes.
    #[default]
    ExitProcess,
    /// Shut down this node only. Used when several nodes share one
    /// address space (in-process clusters, tests).
    ShutdownNode,
}

pub(crate) struct NodeShared<C: PayloadCodec> {
    id: AtomicU32,
    pub(crate) cookie: Cookie,
    pub(crate) codec: C,
    pub(crate) version: String,
    pub(crate) registry: Registry,
    pub(crate) workers: WorkerTable,
    pub(crate) funcs: FuncRegistry,
    next_ref: AtomicU64,
    pub(crate) next_worker_id: AtomicU32,
    pool: Mutex<BTreeSet<WorkerId>>,
    pub(crate) topology: Mutex<Topology>,
    pub(crate) lazy: AtomicBool,
    pub(crate) threaded_compute: AtomicBool,
    pub(crate) manager: Arc<dyn ClusterManager>,
    /// Serializes join-time peer snapshots against worker registration,
    /// so two concurrently joining workers always learn about each other.
    pub(crate) join_lock: tokio::sync::Mutex<()>,
    fatal_policy: FatalPolicy,
    shutting_down: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// One process's membership in a cluster.
///
/// Cheap to clone; all clones share the same state.
pub struct Node<C: PayloadCodec = JsonCodec> {
    pub(crate) shared: Arc<NodeShared<C>>,
}

impl<C: PayloadCodec> Clone for Node<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Node<JsonCodec> {
    /// Create the controller node (worker id 1) with the default codec.
    pub fn controller(manager: Arc<dyn ClusterManager>, cookie: Cookie) -> Self {
        Self::controller_with_codec(manager, cookie, JsonCodec)
    }

    /// Create a worker node with the default codec.
    ///
    /// The node has no id until the controller's join message assigns one.
    pub fn worker(
        manager: Arc<dyn ClusterManager>,
        cookie: Cookie,
        fatal_policy: FatalPolicy,
    ) -> Self {
        Self::worker_with_codec(manager, cookie, JsonCodec, fatal_policy)
    }
}

impl<C: PayloadCodec> Node<C> {
    /// Create the controller node (worker id 1).
    pub fn controller_with_codec(
        manager: Arc<dyn ClusterManager>,
        cookie: Cookie,
        codec: C,
    ) -> Self {
        let node = Self::build(manager, cookie, codec, FatalPolicy::ExitProcess);
        node.shared.id.store(CONTROLLER_ID, Ordering::Release);
        node
    }

    /// Create a worker node. The id arrives with the controller's join
    /// message.
    pub fn worker_with_codec(
        manager: Arc<dyn ClusterManager>,
        cookie: Cookie,
        codec: C,
        fatal_policy: FatalPolicy,
    ) -> Self {
        Self::build(manager, cookie, codec, fatal_policy)
    }

    fn build(
        manager: Arc<dyn ClusterManager>,
        cookie: Cookie,
        codec: C,
        fatal_policy: FatalPolicy,
    ) -> Self {
        let node = Self {
            shared: Arc::new(NodeShared {
                id: AtomicU32::new(0),
                cookie,
                codec,
                version: env!("CARGO_PKG_VERSION").to_string(),
                registry: Registry::new(),
                workers: WorkerTable::new(),
                funcs: FuncRegistry::new(),
                next_ref: AtomicU64::new(0),
                next_worker_id: AtomicU32::new(2),
                pool: Mutex::new(BTreeSet::new()),
                topology: Mutex::new(Topology::default()),
                lazy: AtomicBool::new(false),
                threaded_compute: AtomicBool::new(false),
                manager,
                join_lock: tokio::sync::Mutex::new(()),
                fatal_policy,
                shutting_down: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        };
        node.register_builtins();
        node
    }

    /// This process's worker id (0 before a worker has joined).
    pub fn id(&self) -> WorkerId {
        self.shared.id.load(Ordering::Acquire)
    }

    /// Whether this node is the controller.
    pub fn is_controller(&self) -> bool {
        self.id() == CONTROLLER_ID
    }

    /// Whether the node has been shut down.
    pub fn is_shut_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::Acquire)
    }

    /// Register a synchronous function callable from remote peers.
    pub fn register_fn<A, R, F>(&self, name: impl Into<String>, f: F)
    where
        A: serde::de::DeserializeOwned + Send + 'static,
        R: serde::Serialize,
        F: Fn(A) -> R + Send + Sync + 'static,
    {
        self.shared
            .funcs
            .register_fn(self.shared.codec.clone(), name, f);
    }

    /// Register an async, fallible function callable from remote peers.
    pub fn register_fn_async<A, R, F, Fut>(&self, name: impl Into<String>, f: F)
    where
        A: serde::de::DeserializeOwned + Send + 'static,
        R: serde::Serialize,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<R, CapturedException>> + Send + 'static,
    {
        self.shared
            .funcs
            .register_async(self.shared.codec.clone(), name, f);
    }

    /// The observed lifecycle state of a peer, if the peer is known.
    pub fn worker_state(&self, pid: WorkerId) -> Option<crate::worker::WorkerState> {
        self.shared.workers.lookup(pid).map(|worker| worker.state())
    }

    /// Whether the join handshake enabled the process-wide compute pool
    /// hint on this node.
    pub fn threaded_compute_enabled(&self) -> bool {
        self.shared.threaded_compute.load(Ordering::Acquire)
    }

    /// Ids of the workers in the default pool, sorted.
    pub fn workers(&self) -> Vec<WorkerId> {
        self.shared
            .pool
            .lock()
            .expect("pool mutex poisoned")
            .iter()
            .copied()
            .collect()
    }

    /// Accept an already-established incoming connection.
    ///
    /// Spawns this connection's dispatcher; the peer identifies itself
    /// with its first message.
    pub fn serve_incoming(&self, read: BoxRead, write: BoxWrite) {
        let reader = FrameReader::new(read);
        let writer: SharedWriter =
            Arc::new(tokio::sync::Mutex::new(Some(FrameWriter::new(write))));
        crate::dispatcher::spawn_dispatcher(self.clone(), reader, writer, true, None);
    }

    /// Shut this node down: abort its tasks and close every peer stream.
    ///
    /// Idempotent. Peers observe the closed streams as this worker dying.
    pub fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(pid = self.id(), "node shutting down");
        for handle in self
            .shared
            .tasks
            .lock()
            .expect("task list poisoned")
            .drain(..)
        {
            handle.abort();
        }
        let workers = self.shared.workers.all();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                for worker in workers {
                    worker.set_state(crate::worker::WorkerState::Terminated);
                    worker.close_writer().await;
                }
            });
        }
    }

    // ---- crate-internal plumbing -------------------------------------

    pub(crate) fn set_id(&self, id: WorkerId) {
        self.shared.id.store(id, Ordering::Release);
    }

    /// Mint a fresh reference id owned by this process.
    pub(crate) fn mint_rrid(&self, tag: u32) -> Rrid {
        let id = self.shared.next_ref.fetch_add(1, Ordering::Relaxed) + 1;
        Rrid::new(self.id(), id, tag)
    }

    /// Resolve a peer id to its record.
    ///
    /// A deregistered peer surfaces as the peer-death exception so late
    /// callers see the same outcome as in-flight ones.
    pub(crate) fn worker_record(&self, pid: WorkerId) -> ClusterResult<Arc<Worker>> {
        if let Some(worker) = self.shared.workers.lookup(pid) {
            return Ok(worker);
        }
        if self.shared.workers.is_deleted(pid) {
            return Err(RemoteException::peer_died(pid).into());
        }
        Err(ClusterError::UnknownWorker { pid })
    }

    /// Spawn a task owned by this node (aborted at shutdown).
    pub(crate) fn spawn(&self, fut: impl std::future::Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(fut);
        self.shared
            .tasks
            .lock()
            .expect("task list poisoned")
            .push(handle);
    }

    /// Send one message to a peer, flushing batched refcount
    /// notifications first. Concurrent senders serialize on the peer's
    /// write mutex at frame granularity.
    pub(crate) async fn send_to(
        &self,
        worker: &Worker,
        response_to: Rrid,
        notify: Rrid,
        msg: &Message,
    ) -> ClusterResult<()> {
        let body = self.shared.codec.encode(msg)?;
        // Flush pending refcount notices ahead of the frame, preserving
        // acquisition order; runs of drops coalesce into one batch.
        let mut ref_frames: Vec<Vec<u8>> = Vec::new();
        let mut dels: Vec<Rrid> = Vec::new();
        for notice in worker.drain_refs() {
            match notice {
                RefNotice::Del(rrid) => dels.push(rrid),
                RefNotice::Add(rrid) => {
                    if !dels.is_empty() {
                        ref_frames.push(self.shared.codec.encode(&Message::DelClient {
                            rrids: std::mem::take(&mut dels),
                        })?);
                    }
                    ref_frames.push(self.shared.codec.encode(&Message::AddClient { rrid })?);
                }
            }
        }
        if !dels.is_empty() {
            ref_frames.push(self.shared.codec.encode(&Message::DelClient { rrids: dels })?);
        }

        let handle = worker.writer();
        let mut guard = handle.lock().await;
        let writer = guard
            .as_mut()
            .ok_or(ClusterError::NotConnected { pid: worker.id })?;
        for frame in ref_frames {
            writer.write_frame(Rrid::NULL, Rrid::NULL, &frame).await?;
        }
        writer.write_frame(response_to, notify, &body).await?;
        Ok(())
    }

    /// Send a message on a connection that has no worker record yet
    /// (handshake-phase replies).
    pub(crate) async fn send_on(
        &self,
        writer: &SharedWriter,
        response_to: Rrid,
        notify: Rrid,
        msg: &Message,
    ) -> ClusterResult<()> {
        let body = self.shared.codec.encode(msg)?;
        let mut guard = writer.lock().await;
        let writer = guard.as_mut().ok_or(ClusterError::NodeShutDown)?;
        writer.write_frame(response_to, notify, &body).await?;
        Ok(())
    }

    /// Queue a dropped-handle notification for the owner of `rrid`.
    pub(crate) fn queue_del_client(&self, owner: WorkerId, rrid: Rrid) {
        if let Some(worker) = self.shared.workers.lookup(owner) {
            worker.queue_del(rrid);
        }
    }

    pub(crate) fn add_to_pool(&self, wid: WorkerId) {
        self.shared
            .pool
            .lock()
            .expect("pool mutex poisoned")
            .insert(wid);
    }

    pub(crate) fn remove_from_pool(&self, wid: WorkerId) {
        self.shared
            .pool
            .lock()
            .expect("pool mutex poisoned")
            .remove(&wid);
    }

    /// React to a condition that ends a worker process: controller
    /// connection lost, or a result that could not be serialized.
    pub(crate) fn fatal(&self, reason: &str) {
        tracing::error!(pid = self.id(), reason, "fatal cluster error");
        match self.shared.fatal_policy {
            FatalPolicy::ExitProcess => std::process::exit(1),
            FatalPolicy::ShutdownNode => self.shutdown(),
        }
    }

    // ---- builtin functions -------------------------------------------

    /// Built-in functions every node serves: reference access for remote
    /// futures and the controller-side removal escalation.
    fn register_builtins(&self) {
        let codec = self.shared.codec.clone();
        let shared = Arc::downgrade(&self.shared);
        self.shared.funcs.register(
            "__ref_fetch",
            Arc::new(move |args: Bytes| {
                let codec = codec.clone();
                let shared = shared.clone();
                Box::pin(async move {
                    let shared = upgrade(&shared)?;
                    let rrid: Rrid = decode_args(&codec, &args)?;
                    match registry_value(shared.registry.fetch(rrid).await)? {
                        Ok(bytes) => Ok(CallOutput::new(bytes)),
                        Err(exc) => Err(exc),
                    }
                })
            }),
        );

        let codec = self.shared.codec.clone();
        let shared = Arc::downgrade(&self.shared);
        self.shared.funcs.register(
            "__ref_take",
            Arc::new(move |args: Bytes| {
                let codec = codec.clone();
                let shared = shared.clone();
                Box::pin(async move {
                    let shared = upgrade(&shared)?;
                    let rrid: Rrid = decode_args(&codec, &args)?;
                    let entry = shared.registry.lookup(rrid).ok_or_else(|| {
                        RemoteException::new(
                            0,
                            CapturedException::bare(format!("unknown remote reference {rrid}")),
                        )
                    })?;
                    // Producing a value out of an unbuffered slot: hold the
                    // sync lock from here until the reply frame is written.
                    let guard = match entry.sync_lock() {
                        Some(lock) => Some(lock.lock_owned().await),
                        None => None,
                    };
                    match registry_value(shared.registry.take(rrid).await)? {
                        Ok(bytes) => Ok(match guard {
                            Some(guard) => CallOutput::with_guard(bytes, guard),
                            None => CallOutput::new(bytes),
                        }),
                        Err(exc) => Err(exc),
                    }
                })
            }),
        );

        let codec = self.shared.codec.clone();
        let shared = Arc::downgrade(&self.shared);
        self.shared.funcs.register(
            "__ref_put",
            Arc::new(move |args: Bytes| {
                let codec = codec.clone();
                let shared = shared.clone();
                Box::pin(async move {
                    let shared = upgrade(&shared)?;
                    let (rrid, value): (Rrid, Bytes) = decode_args(&codec, &args)?;
                    shared.registry.put(rrid, Ok(value)).map_err(|e| {
                        RemoteException::new(0, CapturedException::bare(e.to_string()))
                    })?;
                    let ack = codec.encode(&"ok").map_err(|e| {
                        RemoteException::new(0, CapturedException::here(e.to_string()))
                    })?;
                    Ok(CallOutput::new(Bytes::from(ack)))
                })
            }),
        );

        let codec = self.shared.codec.clone();
        let node = self.clone_weak();
        self.shared.funcs.register(
            "__rmprocs",
            Arc::new(move |args: Bytes| {
                let codec = codec.clone();
                let node = node.clone();
                Box::pin(async move {
                    let node = node.upgrade().ok_or_else(|| {
                        RemoteException::new(0, CapturedException::bare("node is shut down"))
                    })?;
                    let pid: WorkerId = decode_args(&codec, &args)?;
                    node.rmprocs(&[pid]).await.map_err(|e| {
                        RemoteException::new(0, CapturedException::bare(e.to_string()))
                    })?;
                    let ack = codec.encode(&"ok").map_err(|e| {
                        RemoteException::new(0, CapturedException::here(e.to_string()))
                    })?;
                    Ok(CallOutput::new(Bytes::from(ack)))
                })
            }),
        );
    }

    fn clone_weak(&self) -> WeakNode<C> {
        WeakNode {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

/// Weak node handle used inside builtin handlers to avoid a reference
/// cycle through the function registry.
pub(crate) struct WeakNode<C: PayloadCodec> {
    shared: Weak<NodeShared<C>>,
}

impl<C: PayloadCodec> Clone for WeakNode<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C: PayloadCodec> WeakNode<C> {
    pub(crate) fn upgrade(&self) -> Option<Node<C>> {
        self.shared.upgrade().map(|shared| Node { shared })
    }
}

fn upgrade<C: PayloadCodec>(
    shared: &Weak<NodeShared<C>>,
) -> Result<Arc<NodeShared<C>>, RemoteException> {
    shared
        .upgrade()
        .ok_or_else(|| RemoteException::new(0, CapturedException::bare("node is shut down")))
}

fn decode_args<C: PayloadCodec, T: serde::de::DeserializeOwned>(
    codec: &C,
    args: &Bytes,
) -> Result<T, RemoteException> {
    codec
        .decode(args)
        .map_err(|e| RemoteException::new(0, CapturedException::bare(e.to_string())))
}

fn registry_value(
    value: ClusterResult<crate::registry::SlotValue>,
) -> Result<crate::registry::SlotValue, RemoteException> {
    value.map_err(|e| RemoteException::new(0, CapturedException::bare(e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::InProcessManager;
    use crate::registry::Buffering;

    fn test_node() -> Node {
        let cookie = Cookie::random();
        let manager = InProcessManager::new(cookie);
        Node::controller(manager, cookie)
    }

    #[test]
    fn test_controller_identity() {
        let node = test_node();
        assert_eq!(node.id(), CONTROLLER_ID);
        assert!(node.is_controller());
        assert!(node.workers().is_empty());
    }

    #[test]
    fn test_rrid_minting_is_unique_and_monotonic() {
        let node = test_node();
        let a = node.mint_rrid(0);
        let b = node.mint_rrid(0);
        assert_eq!(a.whence, CONTROLLER_ID);
        assert_ne!(a, b);
        assert!(b.id > a.id);
    }

    #[tokio::test]
    async fn test_builtin_ref_fetch() {
        let node = test_node();
        let rrid = node.mint_rrid(0);
        node.shared
            .registry
            .register(rrid, Buffering::Buffered, node.id(), 0)
            .expect("register");
        node.shared
            .registry
            .put(rrid, Ok(Bytes::from_static(b"99")))
            .expect("put");

        let args = Bytes::from(node.shared.codec.encode(&rrid).expect("encode"));
        let out = crate::engine::run_call(node.id(), &node.shared.funcs, "__ref_fetch", args)
            .await
            .expect("fetch");
        assert_eq!(out.bytes, Bytes::from_static(b"99"));
    }

    #[tokio::test]
    async fn test_builtin_ref_take_holds_sync_guard() {
        let node = test_node();
        let rrid = node.mint_rrid(0);
        node.shared
            .registry
            .register(rrid, Buffering::Unbuffered, node.id(), 0)
            .expect("register");
        node.shared
            .registry
            .put(rrid, Ok(Bytes::from_static(b"v")))
            .expect("put");

        let args = Bytes::from(node.shared.codec.encode(&rrid).expect("encode"));
        let out = crate::engine::run_call(node.id(), &node.shared.funcs, "__ref_take", args)
            .await
            .expect("take");
        assert!(out.sync_guard.is_some(), "unbuffered take carries the lock");
        // Consumed, but the whence client still holds the entry; it is
        // reclaimed only when the client set drains.
        assert!(node.shared.registry.lookup(rrid).is_some());
        node.shared.registry.remove_client(rrid, node.id());
        assert!(node.shared.registry.lookup(rrid).is_none());
    }

    #[tokio::test]
    async fn test_unknown_worker_vs_deleted_worker() {
        let node = test_node();
        assert!(matches!(
            node.worker_record(9).err(),
            Some(ClusterError::UnknownWorker { pid: 9 })
        ));

        let worker = Arc::new(Worker::new(
            9,
            Default::default(),
            crate::worker::WorkerState::Connected,
        ));
        node.shared.workers.register(worker).expect("register");
        node.shared.workers.deregister(9);
        assert!(matches!(
            node.worker_record(9).err(),
            Some(ClusterError::Remote(ref e)) if e.pid == 9
        ));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let node = test_node();
        node.shutdown();
        node.shutdown();
        assert!(node.is_shut_down());
    }
}
