//! Worker records and the process-local worker table.
//!
//! Each peer the local process knows about has one [`Worker`] record
//! keyed by id. Records own their streams exclusively: the read half is
//! consumed by the peer's dispatcher task, the write half lives behind the
//! record's async mutex so concurrent senders serialize at frame
//! boundaries. Peers reference each other by id only, never by pointer,
//! which keeps the strongly cyclic peer graph trivially droppable.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use procmesh_core::{Rrid, WorkerConfig, WorkerId};
use tokio::sync::Notify;

use crate::error::{ClusterError, ClusterResult};
use crate::wire::FrameWriter;

/// Lifecycle state of a peer.
///
/// `Terminating` and `Terminated` are terminal: once entered, the only
/// permitted transition is `Terminating` → `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// Record exists, no connection attempt yet (lazy placeholders).
    Created = 0,
    /// Streams are being established.
    Connecting = 1,
    /// Handshake complete, peer identified.
    Connected = 2,
    /// Orderly removal in progress.
    Terminating = 3,
    /// Streams closed, record awaiting purge.
    Terminated = 4,
    /// Peer never identified itself (failed handshake).
    Unknown = 5,
}

impl WorkerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => WorkerState::Created,
            1 => WorkerState::Connecting,
            2 => WorkerState::Connected,
            3 => WorkerState::Terminating,
            4 => WorkerState::Terminated,
            _ => WorkerState::Unknown,
        }
    }

    fn allows(self, next: WorkerState) -> bool {
        match self {
            WorkerState::Terminated => false,
            WorkerState::Terminating => next == WorkerState::Terminated,
            _ => true,
        }
    }
}

/// One-shot condition a peer flips when its handshake completes.
pub(crate) struct InitGate {
    done: AtomicBool,
    notify: Notify,
}

impl InitGate {
    fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Signal completion and wake all waiters. Idempotent.
    pub fn signal(&self) {
        self.done.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Whether the gate has been signalled.
    pub fn is_set(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Wait until the gate is signalled.
    pub async fn wait(&self) {
        loop {
            if self.is_set() {
                return;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before re-checking so the signal cannot race past.
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// Shared handle to a connection's write half.
///
/// `None` until the connection is established (lazy placeholders) and
/// again after the streams are closed.
pub(crate) type SharedWriter = Arc<tokio::sync::Mutex<Option<FrameWriter>>>;

/// A reference-count notification batched for a peer.
///
/// Queued in acquisition order and flushed before the peer's next
/// outbound frame, so a claim always reaches the owner ahead of any
/// request made through the claimed handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefNotice {
    /// This process acquired a handle to the peer's reference.
    Add(Rrid),
    /// This process dropped a handle to the peer's reference.
    Del(Rrid),
}

/// Record for one peer of the local process.
pub struct Worker {
    /// The peer's worker id.
    pub id: WorkerId,
    /// Launch/connect configuration for this peer.
    pub config: WorkerConfig,
    state: AtomicU8,
    version: Mutex<Option<String>>,
    /// Handle to the live connection's write half. Replaced wholesale when
    /// a connection is (re-)established so the record and the dispatcher
    /// share one writer.
    writer: Mutex<SharedWriter>,
    pub(crate) initialized: InitGate,
    /// Reference-count notifications batched for this peer, in
    /// acquisition order, flushed before the next outbound frame.
    pending_refs: Mutex<Vec<RefNotice>>,
    /// Serializes lazy connection establishment to this peer.
    pub(crate) connect_once: tokio::sync::OnceCell<()>,
    ospid: AtomicU32,
    cpu_threads: AtomicU32,
}

impl Worker {
    /// Create a record in the given initial state, with no streams yet.
    pub fn new(id: WorkerId, config: WorkerConfig, state: WorkerState) -> Self {
        Self {
            id,
            config,
            state: AtomicU8::new(state as u8),
            version: Mutex::new(None),
            writer: Mutex::new(Arc::new(tokio::sync::Mutex::new(None))),
            initialized: InitGate::new(),
            pending_refs: Mutex::new(Vec::new()),
            connect_once: tokio::sync::OnceCell::new(),
            ospid: AtomicU32::new(0),
            cpu_threads: AtomicU32::new(0),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Compare-and-set state transition.
    ///
    /// Returns `false` when the transition is not permitted (terminal
    /// states stay put); the losing side of a race observes the winner's
    /// state on its next read.
    pub fn set_state(&self, next: WorkerState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !WorkerState::from_u8(current).allows(next) {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Record the peer's advertised version (advisory only).
    pub fn set_version(&self, version: String) {
        *self.version.lock().expect("version mutex poisoned") = Some(version);
    }

    /// The peer's advertised version, if it completed a handshake.
    pub fn version(&self) -> Option<String> {
        self.version.lock().expect("version mutex poisoned").clone()
    }

    /// Record host vitals reported at join completion.
    pub fn set_vitals(&self, ospid: u32, cpu_threads: u32) {
        self.ospid.store(ospid, Ordering::Relaxed);
        self.cpu_threads.store(cpu_threads, Ordering::Relaxed);
    }

    /// The peer's OS process id, if reported.
    pub fn ospid(&self) -> Option<u32> {
        match self.ospid.load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// The peer host's logical CPU count, if reported.
    pub fn cpu_threads(&self) -> Option<u32> {
        match self.cpu_threads.load(Ordering::Relaxed) {
            0 => None,
            n => Some(n),
        }
    }

    /// The shared handle to this peer's write half.
    pub(crate) fn writer(&self) -> SharedWriter {
        self.writer.lock().expect("writer handle poisoned").clone()
    }

    /// Share an existing connection's writer handle with this record.
    pub(crate) fn set_writer_handle(&self, writer: SharedWriter) {
        *self.writer.lock().expect("writer handle poisoned") = writer;
    }

    /// Install the write half of an established connection.
    pub(crate) async fn attach_writer(&self, writer: FrameWriter) {
        let handle = self.writer();
        *handle.lock().await = Some(writer);
    }

    /// Close and drop the write half, if any.
    pub(crate) async fn close_writer(&self) {
        let handle = self.writer();
        let taken = handle.lock().await.take();
        if let Some(mut writer) = taken {
            writer.shutdown().await;
        }
    }

    /// Queue a dropped-handle notification for batching.
    pub(crate) fn queue_del(&self, rrid: Rrid) {
        self.pending_refs
            .lock()
            .expect("pending mutex poisoned")
            .push(RefNotice::Del(rrid));
    }

    /// Queue a new-handle notification for batching.
    pub(crate) fn queue_add(&self, rrid: Rrid) {
        self.pending_refs
            .lock()
            .expect("pending mutex poisoned")
            .push(RefNotice::Add(rrid));
    }

    /// Drain the batched notifications, preserving acquisition order.
    pub(crate) fn drain_refs(&self) -> Vec<RefNotice> {
        std::mem::take(&mut *self.pending_refs.lock().expect("pending mutex poisoned"))
    }
}

/// Process-local directory of peers.
#[derive(Default)]
pub struct WorkerTable {
    workers: Mutex<HashMap<WorkerId, Arc<Worker>>>,
    deleted: Mutex<HashSet<WorkerId>>,
}

impl WorkerTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, asserting id uniqueness.
    ///
    /// # Errors
    ///
    /// Fails if a live record already holds this id.
    pub fn register(&self, worker: Arc<Worker>) -> ClusterResult<()> {
        let mut workers = self.workers.lock().expect("worker table poisoned");
        if workers.contains_key(&worker.id) {
            return Err(ClusterError::LaunchFailed {
                message: format!("worker id {} already registered", worker.id),
            });
        }
        workers.insert(worker.id, worker);
        Ok(())
    }

    /// Remove a record, adding its id to the deleted set.
    ///
    /// Returns the record so the caller can finish cleanup. Ids enter the
    /// deleted set exactly here.
    pub fn deregister(&self, wid: WorkerId) -> Option<Arc<Worker>> {
        let removed = self
            .workers
            .lock()
            .expect("worker table poisoned")
            .remove(&wid);
        if removed.is_some() {
            self.deleted
                .lock()
                .expect("worker table poisoned")
                .insert(wid);
        }
        removed
    }

    /// Look up a live record.
    pub fn lookup(&self, wid: WorkerId) -> Option<Arc<Worker>> {
        self.workers
            .lock()
            .expect("worker table poisoned")
            .get(&wid)
            .cloned()
    }

    /// Whether this id was deregistered earlier.
    pub fn is_deleted(&self, wid: WorkerId) -> bool {
        self.deleted
            .lock()
            .expect("worker table poisoned")
            .contains(&wid)
    }

    /// Ids of all live records, sorted.
    pub fn ids(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self
            .workers
            .lock()
            .expect("worker table poisoned")
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    /// All live records.
    pub fn all(&self) -> Vec<Arc<Worker>> {
        self.workers
            .lock()
            .expect("worker table poisoned")
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(id: WorkerId, state: WorkerState) -> Arc<Worker> {
        Arc::new(Worker::new(id, WorkerConfig::default(), state))
    }

    #[test]
    fn test_state_transitions() {
        let w = worker(2, WorkerState::Created);
        assert!(w.set_state(WorkerState::Connecting));
        assert!(w.set_state(WorkerState::Connected));
        assert!(w.set_state(WorkerState::Terminating));
        assert_eq!(w.state(), WorkerState::Terminating);
    }

    #[test]
    fn test_terminating_only_advances_to_terminated() {
        let w = worker(2, WorkerState::Terminating);
        assert!(!w.set_state(WorkerState::Connected));
        assert!(w.set_state(WorkerState::Terminated));
        assert_eq!(w.state(), WorkerState::Terminated);
    }

    #[test]
    fn test_terminated_is_terminal() {
        let w = worker(2, WorkerState::Terminated);
        assert!(!w.set_state(WorkerState::Connecting));
        assert!(!w.set_state(WorkerState::Terminating));
        assert_eq!(w.state(), WorkerState::Terminated);
    }

    #[test]
    fn test_table_register_and_uniqueness() {
        let table = WorkerTable::new();
        table.register(worker(2, WorkerState::Created)).expect("register");
        assert!(table.register(worker(2, WorkerState::Created)).is_err());
        assert_eq!(table.ids(), vec![2]);
    }

    #[test]
    fn test_deregister_moves_to_deleted_set() {
        let table = WorkerTable::new();
        table.register(worker(3, WorkerState::Connected)).expect("register");
        assert!(!table.is_deleted(3));

        let removed = table.deregister(3).expect("present");
        assert_eq!(removed.id, 3);
        assert!(table.lookup(3).is_none());
        assert!(table.is_deleted(3));

        // Second deregister is a no-op.
        assert!(table.deregister(3).is_none());
    }

    #[tokio::test]
    async fn test_init_gate_wakes_waiters() {
        let w = worker(2, WorkerState::Connecting);
        let waiter = {
            let w = w.clone();
            tokio::spawn(async move { w.initialized.wait().await })
        };
        tokio::task::yield_now().await;
        w.initialized.signal();
        waiter.await.expect("join");
        assert!(w.initialized.is_set());
    }

    #[test]
    fn test_ref_notices_drain_in_order() {
        let w = worker(2, WorkerState::Connected);
        w.queue_add(Rrid::new(1, 1, 0));
        w.queue_del(Rrid::new(1, 1, 0));
        w.queue_del(Rrid::new(1, 2, 0));

        let drained = w.drain_refs();
        assert_eq!(
            drained,
            vec![
                RefNotice::Add(Rrid::new(1, 1, 0)),
                RefNotice::Del(Rrid::new(1, 1, 0)),
                RefNotice::Del(Rrid::new(1, 2, 0)),
            ]
        );
        assert!(w.drain_refs().is_empty());
    }

    #[test]
    fn test_vitals_roundtrip() {
        let w = worker(2, WorkerState::Connected);
        assert_eq!(w.ospid(), None);
        w.set_vitals(4242, 8);
        assert_eq!(w.ospid(), Some(4242));
        assert_eq!(w.cpu_threads(), Some(8));
    }
}
