//! Process-local registry of remote values.
//!
//! Every outstanding remote reference resolves, on exactly one worker, to a
//! [`RemoteValue`]: a single-value rendezvous slot plus bookkeeping about
//! who still holds handles to it. The registry maps reference ids to these
//! records under one mutex; blocking operations (take, fetch) drop the
//! mutex before waiting on the slot.
//!
//! Lifetime rule: an entry is reclaimed once its client set is empty and
//! the slot has been consumed (or filled with a value nobody will consume).
//! At most one put ever succeeds against a reference.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use procmesh_core::{Rrid, WorkerId};
use tokio::sync::Notify;

use crate::error::{ClusterError, ClusterResult, RemoteException};

/// The value a slot eventually holds: raw result bytes, or the exception
/// captured producing them.
pub type SlotValue = Result<Bytes, RemoteException>;

/// Whether a slot buffers its value or hands it off synchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Buffering {
    /// The value persists in the slot; `fetch` may observe it repeatedly.
    Buffered,
    /// Producer and consumer rendezvous; the producing side must hold the
    /// entry's sync lock from the decision to produce until the result is
    /// on the wire.
    Unbuffered,
}

/// Single-value rendezvous holding the eventual result of a remote call.
struct Slot {
    state: Mutex<SlotState>,
    filled: Notify,
}

#[derive(Default)]
struct SlotState {
    value: Option<SlotValue>,
    put_done: bool,
    consumed: bool,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::default()),
            filled: Notify::new(),
        }
    }

    /// Store the value. At most one put ever succeeds.
    fn put(&self, rrid: Rrid, value: SlotValue) -> ClusterResult<()> {
        let mut state = self.state.lock().expect("slot mutex poisoned");
        if state.put_done {
            return Err(ClusterError::DoublePut { rrid });
        }
        state.value = Some(value);
        state.put_done = true;
        drop(state);
        self.filled.notify_waiters();
        Ok(())
    }

    /// Wait until filled, then consume the value.
    async fn take(&self) -> SlotValue {
        loop {
            let notified = self.filled.notified();
            tokio::pin!(notified);
            // Register for wakeups before re-checking, so a concurrent
            // put's notify_waiters cannot slip between check and await.
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().expect("slot mutex poisoned");
                if let Some(value) = state.value.take() {
                    state.consumed = true;
                    return value;
                }
            }
            notified.await;
        }
    }

    /// Wait until filled, then observe the value without consuming it.
    async fn fetch(&self) -> SlotValue {
        loop {
            let notified = self.filled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.state.lock().expect("slot mutex poisoned");
                if let Some(value) = &state.value {
                    return value.clone();
                }
                if state.consumed {
                    // A concurrent take won the race; surface the same
                    // closed-slot outcome a late fetch would see.
                    return Err(RemoteException::new(
                        0,
                        crate::error::CapturedException::bare(
                            "remote value was already taken",
                        ),
                    ));
                }
            }
            notified.await;
        }
    }

    fn is_put_done(&self) -> bool {
        self.state.lock().expect("slot mutex poisoned").put_done
    }

    fn is_consumed(&self) -> bool {
        self.state.lock().expect("slot mutex poisoned").consumed
    }
}

/// One owned remote value: rendezvous slot plus distributed-refcount state.
pub struct RemoteValue {
    rrid: Rrid,
    slot: Slot,
    /// Worker whose reply will fill the slot (0 when produced locally).
    waiting_for: Mutex<WorkerId>,
    /// Workers holding an outstanding handle to this value.
    clients: Mutex<HashSet<WorkerId>>,
    /// Present iff the slot is unbuffered.
    sync_lock: Option<Arc<tokio::sync::Mutex<()>>>,
}

impl RemoteValue {
    /// The reference id this value is registered under.
    pub fn rrid(&self) -> Rrid {
        self.rrid
    }

    /// The worker whose reply will fill the slot (0 for local producers).
    pub fn waiting_for(&self) -> WorkerId {
        *self.waiting_for.lock().expect("clients mutex poisoned")
    }

    /// Point the slot at a different producer.
    pub fn set_waiting_for(&self, wid: WorkerId) {
        *self.waiting_for.lock().expect("clients mutex poisoned") = wid;
    }

    /// The sync lock, present only on unbuffered entries.
    ///
    /// A producer sending this entry's value to a remote consumer must
    /// hold the lock until the result frame is fully written.
    pub fn sync_lock(&self) -> Option<Arc<tokio::sync::Mutex<()>>> {
        self.sync_lock.clone()
    }

    /// Snapshot of the current client set.
    pub fn clients(&self) -> HashSet<WorkerId> {
        self.clients.lock().expect("clients mutex poisoned").clone()
    }

    /// Wait for the value and consume it.
    pub async fn take(&self) -> SlotValue {
        self.slot.take().await
    }

    /// Wait for the value without consuming it.
    pub async fn fetch(&self) -> SlotValue {
        self.slot.fetch().await
    }

    fn reclaimable(&self) -> bool {
        let clients = self.clients.lock().expect("clients mutex poisoned");
        clients.is_empty() && (self.slot.is_consumed() || self.slot.is_put_done())
    }
}

/// Process-local table of owned remote values.
///
/// All structural mutation happens under the single `entries` mutex, which
/// is never held across an await point.
#[derive(Default)]
pub struct Registry {
    entries: Mutex<HashMap<Rrid, Arc<RemoteValue>>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh entry.
    ///
    /// `client` seeds the client set (callers pass the reference's
    /// `whence`); `waiting_for` names the worker whose reply will fill the
    /// slot, or 0 for a local producer.
    ///
    /// # Errors
    ///
    /// [`ClusterError::DuplicateRef`] if the id is already registered.
    pub fn register(
        &self,
        rrid: Rrid,
        buffering: Buffering,
        client: WorkerId,
        waiting_for: WorkerId,
    ) -> ClusterResult<Arc<RemoteValue>> {
        let mut entries = self.entries.lock().expect("registry mutex poisoned");
        if entries.contains_key(&rrid) {
            return Err(ClusterError::DuplicateRef { rrid });
        }
        let value = Arc::new(RemoteValue {
            rrid,
            slot: Slot::new(),
            waiting_for: Mutex::new(waiting_for),
            clients: Mutex::new(HashSet::from([client])),
            sync_lock: match buffering {
                Buffering::Buffered => None,
                Buffering::Unbuffered => Some(Arc::new(tokio::sync::Mutex::new(()))),
            },
        });
        entries.insert(rrid, value.clone());
        Ok(value)
    }

    /// Look up an entry without blocking.
    pub fn lookup(&self, rrid: Rrid) -> Option<Arc<RemoteValue>> {
        self.entries
            .lock()
            .expect("registry mutex poisoned")
            .get(&rrid)
            .cloned()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("registry mutex poisoned").len()
    }

    /// Whether the registry holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store a value into an entry. At most one put per reference ever
    /// succeeds; the entry is reclaimed if its clients are already gone.
    ///
    /// # Errors
    ///
    /// [`ClusterError::UnknownRef`] if no entry exists,
    /// [`ClusterError::DoublePut`] on a second put.
    pub fn put(&self, rrid: Rrid, value: SlotValue) -> ClusterResult<()> {
        let entry = self
            .lookup(rrid)
            .ok_or(ClusterError::UnknownRef { rrid })?;
        entry.slot.put(rrid, value)?;
        self.maybe_reclaim(&entry);
        Ok(())
    }

    /// Wait for an entry's value and consume it.
    ///
    /// # Errors
    ///
    /// [`ClusterError::UnknownRef`] if no entry exists.
    pub async fn take(&self, rrid: Rrid) -> ClusterResult<SlotValue> {
        let entry = self
            .lookup(rrid)
            .ok_or(ClusterError::UnknownRef { rrid })?;
        let value = entry.take().await;
        self.maybe_reclaim(&entry);
        Ok(value)
    }

    /// Wait for an entry's value without consuming it.
    ///
    /// # Errors
    ///
    /// [`ClusterError::UnknownRef`] if no entry exists.
    pub async fn fetch(&self, rrid: Rrid) -> ClusterResult<SlotValue> {
        let entry = self
            .lookup(rrid)
            .ok_or(ClusterError::UnknownRef { rrid })?;
        Ok(entry.fetch().await)
    }

    /// Record that `wid` now holds a handle to the entry.
    pub fn add_client(&self, rrid: Rrid, wid: WorkerId) -> ClusterResult<()> {
        let entry = self
            .lookup(rrid)
            .ok_or(ClusterError::UnknownRef { rrid })?;
        entry
            .clients
            .lock()
            .expect("clients mutex poisoned")
            .insert(wid);
        Ok(())
    }

    /// Record that `wid` dropped its handles to the entry, reclaiming it
    /// when nothing else keeps it alive. Unknown ids are ignored: the
    /// notification may race the entry's reclamation.
    pub fn remove_client(&self, rrid: Rrid, wid: WorkerId) {
        if let Some(entry) = self.lookup(rrid) {
            entry
                .clients
                .lock()
                .expect("clients mutex poisoned")
                .remove(&wid);
            self.maybe_reclaim(&entry);
        }
    }

    /// Resolve every entry waiting on `wid` to a peer-death exception.
    ///
    /// Called by worker deregistration so that no consumer hangs on a
    /// reply that will never arrive.
    pub fn fail_all_waiting_on(&self, wid: WorkerId) {
        let waiting: Vec<Arc<RemoteValue>> = {
            let entries = self.entries.lock().expect("registry mutex poisoned");
            entries
                .values()
                .filter(|entry| entry.waiting_for() == wid)
                .cloned()
                .collect()
        };
        for entry in waiting {
            // A concurrent legitimate put wins; the double-put error here
            // is the benign race, not a fault.
            let _ = entry
                .slot
                .put(entry.rrid, Err(RemoteException::peer_died(wid)));
        }
    }

    /// Drop an entry outright, regardless of clients or slot state.
    ///
    /// For reply slots abandoned before their request ever went out; a
    /// late result for the id is dropped with a log line.
    pub(crate) fn discard(&self, rrid: Rrid) {
        self.entries
            .lock()
            .expect("registry mutex poisoned")
            .remove(&rrid);
    }

    fn maybe_reclaim(&self, entry: &Arc<RemoteValue>) {
        if entry.reclaimable() {
            self.entries
                .lock()
                .expect("registry mutex poisoned")
                .remove(&entry.rrid);
        }
    }
}
