//! Public RPC verbs and client-side futures.
//!
//! The four verbs differ only in what travels back:
//!
//! - [`Node::call`] submits a thunk and returns a [`RemoteFuture`]; the
//!   result stays on the executor until fetched or taken.
//! - [`Node::call_fetch`] is the blocking round trip: the value comes
//!   back with the reply, and a remote failure surfaces as
//!   [`ClusterError::Remote`].
//! - [`Node::call_wait`] waits for completion only.
//! - [`Node::remote_do`] is fire-and-forget.
//!
//! Replies are correlated by reference id, not by order: pipelined
//! requests on one connection answer in completion order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use procmesh_core::{JsonCodec, PayloadCodec, Rrid, WorkerId};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::engine::run_call;
use crate::error::{ClusterError, ClusterResult};
use crate::message::Message;
use crate::node::Node;
use crate::registry::Buffering;
use crate::worker::Worker;

/// Client-side handle to a value computed (or stored) on some worker.
///
/// Wraps the reference id plus the executor's worker id. Fetched values
/// are cached locally, so repeated [`fetch`](RemoteFuture::fetch) calls
/// hit the network once. Dropping the handle releases this process's
/// claim on the remote value.
pub struct RemoteFuture<C: PayloadCodec = JsonCodec> {
    rrid: Rrid,
    pid: WorkerId,
    node: Node<C>,
    cache: Mutex<Option<Bytes>>,
    consumed: AtomicBool,
}

impl<C: PayloadCodec> RemoteFuture<C> {
    fn new(node: Node<C>, pid: WorkerId, rrid: Rrid) -> Self {
        Self {
            rrid,
            pid,
            node,
            cache: Mutex::new(None),
            consumed: AtomicBool::new(false),
        }
    }

    /// The reference id naming the value.
    pub fn rrid(&self) -> Rrid {
        self.rrid
    }

    /// The worker holding the value.
    pub fn pid(&self) -> WorkerId {
        self.pid
    }

    /// Wait for the value without consuming it on the owner.
    ///
    /// # Errors
    ///
    /// [`ClusterError::Remote`] if the producing thunk failed or the
    /// owner died.
    pub async fn fetch(&self) -> ClusterResult<Bytes> {
        if let Some(cached) = self.cache.lock().expect("cache poisoned").clone() {
            return Ok(cached);
        }
        let bytes = if self.pid == self.node.id() {
            self.node
                .shared
                .registry
                .fetch(self.rrid)
                .await?
                .map_err(ClusterError::Remote)?
        } else {
            let args = encode_args(&self.node, &self.rrid)?;
            self.node.call_fetch(self.pid, "__ref_fetch", args).await?
        };
        *self.cache.lock().expect("cache poisoned") = Some(bytes.clone());
        Ok(bytes)
    }

    /// Fetch and decode the value.
    pub async fn fetch_typed<R: DeserializeOwned>(&self) -> ClusterResult<R> {
        let bytes = self.fetch().await?;
        Ok(self.node.shared.codec.decode(&bytes)?)
    }

    /// Wait for the value and consume it on the owner.
    pub async fn take(&self) -> ClusterResult<Bytes> {
        self.consumed.store(true, Ordering::Release);
        if self.pid == self.node.id() {
            return self
                .node
                .shared
                .registry
                .take(self.rrid)
                .await?
                .map_err(ClusterError::Remote);
        }
        let args = encode_args(&self.node, &self.rrid)?;
        self.node.call_fetch(self.pid, "__ref_take", args).await
    }

    /// Take and decode the value.
    pub async fn take_typed<R: DeserializeOwned>(&self) -> ClusterResult<R> {
        let bytes = self.take().await?;
        Ok(self.node.shared.codec.decode(&bytes)?)
    }

    /// Store raw bytes into the reference. At most one put ever succeeds
    /// against a reference, local or remote.
    pub async fn put(&self, value: Bytes) -> ClusterResult<()> {
        if self.pid == self.node.id() {
            return self.node.shared.registry.put(self.rrid, Ok(value));
        }
        let args = encode_args(&self.node, &(self.rrid, value))?;
        self.node.call_fetch(self.pid, "__ref_put", args).await?;
        Ok(())
    }

    /// Encode and store a value into the reference.
    pub async fn put_typed<T: Serialize>(&self, value: &T) -> ClusterResult<()> {
        let bytes = Bytes::from(self.node.shared.codec.encode(value)?);
        self.put(bytes).await
    }
}

impl<C: PayloadCodec> Drop for RemoteFuture<C> {
    fn drop(&mut self) {
        if self.pid == self.node.id() {
            self.node
                .shared
                .registry
                .remove_client(self.rrid, self.node.id());
        } else {
            // Batched; flushed before the next frame to the owner.
            self.node.queue_del_client(self.pid, self.rrid);
        }
    }
}

impl<C: PayloadCodec> Node<C> {
    /// Submit a thunk on `pid`; the result stays there until fetched.
    pub async fn call(
        &self,
        pid: WorkerId,
        func: &str,
        args: Bytes,
    ) -> ClusterResult<RemoteFuture<C>> {
        let rrid = self.mint_rrid(0);
        if pid == self.id() {
            crate::dispatcher::schedule_call(self, rrid, func.to_string(), args);
        } else {
            let worker = self.target(pid).await?;
            let msg = Message::Call {
                func: func.to_string(),
                args,
            };
            self.send_to(&worker, rrid, Rrid::NULL, &msg).await?;
        }
        Ok(RemoteFuture::new(self.clone(), pid, rrid))
    }

    /// [`call`](Node::call) with encoded arguments.
    pub async fn call_typed<A: Serialize>(
        &self,
        pid: WorkerId,
        func: &str,
        args: &A,
    ) -> ClusterResult<RemoteFuture<C>> {
        let args = encode_args(self, args)?;
        self.call(pid, func, args).await
    }

    /// Execute on `pid` and wait for the value.
    ///
    /// # Errors
    ///
    /// [`ClusterError::Remote`] carries the executor-side capture when
    /// the thunk failed or the executor died mid-call.
    pub async fn call_fetch(
        &self,
        pid: WorkerId,
        func: &str,
        args: Bytes,
    ) -> ClusterResult<Bytes> {
        if pid == self.id() {
            return match run_call(self.id(), &self.shared.funcs, func, args).await {
                Ok(out) => Ok(out.bytes),
                Err(exc) => Err(exc.into()),
            };
        }

        let notify = self.mint_rrid(0);
        self.shared
            .registry
            .register(notify, Buffering::Buffered, self.id(), pid)?;
        let sent = async {
            let worker = self.target(pid).await?;
            let msg = Message::CallFetch {
                func: func.to_string(),
                args,
            };
            self.send_to(&worker, Rrid::NULL, notify, &msg).await
        }
        .await;
        if let Err(error) = sent {
            self.shared.registry.discard(notify);
            return Err(error);
        }
        let value = self.shared.registry.take(notify).await;
        // One-shot reply slot: nothing else may ever read it.
        self.shared.registry.discard(notify);
        value?.map_err(ClusterError::Remote)
    }

    /// [`call_fetch`](Node::call_fetch) with encoded arguments and a
    /// decoded result.
    pub async fn call_fetch_typed<A: Serialize, R: DeserializeOwned>(
        &self,
        pid: WorkerId,
        func: &str,
        args: &A,
    ) -> ClusterResult<R> {
        let args = encode_args(self, args)?;
        let bytes = self.call_fetch(pid, func, args).await?;
        Ok(self.shared.codec.decode(&bytes)?)
    }

    /// Execute on `pid` and wait for completion; the value stays remote.
    pub async fn call_wait(&self, pid: WorkerId, func: &str, args: Bytes) -> ClusterResult<()> {
        if pid == self.id() {
            return match run_call(self.id(), &self.shared.funcs, func, args).await {
                Ok(_) => Ok(()),
                Err(exc) => Err(exc.into()),
            };
        }

        let response = self.mint_rrid(0);
        let notify = self.mint_rrid(0);
        self.shared
            .registry
            .register(notify, Buffering::Buffered, self.id(), pid)?;
        let sent = async {
            let worker = self.target(pid).await?;
            let msg = Message::CallWait {
                func: func.to_string(),
                args,
            };
            self.send_to(&worker, response, notify, &msg).await
        }
        .await;
        if let Err(error) = sent {
            self.shared.registry.discard(notify);
            return Err(error);
        }

        let ack = self.shared.registry.take(notify).await;
        self.shared.registry.discard(notify);
        // The completion result is not wanted; release the executor-side
        // binding either way.
        self.queue_del_client(pid, response);
        match ack? {
            Ok(_ack) => Ok(()),
            Err(exc) => Err(exc.into()),
        }
    }

    /// [`call_wait`](Node::call_wait) with encoded arguments.
    pub async fn call_wait_typed<A: Serialize>(
        &self,
        pid: WorkerId,
        func: &str,
        args: &A,
    ) -> ClusterResult<()> {
        let args = encode_args(self, args)?;
        self.call_wait(pid, func, args).await
    }

    /// Fire-and-forget execution on `pid`. Failures are logged on the
    /// executor; nothing comes back.
    pub async fn remote_do(&self, pid: WorkerId, func: &str, args: Bytes) -> ClusterResult<()> {
        if pid == self.id() {
            let node = self.clone();
            let func = func.to_string();
            self.spawn(async move {
                if let Err(exc) = run_call(node.id(), &node.shared.funcs, &func, args).await {
                    tracing::error!(error = %exc, func = %func, "remote_do failed");
                }
            });
            return Ok(());
        }
        let worker = self.target(pid).await?;
        let msg = Message::RemoteDo {
            func: func.to_string(),
            args,
        };
        self.send_to(&worker, Rrid::NULL, Rrid::NULL, &msg).await
    }

    /// [`remote_do`](Node::remote_do) with encoded arguments.
    pub async fn remote_do_typed<A: Serialize>(
        &self,
        pid: WorkerId,
        func: &str,
        args: &A,
    ) -> ClusterResult<()> {
        let args = encode_args(self, args)?;
        self.remote_do(pid, func, args).await
    }

    /// Adopt a handle to a value owned by another worker.
    ///
    /// Registers this process in the owner's client set, keeping the
    /// value alive after the original holder drops its handle. The
    /// announcement is batched on the owner's record and flushes before
    /// the next frame to that peer, so it always precedes a request made
    /// through the returned handle. Claims are per worker, not per
    /// handle: adopting the same reference twice from one process still
    /// takes a single drop to release.
    pub fn adopt_ref(&self, pid: WorkerId, rrid: Rrid) -> ClusterResult<RemoteFuture<C>> {
        if pid == self.id() {
            self.shared.registry.add_client(rrid, self.id())?;
        } else {
            self.worker_record(pid)?.queue_add(rrid);
        }
        Ok(RemoteFuture::new(self.clone(), pid, rrid))
    }

    /// Create a reference owned by this process, to be filled with
    /// [`RemoteFuture::put`] and read from anywhere.
    pub fn remote_ref(&self, buffering: Buffering) -> ClusterResult<RemoteFuture<C>> {
        let rrid = self.mint_rrid(0);
        self.shared
            .registry
            .register(rrid, buffering, self.id(), 0)?;
        Ok(RemoteFuture::new(self.clone(), self.id(), rrid))
    }

    /// Resolve a worker id into a connected record, running a lazy
    /// placeholder's deferred connect if needed.
    pub(crate) async fn target(&self, pid: WorkerId) -> ClusterResult<Arc<Worker>> {
        let worker = self.worker_record(pid)?;
        crate::topology::ensure_connected(self, &worker).await?;
        Ok(worker)
    }
}

fn encode_args<C: PayloadCodec, T: Serialize>(node: &Node<C>, args: &T) -> ClusterResult<Bytes> {
    Ok(Bytes::from(node.shared.codec.encode(args)?))
}
