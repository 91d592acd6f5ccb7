//! Per-peer message dispatch.
//!
//! Every connection gets one dispatcher task owning the read half. The
//! loop runs the transport state machine: optional handshake validation
//! (incoming side), a first message that binds the peer id, then the
//! steady-state read → dispatch → boundary cycle. A body that fails to
//! decode produces a synthetic decode exception for the frame's reference
//! ids and a resync to the boundary; any other failure tears the
//! connection down through the peer-failure path.
//!
//! Handlers never kill the dispatcher: each `call`-class message runs in
//! its own task and every failure mode is reified into a
//! [`RemoteException`] targeting the frame's reply references.

use std::sync::Arc;

use bytes::Bytes;
use procmesh_core::{PayloadCodec, Rrid, WorkerId, CONTROLLER_ID};

use crate::engine::{run_call, CallOutput};
use crate::error::{ClusterError, ClusterResult, RemoteException};
use crate::message::Message;
use crate::node::Node;
use crate::registry::Buffering;
use crate::wire::FrameReader;
use crate::worker::{SharedWriter, Worker, WorkerState};

/// Which verb a result reply answers; decides between raw value and ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyKind {
    /// `call_fetch`: the raw value travels back.
    Value,
    /// `call_wait`: a completion ack travels back.
    Ack,
}

/// Start the dispatcher task for one connection.
///
/// `preset_peer` is the peer id when the local side initiated the
/// connection and already knows who it called; incoming connections bind
/// the id from the first message instead.
pub(crate) fn spawn_dispatcher<C: PayloadCodec>(
    node: Node<C>,
    mut reader: FrameReader,
    writer: SharedWriter,
    incoming: bool,
    preset_peer: Option<WorkerId>,
) {
    let task_node = node.clone();
    node.spawn(async move {
        let mut peer = preset_peer;
        let result =
            process_messages(&task_node, &mut reader, &writer, incoming, &mut peer).await;
        match result {
            Ok(()) => {
                // Only the cookie-rejection path returns cleanly.
            }
            Err(error) => handle_peer_failure(&task_node, peer, &writer, error).await,
        }
    });
}

/// The connection read loop.
async fn process_messages<C: PayloadCodec>(
    node: &Node<C>,
    reader: &mut FrameReader,
    writer: &SharedWriter,
    incoming: bool,
    peer: &mut Option<WorkerId>,
) -> ClusterResult<()> {
    let mut peer_version = None;
    if incoming {
        match reader.read_handshake(&node.shared.cookie).await {
            Ok(version) => peer_version = Some(version),
            Err(error) => {
                // Unauthenticated peer: close silently, nothing to mark.
                tracing::warn!(error = %error, "rejected incoming connection");
                close_writer(writer).await;
                return Ok(());
            }
        }
    }

    let mut first = true;
    loop {
        let header = reader.read_header().await?;
        match reader.read_body(&header).await {
            Ok(body) => match node.shared.codec.decode::<Message>(&body) {
                Ok(msg) => {
                    tracing::trace!(msg = msg.name(), peer = ?*peer, "dispatching");
                    let bound = handle_msg(node, msg, &header, writer, *peer).await?;
                    if peer.is_none() {
                        *peer = bound;
                    }
                    reader.read_boundary().await?;
                }
                Err(error) => {
                    deliver_decode_exception(node, writer, &header, &error).await;
                    reader.resync_to_boundary().await?;
                }
            },
            Err(error) if error.is_decode_fault() => {
                deliver_decode_exception(node, writer, &header, &error).await;
                reader.resync_to_boundary().await?;
            }
            Err(error) => return Err(error.into()),
        }

        if first {
            first = false;
            let Some(pid) = *peer else {
                return Err(ClusterError::Protocol {
                    message: "peer sent requests before identifying itself".to_string(),
                });
            };
            debug_assert!(pid > 0);
            if let (Some(version), Ok(worker)) = (peer_version.take(), node.worker_record(pid)) {
                worker.set_version(version);
            }
        }
    }
}

/// Route one decoded message. Returns the peer id binding derived from
/// identity-bearing first messages.
async fn handle_msg<C: PayloadCodec>(
    node: &Node<C>,
    msg: Message,
    header: &crate::wire::MsgHeader,
    writer: &SharedWriter,
    peer: Option<WorkerId>,
) -> ClusterResult<Option<WorkerId>> {
    match msg {
        Message::Call { func, args } => {
            schedule_call(node, header.response_to, func, args);
            Ok(None)
        }

        Message::CallFetch { func, args } => {
            let writer = writer.clone();
            let notify = header.notify;
            let task_node = node.clone();
            node.spawn(async move {
                let outcome =
                    run_call(task_node.id(), &task_node.shared.funcs, &func, args).await;
                deliver_result(&task_node, &writer, peer, ReplyKind::Value, notify, outcome)
                    .await;
            });
            Ok(None)
        }

        Message::CallWait { func, args } => {
            let response_to = header.response_to;
            let notify = header.notify;
            if response_to.is_null() {
                // Degenerate form: nothing to bind, ack straight from the
                // producer task.
                let task_node = node.clone();
                let writer = writer.clone();
                node.spawn(async move {
                    let outcome =
                        run_call(task_node.id(), &task_node.shared.funcs, &func, args).await;
                    deliver_result(&task_node, &writer, peer, ReplyKind::Ack, notify, outcome)
                        .await;
                });
                return Ok(None);
            }

            schedule_call(node, response_to, func, args);
            let task_node = node.clone();
            let writer = writer.clone();
            node.spawn(async move {
                let outcome = match task_node.shared.registry.fetch(response_to).await {
                    Ok(Ok(bytes)) => Ok(CallOutput::new(bytes)),
                    Ok(Err(exc)) => Err(exc),
                    Err(error) => Err(RemoteException::new(
                        task_node.id(),
                        crate::error::CapturedException::bare(error.to_string()),
                    )),
                };
                deliver_result(&task_node, &writer, peer, ReplyKind::Ack, notify, outcome)
                    .await;
            });
            Ok(None)
        }

        Message::RemoteDo { func, args } => {
            let task_node = node.clone();
            node.spawn(async move {
                if let Err(exc) =
                    run_call(task_node.id(), &task_node.shared.funcs, &func, args).await
                {
                    tracing::error!(error = %exc, func = %func, "remote_do failed");
                }
            });
            Ok(None)
        }

        Message::Result { value } => {
            if let Err(error) = node.shared.registry.put(header.response_to, value) {
                tracing::warn!(
                    rrid = %header.response_to,
                    error = %error,
                    "dropping result for reclaimed reference"
                );
            }
            Ok(None)
        }

        Message::IdentifySocket { pid } => {
            let worker = match node.shared.workers.lookup(pid) {
                Some(existing) => existing,
                None => {
                    let worker = Arc::new(Worker::new(
                        pid,
                        Default::default(),
                        WorkerState::Connecting,
                    ));
                    node.shared.workers.register(worker.clone())?;
                    worker
                }
            };
            worker.set_writer_handle(writer.clone());
            worker.set_state(WorkerState::Connected);
            // Reply travels on the same connection, now owned by the record.
            let ack = Message::IdentifySocketAck {
                version: node.shared.version.clone(),
            };
            node.send_to(&worker, Rrid::NULL, Rrid::NULL, &ack).await?;
            worker.initialized.signal();
            node.shared
                .manager
                .manage(pid, &worker.config, crate::manager::WorkerOp::Register)
                .await;
            Ok(Some(pid))
        }

        Message::IdentifySocketAck { version } => {
            let Some(pid) = peer else {
                return Err(ClusterError::Protocol {
                    message: "identify ack on an unbound connection".to_string(),
                });
            };
            let worker = node.worker_record(pid)?;
            worker.set_version(version);
            worker.set_state(WorkerState::Connected);
            worker.initialized.signal();
            Ok(None)
        }

        Message::JoinGroup {
            self_pid,
            other_workers,
            topology,
            lazy,
            enable_threaded_compute,
        } => {
            crate::topology::handle_join_group(
                node,
                self_pid,
                other_workers,
                topology,
                lazy,
                enable_threaded_compute,
                header,
                writer,
            )
            .await?;
            Ok(Some(CONTROLLER_ID))
        }

        Message::JoinComplete { cpu_threads, ospid } => {
            let Some(pid) = peer else {
                return Err(ClusterError::Protocol {
                    message: "join complete on an unbound connection".to_string(),
                });
            };
            let worker = node.worker_record(pid)?;
            worker.set_vitals(ospid, cpu_threads);
            worker.set_state(WorkerState::Connected);
            worker.initialized.signal();
            node.add_to_pool(pid);
            if !header.notify.is_null() {
                let joined = Bytes::from(node.shared.codec.encode(&pid)?);
                if let Err(error) = node.shared.registry.put(header.notify, Ok(joined)) {
                    tracing::warn!(error = %error, "join waiter already gone");
                }
            }
            announce_new_peer(node, &worker).await;
            tracing::info!(pid, ospid, cpu_threads, "worker joined");
            Ok(None)
        }

        Message::NewPeer { peer } => {
            if peer.pid != node.id() && node.shared.workers.lookup(peer.pid).is_none() {
                let placeholder =
                    Arc::new(Worker::new(peer.pid, peer.config, WorkerState::Created));
                if node.shared.workers.register(placeholder).is_err() {
                    tracing::debug!(pid = peer.pid, "peer announced twice");
                }
            }
            Ok(None)
        }

        Message::AddClient { rrid } => {
            let Some(pid) = peer else {
                return Err(ClusterError::Protocol {
                    message: "add_client on an unbound connection".to_string(),
                });
            };
            if let Err(error) = node.shared.registry.add_client(rrid, pid) {
                tracing::warn!(rrid = %rrid, error = %error, "add_client for unknown reference");
            }
            Ok(None)
        }

        Message::DelClient { rrids } => {
            let Some(pid) = peer else {
                return Err(ClusterError::Protocol {
                    message: "del_client on an unbound connection".to_string(),
                });
            };
            for rrid in rrids {
                node.shared.registry.remove_client(rrid, pid);
            }
            Ok(None)
        }
    }
}

/// In a lazy mesh, tell the established workers about a fresh one so
/// their first message to it can run the deferred connect.
async fn announce_new_peer<C: PayloadCodec>(node: &Node<C>, joined: &Arc<Worker>) {
    use std::sync::atomic::Ordering;

    if !node.is_controller()
        || !node.shared.lazy.load(Ordering::Acquire)
        || *node
            .shared
            .topology
            .lock()
            .expect("topology mutex poisoned")
            != procmesh_core::Topology::AllToAll
    {
        return;
    }
    let announcement = Message::NewPeer {
        peer: crate::message::PeerInfo {
            pid: joined.id,
            config: joined.config.clone(),
        },
    };
    for other in node.workers() {
        if other == joined.id {
            continue;
        }
        let Ok(worker) = node.worker_record(other) else {
            continue;
        };
        if let Err(error) = node
            .send_to(&worker, Rrid::NULL, Rrid::NULL, &announcement)
            .await
        {
            tracing::warn!(pid = other, error = %error, "new-peer announcement failed");
        }
    }
}

/// Bind a `call`'s eventual result under `response_to` and start the
/// producer task. Exactly one producer is scheduled per owned reference.
pub(crate) fn schedule_call<C: PayloadCodec>(
    node: &Node<C>,
    response_to: Rrid,
    func: String,
    args: Bytes,
) {
    if response_to.is_null() {
        let task_node = node.clone();
        node.spawn(async move {
            if let Err(exc) = run_call(task_node.id(), &task_node.shared.funcs, &func, args).await
            {
                tracing::error!(error = %exc, func = %func, "unbound call failed");
            }
        });
        return;
    }

    let entry = match node.shared.registry.register(
        response_to,
        Buffering::Buffered,
        response_to.whence,
        0,
    ) {
        Ok(entry) => entry,
        Err(error) => {
            tracing::warn!(rrid = %response_to, error = %error, "duplicate call binding");
            return;
        }
    };
    let task_node = node.clone();
    node.spawn(async move {
        let value = match run_call(task_node.id(), &task_node.shared.funcs, &func, args).await {
            Ok(out) => Ok(out.bytes),
            Err(exc) => Err(exc),
        };
        if let Err(error) = task_node.shared.registry.put(entry.rrid(), value) {
            tracing::warn!(rrid = %entry.rrid(), error = %error, "result slot rejected value");
        }
    });
}

/// Send a result back to the requester.
///
/// A raw value answers `call_fetch`; other verbs get the completion ack.
/// Exceptions always travel raw. A serialization failure on this path is
/// fatal to the connection: the stream closes, and escalation follows the
/// caller's role (controller removes the peer; a worker that cannot reply
/// to the controller dies; other workers ask the controller to remove the
/// peer).
async fn deliver_result<C: PayloadCodec>(
    node: &Node<C>,
    writer: &SharedWriter,
    peer: Option<WorkerId>,
    kind: ReplyKind,
    notify: Rrid,
    outcome: Result<CallOutput, RemoteException>,
) {
    if notify.is_null() {
        return;
    }
    let (value, sync_guard) = match outcome {
        Ok(out) => {
            let payload = match kind {
                ReplyKind::Value => Ok(out.bytes),
                ReplyKind::Ack => match node.shared.codec.encode(&"ok") {
                    Ok(ack) => Ok(Bytes::from(ack)),
                    Err(error) => {
                        tracing::error!(error = %error, "ack serialization failed");
                        return;
                    }
                },
            };
            (payload, out.sync_guard)
        }
        Err(exc) => (Err(exc), None),
    };

    let msg = Message::Result { value };
    let sent = node.send_on(writer, notify, Rrid::NULL, &msg).await;
    // Held until the frame was written (or the attempt abandoned).
    drop(sync_guard);

    match sent {
        Ok(()) => {}
        Err(ClusterError::Codec(error)) => {
            tracing::error!(error = %error, "result serialization failed, closing connection");
            close_writer(writer).await;
            match peer {
                Some(pid) if pid == CONTROLLER_ID && !node.is_controller() => {
                    node.fatal("cannot serialize reply to controller");
                }
                Some(pid) if node.is_controller() => {
                    if let Err(error) = node.rmprocs(&[pid]).await {
                        tracing::warn!(pid, error = %error, "rmprocs after send failure");
                    }
                }
                Some(pid) => {
                    if let Err(error) = node
                        .remote_do_typed(CONTROLLER_ID, "__rmprocs", &pid)
                        .await
                    {
                        tracing::warn!(pid, error = %error, "removal escalation failed");
                    }
                }
                None => {}
            }
        }
        Err(error) => {
            tracing::warn!(error = %error, "result send failed");
        }
    }
}

/// Report a body that could not be decoded to both of the frame's
/// reference ids, so no requester hangs on a corrupt payload.
async fn deliver_decode_exception<C: PayloadCodec>(
    node: &Node<C>,
    writer: &SharedWriter,
    header: &crate::wire::MsgHeader,
    detail: &(dyn std::fmt::Display + Send + Sync),
) {
    let exc = RemoteException::decode(node.id(), detail);
    tracing::warn!(error = %exc.captured, "message body failed to decode, resyncing");

    if !header.response_to.is_null() {
        let registry = &node.shared.registry;
        if registry.lookup(header.response_to).is_none() {
            let _ = registry.register(
                header.response_to,
                Buffering::Buffered,
                header.response_to.whence,
                0,
            );
        }
        if let Err(error) = registry.put(header.response_to, Err(exc.clone())) {
            tracing::warn!(error = %error, "decode exception delivery skipped");
        }
    }

    if !header.notify.is_null() {
        let msg = Message::Result {
            value: Err(exc),
        };
        if let Err(error) = node.send_on(writer, header.notify, Rrid::NULL, &msg).await {
            tracing::warn!(error = %error, "decode exception reply failed");
        }
    }
}

/// Terminal cleanup when a connection dies.
async fn handle_peer_failure<C: PayloadCodec>(
    node: &Node<C>,
    peer: Option<WorkerId>,
    writer: &SharedWriter,
    error: ClusterError,
) {
    close_writer(writer).await;

    let Some(pid) = peer else {
        tracing::warn!(error = %error, "connection from unidentified peer failed");
        return;
    };

    let Some(worker) = node.shared.workers.lookup(pid) else {
        // Already deregistered (orderly removal finished first).
        tracing::debug!(pid, error = %error, "connection closed for removed worker");
        return;
    };

    let was_terminating = matches!(
        worker.state(),
        WorkerState::Terminating | WorkerState::Terminated
    );
    worker.set_state(WorkerState::Terminated);

    if pid == CONTROLLER_ID && !node.is_controller() {
        node.fatal("lost connection to controller");
        return;
    }

    node.deregister_worker(pid).await;

    if node.is_controller() && !was_terminating {
        // Surface the failure to whoever supervises the controller.
        tracing::error!(pid, error = %error, "worker connection failed");
    } else {
        tracing::info!(pid, "worker connection closed");
    }
}

async fn close_writer(writer: &SharedWriter) {
    if let Some(mut writer) = writer.lock().await.take() {
        writer.shutdown().await;
    }
}
