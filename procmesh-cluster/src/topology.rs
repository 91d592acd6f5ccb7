//! Join protocol and mesh formation.
//!
//! A fresh worker's first connection comes from the controller, whose
//! first message assigns the worker its id and lists the peers it should
//! connect to. Depending on the configured [`Topology`] and the `lazy`
//! flag, those connections are established immediately in background
//! tasks or deferred until the first message needs them. Either way the
//! worker finishes by telling the controller it joined; the controller
//! learns of the join through a value put into the slot it registered
//! before launching, not by polling.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use procmesh_core::{PayloadCodec, Rrid, Topology, WorkerConfig, WorkerId, CONTROLLER_ID};

use crate::error::{ClusterError, ClusterResult};
use crate::message::{Message, PeerInfo};
use crate::node::Node;
use crate::wire::{FrameReader, FrameWriter, MsgHeader};
use crate::worker::{SharedWriter, Worker, WorkerState};

/// Worker-side handling of the controller's join message.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn handle_join_group<C: PayloadCodec>(
    node: &Node<C>,
    self_pid: WorkerId,
    other_workers: Vec<PeerInfo>,
    topology: Topology,
    lazy: bool,
    enable_threaded_compute: bool,
    header: &MsgHeader,
    writer: &SharedWriter,
) -> ClusterResult<()> {
    node.set_id(self_pid);
    *node.shared.topology.lock().expect("topology mutex poisoned") = topology;
    node.shared.lazy.store(lazy, Ordering::Release);
    node.shared
        .threaded_compute
        .store(enable_threaded_compute, Ordering::Release);
    tracing::info!(
        pid = self_pid,
        ?topology,
        lazy,
        peers = other_workers.len(),
        "joining cluster"
    );

    // The connection this message arrived on is the controller.
    let controller = Arc::new(Worker::new(
        CONTROLLER_ID,
        WorkerConfig::default(),
        WorkerState::Connected,
    ));
    controller.set_writer_handle(writer.clone());
    node.shared.workers.register(controller.clone())?;
    controller.initialized.signal();

    for peer in other_workers {
        if lazy {
            // Placeholder record; the deferred connect runs on first use.
            let placeholder = Arc::new(Worker::new(peer.pid, peer.config, WorkerState::Created));
            if node.shared.workers.register(placeholder).is_err() {
                tracing::warn!(pid = peer.pid, "peer already known, skipping placeholder");
            }
        } else {
            let task_node = node.clone();
            node.spawn(async move {
                if let Err(error) = connect_to_peer(&task_node, peer.pid, peer.config).await {
                    tracing::error!(pid = peer.pid, error = %error, "peer connect failed");
                }
            });
        }
    }

    let complete = Message::JoinComplete {
        cpu_threads: std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1),
        ospid: std::process::id(),
    };
    node.send_on(writer, Rrid::NULL, header.notify, &complete)
        .await?;
    Ok(())
}

/// Open a connection to a peer worker and identify ourselves on it.
///
/// Used for eager mesh formation at join time and for the deferred
/// connect of lazy placeholders.
pub(crate) async fn connect_to_peer<C: PayloadCodec>(
    node: &Node<C>,
    pid: WorkerId,
    config: WorkerConfig,
) -> ClusterResult<Arc<Worker>> {
    let worker = match node.shared.workers.lookup(pid) {
        Some(existing) => existing,
        None => {
            let worker = Arc::new(Worker::new(pid, config.clone(), WorkerState::Connecting));
            node.shared.workers.register(worker.clone())?;
            worker
        }
    };
    worker.set_state(WorkerState::Connecting);

    let (read, write) = node.shared.manager.connect(pid, &config).await?;
    let mut frame_writer = FrameWriter::new(write);
    frame_writer
        .write_handshake(&node.shared.cookie, &node.shared.version)
        .await?;
    worker.attach_writer(frame_writer).await;

    crate::dispatcher::spawn_dispatcher(
        node.clone(),
        FrameReader::new(read),
        worker.writer(),
        false,
        Some(pid),
    );

    let hello = Message::IdentifySocket { pid: node.id() };
    node.send_to(&worker, Rrid::NULL, Rrid::NULL, &hello).await?;
    Ok(worker)
}

/// Make sure a usable connection to `worker` exists, running the deferred
/// connect of a lazy placeholder at most once even under concurrent first
/// use.
pub(crate) async fn ensure_connected<C: PayloadCodec>(
    node: &Node<C>,
    worker: &Arc<Worker>,
) -> ClusterResult<()> {
    if worker.initialized.is_set() {
        return Ok(());
    }
    if matches!(
        worker.state(),
        WorkerState::Terminating | WorkerState::Terminated
    ) {
        return Err(ClusterError::NotConnected { pid: worker.id });
    }

    if worker.state() == WorkerState::Created {
        let target = worker.clone();
        worker
            .connect_once
            .get_or_try_init(|| async {
                match connect_to_peer(node, target.id, target.config.clone()).await {
                    Ok(_) => Ok(()),
                    Err(error) => {
                        // Leave the cell unset and the record retryable.
                        target.set_state(WorkerState::Created);
                        Err(error)
                    }
                }
            })
            .await?;
    }

    worker.initialized.wait().await;
    Ok(())
}
