//! Cluster supervision: launching workers, removing them, and cleaning up
//! after the ones that die.
//!
//! Only the controller launches and removes workers. Launch streams
//! configs out of the manager as they become ready, bounds concurrent
//! connection setup with a semaphore, and treats a worker that does not
//! complete its join within the worker timeout as a launch failure.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use procmesh_core::{LaunchOptions, PayloadCodec, Rrid, Topology, WorkerId};
use tokio::sync::{mpsc, Semaphore};

use crate::error::{ClusterError, ClusterResult};
use crate::manager::WorkerOp;
use crate::message::{Message, PeerInfo};
use crate::node::Node;
use crate::registry::Buffering;
use crate::wire::{FrameReader, FrameWriter};
use crate::worker::{Worker, WorkerState};

/// Environment variable bounding the controller's wait for a launched
/// worker to join, in seconds.
pub const WORKER_TIMEOUT_ENV: &str = "PROCMESH_WORKER_TIMEOUT";

/// Default worker-join timeout.
pub const DEFAULT_WORKER_TIMEOUT: Duration = Duration::from_secs(60);

/// The join timeout currently in force.
pub(crate) fn worker_timeout() -> Duration {
    std::env::var(WORKER_TIMEOUT_ENV)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_WORKER_TIMEOUT)
}

impl<C: PayloadCodec> Node<C> {
    /// Launch `opts.count` workers and wait for all of them to join.
    ///
    /// Returns the new worker ids, sorted. Controller only.
    ///
    /// # Errors
    ///
    /// Fails if the manager cannot launch, a connection cannot be
    /// established, or a worker misses the join timeout; workers that
    /// did join stay in the cluster either way.
    pub async fn add_workers(&self, opts: LaunchOptions) -> ClusterResult<Vec<WorkerId>> {
        if !self.is_controller() {
            return Err(ClusterError::ControllerOnly { op: "add_workers" });
        }
        *self
            .shared
            .topology
            .lock()
            .expect("topology mutex poisoned") = opts.topology;
        self.shared.lazy.store(opts.lazy, Ordering::Release);

        let (config_tx, mut config_rx) = mpsc::unbounded_channel();
        let manager = self.shared.manager.clone();
        let launch_opts = opts.clone();
        let launcher =
            tokio::spawn(async move { manager.launch(&launch_opts, config_tx).await });

        let semaphore = Arc::new(Semaphore::new(opts.max_parallel.max(1)));
        let mut setups = Vec::new();
        while let Some(mut config) = config_rx.recv().await {
            let pid = self.shared.next_worker_id.fetch_add(1, Ordering::Relaxed);
            config.id = pid;
            config.env.extend(opts.env.clone());
            config.exeflags.extend(opts.exeflags.iter().cloned());
            config.enable_threaded_compute = opts.enable_threaded_compute;

            let node = self.clone();
            let opts = opts.clone();
            let semaphore = semaphore.clone();
            setups.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(|_| {
                    ClusterError::LaunchFailed {
                        message: "launch aborted".to_string(),
                    }
                })?;
                node.setup_worker(pid, config, &opts).await
            }));
        }

        match launcher.await {
            Ok(result) => result?,
            Err(join) => {
                return Err(ClusterError::LaunchFailed {
                    message: format!("launch task failed: {join}"),
                })
            }
        }

        let mut joined = Vec::new();
        let mut first_error = None;
        for setup in setups {
            match setup.await {
                Ok(Ok(pid)) => joined.push(pid),
                Ok(Err(error)) => first_error = first_error.or(Some(error)),
                Err(join) => {
                    first_error = first_error.or(Some(ClusterError::LaunchFailed {
                        message: format!("setup task failed: {join}"),
                    }))
                }
            }
        }
        if let Some(error) = first_error {
            return Err(error);
        }
        joined.sort_unstable();
        Ok(joined)
    }

    /// Connect one launched worker, run the join handshake, and wait for
    /// its completion message.
    async fn setup_worker(
        &self,
        pid: WorkerId,
        config: procmesh_core::WorkerConfig,
        opts: &LaunchOptions,
    ) -> ClusterResult<WorkerId> {
        // The join-completion slot; the worker's completion message fills
        // it with the worker's own id.
        let notify = self.mint_rrid(0);
        self.shared
            .registry
            .register(notify, Buffering::Buffered, self.id(), pid)?;

        // The join lock orders peer snapshots against worker registration:
        // a worker registered before this snapshot appears in the new
        // worker's peer list; one registered after will list this worker
        // in its own. Released before the join wait so joins overlap.
        let prepared: ClusterResult<()> = async {
            let _joining = self.shared.join_lock.lock().await;

            // Peers the fresh worker should reach, under the topology in
            // force.
            let other_workers = match opts.topology {
                Topology::AllToAll => self
                    .shared
                    .workers
                    .all()
                    .into_iter()
                    .filter(|peer| peer.id != pid)
                    .map(|peer| PeerInfo {
                        pid: peer.id,
                        config: peer.config.clone(),
                    })
                    .collect(),
                Topology::MasterWorker | Topology::Custom => Vec::new(),
            };

            let (read, write) = self.shared.manager.connect(pid, &config).await?;
            let mut frame_writer = FrameWriter::new(write);
            frame_writer
                .write_handshake(&self.shared.cookie, &self.shared.version)
                .await?;

            let worker = Arc::new(Worker::new(pid, config.clone(), WorkerState::Connecting));
            self.shared.workers.register(worker.clone())?;
            worker.attach_writer(frame_writer).await;
            crate::dispatcher::spawn_dispatcher(
                self.clone(),
                FrameReader::new(read),
                worker.writer(),
                false,
                Some(pid),
            );

            let join = Message::JoinGroup {
                self_pid: pid,
                other_workers,
                topology: opts.topology,
                lazy: opts.lazy,
                enable_threaded_compute: opts.enable_threaded_compute,
            };
            self.send_to(&worker, Rrid::NULL, notify, &join).await
        }
        .await;
        if let Err(error) = prepared {
            self.shared.registry.discard(notify);
            self.deregister_worker(pid).await;
            return Err(error);
        }

        let timeout = worker_timeout();
        let joined = tokio::time::timeout(timeout, self.shared.registry.take(notify)).await;
        self.shared.registry.discard(notify);
        match joined {
            Ok(Ok(Ok(_joined))) => {
                self.shared
                    .manager
                    .manage(pid, &config, WorkerOp::Register)
                    .await;
                Ok(pid)
            }
            Ok(Ok(Err(exc))) => {
                self.deregister_worker(pid).await;
                Err(exc.into())
            }
            Ok(Err(error)) => {
                self.deregister_worker(pid).await;
                Err(error)
            }
            Err(_elapsed) => {
                tracing::error!(pid, ?timeout, "worker missed the join deadline");
                self.deregister_worker(pid).await;
                Err(ClusterError::WorkerTimeout {
                    pid,
                    seconds: timeout.as_secs(),
                })
            }
        }
    }

    /// Remove workers from the cluster in an orderly fashion: ask the
    /// manager to kill each process, then clean up its state here.
    /// Controller only.
    pub async fn rmprocs(&self, pids: &[WorkerId]) -> ClusterResult<()> {
        if !self.is_controller() {
            return Err(ClusterError::ControllerOnly { op: "rmprocs" });
        }
        for &pid in pids {
            let Some(worker) = self.shared.workers.lookup(pid) else {
                tracing::debug!(pid, "rmprocs for unknown worker");
                continue;
            };
            worker.set_state(WorkerState::Terminating);
            self.shared.manager.kill(pid, &worker.config).await;
            self.deregister_worker(pid).await;
        }
        Ok(())
    }

    /// Tear down local state for a dead or removed worker: fail every
    /// remote value waiting on it, close its streams, drop it from the
    /// pool. The id lands in the deleted set here and nowhere else.
    pub(crate) async fn deregister_worker(&self, pid: WorkerId) {
        let Some(worker) = self.shared.workers.deregister(pid) else {
            return;
        };
        worker.set_state(WorkerState::Terminated);
        self.shared.registry.fail_all_waiting_on(pid);
        worker.close_writer().await;
        self.remove_from_pool(pid);
        self.shared
            .manager
            .manage(pid, &worker.config, WorkerOp::Deregister)
            .await;
        tracing::info!(pid, "worker deregistered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_timeout_default() {
        // Only meaningful when the env var is unset, which is the normal
        // test environment.
        if std::env::var(WORKER_TIMEOUT_ENV).is_err() {
            assert_eq!(worker_timeout(), DEFAULT_WORKER_TIMEOUT);
        }
    }
}
