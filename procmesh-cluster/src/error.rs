//! Error types for the cluster runtime.
//!
//! [`RemoteException`] is the one error that crosses the wire transparently:
//! anything a remote thunk throws is captured where it happened and travels
//! back inside a `Result` payload. Everything else is a local
//! [`ClusterError`].

use procmesh_core::{CodecError, Rrid, WorkerId};
use serde::{Deserialize, Serialize};

use crate::wire::WireError;

/// Result alias for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// An exception captured at its throw site, with context for diagnosis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedException {
    /// Human-readable description of the failure.
    pub message: String,
    /// Backtrace rendered at capture time, when available.
    pub backtrace: Option<String>,
}

impl CapturedException {
    /// Capture a failure message together with the current backtrace.
    pub fn here(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            backtrace: Some(std::backtrace::Backtrace::force_capture().to_string()),
        }
    }

    /// A capture without backtrace, for failures reified from the wire.
    pub fn bare(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            backtrace: None,
        }
    }
}

// Display is just the message; the backtrace is opt-in via Debug.
impl std::fmt::Display for CapturedException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// An exception raised on a remote worker, carried back to the caller.
///
/// `pid` is the worker where the capture happened. This is the only error
/// type forwarded across connections as a payload; all other failures are
/// reified into one at the point of capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("on worker {pid}: {captured}")]
pub struct RemoteException {
    /// Worker id where the exception was captured.
    pub pid: WorkerId,
    /// The captured exception.
    pub captured: CapturedException,
}

impl RemoteException {
    /// Wrap a capture with its origin worker.
    pub fn new(pid: WorkerId, captured: CapturedException) -> Self {
        Self { pid, captured }
    }

    /// The standard exception put into slots abandoned by a dead peer.
    pub(crate) fn peer_died(pid: WorkerId) -> Self {
        Self::new(pid, CapturedException::bare("worker terminated unexpectedly"))
    }

    /// The standard exception for a frame body that failed to decode.
    pub(crate) fn decode(pid: WorkerId, detail: impl std::fmt::Display) -> Self {
        Self::new(
            pid,
            CapturedException::bare(format!("decode: message body failed to decode: {detail}")),
        )
    }
}

/// Errors surfaced by the cluster runtime.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Transport-level framing or handshake failure.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Payload serialization failure.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A remote thunk failed; the capture travelled back with the reply.
    #[error(transparent)]
    Remote(#[from] RemoteException),

    /// No worker with this id is known to the local table.
    #[error("unknown worker {pid}")]
    UnknownWorker {
        /// The unknown worker id.
        pid: WorkerId,
    },

    /// The target worker exists but has no usable connection.
    #[error("no connection to worker {pid}")]
    NotConnected {
        /// The unreachable worker id.
        pid: WorkerId,
    },

    /// A reference with this id is already registered.
    #[error("remote reference {rrid} already registered")]
    DuplicateRef {
        /// The conflicting reference id.
        rrid: Rrid,
    },

    /// A second put was attempted against an already-filled reference.
    #[error("remote reference {rrid} already holds a value")]
    DoublePut {
        /// The reference id.
        rrid: Rrid,
    },

    /// No reference with this id exists in the local registry.
    #[error("unknown remote reference {rrid}")]
    UnknownRef {
        /// The missing reference id.
        rrid: Rrid,
    },

    /// A freshly launched worker did not complete its join in time.
    #[error("worker {pid} did not join within {seconds}s")]
    WorkerTimeout {
        /// The worker that timed out.
        pid: WorkerId,
        /// The timeout that elapsed.
        seconds: u64,
    },

    /// The cluster manager failed to launch workers.
    #[error("launch failed: {message}")]
    LaunchFailed {
        /// Manager-provided detail.
        message: String,
    },

    /// The operation is restricted to the controller process.
    #[error("operation `{op}` is only valid on the controller")]
    ControllerOnly {
        /// The rejected operation.
        op: &'static str,
    },

    /// The peer violated the connection protocol.
    #[error("protocol violation: {message}")]
    Protocol {
        /// What the peer did wrong.
        message: String,
    },

    /// The node has been shut down.
    #[error("node is shut down")]
    NodeShutDown,

    /// Underlying stream I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_exception_display() {
        let exc = RemoteException::new(2, CapturedException::bare("boom"));
        assert_eq!(exc.to_string(), "on worker 2: boom");
    }

    #[test]
    fn test_captured_here_has_backtrace() {
        let captured = CapturedException::here("bad");
        assert_eq!(captured.message, "bad");
        assert!(captured.backtrace.is_some());
    }

    #[test]
    fn test_remote_exception_serde_roundtrip() {
        let exc = RemoteException::new(3, CapturedException::bare("lost"));
        let json = serde_json::to_string(&exc).expect("serialize");
        let back: RemoteException = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(exc, back);
    }

    #[test]
    fn test_decode_exception_kind() {
        let exc = RemoteException::decode(1, "bad tag");
        assert!(exc.captured.message.starts_with("decode:"));
    }

    #[test]
    fn test_cluster_error_from_remote() {
        let err: ClusterError = RemoteException::peer_died(4).into();
        assert!(matches!(err, ClusterError::Remote(ref e) if e.pid == 4));
    }
}
