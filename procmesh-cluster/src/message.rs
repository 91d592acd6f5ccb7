//! Wire-level message taxonomy.
//!
//! One [`Message`] travels in each frame body, encoded by the node's
//! payload codec. The serde tag doubles as the wire discriminant: a tag
//! unknown to this version fails decode recoverably and takes the
//! boundary-resync path instead of killing the dispatcher.

use bytes::Bytes;
use procmesh_core::{Rrid, Topology, WorkerConfig, WorkerId};
use serde::{Deserialize, Serialize};

use crate::error::RemoteException;

/// A peer listed in a join message, with enough config to connect to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    /// The peer's worker id.
    pub pid: WorkerId,
    /// Connection config understood by the cluster manager.
    pub config: WorkerConfig,
}

/// Everything that crosses a peer connection.
///
/// Producer semantics per variant:
///
/// | Variant | Reply |
/// |---|---|
/// | [`Call`](Message::Call) | none; result bound under `response_to` on the executor |
/// | [`CallFetch`](Message::CallFetch) | one [`Result`](Message::Result) to `notify` |
/// | [`CallWait`](Message::CallWait) | completion ack to `notify` |
/// | [`RemoteDo`](Message::RemoteDo) | none |
/// | [`Result`](Message::Result) | consumed by the reference registry |
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    /// Execute a registered function; bind the result under the header's
    /// `response_to` reference on the executing worker.
    Call {
        /// Registered function name.
        func: String,
        /// Encoded arguments, opaque to the runtime.
        args: Bytes,
    },

    /// Execute a registered function; send the value back to the header's
    /// `notify` reference.
    CallFetch {
        /// Registered function name.
        func: String,
        /// Encoded arguments, opaque to the runtime.
        args: Bytes,
    },

    /// Execute as [`Call`](Message::Call), then ack completion to the
    /// header's `notify` reference.
    CallWait {
        /// Registered function name.
        func: String,
        /// Encoded arguments, opaque to the runtime.
        args: Bytes,
    },

    /// Fire-and-forget execution; failures are logged on the executor.
    RemoteDo {
        /// Registered function name.
        func: String,
        /// Encoded arguments, opaque to the runtime.
        args: Bytes,
    },

    /// A value for the reference named by the header's `response_to`.
    Result {
        /// The computed value, or the exception captured producing it.
        value: Result<Bytes, RemoteException>,
    },

    /// First message on a worker-to-worker connection: who is calling.
    IdentifySocket {
        /// The initiating worker's id.
        pid: WorkerId,
    },

    /// Reply to [`IdentifySocket`](Message::IdentifySocket).
    IdentifySocketAck {
        /// The accepting worker's version string.
        version: String,
    },

    /// Controller to fresh worker: your identity and your peers.
    JoinGroup {
        /// The id assigned to the receiving worker.
        self_pid: WorkerId,
        /// Already-joined workers the receiver should connect to.
        other_workers: Vec<PeerInfo>,
        /// Connectivity pattern in force.
        topology: Topology,
        /// Defer the `other_workers` connections until first use.
        lazy: bool,
        /// Hint that the worker may run a process-wide compute pool.
        enable_threaded_compute: bool,
    },

    /// Worker to controller: join finished, here are my vitals.
    JoinComplete {
        /// Number of logical CPUs on the worker host.
        cpu_threads: u32,
        /// The worker's OS process id.
        ospid: u32,
    },

    /// Controller to established workers: a new worker joined a lazy
    /// mesh; hold a placeholder so a first message can connect to it.
    NewPeer {
        /// The freshly joined worker.
        peer: PeerInfo,
    },

    /// The sender now holds a handle to the named local reference.
    AddClient {
        /// The reference being shared.
        rrid: Rrid,
    },

    /// The sender dropped its handles to the named local references.
    /// Batched on the sender and flushed before its next frame.
    DelClient {
        /// The references being released.
        rrids: Vec<Rrid>,
    },
}

impl Message {
    /// The variant name, for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Call { .. } => "call",
            Message::CallFetch { .. } => "call_fetch",
            Message::CallWait { .. } => "call_wait",
            Message::RemoteDo { .. } => "remote_do",
            Message::Result { .. } => "result",
            Message::IdentifySocket { .. } => "identify_socket",
            Message::IdentifySocketAck { .. } => "identify_socket_ack",
            Message::JoinGroup { .. } => "join_group",
            Message::JoinComplete { .. } => "join_complete",
            Message::NewPeer { .. } => "new_peer",
            Message::AddClient { .. } => "add_client",
            Message::DelClient { .. } => "del_client",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procmesh_core::{JsonCodec, PayloadCodec};

    #[test]
    fn test_tagged_encoding() {
        let codec = JsonCodec;
        let msg = Message::IdentifySocket { pid: 3 };
        let bytes = codec.encode(&msg).expect("encode");
        let text = String::from_utf8(bytes).expect("utf8");
        assert!(text.contains("\"kind\":\"identify_socket\""));
    }

    #[test]
    fn test_unknown_tag_fails_decode() {
        let codec = JsonCodec;
        let result: Result<Message, _> =
            codec.decode(br#"{"kind":"from_the_future","pid":9}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_call_roundtrip() {
        let codec = JsonCodec;
        let msg = Message::Call {
            func: "double".to_string(),
            args: Bytes::from_static(b"[21]"),
        };
        let bytes = codec.encode(&msg).expect("encode");
        let back: Message = codec.decode(&bytes).expect("decode");
        match back {
            Message::Call { func, args } => {
                assert_eq!(func, "double");
                assert_eq!(&args[..], b"[21]");
            }
            other => panic!("wrong variant: {}", other.name()),
        }
    }

    #[test]
    fn test_result_carries_exception() {
        let codec = JsonCodec;
        let msg = Message::Result {
            value: Err(RemoteException::new(
                2,
                crate::error::CapturedException::bare("boom"),
            )),
        };
        let bytes = codec.encode(&msg).expect("encode");
        let back: Message = codec.decode(&bytes).expect("decode");
        match back {
            Message::Result { value: Err(exc) } => {
                assert_eq!(exc.pid, 2);
                assert_eq!(exc.captured.message, "boom");
            }
            other => panic!("wrong variant: {}", other.name()),
        }
    }

    #[test]
    fn test_join_group_roundtrip() {
        let codec = JsonCodec;
        let msg = Message::JoinGroup {
            self_pid: 4,
            other_workers: vec![PeerInfo {
                pid: 2,
                config: WorkerConfig::at("inproc:w0"),
            }],
            topology: Topology::AllToAll,
            lazy: true,
            enable_threaded_compute: false,
        };
        let bytes = codec.encode(&msg).expect("encode");
        let back: Message = codec.decode(&bytes).expect("decode");
        match back {
            Message::JoinGroup {
                self_pid,
                other_workers,
                lazy,
                ..
            } => {
                assert_eq!(self_pid, 4);
                assert_eq!(other_workers.len(), 1);
                assert_eq!(other_workers[0].pid, 2);
                assert!(lazy);
            }
            other => panic!("wrong variant: {}", other.name()),
        }
    }
}
