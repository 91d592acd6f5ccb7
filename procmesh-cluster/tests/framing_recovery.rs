//! Raw-peer protocol tests: drive a worker node over the wire format
//! directly, playing the controller's side of the conversation by hand.

use bytes::Bytes;
use procmesh_cluster::{
    ClusterManager, Cookie, FrameReader, FrameWriter, InProcessManager, JsonCodec, LaunchOptions,
    Message, PayloadCodec, Rrid, Topology, WireError,
};
use tokio::sync::mpsc;

const RAW_PEER_VERSION: &str = "0.3.1";

/// Launch one worker node and open a raw connection to it.
async fn raw_worker(cookie: Cookie) -> (FrameReader, FrameWriter) {
    let manager = InProcessManager::new(cookie);
    manager.on_worker_setup(|node| {
        node.register_fn("echo_str", |s: String| s);
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    manager
        .launch(&LaunchOptions::new(1), tx)
        .await
        .expect("launch");
    let config = rx.recv().await.expect("one config");
    let (read, write) = manager.connect(2, &config).await.expect("connect");
    (FrameReader::new(read), FrameWriter::new(write))
}

/// Read one frame and decode its message.
async fn read_msg(reader: &mut FrameReader) -> (procmesh_cluster::MsgHeader, Message) {
    let header = reader.read_header().await.expect("header");
    let body = reader.read_body(&header).await.expect("body");
    reader.read_boundary().await.expect("boundary");
    let msg: Message = JsonCodec.decode(&body).expect("decode");
    (header, msg)
}

async fn join_as_controller(
    reader: &mut FrameReader,
    writer: &mut FrameWriter,
    cookie: &Cookie,
) {
    writer
        .write_handshake(cookie, RAW_PEER_VERSION)
        .await
        .expect("handshake");

    let codec = JsonCodec;
    let join = Message::JoinGroup {
        self_pid: 2,
        other_workers: Vec::new(),
        topology: Topology::AllToAll,
        lazy: false,
        enable_threaded_compute: false,
    };
    let join_notify = Rrid::new(1, 1, 0);
    writer
        .write_frame(Rrid::NULL, join_notify, &codec.encode(&join).expect("encode"))
        .await
        .expect("send join");

    let (header, msg) = read_msg(reader).await;
    assert!(
        matches!(msg, Message::JoinComplete { .. }),
        "expected join completion, got {}",
        msg.name()
    );
    assert_eq!(header.notify, join_notify);
}

#[tokio::test]
async fn test_decode_failure_recovers_at_next_boundary() {
    let cookie = Cookie::random();
    let (mut reader, mut writer) = raw_worker(cookie).await;
    join_as_controller(&mut reader, &mut writer, &cookie).await;

    let codec = JsonCodec;

    // A frame whose checksum is fine but whose body is not a message.
    let bad_notify = Rrid::new(1, 2, 0);
    writer
        .write_frame(Rrid::NULL, bad_notify, b"this is not a message")
        .await
        .expect("send corrupt frame");

    // Immediately follow with a well-formed request.
    let good_notify = Rrid::new(1, 3, 0);
    let call = Message::CallFetch {
        func: "echo_str".to_string(),
        args: Bytes::from(codec.encode(&"ok").expect("encode args")),
    };
    writer
        .write_frame(Rrid::NULL, good_notify, &codec.encode(&call).expect("encode"))
        .await
        .expect("send call");

    // The corrupt frame's requester hears a decode exception first...
    let (header, msg) = read_msg(&mut reader).await;
    assert_eq!(header.response_to, bad_notify);
    match msg {
        Message::Result { value: Err(exc) } => {
            assert_eq!(exc.pid, 2);
            assert!(
                exc.captured.message.starts_with("decode"),
                "unexpected message: {}",
                exc.captured.message
            );
        }
        other => panic!("expected exception result, got {}", other.name()),
    }

    // ...and the dispatcher never desynchronized: the next request is
    // answered normally.
    let (header, msg) = read_msg(&mut reader).await;
    assert_eq!(header.response_to, good_notify);
    match msg {
        Message::Result { value: Ok(bytes) } => {
            let echoed: String = codec.decode(&bytes).expect("decode value");
            assert_eq!(echoed, "ok");
        }
        other => panic!("expected ok result, got {}", other.name()),
    }
}

#[tokio::test]
async fn test_repeated_decode_failures_keep_recovering() {
    let cookie = Cookie::random();
    let (mut reader, mut writer) = raw_worker(cookie).await;
    join_as_controller(&mut reader, &mut writer, &cookie).await;

    let codec = JsonCodec;
    for round in 0u64..3 {
        let bad_notify = Rrid::new(1, 10 + round * 2, 0);
        writer
            .write_frame(Rrid::NULL, bad_notify, b"{\"kind\":\"no_such_kind\"}")
            .await
            .expect("send corrupt frame");
        let (header, msg) = read_msg(&mut reader).await;
        assert_eq!(header.response_to, bad_notify);
        assert!(matches!(msg, Message::Result { value: Err(_) }));

        let good_notify = Rrid::new(1, 11 + round * 2, 0);
        let call = Message::CallFetch {
            func: "echo_str".to_string(),
            args: Bytes::from(codec.encode(&format!("round {round}")).expect("encode")),
        };
        writer
            .write_frame(Rrid::NULL, good_notify, &codec.encode(&call).expect("encode"))
            .await
            .expect("send call");
        let (header, msg) = read_msg(&mut reader).await;
        assert_eq!(header.response_to, good_notify);
        assert!(matches!(msg, Message::Result { value: Ok(_) }));
    }
}

#[tokio::test]
async fn test_wrong_cookie_is_rejected() {
    let cookie = Cookie::from_bytes(*b"0123456789abcdef");
    let (mut reader, mut writer) = raw_worker(cookie).await;

    let wrong = Cookie::from_bytes(*b"fedcba9876543210");
    writer
        .write_handshake(&wrong, RAW_PEER_VERSION)
        .await
        .expect("handshake bytes still go out");

    // The worker closes the connection without replying.
    let err = reader.read_header().await.err().expect("must fail");
    assert!(matches!(err, WireError::ConnectionClosed));
}
