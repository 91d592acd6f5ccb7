//! Call engine: the function registry and thunk execution.
//!
//! Remote calls name functions registered ahead of time in the node's
//! [`FuncRegistry`]; arguments and results are opaque bytes produced by
//! the payload codec. Each submitted thunk runs in its own task. A
//! success fills the target slot with the raw return bytes; a handler
//! error or panic is captured where it happened and wrapped in a
//! [`RemoteException`] carrying the executing worker's id. The engine
//! never re-raises and never retries.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use procmesh_core::PayloadCodec;
use tokio::sync::OwnedMutexGuard;

use crate::error::{CapturedException, RemoteException};

/// Result bytes plus the lock a synchronous take must hold across the
/// result send (see the registry's unbuffered slots).
pub struct CallOutput {
    /// Encoded result value.
    pub bytes: Bytes,
    /// Held until the result frame is fully written, then released.
    pub(crate) sync_guard: Option<OwnedMutexGuard<()>>,
}

impl CallOutput {
    /// Plain output with no send-side locking.
    pub fn new(bytes: Bytes) -> Self {
        Self {
            bytes,
            sync_guard: None,
        }
    }

    pub(crate) fn with_guard(bytes: Bytes, guard: OwnedMutexGuard<()>) -> Self {
        Self {
            bytes,
            sync_guard: Some(guard),
        }
    }
}

impl From<Bytes> for CallOutput {
    fn from(bytes: Bytes) -> Self {
        Self::new(bytes)
    }
}

/// Future returned by a registered handler.
pub type HandlerFuture =
    Pin<Box<dyn Future<Output = Result<CallOutput, RemoteException>> + Send + 'static>>;

/// A registered function: opaque bytes in, opaque bytes out.
///
/// Handlers reporting their own failure use pid 0 in the returned
/// [`RemoteException`]; the engine rewrites it to the executing worker's
/// id. A non-zero pid is preserved, so handlers forwarding an exception
/// that originated elsewhere keep its provenance.
pub type Handler = Arc<dyn Fn(Bytes) -> HandlerFuture + Send + Sync>;

/// Name → handler table consulted by the dispatcher for every `call`-class
/// message.
#[derive(Default)]
pub struct FuncRegistry {
    funcs: Mutex<HashMap<String, Handler>>,
}

impl FuncRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a raw handler under `name`, replacing any previous one.
    pub fn register(&self, name: impl Into<String>, handler: Handler) {
        self.funcs
            .lock()
            .expect("func registry poisoned")
            .insert(name.into(), handler);
    }

    /// Register an async handler with typed arguments and result.
    ///
    /// The handler reports failure as a [`CapturedException`]; the engine
    /// attributes it to the executing worker.
    pub fn register_async<C, A, R, F, Fut>(&self, codec: C, name: impl Into<String>, f: F)
    where
        C: PayloadCodec,
        A: serde::de::DeserializeOwned + Send + 'static,
        R: serde::Serialize,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, CapturedException>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: Handler = Arc::new(move |args: Bytes| {
            let codec = codec.clone();
            let f = f.clone();
            Box::pin(async move {
                let args: A = codec
                    .decode(&args)
                    .map_err(|e| local_fault(CapturedException::bare(e.to_string())))?;
                let result = f(args).await.map_err(local_fault)?;
                let bytes = codec
                    .encode(&result)
                    .map_err(|e| local_fault(CapturedException::here(e.to_string())))?;
                Ok(CallOutput::new(Bytes::from(bytes)))
            })
        });
        self.register(name, handler);
    }

    /// Register a synchronous infallible function.
    pub fn register_fn<C, A, R, F>(&self, codec: C, name: impl Into<String>, f: F)
    where
        C: PayloadCodec,
        A: serde::de::DeserializeOwned + Send + 'static,
        R: serde::Serialize,
        F: Fn(A) -> R + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.register_async(codec, name, move |args: A| {
            let f = f.clone();
            async move { Ok(f(args)) }
        });
    }

    /// Look up a handler by name.
    pub fn lookup(&self, name: &str) -> Option<Handler> {
        self.funcs
            .lock()
            .expect("func registry poisoned")
            .get(name)
            .cloned()
    }
}

/// A handler-local fault, attributed to the executor by [`run_call`].
fn local_fault(captured: CapturedException) -> RemoteException {
    RemoteException::new(0, captured)
}

/// Execute one thunk to completion, converting every failure mode into a
/// [`RemoteException`] attributed to worker `pid`.
///
/// The handler runs in its own spawned task so that a panic is isolated
/// and observed as a capture instead of tearing down the caller.
pub(crate) async fn run_call(
    pid: procmesh_core::WorkerId,
    funcs: &FuncRegistry,
    func: &str,
    args: Bytes,
) -> Result<CallOutput, RemoteException> {
    let Some(handler) = funcs.lookup(func) else {
        return Err(RemoteException::new(
            pid,
            CapturedException::bare(format!("no function `{func}` is registered")),
        ));
    };

    let result = match tokio::spawn(handler(args)).await {
        Ok(outcome) => outcome,
        Err(join) if join.is_panic() => {
            let payload = join.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            Err(local_fault(CapturedException::here(format!(
                "handler panicked: {message}"
            ))))
        }
        Err(_) => Err(local_fault(CapturedException::bare("handler was cancelled"))),
    };

    result.map_err(|mut exc| {
        if exc.pid == 0 {
            exc.pid = pid;
        }
        exc
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use procmesh_core::JsonCodec;

    fn registry_with_double() -> FuncRegistry {
        let funcs = FuncRegistry::new();
        funcs.register_fn(JsonCodec, "double", |x: i64| x * 2);
        funcs
    }

    #[tokio::test]
    async fn test_typed_call_roundtrip() {
        let funcs = registry_with_double();
        let args = Bytes::from(serde_json::to_vec(&21i64).expect("encode"));
        let out = run_call(2, &funcs, "double", args).await.expect("call");
        let value: i64 = serde_json::from_slice(&out.bytes).expect("decode");
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_missing_function_is_remote_exception() {
        let funcs = FuncRegistry::new();
        let err = run_call(2, &funcs, "nope", Bytes::new())
            .await
            .err()
            .expect("must fail");
        assert_eq!(err.pid, 2);
        assert!(err.captured.message.contains("no function"));
    }

    #[tokio::test]
    async fn test_handler_error_attributed_to_executor() {
        let funcs = FuncRegistry::new();
        funcs.register_async(JsonCodec, "explode", |_: i64| async {
            Err::<i64, _>(CapturedException::bare("boom"))
        });
        let args = Bytes::from(serde_json::to_vec(&0i64).expect("encode"));
        let err = run_call(7, &funcs, "explode", args)
            .await
            .err()
            .expect("must fail");
        assert_eq!(err.pid, 7);
        assert_eq!(err.captured.message, "boom");
    }

    #[tokio::test]
    async fn test_panic_is_captured_not_propagated() {
        let funcs = FuncRegistry::new();
        funcs.register_fn(JsonCodec, "panic", |_: i64| -> i64 { panic!("kaboom") });
        let args = Bytes::from(serde_json::to_vec(&0i64).expect("encode"));
        let err = run_call(3, &funcs, "panic", args)
            .await
            .err()
            .expect("must fail");
        assert_eq!(err.pid, 3);
        assert!(err.captured.message.contains("kaboom"));
        assert!(err.captured.backtrace.is_some());
    }

    #[tokio::test]
    async fn test_bad_args_fail_as_capture() {
        let funcs = registry_with_double();
        let err = run_call(2, &funcs, "double", Bytes::from_static(b"not json"))
            .await
            .err()
            .expect("must fail");
        assert_eq!(err.pid, 2);
    }

    #[tokio::test]
    async fn test_forwarded_exception_keeps_origin_pid() {
        let funcs = FuncRegistry::new();
        let handler: Handler = Arc::new(|_args| {
            Box::pin(async {
                Err(RemoteException::new(
                    9,
                    CapturedException::bare("from elsewhere"),
                ))
            })
        });
        funcs.register("forward", handler);
        let err = run_call(2, &funcs, "forward", Bytes::new())
            .await
            .err()
            .expect("must fail");
        assert_eq!(err.pid, 9, "origin pid must survive forwarding");
    }
}
