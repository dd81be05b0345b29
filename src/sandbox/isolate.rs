//! One V8 isolate per invocation.
//!
//! The isolate lives on its own thread with a current-thread tokio runtime,
//! since `JsRuntime` is `!Send`. Two guards bound it: a watchdog thread that
//! terminates execution at the deadline (covering synchronous loops the event
//! loop timeout cannot interrupt) and a near-heap-limit callback that
//! terminates execution before V8 aborts the process.

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use deno_core::error::{AnyError, JsError};
use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::capabilities::CapabilitySet;
use super::ops::{func_sandbox, OpContext};
use super::protocol::Frame;
use super::{HostError, Invocation};
use crate::function::{Outcome, RequestStorage, ThrownError};

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

/// Terminates execution and grants 1MB so V8 can unwind.
extern "C" fn near_heap_limit_callback(
    data: *mut c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the boxed HeapLimitState in `run`, which is
    // dropped only after the runtime owning the isolate.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

/// Starts an isolate thread for `invocation`. Frames stream through
/// `frames`; the receiver resolves once the isolate is torn down.
pub fn spawn(
    invocation: Invocation,
    frames: mpsc::UnboundedSender<Frame>,
    deadline: Duration,
) -> Result<oneshot::Receiver<Result<(), HostError>>, HostError> {
    let (tx, rx) = oneshot::channel();
    std::thread::Builder::new()
        .name(format!("isolate-{}", invocation.kind))
        .spawn(move || {
            let result = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt.block_on(run(invocation, frames, deadline)),
                Err(e) => Err(HostError::Io(e)),
            };
            if tx.send(result).is_err() {
                warn!("isolate result receiver dropped");
            }
        })
        .map_err(HostError::Spawn)?;
    Ok(rx)
}

/// Runs the invocation to completion and emits its state and result frames.
pub async fn run(
    invocation: Invocation,
    frames: mpsc::UnboundedSender<Frame>,
    deadline: Duration,
) -> Result<(), HostError> {
    let Invocation {
        execution_id,
        kind,
        script,
        arguments,
        storage,
        timeout_secs,
        max_heap_bytes,
        max_output_bytes,
    } = invocation;

    let capabilities = CapabilitySet::for_kind(kind);
    let bootstrap = capabilities.bootstrap_script();
    debug!(%execution_id, %kind, "wrapped function:\n{script}");

    let (completion_tx, completion_rx) = oneshot::channel();
    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![func_sandbox::init_ops()],
        create_params: Some(v8::CreateParams::default().heap_limits(0, max_heap_bytes)),
        ..Default::default()
    });
    runtime.op_state().borrow_mut().put(OpContext::new(
        execution_id.clone(),
        capabilities,
        arguments,
        storage,
        frames.clone(),
        completion_tx,
        max_output_bytes,
        max_heap_bytes,
    ));

    // ── Guards ──────────────────────────────────────────
    let heap_state = Box::new(HeapLimitState {
        handle: runtime.v8_isolate().thread_safe_handle(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut c_void,
    );

    let watchdog_handle = runtime.v8_isolate().thread_safe_handle();
    let timed_out = Arc::new(AtomicBool::new(false));
    let watchdog_timed_out = timed_out.clone();
    let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();
    let watchdog = std::thread::spawn(move || {
        if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(deadline) {
            watchdog_timed_out.store(true, Ordering::SeqCst);
            watchdog_handle.terminate_execution();
        }
    });

    let driven = drive(&mut runtime, bootstrap, script, completion_rx, deadline).await;

    // The watchdog holds an isolate handle; it must exit before the runtime drops.
    let _ = cancel_tx.send(());
    let _ = watchdog.join();

    let storage = runtime
        .op_state()
        .borrow_mut()
        .try_take::<OpContext>()
        .map(|ctx| ctx.storage)
        .unwrap_or_default();
    drop(runtime);

    if heap_state.triggered.load(Ordering::SeqCst) {
        return Err(HostError::HeapLimit(max_heap_bytes / (1024 * 1024)));
    }
    if timed_out.load(Ordering::SeqCst) {
        return Err(HostError::Timeout(timeout_secs));
    }
    let encoded = match driven {
        Ok(encoded) => encoded,
        Err(Driven::Bootstrap(message)) => return Err(HostError::Bootstrap(message)),
        Err(Driven::TimedOut) => return Err(HostError::Timeout(timeout_secs)),
    };

    debug!(%execution_id, "result envelope: {encoded}");
    let _ = frames.send(Frame::State(encode_storage(&storage)));
    let _ = frames.send(Frame::Result(encoded));
    Ok(())
}

enum Driven {
    Bootstrap(String),
    TimedOut,
}

/// Executes bootstrap and function script, then polls the event loop until
/// the completion hook fires or nothing is left to run.
async fn drive(
    runtime: &mut JsRuntime,
    bootstrap: String,
    script: String,
    mut completion: oneshot::Receiver<String>,
    deadline: Duration,
) -> Result<String, Driven> {
    runtime
        .execute_script("[func-sandbox:bootstrap]", bootstrap)
        .map_err(|e| Driven::Bootstrap(e.to_string()))?;

    if let Err(e) = runtime.execute_script("[func-sandbox:function]", script) {
        return Ok(thrown(&e));
    }

    let polled = tokio::time::timeout(deadline, async {
        tokio::select! {
            biased;
            encoded = &mut completion => Ok(encoded.ok()),
            polled = runtime.run_event_loop(PollEventLoopOptions::default()) => polled.map(|()| None),
        }
    })
    .await;

    match polled {
        Err(_) => Err(Driven::TimedOut),
        Ok(Ok(Some(encoded))) => Ok(encoded),
        Ok(Ok(None)) => Ok(completion.try_recv().unwrap_or_else(|_| never_settled())),
        Ok(Err(e)) => Ok(completion.try_recv().unwrap_or_else(|_| thrown(&e))),
    }
}

fn thrown(err: &AnyError) -> String {
    let thrown = match err.downcast_ref::<JsError>() {
        Some(js) => ThrownError::new(
            js.name.clone().unwrap_or_else(|| "Error".to_string()),
            js.message
                .clone()
                .unwrap_or_else(|| js.exception_message.clone()),
        ),
        None => ThrownError::new("Error", err.to_string()),
    };
    encode_outcome(&Outcome::Thrown(thrown))
}

/// The event loop drained while the handler's promise was still pending.
fn never_settled() -> String {
    encode_outcome(&Outcome::Thrown(ThrownError::new(
        "Error",
        "function did not complete: its promise never settled",
    )))
}

fn encode_outcome(outcome: &Outcome) -> String {
    serde_json::to_string(outcome).unwrap_or_default()
}

fn encode_storage(storage: &RequestStorage) -> String {
    serde_json::to_string(storage).unwrap_or_default()
}
