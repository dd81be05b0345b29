//! Execution sandbox.
//!
//! A [`Sandbox`] turns one [`Request`] into exactly one [`ResultRecord`]:
//!
//! 1. `prepare` parses the kind payload, decodes the main function and wraps
//!    it. Any failure here is a protocol error and no guest code runs.
//! 2. Before-hooks run one at a time. Each receives the current request
//!    storage and its snapshot replaces it. A failing hook is logged and
//!    skipped.
//! 3. The main invocation runs once with the accumulated storage, and its
//!    outcome goes through the kind's result contract.
//!
//! Every invocation goes through an [`ExecutionHost`]: child processes
//! killed at the deadline, or isolate threads inside this process.

pub mod capabilities;
pub mod child_process;
pub mod in_process;
pub mod isolate;
pub mod ops;
pub mod protocol;
pub mod wrapper;

use std::io;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::classify::{missing_result, FunctionFailure};
use crate::config::LimitsConfig;
use crate::function::{
    BeforeFunction, FunctionKind, FunctionResult, LogLevel, Outcome, OutputLine, OutputStream,
    Request, RequestError, RequestStorage, ResultRecord,
};
use crate::function_kinds::{GuestSource, KindContract, KindPayload, Resolved};
use crate::output::OutputSink;
use protocol::{Collected, Frame, FrameCollector};
use wrapper::Template;

/// Failures of the isolation machinery itself.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to start isolate: {0}")]
    Spawn(#[source] io::Error),
    #[error("isolate I/O failed: {0}")]
    Io(#[source] io::Error),
    #[error("function timed out after {0} seconds")]
    Timeout(u64),
    #[error("function exceeded the heap limit of {0} MB")]
    HeapLimit(usize),
    #[error("function output exceeded {0} bytes")]
    OutputLimit(usize),
    #[error("failed to bootstrap isolate: {0}")]
    Bootstrap(String),
    #[error("isolate exited without reporting")]
    Panicked,
}

/// How the runtime instance ended, independent of what it printed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostExit {
    pub success: bool,
    pub code: Option<i32>,
    pub stderr: String,
}

impl HostExit {
    pub fn clean() -> Self {
        Self {
            success: true,
            code: Some(0),
            stderr: String::new(),
        }
    }
}

/// Everything an isolate needs, serializable for the child process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    pub execution_id: String,
    pub kind: FunctionKind,
    pub script: String,
    pub arguments: Vec<Value>,
    pub storage: RequestStorage,
    pub timeout_secs: u64,
    pub max_heap_bytes: usize,
    pub max_output_bytes: usize,
}

/// Runs one wrapped invocation under an isolation strategy and a deadline.
///
/// Frames stream through `frames` while the invocation runs. On deadline
/// expiry the runtime instance is terminated before the call returns.
#[async_trait]
pub trait ExecutionHost: Send + Sync {
    async fn execute(
        &self,
        invocation: Invocation,
        frames: mpsc::UnboundedSender<Frame>,
    ) -> Result<HostExit, HostError>;
}

/// A request that passed protocol checks and is ready to run.
#[derive(Debug)]
pub struct Prepared {
    pub execution_id: String,
    pub payload: KindPayload,
    pub script: String,
    pub before: Vec<BeforeFunction>,
    pub timeout_secs: u64,
}

struct Invoked {
    storage: Option<RequestStorage>,
    outcome: Result<Outcome, FunctionFailure>,
}

pub struct Sandbox {
    host: Box<dyn ExecutionHost>,
    limits: LimitsConfig,
    default_timeout_secs: u64,
}

impl Sandbox {
    pub fn new(host: Box<dyn ExecutionHost>, limits: LimitsConfig, default_timeout_secs: u64) -> Self {
        Self {
            host,
            limits,
            default_timeout_secs,
        }
    }

    pub fn prepare(&self, kind: FunctionKind, request: &Request) -> Result<Prepared, RequestError> {
        let payload = KindPayload::parse(kind, request.payload.clone())?;
        let contract = payload.contract();
        let guest = contract.guest(&request.func())?;
        let script = wrapper::wrap(&guest, contract.template())?;
        Ok(Prepared {
            execution_id: request.execution_id().to_string(),
            payload,
            script,
            before: request.before.clone(),
            timeout_secs: request.timeout.unwrap_or(self.default_timeout_secs),
        })
    }

    /// Runs the before-hooks then the main invocation.
    pub async fn execute(&self, prepared: Prepared, sink: &mut dyn OutputSink) -> ResultRecord {
        let Prepared {
            execution_id,
            payload,
            script,
            before,
            timeout_secs,
        } = prepared;

        let mut storage = RequestStorage::default();
        for (index, hook) in before.iter().enumerate() {
            storage = self
                .run_before(&execution_id, index, hook, storage, timeout_secs, sink)
                .await;
        }

        let contract = payload.contract();
        let invoked = self
            .invoke(
                &execution_id,
                payload.kind(),
                script,
                contract.arguments(),
                storage.clone(),
                timeout_secs,
                sink,
            )
            .await;
        let storage = invoked.storage.unwrap_or(storage);

        let result = match invoked.outcome.and_then(|outcome| resolve(contract, outcome)) {
            Ok(resolved) => FunctionResult::success(&execution_id, resolved.data, resolved.error),
            Err(failure) => {
                info!(%execution_id, kind = %failure.kind, "function failed: {}", failure.message);
                FunctionResult::failure(&execution_id, failure)
            }
        };

        ResultRecord {
            result,
            request_storage: storage,
        }
    }

    async fn run_before(
        &self,
        execution_id: &str,
        index: usize,
        hook: &BeforeFunction,
        storage: RequestStorage,
        timeout_secs: u64,
        sink: &mut dyn OutputSink,
    ) -> RequestStorage {
        let script = hook
            .func
            .source()
            .and_then(|code| {
                let guest = GuestSource {
                    code,
                    handler: hook.func.handler.clone(),
                };
                wrapper::wrap(&guest, Template::BEFORE)
            });
        let script = match script {
            Ok(script) => script,
            Err(e) => {
                report_before_failure(execution_id, index, &e.to_string(), sink);
                return storage;
            }
        };

        let invoked = self
            .invoke(
                execution_id,
                FunctionKind::Before,
                script,
                vec![hook.arg.clone()],
                storage.clone(),
                timeout_secs,
                sink,
            )
            .await;

        match invoked.outcome.and_then(|outcome| outcome.returned().map_err(FunctionFailure::from)) {
            Ok(_) => debug!(%execution_id, index, "before function completed"),
            Err(failure) => report_before_failure(
                execution_id,
                index,
                &format!("{}: {}", failure.kind, failure.message),
                sink,
            ),
        }

        let storage = invoked.storage.unwrap_or(storage);
        debug!(%execution_id, index, "request storage after before function: {:?}", storage);
        storage
    }

    #[allow(clippy::too_many_arguments)]
    async fn invoke(
        &self,
        execution_id: &str,
        kind: FunctionKind,
        script: String,
        arguments: Vec<Value>,
        storage: RequestStorage,
        timeout_secs: u64,
        sink: &mut dyn OutputSink,
    ) -> Invoked {
        let invocation = Invocation {
            execution_id: execution_id.to_string(),
            kind,
            script,
            arguments,
            storage,
            timeout_secs,
            max_heap_bytes: self.limits.max_heap_bytes(),
            max_output_bytes: self.limits.max_output_bytes,
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut collector = FrameCollector::new();
        let execution = self.host.execute(invocation, tx);
        tokio::pin!(execution);

        let exit = loop {
            tokio::select! {
                biased;
                Some(frame) = rx.recv() => {
                    if let Some(line) = collector.accept(frame) {
                        sink.emit(line);
                    }
                }
                exit = &mut execution => break exit,
            }
        };
        while let Ok(frame) = rx.try_recv() {
            if let Some(line) = collector.accept(frame) {
                sink.emit(line);
            }
        }

        let exit = match exit {
            Ok(exit) => exit,
            Err(e) => {
                warn!(%execution_id, %kind, "execution host failed: {e}");
                return Invoked {
                    storage: None,
                    outcome: Err(FunctionFailure::from(&e)),
                };
            }
        };

        // The isolate only reports after a clean run, so payloads from a
        // failed one cannot be trusted.
        if !exit.success {
            warn!(%execution_id, %kind, code = ?exit.code, "isolate exited abnormally; discarding its payloads");
            return Invoked {
                storage: None,
                outcome: Err(missing_result(&exit)),
            };
        }

        match collector.finish() {
            Err(violation) => Invoked {
                storage: None,
                outcome: Err(FunctionFailure::invalid_return(violation)),
            },
            Ok(Collected {
                storage,
                outcome: Some(outcome),
            }) => {
                debug!(%execution_id, %kind, "decoded outcome: {:?}", outcome);
                Invoked {
                    storage,
                    outcome: Ok(outcome),
                }
            }
            Ok(Collected {
                storage,
                outcome: None,
            }) => Invoked {
                storage,
                outcome: Err(missing_result(&exit)),
            },
        }
    }
}

/// Passes a decoded outcome through the kind's result contract.
fn resolve(contract: &dyn KindContract, outcome: Outcome) -> Result<Resolved, FunctionFailure> {
    let returned = outcome.returned().map_err(FunctionFailure::from)?;
    contract.resolve(returned)
}

fn report_before_failure(execution_id: &str, index: usize, message: &str, sink: &mut dyn OutputSink) {
    warn!(%execution_id, index, "before function failed: {message}");
    let line = OutputLine::new(
        execution_id,
        OutputStream::Stderr,
        LogLevel::Error,
        format!("before function {index} failed: {message}"),
    )
    .with_group("before");
    sink.emit(line);
}
