use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use super::protocol::Frame;
use super::{isolate, ExecutionHost, HostError, HostExit, Invocation};

/// Extra time the isolate thread gets to tear down after its own deadline.
const TEARDOWN_GRACE: Duration = Duration::from_secs(2);

/// Runs each invocation on a dedicated isolate thread of this process.
///
/// The deadline is cooperative from the host's point of view: the watchdog
/// terminates V8 execution, but a thread stuck outside V8 cannot be killed.
#[derive(Debug, Default, Clone, Copy)]
pub struct InProcessHost;

#[async_trait]
impl ExecutionHost for InProcessHost {
    async fn execute(
        &self,
        invocation: Invocation,
        frames: mpsc::UnboundedSender<Frame>,
    ) -> Result<HostExit, HostError> {
        let timeout_secs = invocation.timeout_secs;
        let deadline = Duration::from_secs(timeout_secs);
        let done = isolate::spawn(invocation, frames, deadline)?;

        match tokio::time::timeout(deadline + TEARDOWN_GRACE, done).await {
            Ok(Ok(result)) => result.map(|()| HostExit::clean()),
            Ok(Err(_)) => Err(HostError::Panicked),
            Err(_) => {
                warn!("isolate thread did not finish within {timeout_secs}s plus grace");
                Err(HostError::Timeout(timeout_secs))
            }
        }
    }
}
