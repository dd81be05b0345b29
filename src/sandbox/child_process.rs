//! Out-of-process isolation.
//!
//! The host re-executes a binary with `--isolate`, writes the [`Invocation`]
//! as JSON on its stdin and decodes its stdout line by line. Both output
//! streams are drained concurrently. At the deadline the child is killed and
//! reaped before the host returns.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::protocol::Frame;
use super::{isolate, ExecutionHost, HostError, HostExit, Invocation};

/// The only variables a child isolate inherits.
pub const INHERITED_ENV: &[&str] = &["RUST_LOG", "FUNC_SANDBOX_DEBUG", "FUNC_SANDBOX_LOG"];

/// Extra time the child gets past the host deadline, so the host's kill
/// always happens first.
const CHILD_GRACE: Duration = Duration::from_secs(5);

/// Room for the truncation notice the isolate emits past its output cap.
const NOTICE_HEADROOM: usize = 4 * 1024;

#[derive(Debug, Clone)]
pub struct ChildProcessHost {
    pub program: PathBuf,
    pub max_stderr_bytes: usize,
}

/// Hard cap on a child's stdout.
///
/// The isolate stops forwarding diagnostics at `max_output_bytes` of encoded
/// lines. The state and result payloads come on top and are serialized from
/// values that fit in the isolate heap. Only a child breaking the protocol
/// can exceed this.
fn stdout_budget(invocation: &Invocation) -> usize {
    invocation
        .max_output_bytes
        .saturating_add(NOTICE_HEADROOM)
        .saturating_add(invocation.max_heap_bytes.saturating_mul(2))
}

#[cfg(unix)]
fn limit_resources() -> std::io::Result<()> {
    // SAFETY: `setrlimit` only reads the struct passed by reference, and
    // both calls are async-signal-safe, as required between fork and exec.
    unsafe {
        let core = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::setrlimit(libc::RLIMIT_CORE, &core) != 0 {
            return Err(std::io::Error::last_os_error());
        }

        let fsize = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::setrlimit(libc::RLIMIT_FSIZE, &fsize) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

impl ChildProcessHost {
    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("--isolate")
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for name in INHERITED_ENV {
            if let Some(value) = std::env::var_os(name) {
                command.env(name, value);
            }
        }
        // SAFETY: `limit_resources` allocates nothing and calls only
        // async-signal-safe functions, so it may run in the forked child.
        #[cfg(unix)]
        unsafe {
            command.pre_exec(limit_resources);
        }
        command
    }
}

#[async_trait]
impl ExecutionHost for ChildProcessHost {
    async fn execute(
        &self,
        invocation: Invocation,
        frames: mpsc::UnboundedSender<Frame>,
    ) -> Result<HostExit, HostError> {
        let timeout_secs = invocation.timeout_secs;
        let execution_id = invocation.execution_id.clone();
        let budget = stdout_budget(&invocation);
        let payload = serde_json::to_vec(&invocation)
            .map_err(|e| HostError::Io(std::io::Error::other(e)))?;

        let mut child = self.command().spawn().map_err(HostError::Spawn)?;
        debug!(pid = ?child.id(), program = %self.program.display(), "spawned isolate");

        let collected = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            self.collect(&mut child, &payload, &execution_id, &frames, budget),
        )
        .await;

        match collected {
            Ok(Ok(exit)) => Ok(exit),
            Ok(Err(e)) => {
                kill(&mut child).await;
                Err(e)
            }
            Err(_) => {
                kill(&mut child).await;
                Err(HostError::Timeout(timeout_secs))
            }
        }
    }
}

impl ChildProcessHost {
    async fn collect(
        &self,
        child: &mut Child,
        payload: &[u8],
        execution_id: &str,
        frames: &mpsc::UnboundedSender<Frame>,
        budget: usize,
    ) -> Result<HostExit, HostError> {
        let missing = || HostError::Io(std::io::Error::other("child pipe unavailable"));
        let mut stdin = child.stdin.take().ok_or_else(missing)?;
        let stdout = child.stdout.take().ok_or_else(missing)?;
        let stderr = child.stderr.take().ok_or_else(missing)?;

        stdin.write_all(payload).await.map_err(HostError::Io)?;
        drop(stdin);

        let (pumped, diagnostics) = tokio::join!(
            pump_stdout(stdout, execution_id, frames, budget),
            read_capped(stderr, self.max_stderr_bytes),
        );
        pumped?;
        let (stderr, truncated) = diagnostics.map_err(HostError::Io)?;
        if truncated {
            warn!("isolate diagnostics truncated at {} bytes", self.max_stderr_bytes);
        }

        let status = child.wait().await.map_err(HostError::Io)?;
        Ok(HostExit {
            success: status.success(),
            code: status.code(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!("isolate already gone: {e}");
    }
    if let Err(e) = child.wait().await {
        warn!("failed to reap isolate: {e}");
    }
}

async fn pump_stdout<R: AsyncRead + Unpin>(
    stdout: R,
    execution_id: &str,
    frames: &mpsc::UnboundedSender<Frame>,
    max_bytes: usize,
) -> Result<(), HostError> {
    let mut reader = BufReader::new(stdout.take(max_bytes as u64 + 1));
    let mut line = Vec::new();
    let mut total = 0usize;
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).await.map_err(HostError::Io)?;
        if n == 0 {
            return Ok(());
        }
        total += n;
        if total > max_bytes {
            return Err(HostError::OutputLimit(max_bytes));
        }
        if let Some(frame) = Frame::decode_line(&String::from_utf8_lossy(&line), execution_id) {
            let _ = frames.send(frame);
        }
    }
}

async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> std::io::Result<(Vec<u8>, bool)> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 8192];
    let mut truncated = false;

    loop {
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            break;
        }
        if truncated {
            continue;
        }
        let remaining = cap.saturating_sub(buf.len());
        if n <= remaining {
            buf.extend_from_slice(&tmp[..n]);
        } else {
            buf.extend_from_slice(&tmp[..remaining]);
            truncated = true;
        }
    }

    Ok((buf, truncated))
}

// ── Child side ──────────────────────────────────────────

/// Entry point of `--isolate`: reads one invocation from stdin, runs it and
/// writes every frame to stdout. Returns the process exit code.
pub async fn serve() -> anyhow::Result<i32> {
    let mut input = String::new();
    tokio::io::stdin().read_to_string(&mut input).await?;
    let invocation: Invocation = serde_json::from_str(&input)?;
    let deadline = Duration::from_secs(invocation.timeout_secs) + CHILD_GRACE;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let done = isolate::spawn(invocation, tx, deadline)?;

    let mut stdout = tokio::io::stdout();
    while let Some(frame) = rx.recv().await {
        stdout.write_all(frame.encode().as_bytes()).await?;
        stdout.write_all(b"\n").await?;
    }
    stdout.flush().await?;

    match done.await {
        Ok(Ok(())) => Ok(0),
        Ok(Err(e)) => {
            eprintln!("{e}");
            Ok(1)
        }
        Err(_) => {
            eprintln!("{}", HostError::Panicked);
            Ok(1)
        }
    }
}
