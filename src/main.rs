mod builders;
mod classify;
mod codecs;
mod config;
mod format;
mod function;
mod function_kinds;
mod output;
mod sandbox;

use std::any::Any;
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::process::ExitCode;

use anyhow::{bail, Result};
use futures::FutureExt;
use tokio::io::AsyncReadExt;
use tracing::{error, info, info_span, Instrument};
use tracing_subscriber::EnvFilter;

use crate::classify::FunctionFailure;
use crate::config::{Config, Isolation};
use crate::function::{
    sniff_execution_id, FunctionKind, FunctionResult, Request, RequestError, RequestStorage,
    ResultRecord,
};
use crate::output::Emitter;
use crate::sandbox::child_process::{self, ChildProcessHost};
use crate::sandbox::in_process::InProcessHost;
use crate::sandbox::{ExecutionHost, Sandbox};

/// Either toggle switches the default log filter to debug.
const DEBUG_TOGGLES: [&str; 2] = ["FUNC_SANDBOX_DEBUG", "FUNC_SANDBOX_LOG"];

fn print_help() {
    println!(
        "\
func-sandbox v{}

Runs one untrusted function under time and capability bounds.

USAGE:
    func-sandbox [OPTIONS] <KIND> < request.json

ARGUMENTS:
    KIND    Function kind: actionRun, before, confirmation, management,
            resolverFunction, schemaVariantDefinition, validation

OPTIONS:
    -c, --config <PATH>    Path to TOML configuration file
    -h, --help             Print this help message and exit
    -V, --version          Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    FUNC_SANDBOX_CONFIG    Configuration file used when --config is absent
    RUST_LOG               Log level filter for tracing
                           (e.g. debug, func_sandbox=debug,warn)
    FUNC_SANDBOX_DEBUG     When set, logs at debug level unless RUST_LOG is set
    FUNC_SANDBOX_LOG       Same as FUNC_SANDBOX_DEBUG

OUTPUT:
    Newline-delimited JSON on stdout: zero or more {{\"protocol\":\"output\"}}
    records followed by exactly one {{\"protocol\":\"result\"}} record.
    Logs go to stderr.

EXAMPLES:
    func-sandbox actionRun < request.json
    func-sandbox --config /etc/func-sandbox.toml validation < request.json
    FUNC_SANDBOX_DEBUG=1 func-sandbox before < request.json",
        env!("CARGO_PKG_VERSION"),
    );
}

enum Mode {
    Run { kind: String, config: Option<String> },
    Isolate,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Mode> {
    let mut kind = None;
    let mut config = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--isolate" => return Ok(Mode::Isolate),
            "--config" | "-c" => match args.next() {
                Some(path) => config = Some(path),
                None => bail!("--config requires a path"),
            },
            flag if flag.starts_with('-') => bail!("unknown option `{flag}`"),
            _ if kind.is_some() => bail!("unexpected argument `{arg}`"),
            _ => kind = Some(arg),
        }
    }
    match kind {
        Some(kind) => Ok(Mode::Run { kind, config }),
        None => bail!("missing function kind"),
    }
}

fn init_logging() {
    let default = if DEBUG_TOGGLES.iter().any(|name| std::env::var_os(name).is_some()) {
        "func_sandbox=debug"
    } else {
        "func_sandbox=warn"
    };
    // stdout carries the protocol
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("func-sandbox v{}", env!("CARGO_PKG_VERSION"));
                return ExitCode::SUCCESS;
            }
            "--help" | "-h" => {
                print_help();
                return ExitCode::SUCCESS;
            }
            _ => {}
        }
    }

    init_logging();

    match parse_args(std::env::args().skip(1)) {
        Ok(Mode::Isolate) => match child_process::serve().await {
            Ok(0) => ExitCode::SUCCESS,
            Ok(_) => ExitCode::FAILURE,
            Err(e) => {
                eprintln!("isolate failed: {e:#}");
                ExitCode::FAILURE
            }
        },
        Ok(Mode::Run { kind, config }) => run(&kind, config.as_deref()).await,
        Err(e) => {
            eprintln!("error: {e}\n\nRun `func-sandbox --help` for usage.");
            ExitCode::FAILURE
        }
    }
}

/// Serves one request from stdin. Whatever happens, exactly one result
/// record reaches stdout.
async fn run(kind: &str, config_flag: Option<&str>) -> ExitCode {
    let mut emitter = Emitter::new(std::io::stdout());
    let mut input = String::new();
    if let Err(e) = tokio::io::stdin().read_to_string(&mut input).await {
        return last_resort(&mut emitter, "", &format!("failed to read request: {e}"));
    }
    let execution_id = sniff_execution_id(&input);

    let span = info_span!("request", run = %uuid::Uuid::new_v4(), %execution_id);
    let handled = AssertUnwindSafe(handle(kind, config_flag, &input, &mut emitter).instrument(span))
        .catch_unwind()
        .await;

    match handled {
        Ok(Ok(code)) => code,
        Ok(Err(e)) => last_resort(&mut emitter, &execution_id, &format!("{e:#}")),
        Err(panic) => last_resort(&mut emitter, &execution_id, &panic_message(panic.as_ref())),
    }
}

async fn handle<W: Write>(
    kind: &str,
    config_flag: Option<&str>,
    input: &str,
    emitter: &mut Emitter<W>,
) -> Result<ExitCode> {
    let kind = match kind.parse::<FunctionKind>() {
        Ok(kind) => kind,
        Err(e) => return reject(emitter, &sniff_execution_id(input), &e),
    };
    let request = match Request::parse(input) {
        Ok(request) => request,
        Err(e) => return reject(emitter, &sniff_execution_id(input), &e),
    };

    let config = Config::discover(config_flag)?;
    let sandbox = Sandbox::new(
        host(&config)?,
        config.limits.clone(),
        config.sandbox.default_timeout_secs,
    );
    let prepared = match sandbox.prepare(kind, &request) {
        Ok(prepared) => prepared,
        Err(e) => return reject(emitter, request.execution_id(), &e),
    };

    info!(%kind, isolation = ?config.sandbox.isolation, "running function");
    let record = sandbox.execute(prepared, emitter).await;
    emitter.finish(&record)?;
    Ok(ExitCode::SUCCESS)
}

fn host(config: &Config) -> Result<Box<dyn ExecutionHost>> {
    Ok(match config.sandbox.isolation {
        Isolation::ChildProcess => Box::new(ChildProcessHost {
            program: config.isolate_program()?,
            max_stderr_bytes: config.limits.max_stderr_bytes,
        }),
        Isolation::InProcess => Box::new(InProcessHost),
    })
}

/// Protocol errors: no guest code ran.
fn reject<W: Write>(emitter: &mut Emitter<W>, execution_id: &str, err: &RequestError) -> Result<ExitCode> {
    error!("rejecting request: {err}");
    let record = ResultRecord {
        result: FunctionResult::failure(execution_id, FunctionFailure::from(err)),
        request_storage: RequestStorage::default(),
    };
    emitter.finish(&record)?;
    Ok(ExitCode::FAILURE)
}

fn last_resort<W: Write>(emitter: &mut Emitter<W>, execution_id: &str, message: &str) -> ExitCode {
    error!("request failed outside the function: {message}");
    let record = ResultRecord {
        result: FunctionResult::failure(execution_id, FunctionFailure::sandbox(message)),
        request_storage: RequestStorage::default(),
    };
    if let Err(e) = emitter.finish(&record) {
        eprintln!("failed to write result: {e}");
    }
    ExitCode::FAILURE
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    match panic.downcast_ref::<&str>() {
        Some(message) => message.to_string(),
        None => match panic.downcast_ref::<String>() {
            Some(message) => message.clone(),
            None => "sandbox panicked".to_string(),
        },
    }
}
