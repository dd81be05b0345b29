//! Drives the built binary end to end: request on stdin, NDJSON on stdout.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::time::{Duration, Instant};

use base64::Engine;
use serde_json::{json, Value};

fn code(source: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(source)
}

fn spawn_with(args: &[&str], envs: &[(&str, &str)], request: &Value) -> Child {
    let mut child = Command::new(env!("CARGO_BIN_EXE_func-sandbox"))
        .args(args)
        .env_remove("RUST_LOG")
        .env_remove("FUNC_SANDBOX_CONFIG")
        .envs(envs.iter().copied())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(request.to_string().as_bytes())
        .unwrap();
    child
}

fn run_with(args: &[&str], request: &Value) -> Output {
    spawn_with(args, &[], request).wait_with_output().unwrap()
}

fn config_file(dir: &Path, content: &str) -> PathBuf {
    let path = dir.join("sandbox.toml");
    std::fs::write(&path, content).unwrap();
    path
}

fn records(output: &Output) -> Vec<Value> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

/// The terminal record, checked to be the last and only result.
fn result(output: &Output) -> Value {
    let records = records(output);
    let results: Vec<_> = records.iter().filter(|r| r["protocol"] == "result").collect();
    assert_eq!(results.len(), 1, "records: {records:?}");
    assert_eq!(records.last().unwrap()["protocol"], "result");
    results[0].clone()
}

#[test]
fn test_help_and_version() {
    let output = Command::new(env!("CARGO_BIN_EXE_func-sandbox"))
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());
    let help = String::from_utf8_lossy(&output.stdout);
    assert!(help.contains("USAGE:"));
    assert!(help.contains("ENVIRONMENT VARIABLES:"));
    assert!(!help.contains("--isolate"));

    let output = Command::new(env!("CARGO_BIN_EXE_func-sandbox"))
        .arg("-V")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).starts_with("func-sandbox v"));
}

#[test]
fn test_missing_execution_id_is_protocol_error() {
    let output = run_with(&["before"], &json!({"handler": "main", "codeBase64": code("function main() {}")}));
    assert_eq!(output.status.code(), Some(1));
    let result = result(&output);
    assert_eq!(result["status"], "failure");
    assert_eq!(result["executionId"], "");
    assert_eq!(result["error"]["kind"], "InvalidRequest");
}

#[test]
fn test_unknown_kind_keeps_execution_id() {
    let output = run_with(&["reconciliation"], &json!({"executionId": "k1"}));
    assert_eq!(output.status.code(), Some(1));
    let result = result(&output);
    assert_eq!(result["executionId"], "k1");
    assert_eq!(result["error"]["kind"], "InvalidRequest");
}

#[test]
fn test_validation_format() {
    let output = run_with(
        &["validation"],
        &json!({"executionId": "v1", "value": 42, "validationFormat": "{\"type\":\"number\"}"}),
    );
    assert_eq!(output.status.code(), Some(0));
    let result = result(&output);
    assert_eq!(result["status"], "success");
    assert!(result.get("error").is_none());

    let output = run_with(
        &["validation"],
        &json!({"executionId": "v2", "value": "foobar", "validationFormat": {"type": "number"}}),
    );
    assert_eq!(output.status.code(), Some(0));
    let result = crate::result(&output);
    assert_eq!(result["status"], "success");
    assert_eq!(result["error"], "\"value\" must be a number");
}

#[test]
fn test_action_run_output_and_contract() {
    let source = r#"
        async function main(args, previous) {
          console.log("hello", args.name);
          console.error("careful");
          return { status: "ok", payload: { previous } };
        }
    "#;
    let output = run_with(
        &["actionRun"],
        &json!({
            "executionId": "a1",
            "handler": "main",
            "codeBase64": code(source),
            "args": {"name": "world", "properties": {"resource": {"payload": {"id": 7}}}}
        }),
    );
    assert_eq!(output.status.code(), Some(0));
    let records = records(&output);
    assert_eq!(records[0]["protocol"], "output");
    assert_eq!(records[0]["executionId"], "a1");
    assert_eq!(records[0]["stream"], "stdout");
    assert_eq!(records[0]["message"], "hello world");
    assert_eq!(records[1]["stream"], "stderr");
    assert_eq!(records[1]["level"], "error");

    let result = result(&output);
    assert_eq!(result["status"], "success");
    assert_eq!(result["health"], "ok");
    assert_eq!(result["payload"], json!({"previous": {"id": 7}}));
}

#[test]
fn test_action_run_ok_with_message_is_rejected() {
    let source = r#"function main() { return { status: "ok", message: "nope" }; }"#;
    let output = run_with(
        &["actionRun"],
        &json!({"executionId": "a2", "handler": "main", "codeBase64": code(source), "args": {}}),
    );
    assert_eq!(output.status.code(), Some(0));
    let result = result(&output);
    assert_eq!(result["status"], "failure");
    assert_eq!(result["error"]["kind"], "ActionFieldWrongType");
}

#[test]
fn test_null_return_is_invalid() {
    let source = "function main() { return null; }";
    let output = run_with(
        &["confirmation"],
        &json!({"executionId": "c1", "handler": "main", "codeBase64": code(source)}),
    );
    let result = result(&output);
    assert_eq!(result["error"]["kind"], "InvalidReturnType");
}

#[test]
fn test_thrown_error_keeps_name() {
    let source = "function main() { throw new TypeError('bad input'); }";
    let output = run_with(
        &["management"],
        &json!({"executionId": "m1", "handler": "main", "codeBase64": code(source)}),
    );
    assert_eq!(output.status.code(), Some(0));
    let result = result(&output);
    assert_eq!(result["error"]["kind"], json!({"UserCodeException": "TypeError"}));
    assert_eq!(result["error"]["message"], "bad input");
}

#[test]
fn test_missing_handler_is_reference_error() {
    let output = run_with(
        &["before"],
        &json!({"executionId": "b0", "handler": "absent", "codeBase64": code("const x = 1;")}),
    );
    let result = result(&output);
    assert_eq!(result["error"]["kind"], json!({"UserCodeException": "ReferenceError"}));
}

#[test]
fn test_before_hooks_thread_storage() {
    let first = r#"function hook(arg) { requestStorage.setEnv("TOKEN", arg.token); }"#;
    let broken = r#"function hook() { requestStorage.setItem("partial", "yes"); throw new Error("hook broke"); }"#;
    let main = r#"
        function main() {
          return {
            status: "ok",
            payload: { token: requestStorage.getEnv("TOKEN"), partial: requestStorage.getItem("partial") }
          };
        }
    "#;
    let output = run_with(
        &["actionRun"],
        &json!({
            "executionId": "b1",
            "handler": "main",
            "codeBase64": code(main),
            "args": {},
            "before": [
                {"handler": "hook", "codeBase64": code(first), "arg": {"token": "abc"}},
                {"handler": "hook", "codeBase64": code(broken), "arg": {}}
            ]
        }),
    );
    assert_eq!(output.status.code(), Some(0));
    let records = records(&output);
    assert!(records
        .iter()
        .any(|r| r["protocol"] == "output" && r["group"] == "before"
            && r["message"].as_str().unwrap_or_default().contains("hook broke")));

    let result = result(&output);
    assert_eq!(result["status"], "success");
    assert_eq!(result["payload"], json!({"token": "abc", "partial": "yes"}));
    assert_eq!(result["requestStorage"]["env"]["TOKEN"], "abc");
}

#[test]
fn test_read_only_storage_for_validation() {
    let source = r#"
        function main() {
          return { valid: typeof requestStorage.setEnv === "undefined" && typeof Deno === "undefined" };
        }
    "#;
    let output = run_with(
        &["validation"],
        &json!({"executionId": "r1", "handler": "main", "codeBase64": code(source), "value": 1}),
    );
    let result = result(&output);
    assert_eq!(result["status"], "success");
    assert!(result.get("error").is_none());
}

#[test]
fn test_timeout_is_classified() {
    let source = "async function main() { await new Promise((resolve) => setTimeout(resolve, 60000)); }";
    let output = run_with(
        &["before"],
        &json!({"executionId": "t1", "handler": "main", "codeBase64": code(source), "timeout": 1}),
    );
    assert_eq!(output.status.code(), Some(0));
    let result = result(&output);
    assert_eq!(result["error"]["kind"], json!({"UserCodeException": "TimeoutError"}));
    assert_eq!(result["error"]["message"], "function timed out after 1 seconds");
}

#[test]
fn test_in_process_isolation_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = config_file(dir.path(), "[sandbox]\nisolation = \"in_process\"\n");

    let source = "while (true) {}\nfunction main() {}";
    let output = run_with(
        &["--config", path.to_str().unwrap(), "before"],
        &json!({"executionId": "i1", "handler": "main", "codeBase64": code(source), "timeout": 1}),
    );
    assert_eq!(output.status.code(), Some(0));
    let result = result(&output);
    assert_eq!(result["error"]["kind"], json!({"UserCodeException": "TimeoutError"}));
}

const KINDS: [&str; 7] = [
    "actionRun",
    "before",
    "confirmation",
    "management",
    "resolverFunction",
    "schemaVariantDefinition",
    "validation",
];

#[test]
fn test_runtime_internals_are_unreachable_for_every_kind() {
    let source = r#"
        function main() {
          for (const name of ["__bootstrap", "Deno", "eval"]) {
            if (typeof globalThis[name] !== "undefined") throw new Error(`leaked ${name}`);
          }
          if ((() => {}).constructor !== undefined) throw new Error("leaked Function");
          return undefined;
        }
    "#;
    for kind in KINDS {
        let output = run_with(
            &[kind],
            &json!({
                "executionId": kind,
                "handler": "main",
                "codeBase64": code(source),
                "responseType": "json",
                "component": {"data": {"properties": {}}}
            }),
        );
        assert_eq!(output.status.code(), Some(0), "{kind}");
        let result = result(&output);
        assert_eq!(result["executionId"], kind);
        assert!(!result.to_string().contains("leaked"), "{kind}: {result}");
    }
}

#[test]
fn test_global_mutations_do_not_survive_the_invocation() {
    let dir = tempfile::tempdir().unwrap();
    let in_process = config_file(dir.path(), "[sandbox]\nisolation = \"in_process\"\n");
    let in_process = in_process.to_str().unwrap();

    let hook = r#"function hook() { globalThis.shared = "from hook"; Array.prototype.tainted = true; }"#;
    let writer = r#"
        function main() {
          const seen = [typeof globalThis.shared, typeof [].tainted];
          globalThis.shared = "from first request";
          Object.prototype.tainted = true;
          return { status: "ok", payload: seen };
        }
    "#;
    let reader = r#"
        function main() {
          return { status: "ok", payload: [typeof globalThis.shared, typeof ({}).tainted] };
        }
    "#;

    for args in [vec!["actionRun"], vec!["--config", in_process, "actionRun"]] {
        let output = run_with(
            &args,
            &json!({
                "executionId": "g1",
                "handler": "main",
                "codeBase64": code(writer),
                "args": {},
                "before": [{"handler": "hook", "codeBase64": code(hook), "arg": {}}]
            }),
        );
        let first = result(&output);
        assert_eq!(first["status"], "success", "{args:?}: {first}");
        assert_eq!(first["payload"], json!(["undefined", "undefined"]), "{args:?}");

        let output = run_with(
            &args,
            &json!({"executionId": "g2", "handler": "main", "codeBase64": code(reader), "args": {}}),
        );
        let second = result(&output);
        assert_eq!(second["payload"], json!(["undefined", "undefined"]), "{args:?}");
    }
}

#[test]
fn test_output_past_the_cap_keeps_the_result_in_child_mode() {
    let dir = tempfile::tempdir().unwrap();
    let path = config_file(dir.path(), "[limits]\nmax_output_bytes = 8192\n");

    let source = r#"
        function main() {
          for (let i = 0; i < 5000; i++) console.log(`line ${i}`);
          return { status: "ok", payload: { done: true } };
        }
    "#;
    let output = run_with(
        &["--config", path.to_str().unwrap(), "actionRun"],
        &json!({"executionId": "o1", "handler": "main", "codeBase64": code(source), "args": {}}),
    );
    assert_eq!(output.status.code(), Some(0));
    let records = records(&output);
    assert!(records.len() < 5000);
    assert!(records
        .iter()
        .any(|r| r["message"].as_str().unwrap_or_default().contains("output exceeded 8192 bytes")));

    let result = result(&output);
    assert_eq!(result["status"], "success", "{result}");
    assert_eq!(result["payload"], json!({"done": true}));
}

/// Live `--isolate` children whose environment carries `FUNC_SANDBOX_LOG=<tag>`.
#[cfg(target_os = "linux")]
fn isolates_tagged(tag: &str) -> Vec<u32> {
    let needle = format!("FUNC_SANDBOX_LOG={tag}");
    let mut pids = Vec::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return pids;
    };
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|name| name.parse::<u32>().ok()) else {
            continue;
        };
        let (Ok(environ), Ok(cmdline)) = (
            std::fs::read(entry.path().join("environ")),
            std::fs::read(entry.path().join("cmdline")),
        ) else {
            continue;
        };
        let tagged = environ.split(|b| *b == 0).any(|var| var == needle.as_bytes());
        let isolate = cmdline.split(|b| *b == 0).any(|arg| arg == b"--isolate");
        if tagged && isolate {
            pids.push(pid);
        }
    }
    pids
}

#[cfg(target_os = "linux")]
#[test]
fn test_timeout_terminates_the_isolate_process() {
    let tag = format!("timeout-{}", std::process::id());
    let source = "async function main() { await new Promise((resolve) => setTimeout(resolve, 60000)); }";
    let child = spawn_with(
        &["before"],
        &[("FUNC_SANDBOX_LOG", tag.as_str())],
        &json!({"executionId": "t2", "handler": "main", "codeBase64": code(source), "timeout": 2}),
    );

    let started = Instant::now();
    let mut seen = Vec::new();
    while seen.is_empty() && started.elapsed() < Duration::from_secs(2) {
        seen = isolates_tagged(&tag);
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(!seen.is_empty(), "isolate process never observed");

    let output = child.wait_with_output().unwrap();
    let result = result(&output);
    assert_eq!(result["error"]["kind"], json!({"UserCodeException": "TimeoutError"}));
    assert_eq!(result["error"]["message"], "function timed out after 2 seconds");

    assert!(isolates_tagged(&tag).is_empty());
    for pid in seen {
        assert!(!Path::new(&format!("/proc/{pid}")).exists(), "isolate {pid} still present");
    }
}
