//! Native ops backing the guest globals.
//!
//! Every op reads the per-isolate [`OpContext`] from the op state. Ops that
//! mutate request storage or create builders check the invocation's
//! [`CapabilitySet`] first.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::str::FromStr;
use std::time::Duration;

use deno_core::error::AnyError;
use deno_core::{op2, OpState};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, warn};

use super::capabilities::CapabilitySet;
use super::protocol::{contains_marker, Frame};
use crate::builders::{new_builder, BuilderArena};
use crate::codecs::{self, json_patch};
use crate::format::{FormatDescription, Validation};
use crate::function::{LogLevel, OutputLine, OutputStream, RequestStorage, StorageAccess, StorageArea};

/// State shared by all ops of one isolate.
pub struct OpContext {
    pub execution_id: String,
    pub capabilities: CapabilitySet,
    pub arguments: Vec<Value>,
    pub storage: RequestStorage,
    pub frames: mpsc::UnboundedSender<Frame>,
    pub completion: Option<oneshot::Sender<String>>,
    pub max_output_bytes: usize,
    /// Also bounds native buffers handed back to the guest.
    pub max_heap_bytes: usize,
    output_bytes: usize,
    truncated: bool,
    timers: HashMap<u32, Rc<Notify>>,
    builders: BuilderArena,
}

impl OpContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        execution_id: impl Into<String>,
        capabilities: CapabilitySet,
        arguments: Vec<Value>,
        storage: RequestStorage,
        frames: mpsc::UnboundedSender<Frame>,
        completion: oneshot::Sender<String>,
        max_output_bytes: usize,
        max_heap_bytes: usize,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            capabilities,
            arguments,
            storage,
            frames,
            completion: Some(completion),
            max_output_bytes,
            max_heap_bytes,
            output_bytes: 0,
            truncated: false,
            timers: HashMap::new(),
            builders: BuilderArena::default(),
        }
    }

    /// Forwards one diagnostic line, dropping everything past the output cap.
    ///
    /// Lines are counted as encoded on the child's stdout, newline included,
    /// so a child that stays under the cap never trips the host's stdout
    /// budget with diagnostics alone.
    fn forward(&mut self, line: OutputLine) {
        let frame = Frame::Output(line);
        self.output_bytes = self.output_bytes.saturating_add(frame.encode().len() + 1);
        if self.output_bytes > self.max_output_bytes {
            if !self.truncated {
                self.truncated = true;
                let notice = OutputLine::new(
                    &self.execution_id,
                    OutputStream::Stderr,
                    LogLevel::Warn,
                    format!("output exceeded {} bytes; further lines dropped", self.max_output_bytes),
                );
                let _ = self.frames.send(Frame::Output(notice));
            }
            return;
        }
        let _ = self.frames.send(frame);
    }

    fn writable(&self, area: StorageArea) -> Result<(), AnyError> {
        match self.capabilities.storage_access() {
            StorageAccess::ReadWrite => Ok(()),
            StorageAccess::ReadOnly => Err(anyhow::anyhow!(
                "request storage {} is read-only for {} functions",
                area_name(area),
                self.capabilities.kind
            )),
        }
    }
}

fn area_name(area: StorageArea) -> &'static str {
    match area {
        StorageArea::Env => "env",
        StorageArea::Data => "data",
    }
}

fn context(state: &mut OpState) -> &mut OpContext {
    state.borrow_mut::<OpContext>()
}

fn area(name: &str) -> Result<StorageArea, AnyError> {
    StorageArea::from_str(name).map_err(|e| anyhow::anyhow!(e))
}

// ── Console & completion ────────────────────────────────

#[op2(fast)]
fn op_sandbox_log(
    state: &mut OpState,
    #[string] stream: &str,
    #[string] level: &str,
    #[string] group: &str,
    #[string] message: &str,
) {
    let ctx = context(state);
    if contains_marker(message) {
        debug!(execution_id = %ctx.execution_id, "suppressed guest output containing a protocol marker");
        return;
    }
    let stream = if stream == "stderr" {
        OutputStream::Stderr
    } else {
        OutputStream::Stdout
    };
    let level = LogLevel::from_str(level).unwrap_or(LogLevel::Info);
    let mut line = OutputLine::new(&ctx.execution_id, stream, level, message);
    if !group.is_empty() {
        line = line.with_group(group);
    }
    ctx.forward(line);
}

#[op2(fast)]
fn op_sandbox_complete(state: &mut OpState, #[string] encoded: String) {
    let ctx = context(state);
    match ctx.completion.take() {
        Some(sender) => {
            let _ = sender.send(encoded);
        }
        None => warn!(execution_id = %ctx.execution_id, "ignoring a second completion"),
    }
}

#[op2]
#[serde]
fn op_sandbox_arguments(state: &mut OpState) -> Vec<serde_json::Value> {
    std::mem::take(&mut context(state).arguments)
}

// ── Request storage ─────────────────────────────────────

#[op2]
#[serde]
fn op_sandbox_storage_get(
    state: &mut OpState,
    #[string] area_name: &str,
    #[string] key: &str,
) -> Result<Option<serde_json::Value>, AnyError> {
    Ok(context(state).storage.get(area(area_name)?, key))
}

#[op2]
#[serde]
fn op_sandbox_storage_keys(state: &mut OpState, #[string] area_name: &str) -> Result<Vec<String>, AnyError> {
    Ok(context(state).storage.keys(area(area_name)?))
}

#[op2]
fn op_sandbox_storage_set(
    state: &mut OpState,
    #[string] area_name: &str,
    #[string] key: String,
    #[serde] value: serde_json::Value,
) -> Result<(), AnyError> {
    let area = area(area_name)?;
    let ctx = context(state);
    ctx.writable(area)?;
    ctx.storage.set(area, key, value);
    Ok(())
}

#[op2(fast)]
fn op_sandbox_storage_delete(
    state: &mut OpState,
    #[string] area_name: &str,
    #[string] key: &str,
) -> Result<bool, AnyError> {
    let area = area(area_name)?;
    let ctx = context(state);
    ctx.writable(area)?;
    Ok(ctx.storage.delete(area, key))
}

// ── Timers ──────────────────────────────────────────────

/// Resolves `true` once `millis` elapse, `false` if cancelled first.
#[op2(async)]
async fn op_sandbox_timer_start(state: Rc<RefCell<OpState>>, id: u32, millis: f64) -> bool {
    let notify = Rc::new(Notify::new());
    context(&mut state.borrow_mut()).timers.insert(id, notify.clone());
    let delay = Duration::from_millis(millis.max(0.0) as u64);
    let fired = tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = notify.notified() => false,
    };
    context(&mut state.borrow_mut()).timers.remove(&id);
    fired
}

#[op2(fast)]
fn op_sandbox_timer_cancel(state: &mut OpState, id: u32) {
    if let Some(notify) = context(state).timers.remove(&id) {
        notify.notify_one();
    }
}

// ── Codecs ──────────────────────────────────────────────

#[op2]
#[serde]
fn op_sandbox_yaml_parse(#[string] text: &str) -> Result<serde_json::Value, AnyError> {
    Ok(codecs::yaml_parse(text)?)
}

#[op2]
#[string]
fn op_sandbox_yaml_stringify(#[serde] value: serde_json::Value) -> Result<String, AnyError> {
    Ok(codecs::yaml_stringify(&value)?)
}

#[op2]
#[serde]
fn op_sandbox_toml_parse(#[string] text: &str) -> Result<serde_json::Value, AnyError> {
    Ok(codecs::toml_parse(text)?)
}

#[op2]
#[string]
fn op_sandbox_toml_stringify(#[serde] value: serde_json::Value) -> Result<String, AnyError> {
    Ok(codecs::toml_stringify(&value)?)
}

#[op2]
#[serde]
fn op_sandbox_json_patch_apply(
    #[serde] document: serde_json::Value,
    #[serde] operations: Vec<serde_json::Value>,
) -> Result<serde_json::Value, AnyError> {
    Ok(json_patch::apply(&document, &operations)?)
}

#[op2]
#[serde]
fn op_sandbox_json_patch_compare(#[serde] from: serde_json::Value, #[serde] to: serde_json::Value) -> Vec<serde_json::Value> {
    json_patch::compare(&from, &to)
}

#[op2]
#[string]
fn op_sandbox_gzip(#[string] text: &str) -> Result<String, AnyError> {
    Ok(codecs::gzip(text)?)
}

#[op2]
#[string]
fn op_sandbox_gunzip(state: &mut OpState, #[string] encoded: &str) -> Result<String, AnyError> {
    let limit = context(state).max_heap_bytes;
    Ok(codecs::gunzip(encoded, limit)?)
}

#[op2]
#[string]
fn op_sandbox_base64_encode(#[string] text: &str) -> String {
    codecs::base64_encode(text)
}

#[op2]
#[string]
fn op_sandbox_base64_decode(#[string] encoded: &str) -> Result<String, AnyError> {
    Ok(codecs::base64_decode(encoded)?)
}

// ── Validation formats ──────────────────────────────────

#[op2]
#[serde]
fn op_sandbox_format_validate(
    #[serde] description: serde_json::Value,
    #[serde] value: serde_json::Value,
    defined: bool,
) -> Result<Validation, AnyError> {
    let description = FormatDescription::from_value(description)?;
    let value = defined.then_some(value);
    Ok(description.validate(value.as_ref())?)
}

/// Normalizes a description, rejecting malformed ones.
#[op2]
#[serde]
fn op_sandbox_format_check(#[serde] description: serde_json::Value) -> Result<FormatDescription, AnyError> {
    Ok(FormatDescription::from_value(description)?)
}

// ── Builders ────────────────────────────────────────────

fn allowed<'a>(ctx: &OpContext, name: &'a str) -> Result<&'a str, AnyError> {
    if ctx.capabilities.allows_builder(name) {
        Ok(name)
    } else {
        Err(anyhow::anyhow!(
            "{name} is not available to {} functions",
            ctx.capabilities.kind
        ))
    }
}

#[op2]
#[serde]
fn op_sandbox_builder_methods(state: &mut OpState, #[string] name: &str) -> Result<Vec<String>, AnyError> {
    let name = allowed(context(state), name)?;
    let builder = new_builder(name)?;
    Ok(builder.methods().iter().map(|m| m.to_string()).collect())
}

#[op2(fast)]
fn op_sandbox_builder_new(state: &mut OpState, #[string] name: &str) -> Result<u32, AnyError> {
    let ctx = context(state);
    let name = allowed(ctx, name)?;
    Ok(ctx.builders.create(name)?)
}

#[op2]
fn op_sandbox_builder_call(
    state: &mut OpState,
    handle: u32,
    #[string] method: &str,
    #[serde] args: Vec<serde_json::Value>,
) -> Result<(), AnyError> {
    Ok(context(state).builders.call(handle, method, &args)?)
}

#[op2]
#[serde]
fn op_sandbox_builder_build(state: &mut OpState, handle: u32) -> Result<serde_json::Value, AnyError> {
    Ok(context(state).builders.build(handle)?)
}

deno_core::extension!(
    func_sandbox,
    ops = [
        op_sandbox_log,
        op_sandbox_complete,
        op_sandbox_arguments,
        op_sandbox_storage_get,
        op_sandbox_storage_keys,
        op_sandbox_storage_set,
        op_sandbox_storage_delete,
        op_sandbox_timer_start,
        op_sandbox_timer_cancel,
        op_sandbox_yaml_parse,
        op_sandbox_yaml_stringify,
        op_sandbox_toml_parse,
        op_sandbox_toml_stringify,
        op_sandbox_json_patch_apply,
        op_sandbox_json_patch_compare,
        op_sandbox_gzip,
        op_sandbox_gunzip,
        op_sandbox_base64_encode,
        op_sandbox_base64_decode,
        op_sandbox_format_validate,
        op_sandbox_format_check,
        op_sandbox_builder_methods,
        op_sandbox_builder_new,
        op_sandbox_builder_call,
        op_sandbox_builder_build,
    ],
);
