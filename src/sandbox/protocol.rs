//! Line framing between an isolate and its host.
//!
//! An isolate writes newline-delimited text. Two sentinel-prefixed lines carry
//! payloads: the request storage snapshot and, strictly after it, the encoded
//! outcome. Everything else is diagnostics: structured `output` records or
//! raw text, which is forwarded as stdout at info level.

use serde::Deserialize;

use crate::function::{LogLevel, Outcome, OutputLine, OutputStream, RequestStorage};

pub const STATE_MARKER: &str = "__FUNC_SANDBOX_STATE__:";
pub const RESULT_MARKER: &str = "__FUNC_SANDBOX_RESULT__:";

/// True when `text` could be mistaken for a payload line.
pub fn contains_marker(text: &str) -> bool {
    text.contains(STATE_MARKER) || text.contains(RESULT_MARKER)
}

/// One unit of isolate output.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Output(OutputLine),
    /// Serialized [`RequestStorage`].
    State(String),
    /// Serialized [`Outcome`].
    Result(String),
}

#[derive(Deserialize)]
#[serde(tag = "protocol", rename_all = "camelCase")]
enum GuestLine {
    Output(OutputLine),
}

impl Frame {
    /// Encodes the frame as a single line without the trailing newline.
    pub fn encode(&self) -> String {
        match self {
            Frame::Output(line) => {
                serde_json::to_string(&crate::function::Message::Output(line)).unwrap_or_default()
            }
            Frame::State(payload) => format!("{STATE_MARKER}{}", single_line(payload)),
            Frame::Result(payload) => format!("{RESULT_MARKER}{}", single_line(payload)),
        }
    }

    /// Decodes one line of isolate output. Returns `None` for blank lines
    /// and for raw text that embeds a marker somewhere other than the start.
    pub fn decode_line(line: &str, execution_id: &str) -> Option<Frame> {
        let line = line.trim_end_matches(['\r', '\n']);
        if let Some(payload) = line.strip_prefix(STATE_MARKER) {
            return Some(Frame::State(payload.to_string()));
        }
        if let Some(payload) = line.strip_prefix(RESULT_MARKER) {
            return Some(Frame::Result(payload.to_string()));
        }
        if line.trim().is_empty() || contains_marker(line) {
            return None;
        }
        if let Ok(GuestLine::Output(mut output)) = serde_json::from_str::<GuestLine>(line) {
            output.execution_id = execution_id.to_string();
            return Some(Frame::Output(output));
        }
        Some(Frame::Output(OutputLine::new(
            execution_id,
            OutputStream::Stdout,
            LogLevel::Info,
            line,
        )))
    }
}

fn single_line(payload: &str) -> String {
    // JSON never needs a raw newline; strip any that slipped in.
    payload.replace(['\n', '\r'], "")
}

/// What an invocation produced once its output is fully drained.
#[derive(Debug, Clone, PartialEq)]
pub struct Collected {
    pub storage: Option<RequestStorage>,
    pub outcome: Option<Outcome>,
}

/// Demultiplexes frames, enforcing that each payload appears at most once and
/// that the state snapshot never follows the result.
#[derive(Debug, Default)]
pub struct FrameCollector {
    state: Option<String>,
    result: Option<String>,
    violation: Option<String>,
}

impl FrameCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records payload frames and hands diagnostics back for forwarding.
    pub fn accept(&mut self, frame: Frame) -> Option<OutputLine> {
        match frame {
            Frame::Output(line) => return Some(line),
            Frame::State(payload) => {
                if self.result.is_some() {
                    self.violate("state snapshot received after the result");
                } else if self.state.is_some() {
                    self.violate("duplicate state snapshot");
                } else {
                    self.state = Some(payload);
                }
            }
            Frame::Result(payload) => {
                if self.result.is_some() {
                    self.violate("duplicate result payload");
                } else {
                    self.result = Some(payload);
                }
            }
        }
        None
    }

    fn violate(&mut self, message: &str) {
        if self.violation.is_none() {
            self.violation = Some(message.to_string());
        }
    }

    /// Decodes the payloads. An `Err` is a transport error: a sequencing
    /// violation or an undecodable payload.
    pub fn finish(self) -> Result<Collected, String> {
        if let Some(violation) = self.violation {
            return Err(violation);
        }
        let storage = self
            .state
            .map(|payload| serde_json::from_str::<RequestStorage>(&payload))
            .transpose()
            .map_err(|e| format!("failed to decode state snapshot: {e}"))?;
        let outcome = self
            .result
            .map(|payload| serde_json::from_str::<Outcome>(&payload))
            .transpose()
            .map_err(|e| format!("failed to decode result payload: {e}"))?;
        Ok(Collected { storage, outcome })
    }
}
