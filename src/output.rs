//! NDJSON writer for standard output.
//!
//! Every record is one line tagged with `protocol`. Output lines stream as
//! they arrive; the result record is written last and only once.

use std::io::Write;

use tracing::warn;

use crate::function::{Message, OutputLine, ResultRecord};

/// Receives diagnostics while a request runs.
pub trait OutputSink {
    fn emit(&mut self, line: OutputLine);
}

impl OutputSink for Vec<OutputLine> {
    fn emit(&mut self, line: OutputLine) {
        self.push(line);
    }
}

pub struct Emitter<W: Write> {
    writer: W,
    finished: bool,
}

impl<W: Write> Emitter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            finished: false,
        }
    }

    fn write(&mut self, message: &Message<'_>) -> std::io::Result<()> {
        serde_json::to_writer(&mut self.writer, message)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }

    /// Writes the terminal record. Later calls are ignored.
    pub fn finish(&mut self, record: &ResultRecord) -> std::io::Result<()> {
        if self.finished {
            warn!("result already written; dropping a second result record");
            return Ok(());
        }
        self.finished = true;
        self.write(&Message::Result(record))
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> OutputSink for Emitter<W> {
    fn emit(&mut self, line: OutputLine) {
        if self.finished {
            warn!("dropping output received after the result");
            return;
        }
        if let Err(e) = self.write(&Message::Output(&line)) {
            warn!("failed to write output line: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::{FunctionResult, LogLevel, OutputStream, RequestStorage, SuccessData};
    use serde_json::Value;

    fn lines(bytes: Vec<u8>) -> Vec<Value> {
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_output_then_result() {
        let mut emitter = Emitter::new(Vec::new());
        emitter.emit(OutputLine::new("1", OutputStream::Stdout, LogLevel::Info, "hello"));
        let record = ResultRecord {
            result: FunctionResult::success("1", SuccessData::Before, None),
            request_storage: RequestStorage::default(),
        };
        emitter.finish(&record).unwrap();

        let records = lines(emitter.into_inner());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["protocol"], "output");
        assert_eq!(records[0]["message"], "hello");
        assert_eq!(records[1]["protocol"], "result");
        assert_eq!(records[1]["status"], "success");
    }

    #[test]
    fn test_result_is_written_once_and_last() {
        let mut emitter = Emitter::new(Vec::new());
        let record = ResultRecord {
            result: FunctionResult::success("1", SuccessData::Validation, None),
            request_storage: RequestStorage::default(),
        };
        emitter.finish(&record).unwrap();
        emitter.finish(&record).unwrap();
        emitter.emit(OutputLine::new("1", OutputStream::Stderr, LogLevel::Warn, "late"));

        let records = lines(emitter.into_inner());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["protocol"], "result");
    }
}
