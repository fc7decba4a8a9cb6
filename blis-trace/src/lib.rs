//! Optional decision trace (§4.8): an append-only, deterministic log of
//! routing decisions. Grounded on the ancestor kernel's
//! `Receipt`/`ReceiptLog` append-only JSONL log, minus the hash-chain —
//! tamper evidence isn't a requirement here, only that replaying the
//! same seed twice produces byte-identical trace output.

use std::io::{self, Write};

use blis_types::TraceRecord;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("failed to serialize trace record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write trace record: {0}")]
    Write(#[from] io::Error),
}

/// Where completed `TraceRecord`s go. Kept separate from [`DecisionTrace`]
/// so the trace can be buffered in memory for tests or streamed to a
/// file/stdout sink for real scenario runs, without changing the
/// recording call sites.
pub trait TraceSink {
    fn write(&mut self, record: &TraceRecord) -> Result<(), TraceError>;
}

/// Collects records in memory, in recording order. The default for
/// tests and for any run that wants to inspect the trace in-process
/// rather than round-tripping it through a file.
#[derive(Default)]
pub struct InMemorySink {
    records: Vec<TraceRecord>,
}

impl InMemorySink {
    pub fn records(&self) -> &[TraceRecord] {
        &self.records
    }
}

impl TraceSink for InMemorySink {
    fn write(&mut self, record: &TraceRecord) -> Result<(), TraceError> {
        self.records.push(record.clone());
        Ok(())
    }
}

/// Appends one JSON object per line to any `io::Write`, newline-
/// delimited — the same on-disk shape as the ancestor's receipt log.
pub struct JsonlSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonlSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write> TraceSink for JsonlSink<W> {
    fn write(&mut self, record: &TraceRecord) -> Result<(), TraceError> {
        let line = serde_json::to_string(record)?;
        writeln!(self.writer, "{line}")?;
        Ok(())
    }
}

/// Gate in front of a [`TraceSink`]: when disabled, `record` is a
/// no-op, so call sites don't need to branch on whether tracing is on.
pub struct DecisionTrace<S: TraceSink> {
    enabled: bool,
    sink: S,
    count: u64,
}

impl<S: TraceSink> DecisionTrace<S> {
    pub fn new(enabled: bool, sink: S) -> Self {
        Self { enabled, sink, count: 0 }
    }

    pub fn record(&mut self, record: TraceRecord) -> Result<(), TraceError> {
        if !self.enabled {
            return Ok(());
        }
        self.sink.write(&record)?;
        self.count += 1;
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}
