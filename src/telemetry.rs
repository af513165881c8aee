use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::alert::AlertLevel;

/// One row per classified tick, in the dashboard's (id, time, inference) schema.
#[derive(Debug, Clone, Serialize)]
pub struct TickRecord {
    pub id: u64,
    pub session: String,
    pub device: String,
    pub timestamp: DateTime<Utc>,
    pub label: String,
    pub confidence: f32,
    pub level: AlertLevel,
    pub dispatched: Option<AlertLevel>,
    pub stale: bool,
    pub latency_ms: f32,
}

pub trait TelemetrySink {
    fn record(&mut self, record: &TickRecord);
}

/// Records as JSON on the `telemetry` log target.
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn record(&mut self, record: &TickRecord) {
        match serde_json::to_string(record) {
            Ok(line) => log::info!(target: "telemetry", "{}", line),
            Err(err) => log::warn!("Failed to serialise tick {}: {}", record.id, err),
        }
    }
}

/// One JSON object per line.
pub struct JsonLinesSink<W: Write> {
    writer: W,
}

impl JsonLinesSink<BufWriter<File>> {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open telemetry file {}", path.display()))?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> TelemetrySink for JsonLinesSink<W> {
    fn record(&mut self, record: &TickRecord) {
        let result = serde_json::to_writer(&mut self.writer, record)
            .map_err(std::io::Error::from)
            .and_then(|()| self.writer.write_all(b"\n"))
            .and_then(|()| self.writer.flush());
        if let Err(err) = result {
            log::warn!("Telemetry write failed: {}", err);
        }
    }
}

impl TelemetrySink for Vec<TickRecord> {
    fn record(&mut self, record: &TickRecord) {
        self.push(record.clone());
    }
}
