//! Durable log sink.
//!
//! Every drained record is re-emitted as a `tracing` event and, when a log
//! file is configured, appended to it as one text line.

use crate::error::DaemonResult;
use rtx_common::config::LogLevel;
use rtx_shared_memory::LogRecord;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, error, info, trace, warn};

/// Destination of drained records.
pub struct LogSink {
    file: Option<BufWriter<File>>,
    written: u64,
}

/// Text line written to the log file for `record`.
pub fn format_line(record: &LogRecord) -> String {
    format!(
        "{} {} [{}] {}: {}",
        record.timestamp_us,
        record.topic(),
        record.pid,
        record.level,
        record.text
    )
}

impl LogSink {
    /// Sink appending to `path`, or tracing only.
    pub fn open(path: Option<&Path>) -> DaemonResult<Self> {
        let file = match path {
            Some(path) => {
                let f = OpenOptions::new().create(true).append(true).open(path)?;
                info!("Appending messages to {}", path.display());
                Some(BufWriter::new(f))
            }
            None => None,
        };
        Ok(Self { file, written: 0 })
    }

    /// Records written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Emit one record.
    pub fn write(&mut self, record: &LogRecord) -> DaemonResult<()> {
        let topic = record.topic();
        match record.level {
            LogLevel::Error => error!(target: "rtx_msgd::msg", topic = %topic, pid = record.pid, "{}", record.text),
            LogLevel::Warn => warn!(target: "rtx_msgd::msg", topic = %topic, pid = record.pid, "{}", record.text),
            LogLevel::Info => info!(target: "rtx_msgd::msg", topic = %topic, pid = record.pid, "{}", record.text),
            LogLevel::Debug => debug!(target: "rtx_msgd::msg", topic = %topic, pid = record.pid, "{}", record.text),
            LogLevel::Trace | LogLevel::Off => trace!(target: "rtx_msgd::msg", topic = %topic, pid = record.pid, "{}", record.text),
        }
        if let Some(file) = &mut self.file {
            writeln!(file, "{}", format_line(record))?;
        }
        self.written += 1;
        Ok(())
    }

    /// Push buffered lines to the file.
    pub fn flush(&mut self) -> DaemonResult<()> {
        if let Some(file) = &mut self.file {
            file.flush()?;
        }
        Ok(())
    }
}

impl Drop for LogSink {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
