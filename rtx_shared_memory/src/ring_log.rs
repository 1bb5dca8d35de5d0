//! `tracing` layer writing events into the session message ring.
//!
//! Install it next to the usual formatter in every process attached to a
//! session. Events below the session verbosity of the layer's origin are
//! dropped. A failed ring write is only counted in the ring header.

use crate::error::ShmResult;
use crate::log::{LogRecord, MsgOrigin};
use crate::ring::RingBuffer;
use crate::session::Session;
use rtx_common::config::LogLevel;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Layer forwarding events to the message ring of a session.
pub struct RingLogLayer {
    session: Arc<Session>,
    origin: MsgOrigin,
    tag: String,
}

impl RingLogLayer {
    /// Layer for events of `origin`, tagged `tag` unless the event has a `tag` field.
    pub fn new(session: Arc<Session>, origin: MsgOrigin, tag: impl Into<String>) -> Self {
        Self {
            session,
            origin,
            tag: tag.into(),
        }
    }
}

impl<S: Subscriber> Layer<S> for RingLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = LogLevel::from(*event.metadata().level());
        if !self.session.msg_level(self.origin).allows(level) {
            return;
        }
        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);
        let tag = visitor.tag.take().unwrap_or_else(|| self.tag.clone());
        let record = LogRecord::new(self.origin, level, &tag, visitor.text);
        let _ = write_record(self.session.message_ring(), record);
    }
}

/// Write `record` to `ring`, shortening its text if it would not fit.
pub fn write_record(ring: &RingBuffer, mut record: LogRecord) -> ShmResult<()> {
    let mut bytes = record.encode()?;
    let max = ring.max_record();
    if bytes.len() > max {
        let excess = bytes.len() - max;
        let mut keep = record.text.len().saturating_sub(excess);
        while !record.text.is_char_boundary(keep) {
            keep -= 1;
        }
        record.text.truncate(keep);
        bytes = record.encode()?;
    }
    ring.record_writer()?.write(&bytes)
}

#[derive(Default)]
struct RecordVisitor {
    text: String,
    tag: Option<String>,
}

impl Visit for RecordVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.text.insert_str(0, value),
            "tag" => self.tag = Some(value.to_string()),
            name => {
                let _ = write!(self.text, " {name}={value}");
            }
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        match field.name() {
            "message" => self.text.insert_str(0, &format!("{value:?}")),
            "tag" => self.tag = Some(format!("{value:?}").trim_matches('"').to_string()),
            name => {
                let _ = write!(self.text, " {name}={value:?}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentManager;
    use rtx_common::config::SessionConfig;
    use rtx_common::flavor::Flavor;
    use tempfile::TempDir;
    use tracing_subscriber::layer::SubscriberExt;

    fn session(dir: &TempDir) -> Arc<Session> {
        let cfg = SessionConfig {
            shm_dir: dir.path().to_path_buf(),
            global_size: 128 * 1024,
            message_ring_size: 8 * 1024,
            ..Default::default()
        };
        Arc::new(Session::create(&SegmentManager::new(dir.path()), &cfg, Flavor::Posix).unwrap())
    }

    fn drain(session: &Session) -> Vec<LogRecord> {
        let mut reader = session.message_ring().record_reader().unwrap();
        let mut buf = Vec::new();
        let mut out = Vec::new();
        while reader.read(&mut buf).is_ok() {
            out.push(LogRecord::decode(&buf).unwrap());
        }
        out
    }

    #[test]
    fn events_reach_the_ring_filtered_by_level() {
        let dir = TempDir::new().unwrap();
        let s = session(&dir);
        let subscriber = tracing_subscriber::registry().with(RingLogLayer::new(
            s.clone(),
            MsgOrigin::User,
            "test",
        ));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(count = 3, "loaded");
            tracing::debug!("hidden");
            tracing::warn!(tag = "scale", "overrun");
        });
        let recs = drain(&s);
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].text, "loaded count=3");
        assert_eq!(recs[0].tag, "test");
        assert_eq!(recs[1].level, LogLevel::Warn);
        assert_eq!(recs[1].topic(), "user.scale");
    }

    #[test]
    fn oversized_text_is_shortened() {
        let dir = TempDir::new().unwrap();
        let s = session(&dir);
        let rec = LogRecord::new(MsgOrigin::Rt, LogLevel::Error, "big", "x".repeat(10_000));
        write_record(s.message_ring(), rec).unwrap();
        let recs = drain(&s);
        assert_eq!(recs.len(), 1);
        assert!(recs[0].text.len() < 4096);
    }
}
