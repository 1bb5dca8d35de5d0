//! Log records carried by the session message ring.

use crate::error::ShmResult;
use rtx_common::config::LogLevel;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Who emitted a message. Each origin has its own verbosity in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsgOrigin {
    /// Realtime code (thread functions, module start/stop).
    Rt,
    /// Non-realtime processes.
    User,
    /// Kernel-build flavors.
    Kernel,
}

impl MsgOrigin {
    /// Lowercase name, used as topic prefix.
    pub fn as_str(self) -> &'static str {
        match self {
            MsgOrigin::Rt => "rt",
            MsgOrigin::User => "user",
            MsgOrigin::Kernel => "kernel",
        }
    }
}

/// One log message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Emitter class.
    pub origin: MsgOrigin,
    /// Emitting process.
    pub pid: u32,
    /// Severity.
    pub level: LogLevel,
    /// Short emitter tag, e.g. the process or module name.
    pub tag: String,
    /// Message text.
    pub text: String,
    /// Microseconds since the epoch.
    pub timestamp_us: u64,
}

impl LogRecord {
    /// Record stamped with the current time and pid.
    pub fn new(origin: MsgOrigin, level: LogLevel, tag: &str, text: impl Into<String>) -> Self {
        Self {
            origin,
            pid: std::process::id(),
            level,
            tag: tag.to_string(),
            text: text.into(),
            timestamp_us: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_micros() as u64)
                .unwrap_or(0),
        }
    }

    /// Topic under which the record is republished.
    pub fn topic(&self) -> String {
        format!("{}.{}", self.origin.as_str(), self.tag)
    }

    /// Binary form written to the ring.
    pub fn encode(&self) -> ShmResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode a ring record.
    pub fn decode(bytes: &[u8]) -> ShmResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode() {
        let rec = LogRecord::new(MsgOrigin::Rt, LogLevel::Warn, "scale", "overrun");
        let back = LogRecord::decode(&rec.encode().unwrap()).unwrap();
        assert_eq!(back, rec);
        assert_eq!(back.topic(), "rt.scale");
        assert!(LogRecord::decode(&[1, 2]).is_err());
    }
}
