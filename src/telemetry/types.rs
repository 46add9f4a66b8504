use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::{DeviceError, DeviceMode, TelemetrySnapshot};

/// One poll cycle as delivered to the consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub session_id: Uuid,
    pub session_started: DateTime<Utc>,
    pub now: DateTime<Utc>,
    /// Monotonic time since the poll session started.
    pub elapsed: Duration,
    /// 1-based cycle counter.
    pub cycle: u64,
    pub snapshot: TelemetrySnapshot,
    pub mode: DeviceMode,
    /// The read timed out and `snapshot` repeats the previous cycle.
    pub stale: bool,
}

/// Why a session can no longer be polled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFault {
    pub message: String,
}

impl From<&DeviceError> for SessionFault {
    fn from(e: &DeviceError) -> Self {
        let message = match e {
            DeviceError::ConnectionLost(reason) => format!("connection to device lost: {}", reason),
            DeviceError::Protocol(reason) => format!("device sent an unreadable reply: {}", reason),
            other => other.to_string(),
        };
        Self { message }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PollEvent {
    Snapshot(TelemetryEvent),
    /// Last event of a session whose poll loop died on a fatal error.
    Terminated(SessionFault),
}
