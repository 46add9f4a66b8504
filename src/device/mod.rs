pub mod access;
pub mod commands;
pub mod driver;
pub mod manager;
pub mod mock;
pub mod models;
pub mod status;

pub use access::{AccessSerializer, DeviceGuard};
pub use driver::{DeviceHandle, SpdcDriver};
pub use manager::{ConnectionSummary, DeviceManager};
pub use models::*;

use crate::serial::SerialError;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// The device did not answer in time. Recoverable.
    #[error("Device did not respond in time")]
    Timeout,

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Unexpected device reply: {0}")]
    Protocol(String),

    #[error("{what} can only take values between [{low}, {high}] {unit}, got {value}")]
    OutOfRange {
        what: &'static str,
        value: f64,
        low: f64,
        high: f64,
        unit: &'static str,
    },

    #[error("Laser is already switched on; change the current setpoint instead")]
    LaserAlreadyOn,

    #[error("Device busy: access not granted within {0:?}")]
    Busy(std::time::Duration),

    #[error("Device not connected")]
    NotConnected,

    #[error("Device already connected")]
    AlreadyConnected,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl DeviceError {
    /// Only a missed reply is worth retrying; everything else ends the session.
    pub fn is_transient(&self) -> bool {
        matches!(self, DeviceError::Timeout)
    }
}

impl From<SerialError> for DeviceError {
    fn from(e: SerialError) -> Self {
        match e {
            SerialError::Timeout => DeviceError::Timeout,
            SerialError::ProtocolError(msg) => DeviceError::Protocol(msg),
            SerialError::PortNotFound(port) => DeviceError::ConnectionLost(format!("port {} not found", port)),
            SerialError::ConnectionFailed(msg) => DeviceError::ConnectionLost(msg),
            SerialError::IoError(e) => DeviceError::ConnectionLost(e.to_string()),
            SerialError::SerialportError(e) => DeviceError::ConnectionLost(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DeviceError>;
