pub mod interface;

pub use interface::{SerialInterface, SerialPortIO};

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Communication timeout")]
    Timeout,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;
