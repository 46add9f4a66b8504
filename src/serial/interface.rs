use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, SerialPort};
use tokio::time::sleep;

use super::{Result, SerialError};

/// Time given to the OS buffers to fill before they are checked again.
pub const BUFFER_WAIT: Duration = Duration::from_millis(10);
pub const DEFAULT_BAUD_RATE: u32 = 9600;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

/// Byte-level access to an open port.
///
/// Implemented for the ports handed out by `serialport` and for in-memory
/// ports in tests.
pub trait SerialPortIO: Send {
    fn write_bytes(&mut self, data: &[u8]) -> std::io::Result<()>;
    fn bytes_to_read(&self) -> Result<u32>;
    fn read_bytes(&mut self, buffer: &mut [u8]) -> std::io::Result<usize>;
    fn clear_input(&mut self) -> Result<()>;
}

impl SerialPortIO for Box<dyn SerialPort> {
    fn write_bytes(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.write_all(data)?;
        self.flush()
    }

    fn bytes_to_read(&self) -> Result<u32> {
        Ok(SerialPort::bytes_to_read(self.as_ref())?)
    }

    fn read_bytes(&mut self, buffer: &mut [u8]) -> std::io::Result<usize> {
        self.read(buffer)
    }

    fn clear_input(&mut self) -> Result<()> {
        Ok(self.clear(ClearBuffer::All)?)
    }
}

/// Line-oriented command interface to an SPDC driver board.
///
/// Commands are terminated with `;` and replies are single `\r\n`
/// terminated lines, except for `HELP` which spans several lines.
pub struct SerialInterface {
    port: Option<Box<dyn SerialPortIO>>,
    port_name: Option<String>,
    timeout: Duration,
}

impl SerialInterface {
    pub fn new(timeout: Duration) -> Self {
        Self {
            port: None,
            port_name: None,
            timeout,
        }
    }

    /// Wrap an already open port.
    pub fn from_io(io: Box<dyn SerialPortIO>, timeout: Duration) -> Self {
        Self {
            port: Some(io),
            port_name: None,
            timeout,
        }
    }

    /// Open `port_name` and drain anything left over in its buffers.
    pub async fn connect(&mut self, port_name: &str, baud_rate: u32) -> Result<()> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(self.timeout)
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => SerialError::PortNotFound(port_name.to_string()),
                _ => SerialError::ConnectionFailed(e.to_string()),
            })?;

        self.port = Some(Box::new(port));
        self.port_name = Some(port_name.to_string());
        self.cleanup().await?;

        log::info!("Opened serial port {} at {} baud", port_name, baud_rate);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if let Some(name) = &self.port_name {
            log::info!("Closing serial port {}", name);
        }
        self.port = None;
        self.port_name = None;
    }

    pub fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    pub fn port_name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPortIO>> {
        self.port
            .as_mut()
            .ok_or_else(|| SerialError::ConnectionFailed("Not connected".to_string()))
    }

    /// Discard pending input until the port stays quiet or the timeout passes.
    pub async fn cleanup(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        loop {
            sleep(BUFFER_WAIT).await;
            let port = self.port_mut()?;
            if port.bytes_to_read()? == 0 {
                break;
            }
            port.clear_input()?;
            if Instant::now() > deadline {
                break;
            }
        }
        Ok(())
    }

    /// Send a command without waiting for a reply.
    pub async fn writeline(&mut self, command: &str) -> Result<()> {
        let framed = format!("{};", command);
        self.port_mut()?
            .write_bytes(framed.as_bytes())
            .map_err(map_io_error)
    }

    /// Send a command and read back a single line.
    ///
    /// `timeout` overrides the interface timeout for slow commands such as `SAVE`.
    pub async fn getresponse(&mut self, command: &str, timeout: Option<Duration>) -> Result<String> {
        self.cleanup().await?;
        self.writeline(command).await?;

        let deadline = Instant::now() + timeout.unwrap_or(self.timeout);
        let mut reply: Vec<u8> = Vec::new();
        loop {
            self.read_pending(&mut reply)?;
            if let Some(pos) = reply.iter().position(|b| *b == b'\n') {
                reply.truncate(pos + 1);
                return Ok(decode_line(&reply));
            }
            if Instant::now() > deadline {
                log::debug!("No reply to '{}' within {:?} ({} bytes pending)", command, timeout.unwrap_or(self.timeout), reply.len());
                return Err(SerialError::Timeout);
            }
            sleep(BUFFER_WAIT).await;
        }
    }

    /// Send a command and collect every line that arrives within the timeout.
    pub async fn getresponses(&mut self, command: &str, timeout: Option<Duration>) -> Result<Vec<String>> {
        self.cleanup().await?;
        self.writeline(command).await?;

        let deadline = Instant::now() + timeout.unwrap_or(self.timeout);
        let mut replies: Vec<u8> = Vec::new();
        while Instant::now() <= deadline {
            self.read_pending(&mut replies)?;
            sleep(BUFFER_WAIT).await;
        }

        if replies.is_empty() {
            return Err(SerialError::Timeout);
        }
        Ok(String::from_utf8_lossy(&replies)
            .split('\n')
            .map(|line| line.trim_matches(|c| c == '\r' || c == '\n'))
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn read_pending(&mut self, into: &mut Vec<u8>) -> Result<()> {
        let port = self.port_mut()?;
        let waiting = port.bytes_to_read()? as usize;
        if waiting == 0 {
            return Ok(());
        }
        let mut buffer = vec![0u8; waiting];
        let read = port.read_bytes(&mut buffer).map_err(map_io_error)?;
        into.extend_from_slice(&buffer[..read]);
        Ok(())
    }
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_matches(|c| c == '\r' || c == '\n')
        .to_string()
}

fn map_io_error(e: std::io::Error) -> SerialError {
    match e.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => SerialError::Timeout,
        _ => SerialError::IoError(e),
    }
}

impl Default for SerialInterface {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}


#[cfg(test)]
mod tests {
    use super::test_port::ScriptedPort;
    use super::*;

    fn interface(port: &ScriptedPort) -> SerialInterface {
        SerialInterface::from_io(Box::new(port.clone()), Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_getresponse_strips_line_ending() {
        let port = ScriptedPort::new();
        port.reply("PTEMP?", "24.512");
        let mut iface = interface(&port);

        let reply = iface.getresponse("PTEMP?", None).await.unwrap();
        assert_eq!(reply, "24.512");
        assert_eq!(port.written(), vec!["PTEMP?".to_string()]);
    }

    #[tokio::test]
    async fn test_getresponse_discards_stale_input() {
        let port = ScriptedPort::new();
        port.reply("*IDN?", "SPDC driver, svn-05");
        port.inject(b"garbage from a previous command\r\n");
        let mut iface = interface(&port);

        let reply = iface.getresponse("*IDN?", None).await.unwrap();
        assert_eq!(reply, "SPDC driver, svn-05");
    }

    #[tokio::test]
    async fn test_getresponse_times_out_without_reply() {
        let port = ScriptedPort::new();
        let mut iface = interface(&port);

        let result = iface.getresponse("STATUS?", None).await;
        assert!(matches!(result, Err(SerialError::Timeout)));
    }

    #[tokio::test]
    async fn test_writeline_frames_with_semicolon() {
        let port = ScriptedPort::new();
        let mut iface = interface(&port);

        iface.writeline("PLOOP 1").await.unwrap();
        iface.writeline("POWER 3").await.unwrap();
        assert_eq!(port.written(), vec!["PLOOP 1".to_string(), "POWER 3".to_string()]);
    }

    #[tokio::test]
    async fn test_getresponses_collects_all_lines() {
        let port = ScriptedPort::new();
        port.reply("HELP", "PLOOP <0|1>\nHLOOP <0|1>");
        let mut iface = interface(&port);

        let lines = iface.getresponses("HELP", None).await.unwrap();
        assert_eq!(lines, vec!["PLOOP <0|1>", "HLOOP <0|1>"]);
    }

    #[tokio::test]
    async fn test_disconnected_interface_reports_connection_failure() {
        let mut iface = SerialInterface::default();
        let result = iface.writeline("ON").await;
        assert!(matches!(result, Err(SerialError::ConnectionFailed(_))));
    }
}
