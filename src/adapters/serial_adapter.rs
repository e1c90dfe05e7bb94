//! RS-232 link to the piezo controller.

use crate::adapters::CommandLink;
use crate::config::SerialConfig;
use crate::error::{ScanError, ScanResult};
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_serial")]
use tracing::debug;

#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;
#[cfg(feature = "instrument_serial")]
use std::sync::Arc;
#[cfg(feature = "instrument_serial")]
use tokio::sync::Mutex;

/// Serial adapter for the RS-232 link to the piezo controller
///
/// This adapter wraps the serialport crate and provides async I/O
/// using Tokio's blocking task executor for synchronous serial operations.
/// The controller expects XON/XOFF software flow control.
pub struct SerialAdapter {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,

    /// Baud rate (the controller default is 9600)
    baud_rate: u32,

    /// Reply timeout
    timeout: Duration,

    /// Record terminator appended to every command
    line_terminator: String,

    /// Reply terminator byte
    response_delimiter: u8,

    /// XON/XOFF flow control
    software_flow_control: bool,

    /// The actual serial port (behind Arc<Mutex> for blocking-task access)
    #[cfg(feature = "instrument_serial")]
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

const DEFAULT_SERIAL_TIMEOUT_MS: u64 = 1000;

/// Short internal read timeout; the reply timeout is enforced on top of it.
#[cfg(feature = "instrument_serial")]
const PORT_POLL_TIMEOUT: Duration = Duration::from_millis(50);

impl SerialAdapter {
    /// Create a new serial adapter with default settings
    ///
    /// # Arguments
    /// * `port_name` - Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    /// * `baud_rate` - Communication speed (e.g., 9600)
    pub fn new(port_name: String, baud_rate: u32) -> Self {
        Self {
            port_name,
            baud_rate,
            timeout: Duration::from_millis(DEFAULT_SERIAL_TIMEOUT_MS),
            line_terminator: "\n".to_string(),
            response_delimiter: b'\n',
            software_flow_control: true,
            #[cfg(feature = "instrument_serial")]
            port: None,
        }
    }

    /// Build an adapter from the `[serial]` configuration section
    pub fn from_config(config: &SerialConfig) -> Self {
        Self::new(config.port.clone(), config.baud_rate)
            .with_timeout(Duration::from_millis(config.timeout_ms))
            .with_line_terminator(config.line_terminator.clone())
            .with_software_flow_control(config.software_flow_control)
    }

    /// Set reply timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set line terminator for commands
    pub fn with_line_terminator(mut self, terminator: String) -> Self {
        self.line_terminator = terminator;
        self
    }

    /// Set response delimiter byte
    pub fn with_response_delimiter(mut self, delimiter: u8) -> Self {
        self.response_delimiter = delimiter;
        self
    }

    /// Enable or disable XON/XOFF flow control
    pub fn with_software_flow_control(mut self, enabled: bool) -> Self {
        self.software_flow_control = enabled;
        self
    }

    /// Port path as configured
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Configured baud rate
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Reply timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Terminator appended to every command
    pub fn line_terminator(&self) -> &str {
        &self.line_terminator
    }

    /// Byte that ends a reply
    pub fn response_delimiter(&self) -> u8 {
        self.response_delimiter
    }

    /// Whether XON/XOFF flow control is requested
    pub fn software_flow_control(&self) -> bool {
        self.software_flow_control
    }

    /// Open the serial port
    #[cfg(feature = "instrument_serial")]
    pub async fn connect(&mut self) -> ScanResult<()> {
        let port_name = self.port_name.clone();
        let baud_rate = self.baud_rate;
        let flow_control = if self.software_flow_control {
            serialport::FlowControl::Software
        } else {
            serialport::FlowControl::None
        };

        let port = tokio::task::spawn_blocking(move || {
            serialport::new(&port_name, baud_rate)
                .timeout(PORT_POLL_TIMEOUT)
                .flow_control(flow_control)
                .open()
                .map_err(|e| {
                    ScanError::Link(format!(
                        "Failed to open serial port '{}' at {} baud: {}",
                        port_name, baud_rate, e
                    ))
                })
        })
        .await
        .map_err(|e| ScanError::Link(format!("Serial open task panicked: {}", e)))??;

        self.port = Some(Arc::new(Mutex::new(port)));
        debug!(port = %self.port_name, baud = self.baud_rate, "Serial port opened");
        Ok(())
    }

    /// Always fails: serial support is compiled out
    #[cfg(not(feature = "instrument_serial"))]
    pub async fn connect(&mut self) -> ScanResult<()> {
        Err(ScanError::SerialFeatureDisabled)
    }

    /// Close the serial port
    pub async fn disconnect(&mut self) -> ScanResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            if self.port.take().is_some() {
                debug!(port = %self.port_name, "Serial port closed");
            }
        }
        Ok(())
    }

    /// Check if connected to serial port
    pub fn is_connected(&self) -> bool {
        #[cfg(feature = "instrument_serial")]
        {
            self.port.is_some()
        }
        #[cfg(not(feature = "instrument_serial"))]
        {
            false
        }
    }

    #[cfg(feature = "instrument_serial")]
    fn port(&self) -> ScanResult<Arc<Mutex<Box<dyn SerialPort>>>> {
        self.port
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| ScanError::Link("Serial port not connected".to_string()))
    }
}

#[async_trait]
impl CommandLink for SerialAdapter {
    async fn send(&mut self, command: &str) -> ScanResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.port()?;
            let frame = format!("{}{}", command, self.line_terminator);

            // Execute blocking serial I/O on dedicated thread
            tokio::task::spawn_blocking(move || -> ScanResult<()> {
                use std::io::Write;

                let mut port = port.blocking_lock();
                port.write_all(frame.as_bytes())?;
                port.flush()?;
                Ok(())
            })
            .await
            .map_err(|e| ScanError::Link(format!("Serial I/O task panicked: {}", e)))??;

            debug!(command, "Sent serial command");
            Ok(())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = command;
            Err(ScanError::SerialFeatureDisabled)
        }
    }

    async fn receive_line(&mut self) -> ScanResult<Vec<u8>> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.port()?;
            let delimiter = self.response_delimiter;
            let timeout = self.timeout;

            let reply = tokio::task::spawn_blocking(move || -> ScanResult<Vec<u8>> {
                use std::io::Read;

                let mut port = port.blocking_lock();
                let mut reply = Vec::new();
                let mut byte = [0u8; 1];
                let start = std::time::Instant::now();

                loop {
                    if start.elapsed() > timeout {
                        // Partial data is handed back as-is; parsing decides.
                        debug!(?timeout, partial = reply.len(), "Serial read timed out");
                        return Ok(reply);
                    }

                    match port.read(&mut byte) {
                        Ok(0) => {
                            return Err(ScanError::Link("Unexpected EOF from serial port".into()))
                        }
                        Ok(_) if byte[0] == delimiter => return Ok(reply),
                        Ok(_) => reply.push(byte[0]),
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                        Err(e) => return Err(ScanError::Io(e)),
                    }
                }
            })
            .await
            .map_err(|e| ScanError::Link(format!("Serial I/O task panicked: {}", e)))??;

            debug!(reply = %String::from_utf8_lossy(&reply), "Received serial reply");
            Ok(reply)
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(ScanError::SerialFeatureDisabled)
        }
    }
}
