//! Typed commands for the piezo controller's SCPI-style text protocol.
//!
//! Commands are ASCII lines; numeric replies are plain decimal text. All string
//! formatting and reply parsing lives here so the rest of the crate only sees
//! typed values and [`ScanError::Protocol`].
//!
//! | Command | Wire form |
//! |---|---|
//! | remote / local control | `DEV:CONT REM` / `DEV:CONT LOC` |
//! | identify | `*IDN?` |
//! | select channel | `INST:SEL Ch{n}` |
//! | query channel | `INST:SEL?` |
//! | set voltage | `SOUR:VOLT {v:.2}` |
//! | calibration | `SOUR:VOLT:LIM:HIGH?`, `SOUR:VOLT:LIM:LOW?`, `SOUR:VOLT:OFFS?` |
//! | read back | `MEAS:VOLT?`, `MEAS:POS?` |
//! | servo status | `DEV:SERV?` |
//! | error queue | `SYST:ERR?` |

use crate::axis::Axis;
use crate::error::{ScanError, ScanResult};
use std::fmt;

/// A single controller command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StageCommand {
    /// Hand control to the serial interface (`true`) or the front panel (`false`)
    RemoteControl(bool),
    /// `*IDN?`
    Identify,
    /// Make `Axis` the current channel
    SelectChannel(Axis),
    /// Ask which channel is current
    QueryChannel,
    /// Set the output voltage of the selected channel (open loop)
    SetVoltage(f64),
    /// Calibrated upper voltage limit
    VoltLimitHigh,
    /// Calibrated lower voltage limit
    VoltLimitLow,
    /// Calibrated voltage offset
    VoltOffset,
    /// Read the output voltage of the selected channel
    MeasureVoltage,
    /// Read the position sensor of the selected channel
    MeasurePosition,
    /// Servo switch state of the selected channel
    ServoStatus,
    /// Pop the oldest entry of the error queue
    SystemError,
}

impl StageCommand {
    /// Wire representation without the record terminator.
    pub fn encode(&self) -> String {
        match self {
            StageCommand::RemoteControl(true) => "DEV:CONT REM".to_string(),
            StageCommand::RemoteControl(false) => "DEV:CONT LOC".to_string(),
            StageCommand::Identify => "*IDN?".to_string(),
            StageCommand::SelectChannel(axis) => format!("INST:SEL Ch{}", axis.channel()),
            StageCommand::QueryChannel => "INST:SEL?".to_string(),
            StageCommand::SetVoltage(v) => format!("SOUR:VOLT {:.2}", quantize_voltage(*v)),
            StageCommand::VoltLimitHigh => "SOUR:VOLT:LIM:HIGH?".to_string(),
            StageCommand::VoltLimitLow => "SOUR:VOLT:LIM:LOW?".to_string(),
            StageCommand::VoltOffset => "SOUR:VOLT:OFFS?".to_string(),
            StageCommand::MeasureVoltage => "MEAS:VOLT?".to_string(),
            StageCommand::MeasurePosition => "MEAS:POS?".to_string(),
            StageCommand::ServoStatus => "DEV:SERV?".to_string(),
            StageCommand::SystemError => "SYST:ERR?".to_string(),
        }
    }

    /// Whether the controller answers this command with a line.
    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            StageCommand::Identify
                | StageCommand::QueryChannel
                | StageCommand::VoltLimitHigh
                | StageCommand::VoltLimitLow
                | StageCommand::VoltOffset
                | StageCommand::MeasureVoltage
                | StageCommand::MeasurePosition
                | StageCommand::ServoStatus
                | StageCommand::SystemError
        )
    }
}

impl fmt::Display for StageCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Round a voltage to the two decimal places the controller accepts.
///
/// `SOUR:VOLT` sends exactly this value, so limits must be checked against it.
pub fn quantize_voltage(volts: f64) -> f64 {
    (volts * 100.0).round() / 100.0
}

/// Servo switch state of a channel.
///
/// Set implicitly by the controller: a VOLT-branch command switches the servo
/// off, a POS-branch command switches it on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServoState {
    /// Open loop (`0`)
    Off,
    /// Closed loop (`1`)
    On,
}

/// Entry from the controller's error queue (`SYST:ERR?`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceError {
    /// SCPI error number; `0` is "no error"
    pub code: i32,
    /// Text without the surrounding quotes
    pub description: String,
}

impl DeviceError {
    /// `0` means the queue is empty.
    pub fn is_none(&self) -> bool {
        self.code == 0
    }
}

fn protocol_error(command: StageCommand, reply: &[u8]) -> ScanError {
    ScanError::Protocol {
        command: command.encode(),
        reply: String::from_utf8_lossy(reply).into_owned(),
    }
}

fn reply_text(command: StageCommand, reply: &[u8]) -> ScanResult<&str> {
    let text = std::str::from_utf8(reply)
        .map_err(|_| protocol_error(command, reply))?
        .trim();
    if text.is_empty() {
        return Err(protocol_error(command, reply));
    }
    Ok(text)
}

/// Decode a plain decimal reply.
pub fn parse_float(command: StageCommand, reply: &[u8]) -> ScanResult<f64> {
    let text = reply_text(command, reply)?;
    text.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| protocol_error(command, reply))
}

/// Decode an `INST:SEL?` reply of the form `Ch{n}`.
pub fn parse_channel(reply: &[u8]) -> ScanResult<Axis> {
    let command = StageCommand::QueryChannel;
    let text = reply_text(command, reply)?;
    let digits = text
        .strip_prefix("Ch")
        .or_else(|| text.strip_prefix("CH"))
        .ok_or_else(|| protocol_error(command, reply))?;
    let channel = digits
        .trim()
        .parse::<u8>()
        .map_err(|_| protocol_error(command, reply))?;
    Axis::try_from(channel)
}

/// Decode a `DEV:SERV?` reply (`0` or `1`).
pub fn parse_servo(reply: &[u8]) -> ScanResult<ServoState> {
    let command = StageCommand::ServoStatus;
    match reply_text(command, reply)? {
        "0" => Ok(ServoState::Off),
        "1" => Ok(ServoState::On),
        _ => Err(protocol_error(command, reply)),
    }
}

/// Decode a `SYST:ERR?` reply of the form `code,"description"`.
pub fn parse_device_error(reply: &[u8]) -> ScanResult<DeviceError> {
    let command = StageCommand::SystemError;
    let text = reply_text(command, reply)?;
    let (code, description) = text
        .split_once(',')
        .ok_or_else(|| protocol_error(command, reply))?;
    let code = code
        .trim()
        .parse::<i32>()
        .map_err(|_| protocol_error(command, reply))?;
    Ok(DeviceError {
        code,
        description: description.trim().trim_matches('"').to_string(),
    })
}

/// Decode a free-text reply such as the `*IDN?` identity string.
pub fn parse_text(command: StageCommand, reply: &[u8]) -> ScanResult<String> {
    reply_text(command, reply).map(str::to_string)
}
