//! Simulated controller link for testing
//!
//! This adapter behaves like the piezo controller on the other end of the
//! serial line, so the stage and scan layers can run without hardware. It
//! provides:
//! - Per-channel calibration and output voltage state
//! - Optional slew so read-backs converge on the commanded voltage over several polls
//! - Reply injection for protocol-error tests
//! - A timestamped command log for test verification
//!
//! Clones share state, so a test can keep a handle while the stage owns the link.

use crate::adapters::CommandLink;
use crate::axis::{Axis, Calibration};
use crate::error::ScanResult;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;

/// Simulated position sensor gain in µm per volt.
const MICRONS_PER_VOLT: f64 = 1.0;

/// A command received by the simulated controller.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedCommand {
    /// When the command arrived (tokio clock)
    pub at: Instant,
    /// Channel that was selected when the command arrived
    pub channel: Option<Axis>,
    /// Wire text without terminator
    pub command: String,
}

#[derive(Debug, Clone)]
struct ChannelState {
    calibration: Calibration,
    commanded: f64,
    measured: f64,
    servo_on: bool,
}

impl ChannelState {
    fn new(calibration: Calibration) -> Self {
        Self {
            calibration,
            commanded: 0.0,
            measured: 0.0,
            servo_on: false,
        }
    }
}

#[derive(Debug)]
struct ControllerState {
    remote: bool,
    active: Option<Axis>,
    channels: HashMap<Axis, ChannelState>,
    pending: VecDeque<Vec<u8>>,
    injected: VecDeque<Vec<u8>>,
    errors: VecDeque<(i32, String)>,
    slew_per_poll: Option<f64>,
    log: Vec<LoggedCommand>,
}

/// Mock controller link
///
/// # Example
///
/// ```
/// use piezo_scan::adapters::MockAdapter;
/// use piezo_scan::axis::{Axis, Calibration};
///
/// let link = MockAdapter::new().with_calibration(Axis::X, Calibration::new(-5.0, 5.0, 0.0));
/// assert!(link.commands().is_empty());
/// ```
#[derive(Clone)]
pub struct MockAdapter {
    state: Arc<Mutex<ControllerState>>,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    /// Create a simulated controller with a `(-10, 10)` V window on every channel
    pub fn new() -> Self {
        let channels = Axis::ALL
            .iter()
            .map(|&axis| (axis, ChannelState::new(Calibration::new(-10.0, 10.0, 0.0))))
            .collect();
        Self {
            state: Arc::new(Mutex::new(ControllerState {
                remote: false,
                active: None,
                channels,
                pending: VecDeque::new(),
                injected: VecDeque::new(),
                errors: VecDeque::new(),
                slew_per_poll: None,
                log: Vec::new(),
            })),
        }
    }

    /// Override the calibration reported for one channel
    pub fn with_calibration(self, axis: Axis, calibration: Calibration) -> Self {
        if let Some(channel) = self.lock().channels.get_mut(&axis) {
            channel.calibration = calibration;
        }
        self
    }

    /// Make `MEAS:VOLT?` approach the commanded voltage by at most `volts` per poll
    pub fn with_slew_per_poll(self, volts: f64) -> Self {
        self.lock().slew_per_poll = Some(volts);
        self
    }

    /// Start a channel at a given output voltage
    pub fn with_voltage(self, axis: Axis, volts: f64) -> Self {
        if let Some(channel) = self.lock().channels.get_mut(&axis) {
            channel.commanded = volts;
            channel.measured = volts;
        }
        self
    }

    /// Replace the next reply with raw bytes
    pub fn inject_reply(&self, reply: &[u8]) {
        self.lock().injected.push_back(reply.to_vec());
    }

    /// Whether `DEV:CONT REM` is in effect
    pub fn is_remote(&self) -> bool {
        self.lock().remote
    }

    /// Channel selected by the last `INST:SEL`
    pub fn active_channel(&self) -> Option<Axis> {
        self.lock().active
    }

    /// Commanded output voltage of a channel
    pub fn output_voltage(&self, axis: Axis) -> f64 {
        self.lock()
            .channels
            .get(&axis)
            .map(|c| c.commanded)
            .unwrap_or_default()
    }

    /// Every command received so far
    pub fn commands(&self) -> Vec<LoggedCommand> {
        self.lock().log.clone()
    }

    /// Wire text of every command received so far
    pub fn command_strings(&self) -> Vec<String> {
        self.lock().log.iter().map(|c| c.command.clone()).collect()
    }

    /// `(channel, volts)` for every `SOUR:VOLT` command, in order
    pub fn voltage_sets(&self) -> Vec<(Axis, f64)> {
        self.lock()
            .log
            .iter()
            .filter_map(|c| {
                let value = c.command.strip_prefix("SOUR:VOLT ")?.parse::<f64>().ok()?;
                Some((c.channel?, value))
            })
            .collect()
    }

    /// Queue a controller-side error, as if a previous command had failed
    pub fn push_device_error(&self, code: i32, description: &str) {
        self.lock().push_error(code, description);
    }

    /// Clear the command log
    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ControllerState {
    fn push_error(&mut self, code: i32, description: &str) {
        self.errors.push_back((code, description.to_string()));
    }

    fn reply(&mut self, text: String) {
        self.pending.push_back(text.into_bytes());
    }

    fn active_channel(&mut self) -> Option<&mut ChannelState> {
        let axis = self.active?;
        self.channels.get_mut(&axis)
    }

    fn handle(&mut self, command: &str) {
        let command = command.trim();
        match command {
            "DEV:CONT REM" => self.remote = true,
            "DEV:CONT LOC" => self.remote = false,
            "*IDN?" => self.reply("PI E-515 (simulated)".to_string()),
            "INST:SEL?" => match self.active {
                Some(axis) => self.reply(format!("Ch{}", axis.channel())),
                None => self.reply("Ch1".to_string()),
            },
            "SYST:ERR?" => {
                let (code, description) = self
                    .errors
                    .pop_front()
                    .unwrap_or((0, "No error".to_string()));
                self.reply(format!("{},\"{}\"", code, description));
            }
            "SOUR:VOLT:LIM:HIGH?" | "SOUR:VOLT:LIM:LOW?" | "SOUR:VOLT:OFFS?" | "MEAS:VOLT?"
            | "MEAS:POS?" | "DEV:SERV?" => self.channel_query(command),
            _ => {
                if let Some(channel) = command.strip_prefix("INST:SEL Ch") {
                    match channel.parse::<u8>().ok().and_then(|n| Axis::try_from(n).ok()) {
                        Some(axis) => self.active = Some(axis),
                        None => self.push_error(-114, "Header suffix out of range"),
                    }
                } else if let Some(value) = command.strip_prefix("SOUR:VOLT ") {
                    match (value.parse::<f64>(), self.active_channel()) {
                        (Ok(v), Some(channel)) => {
                            channel.commanded = v;
                            channel.servo_on = false;
                        }
                        _ => self.push_error(-222, "Data out of range"),
                    }
                } else {
                    self.push_error(-113, "Undefined header");
                }
            }
        }
    }

    fn channel_query(&mut self, command: &str) {
        let slew = self.slew_per_poll;
        let Some(channel) = self.active_channel() else {
            // Mirrors a silent controller: no reply, the read times out.
            return;
        };
        let text = match command {
            "SOUR:VOLT:LIM:HIGH?" => channel.calibration.volt_max.to_string(),
            "SOUR:VOLT:LIM:LOW?" => channel.calibration.volt_min.to_string(),
            "SOUR:VOLT:OFFS?" => channel.calibration.volt_offset.to_string(),
            "MEAS:VOLT?" | "MEAS:POS?" => {
                let delta = channel.commanded - channel.measured;
                channel.measured = match slew {
                    Some(step) if delta.abs() > step => channel.measured + step * delta.signum(),
                    _ => channel.commanded,
                };
                // The position branch switches the servo indicator on; a voltage set clears it.
                let scale = if command == "MEAS:POS?" {
                    channel.servo_on = true;
                    MICRONS_PER_VOLT
                } else {
                    1.0
                };
                format!("{:.3}", channel.measured * scale)
            }
            _ => (if channel.servo_on { "1" } else { "0" }).to_string(),
        };
        self.reply(text);
    }
}

#[async_trait]
impl CommandLink for MockAdapter {
    async fn send(&mut self, command: &str) -> ScanResult<()> {
        let mut state = self.lock();
        let channel = state.active;
        state.log.push(LoggedCommand {
            at: Instant::now(),
            channel,
            command: command.to_string(),
        });
        state.handle(command);
        Ok(())
    }

    async fn receive_line(&mut self) -> ScanResult<Vec<u8>> {
        let mut state = self.lock();
        if let Some(injected) = state.injected.pop_front() {
            state.pending.pop_front();
            return Ok(injected);
        }
        // Nothing pending behaves like a timed-out read with no data.
        Ok(state.pending.pop_front().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_select_and_set_voltage() {
        let mut link = MockAdapter::new();
        link.send("INST:SEL Ch2").await.unwrap();
        link.send("SOUR:VOLT 1.50").await.unwrap();

        assert_eq!(link.active_channel(), Some(Axis::Z));
        assert_eq!(link.output_voltage(Axis::Z), 1.5);
        assert_eq!(link.voltage_sets(), vec![(Axis::Z, 1.5)]);
    }

    #[tokio::test]
    async fn test_calibration_queries_follow_selected_channel() {
        let mut link =
            MockAdapter::new().with_calibration(Axis::Y, Calibration::new(-2.0, 30.0, 0.5));
        link.send("INST:SEL Ch3").await.unwrap();
        assert_eq!(link.query("SOUR:VOLT:LIM:HIGH?").await.unwrap(), b"30");
        assert_eq!(link.query("SOUR:VOLT:LIM:LOW?").await.unwrap(), b"-2");
        assert_eq!(link.query("SOUR:VOLT:OFFS?").await.unwrap(), b"0.5");
    }

    #[tokio::test]
    async fn test_slew_converges_over_polls() {
        let mut link = MockAdapter::new().with_slew_per_poll(1.0);
        link.send("INST:SEL Ch1").await.unwrap();
        link.send("SOUR:VOLT 2.50").await.unwrap();

        assert_eq!(link.query("MEAS:VOLT?").await.unwrap(), b"1.000");
        assert_eq!(link.query("MEAS:VOLT?").await.unwrap(), b"2.000");
        assert_eq!(link.query("MEAS:VOLT?").await.unwrap(), b"2.500");
    }

    #[tokio::test]
    async fn test_initial_voltage_reads_back() {
        let mut link = MockAdapter::new().with_voltage(Axis::Y, -3.5);
        link.send("INST:SEL Ch3").await.unwrap();
        assert_eq!(link.query("MEAS:VOLT?").await.unwrap(), b"-3.500");
        assert_eq!(link.query("DEV:SERV?").await.unwrap(), b"0");
        assert_eq!(link.query("MEAS:POS?").await.unwrap(), b"-3.500");
        assert_eq!(link.query("DEV:SERV?").await.unwrap(), b"1");
    }

    #[tokio::test]
    async fn test_injected_reply_replaces_next() {
        let mut link = MockAdapter::new();
        link.send("INST:SEL Ch1").await.unwrap();
        link.inject_reply(b"junk");
        assert_eq!(link.query("MEAS:VOLT?").await.unwrap(), b"junk");
        // The genuine reply was discarded, nothing left over.
        assert!(link.receive_line().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_command_lands_in_error_queue() {
        let mut link = MockAdapter::new();
        link.send("BOGUS").await.unwrap();
        assert_eq!(
            link.query("SYST:ERR?").await.unwrap(),
            b"-113,\"Undefined header\""
        );
        assert_eq!(link.query("SYST:ERR?").await.unwrap(), b"0,\"No error\"");
    }

    #[test]
    fn test_clear_log() {
        let link = MockAdapter::new();
        link.lock().log.push(LoggedCommand {
            at: Instant::now(),
            channel: None,
            command: "x".into(),
        });
        assert_eq!(link.commands().len(), 1);
        link.clear_log();
        assert!(link.commands().is_empty());
    }
}
