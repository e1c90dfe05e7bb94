//! Piezo stage controller: channel selection, calibration cache, and
//! safety-checked voltage commands.
//!
//! Every operation takes an explicit [`Axis`] and selects that channel before
//! talking to it. The controller itself keeps a "current channel", so the
//! stage mirrors it in [`PiezoStage::active_channel`]; the `*_active` methods
//! at the bottom of this file reuse it without re-selecting, which is what the
//! verified line scan relies on.
//!
//! # Example
//!
//! ```no_run
//! use piezo_scan::adapters::SerialAdapter;
//! use piezo_scan::axis::Axis;
//! use piezo_scan::stage::PiezoStage;
//!
//! # async fn example() -> piezo_scan::error::ScanResult<()> {
//! let mut link = SerialAdapter::new("/dev/ttyUSB0".to_string(), 9600);
//! link.connect().await?;
//!
//! let mut stage = PiezoStage::new(link);
//! stage.initialize().await?;
//! stage.command_voltage(Axis::X, 2.5).await?;
//! let volts = stage.read_voltage(Axis::X).await?;
//! # let _ = volts;
//! # Ok(())
//! # }
//! ```

use crate::adapters::CommandLink;
use crate::axis::{Axis, Calibration};
use crate::error::{ScanError, ScanResult};
use crate::protocol::{self, DeviceError, ServoState, StageCommand};
use crate::safety;
use std::collections::HashMap;
use tracing::{debug, info};

/// A three-axis piezo stage behind a [`CommandLink`].
///
/// Not internally synchronised: one owner drives one stage.
pub struct PiezoStage<L: CommandLink> {
    link: L,
    calibration: HashMap<Axis, Calibration>,
    active: Option<Axis>,
}

impl<L: CommandLink> PiezoStage<L> {
    /// Wrap a connected link. Calibration is fetched lazily per axis.
    pub fn new(link: L) -> Self {
        Self {
            link,
            calibration: HashMap::new(),
            active: None,
        }
    }

    /// Wrap a link with calibration values obtained elsewhere.
    pub fn with_calibration(link: L, calibration: HashMap<Axis, Calibration>) -> Self {
        Self {
            link,
            calibration,
            active: None,
        }
    }

    /// The underlying link
    pub fn link(&self) -> &L {
        &self.link
    }

    /// Mutable access to the link, bypassing the safety check
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Give the link back, e.g. to disconnect it.
    pub fn into_link(self) -> L {
        self.link
    }

    async fn send(&mut self, command: StageCommand) -> ScanResult<()> {
        debug!(%command, "stage command");
        self.link.send(&command.encode()).await
    }

    async fn query(&mut self, command: StageCommand) -> ScanResult<Vec<u8>> {
        debug_assert!(command.expects_reply(), "{} has no reply", command);
        let reply = self.link.query(&command.encode()).await?;
        debug!(%command, reply = %String::from_utf8_lossy(&reply), "stage query");
        Ok(reply)
    }

    async fn query_float(&mut self, command: StageCommand) -> ScanResult<f64> {
        let reply = self.query(command).await?;
        protocol::parse_float(command, &reply)
    }

    /// Switch to remote control and fetch the calibration of every axis.
    pub async fn initialize(&mut self) -> ScanResult<()> {
        self.set_remote(true).await?;
        for axis in Axis::ALL {
            let cal = self.calibration(axis).await?;
            info!(
                %axis,
                volt_min = cal.volt_min,
                volt_max = cal.volt_max,
                volt_offset = cal.volt_offset,
                "axis calibrated"
            );
        }
        Ok(())
    }

    /// Hand control back to the front panel.
    pub async fn close(&mut self) -> ScanResult<()> {
        self.set_remote(false).await
    }

    /// `DEV:CONT REM` / `DEV:CONT LOC`.
    ///
    /// Remote control needs all servo toggle switches on the device set to OFF.
    pub async fn set_remote(&mut self, remote: bool) -> ScanResult<()> {
        self.send(StageCommand::RemoteControl(remote)).await
    }

    /// Controller identity string (`*IDN?`).
    pub async fn identify(&mut self) -> ScanResult<String> {
        let reply = self.query(StageCommand::Identify).await?;
        protocol::parse_text(StageCommand::Identify, &reply)
    }

    /// Select a channel by raw id; anything but 1-3 is rejected without I/O.
    pub async fn select_channel_id(&mut self, id: u8) -> ScanResult<Axis> {
        let axis = Axis::try_from(id)?;
        self.select_channel(axis).await?;
        Ok(axis)
    }

    /// Select a channel. The command is sent even if it is already selected.
    pub async fn select_channel(&mut self, axis: Axis) -> ScanResult<()> {
        self.send(StageCommand::SelectChannel(axis)).await?;
        self.active = Some(axis);
        Ok(())
    }

    /// Ask the controller which channel is selected and adopt its answer.
    pub async fn query_channel(&mut self) -> ScanResult<Axis> {
        let reply = self.query(StageCommand::QueryChannel).await?;
        let axis = protocol::parse_channel(&reply)?;
        self.active = Some(axis);
        Ok(axis)
    }

    /// Channel most recently selected through this stage, if any.
    pub fn active_channel(&self) -> Option<Axis> {
        self.active
    }

    /// Calibration of `axis`, queried once and cached for the stage's lifetime.
    pub async fn calibration(&mut self, axis: Axis) -> ScanResult<Calibration> {
        if let Some(cal) = self.calibration.get(&axis) {
            return Ok(*cal);
        }

        self.select_channel(axis).await?;
        let volt_max = self.query_float(StageCommand::VoltLimitHigh).await?;
        let volt_min = self.query_float(StageCommand::VoltLimitLow).await?;
        let volt_offset = self.query_float(StageCommand::VoltOffset).await?;

        let cal = Calibration::new(volt_min, volt_max, volt_offset);
        if !cal.is_consistent() {
            return Err(ScanError::Protocol {
                command: StageCommand::VoltLimitLow.encode(),
                reply: format!("limits {} .. {} are not an interval", volt_min, volt_max),
            });
        }
        self.calibration.insert(axis, cal);
        Ok(cal)
    }

    /// Calibration already in the cache, without I/O.
    pub fn cached_calibration(&self, axis: Axis) -> Option<Calibration> {
        self.calibration.get(&axis).copied()
    }

    /// Bounds-check a voltage for `axis` (fetching calibration if needed).
    ///
    /// The check applies to the value as it will appear on the wire.
    pub async fn check_voltage(&mut self, axis: Axis, value: f64) -> ScanResult<()> {
        let cal = self.calibration(axis).await?;
        safety::check(axis, &cal, protocol::quantize_voltage(value))
    }

    /// Select `axis` and set its output voltage (open loop).
    ///
    /// The value is rounded to the controller's resolution and bounds-checked
    /// before the set command is sent.
    pub async fn command_voltage(&mut self, axis: Axis, value: f64) -> ScanResult<()> {
        let value = protocol::quantize_voltage(value);
        self.check_voltage(axis, value).await?;
        self.select_channel(axis).await?;
        self.send(StageCommand::SetVoltage(value)).await
    }

    /// Measured output voltage of `axis`.
    pub async fn read_voltage(&mut self, axis: Axis) -> ScanResult<f64> {
        self.select_channel(axis).await?;
        self.query_float(StageCommand::MeasureVoltage).await
    }

    /// Position sensor reading of `axis`.
    pub async fn read_servo_position(&mut self, axis: Axis) -> ScanResult<f64> {
        self.select_channel(axis).await?;
        self.query_float(StageCommand::MeasurePosition).await
    }

    /// Servo switch state of `axis`. Informational only.
    pub async fn read_servo_status(&mut self, axis: Axis) -> ScanResult<ServoState> {
        self.select_channel(axis).await?;
        let reply = self.query(StageCommand::ServoStatus).await?;
        protocol::parse_servo(&reply)
    }

    /// Oldest entry of the controller's error queue.
    pub async fn system_error(&mut self) -> ScanResult<DeviceError> {
        let reply = self.query(StageCommand::SystemError).await?;
        protocol::parse_device_error(&reply)
    }

    // --- current-channel shorthand ---------------------------------------

    fn require_active(&self) -> ScanResult<Axis> {
        self.active.ok_or(ScanError::NoActiveChannel)
    }

    /// Set the voltage of the already-selected channel, skipping re-selection.
    ///
    /// Still bounds-checked against that channel's calibration.
    pub async fn command_voltage_active(&mut self, value: f64) -> ScanResult<Axis> {
        let axis = self.require_active()?;
        let cal = match self.cached_calibration(axis) {
            Some(cal) => cal,
            // Fetching selects `axis` again, which keeps it active.
            None => self.calibration(axis).await?,
        };
        let value = protocol::quantize_voltage(value);
        safety::check(axis, &cal, value)?;
        self.send(StageCommand::SetVoltage(value)).await?;
        Ok(axis)
    }

    /// Measured voltage of the already-selected channel.
    pub async fn read_voltage_active(&mut self) -> ScanResult<f64> {
        self.require_active()?;
        self.query_float(StageCommand::MeasureVoltage).await
    }
}
