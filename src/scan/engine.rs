//! Scan execution.
//!
//! [`ScanEngine`] owns a [`PiezoStage`] and a [`TriggerSync`] and turns line
//! and frame requests into a strictly sequential stream of voltage commands,
//! trigger pulses and dwell waits. The only concurrency is the background
//! pixel pulse, and the engine waits for it before the next position command
//! so sample `i + 1` never starts before the pulse for sample `i` has ended.
//!
//! # States
//!
//! ```text
//! Idle → LineActive → Idle
//! Idle → FrameActive → (LineActive → FrameActive)* → Idle
//! ```
//!
//! Every scan ends in `Idle`, including scans that fail part way. Samples
//! committed before a failure are not rolled back.

use super::{FrameRequest, FrameResult, LineMode, LineReport, RowReadback, ScanPattern, SettleLimit};
use crate::adapters::CommandLink;
use crate::axis::Axis;
use crate::config::{AxesConfig, ScanConfig, SettleConfig, TimingConfig};
use crate::error::{ScanError, ScanResult};
use crate::protocol::quantize_voltage;
use crate::stage::PiezoStage;
use crate::trigger::{BlinkPattern, Signal, TriggerOutput, TriggerSync};
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Where the engine is in a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No scan running
    Idle,
    /// Inside a line, standalone or as a frame row
    LineActive,
    /// Between rows of a frame
    FrameActive,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::LineActive => write!(f, "LineActive"),
            Self::FrameActive => write!(f, "FrameActive"),
        }
    }
}

/// Runs line and frame scans on one stage with one set of trigger lines.
///
/// Scans take `&mut self`, so at most one runs at a time.
pub struct ScanEngine<L: CommandLink, T: TriggerOutput> {
    stage: PiezoStage<L>,
    trigger: TriggerSync<T>,
    timing: TimingConfig,
    settle: SettleConfig,
    axes: AxesConfig,
    state: EngineState,
}

impl<L: CommandLink, T: TriggerOutput> ScanEngine<L, T> {
    /// Engine with default timing, settling disabled, X fast and Y slow.
    pub fn new(stage: PiezoStage<L>, output: T) -> Self {
        Self {
            stage,
            trigger: TriggerSync::new(output),
            timing: TimingConfig::default(),
            settle: SettleConfig::default(),
            axes: AxesConfig::default(),
            state: EngineState::Idle,
        }
    }

    /// Engine with timing, settling and axes taken from `config`.
    pub fn from_config(stage: PiezoStage<L>, output: T, config: &ScanConfig) -> Self {
        Self::new(stage, output)
            .with_timing(config.timing.clone())
            .with_settle(config.settle.clone())
            .with_axes(config.axes)
    }

    /// Replace pulse widths and the dwell floor
    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    /// Replace the settling policy
    pub fn with_settle(mut self, settle: SettleConfig) -> Self {
        self.settle = settle;
        self
    }

    /// Replace the fast/slow channel assignment
    pub fn with_axes(mut self, axes: AxesConfig) -> Self {
        self.axes = axes;
        self
    }

    /// Current state; `Idle` whenever no scan future is in flight
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// The stage being scanned
    pub fn stage(&self) -> &PiezoStage<L> {
        &self.stage
    }

    /// Direct stage access between scans
    pub fn stage_mut(&mut self) -> &mut PiezoStage<L> {
        &mut self.stage
    }

    /// The trigger output the engine drives
    pub fn trigger_output(&self) -> &T {
        self.trigger.output()
    }

    /// Give the stage back, e.g. to close it.
    pub fn into_stage(self) -> PiezoStage<L> {
        self.stage
    }

    /// Drive all trigger lines low.
    pub async fn reset_triggers(&mut self) -> ScanResult<()> {
        self.trigger.reset().await
    }

    fn transition(&mut self, next: EngineState) {
        debug!(from = %self.state, to = %next, "engine state");
        self.state = next;
    }

    /// Let background pulses finish and return to `Idle`, keeping the first error.
    async fn finish<R>(&mut self, result: ScanResult<R>) -> ScanResult<R> {
        let drained = self.trigger.wait_all().await;
        self.transition(EngineState::Idle);
        match (result, drained) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Err(pulse)) => {
                warn!(error = %pulse, "trigger failed while aborting scan");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }

    /// Scan `positions` on `axis` in the given order.
    ///
    /// Pulses the line trigger once, then for every sample: bounds-check,
    /// command, pixel pulse, dwell. See [`LineMode`] for the two disciplines.
    pub async fn scan_line(
        &mut self,
        axis: Axis,
        positions: &[f64],
        dwell: Duration,
        mode: LineMode,
    ) -> ScanResult<LineReport> {
        info!(%axis, samples = positions.len(), ?dwell, ?mode, "line scan");
        self.transition(EngineState::LineActive);
        let result = self.run_line(axis, positions, dwell, mode).await;
        self.finish(result).await
    }

    /// [`Self::scan_line`] on whichever channel was selected last.
    pub async fn scan_line_on_active(
        &mut self,
        positions: &[f64],
        dwell: Duration,
        mode: LineMode,
    ) -> ScanResult<LineReport> {
        let axis = self
            .stage
            .active_channel()
            .ok_or(ScanError::NoActiveChannel)?;
        self.scan_line(axis, positions, dwell, mode).await
    }

    async fn run_line(
        &mut self,
        axis: Axis,
        positions: &[f64],
        dwell: Duration,
        mode: LineMode,
    ) -> ScanResult<LineReport> {
        let Some(&first) = positions.first() else {
            debug!(%axis, "empty line");
            return Ok(LineReport {
                commanded: Vec::new(),
                readback: (mode == LineMode::Verified).then(Vec::new),
            });
        };

        // Verified mode pins the active channel here for the rest of the line.
        if mode == LineMode::Verified || self.settle.enabled {
            self.stage.command_voltage(axis, first).await?;
        }
        if self.settle.enabled {
            self.settle_configured(axis, first).await?;
        }

        self.trigger
            .pulse(Signal::Line, self.timing.line_pulse())
            .await?;

        match mode {
            LineMode::Standard => self.standard_samples(axis, positions, dwell).await,
            LineMode::Verified => self.verified_samples(axis, positions, dwell).await,
        }
    }

    async fn standard_samples(
        &mut self,
        axis: Axis,
        positions: &[f64],
        dwell: Duration,
    ) -> ScanResult<LineReport> {
        let pixel = BlinkPattern::background(self.timing.pixel_on(), self.timing.pixel_off());
        let mut commanded = Vec::with_capacity(positions.len());

        for &position in positions {
            self.trigger.wait_pending(Signal::Pixel).await?;
            self.stage.command_voltage(axis, position).await?;
            commanded.push(quantize_voltage(position));
            self.trigger.blink(Signal::Pixel, pixel).await?;
            tokio::time::sleep(dwell).await;
        }
        self.trigger.wait_pending(Signal::Pixel).await?;

        Ok(LineReport {
            commanded,
            readback: None,
        })
    }

    async fn verified_samples(
        &mut self,
        axis: Axis,
        positions: &[f64],
        dwell: Duration,
    ) -> ScanResult<LineReport> {
        let mut commanded = Vec::with_capacity(positions.len());
        let mut readback = Vec::with_capacity(positions.len());

        for &position in positions {
            self.stage.command_voltage_active(position).await?;
            commanded.push(quantize_voltage(position));
            self.trigger
                .pulse(Signal::Pixel, self.timing.verified_pixel_pulse())
                .await?;
            tokio::time::sleep(dwell).await;

            let actual = self.stage.read_voltage_active().await?;
            info!(%axis, commanded = position, readback = actual, "sample");
            readback.push(actual);
        }

        Ok(LineReport {
            commanded,
            readback: Some(readback),
        })
    }

    /// Run a frame: fast axis within each row, slow axis once per row.
    ///
    /// The dwell time and both ranges are validated before anything is sent.
    pub async fn scan_frame(&mut self, request: &FrameRequest) -> ScanResult<FrameResult> {
        let minimum = self.timing.min_dwell();
        if request.dwell < minimum {
            return Err(ScanError::InvalidDwellTime {
                dwell: request.dwell,
                minimum,
            });
        }
        let x = request.x.expand()?;
        let y = request.y.expand()?;

        info!(
            fast = %self.axes.fast,
            slow = %self.axes.slow,
            columns = x.len(),
            rows = y.len(),
            pattern = ?request.pattern,
            mode = ?request.mode,
            "frame scan"
        );
        self.transition(EngineState::FrameActive);
        let result = self.run_frame(request, &x, &y).await;
        let readback = self.finish(result).await?;

        Ok(FrameResult { x, y, readback })
    }

    async fn run_frame(
        &mut self,
        request: &FrameRequest,
        x: &[f64],
        y: &[f64],
    ) -> ScanResult<Vec<RowReadback>> {
        let AxesConfig { fast, slow } = self.axes;
        let mut readback = Vec::new();

        if self.settle.enabled {
            if let Some(&start) = y.first() {
                self.stage.command_voltage(slow, start).await?;
                self.settle_configured(slow, start).await?;
            }
        }

        self.trigger
            .pulse(Signal::Frame, self.timing.frame_pulse())
            .await?;

        for (row, &y_value) in y.iter().enumerate() {
            self.stage.command_voltage(slow, y_value).await?;
            debug!(row, y = y_value, "row");

            let order = request.pattern.row_order(row, x);
            self.transition(EngineState::LineActive);
            let line = self.run_line(fast, &order, request.dwell, request.mode).await?;
            self.transition(EngineState::FrameActive);

            if request.mode == LineMode::Verified {
                let actual = self.stage.read_voltage(slow).await?;
                info!(%slow, row, commanded = y_value, readback = actual, "row complete");
                readback.push(RowReadback {
                    slow: actual,
                    fast: line.readback.unwrap_or_default(),
                });
            }
        }

        if request.pattern == ScanPattern::Boustrophedon {
            self.trigger
                .pulse(Signal::Frame, self.timing.frame_end_pulse())
                .await?;
        }
        Ok(readback)
    }

    /// Poll the measured voltage of `axis` until it is within `tolerance` of `target`.
    ///
    /// With [`SettleLimit::Unbounded`] this blocks for as long as the stage
    /// takes, forever if it never gets there. Returns the converged reading.
    pub async fn await_settled(
        &mut self,
        axis: Axis,
        target: f64,
        tolerance: f64,
        limit: SettleLimit,
    ) -> ScanResult<f64> {
        debug!(%axis, target, tolerance, ?limit, "settling");
        let mut last = f64::NAN;

        match limit {
            SettleLimit::Unbounded => {
                self.poll_until_settled(axis, target, tolerance, &mut last)
                    .await
            }
            SettleLimit::Deadline(deadline) => {
                let outcome = tokio::time::timeout(
                    deadline,
                    self.poll_until_settled(axis, target, tolerance, &mut last),
                )
                .await;
                match outcome {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(%axis, target, last, ?deadline, "settling timed out");
                        Err(ScanError::SettleTimeout { axis, target, last })
                    }
                }
            }
            SettleLimit::Cancel(mut cancel) => {
                let outcome = tokio::select! {
                    biased;
                    _ = cancelled(&mut cancel) => None,
                    result = self.poll_until_settled(axis, target, tolerance, &mut last) => Some(result),
                };
                match outcome {
                    Some(result) => result,
                    None => {
                        warn!(%axis, target, last, "settling cancelled");
                        Err(ScanError::SettleCancelled { axis })
                    }
                }
            }
        }
    }

    async fn settle_configured(&mut self, axis: Axis, target: f64) -> ScanResult<()> {
        let limit = SettleLimit::from_timeout(self.settle.timeout());
        self.await_settled(axis, target, self.settle.tolerance, limit)
            .await?;
        Ok(())
    }

    async fn poll_until_settled(
        &mut self,
        axis: Axis,
        target: f64,
        tolerance: f64,
        last: &mut f64,
    ) -> ScanResult<f64> {
        let interval = self.settle.poll_interval();
        loop {
            let reading = self.stage.read_voltage(axis).await?;
            *last = reading;
            if (reading - target).abs() <= tolerance {
                debug!(%axis, reading, "settled");
                return Ok(reading);
            }
            if interval.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(interval).await;
            }
        }
    }
}

/// Resolves once the flag is `true`. A dropped sender never cancels.
async fn cancelled(flag: &mut watch::Receiver<bool>) {
    loop {
        if *flag.borrow_and_update() {
            return;
        }
        if flag.changed().await.is_err() {
            if *flag.borrow() {
                return;
            }
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;
    use crate::axis::Calibration;
    use crate::trigger::RecordingTrigger;
    use tokio::time::Instant;
    use tracing_test::traced_test;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn engine(link: MockAdapter) -> (ScanEngine<MockAdapter, RecordingTrigger>, RecordingTrigger) {
        let recorder = RecordingTrigger::new();
        let engine = ScanEngine::new(PiezoStage::new(link), recorder.clone());
        (engine, recorder)
    }

    fn polling(interval_ms: u64) -> SettleConfig {
        SettleConfig {
            poll_interval_ms: interval_ms,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_standard_line_timing() {
        let link = MockAdapter::new();
        let (mut engine, recorder) = engine(link.clone());

        let start = Instant::now();
        let report = engine
            .scan_line(Axis::X, &[1.0, 2.0, 3.0], ms(100), LineMode::Standard)
            .await
            .unwrap();

        // 100 ms line pulse, then three 100 ms dwells
        assert_eq!(start.elapsed(), ms(400));
        assert_eq!(report.commanded, vec![1.0, 2.0, 3.0]);
        assert_eq!(report.readback, None);

        let line = recorder.pulses(Signal::Line);
        assert_eq!(line.len(), 1);
        assert_eq!(line[0].width(), ms(100));

        let pixels = recorder.pulses(Signal::Pixel);
        assert_eq!(pixels.len(), 3);
        assert!(pixels.iter().all(|p| p.width() == ms(50)));
        assert_eq!(pixels[1].rise - pixels[0].rise, ms(100));
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_standard_line_reselects_channel_every_sample() {
        let link = MockAdapter::new();
        let (mut engine, _recorder) = engine(link.clone());
        engine.stage_mut().calibration(Axis::Z).await.unwrap();
        link.clear_log();

        engine
            .scan_line(Axis::Z, &[0.5, -0.5], ms(100), LineMode::Standard)
            .await
            .unwrap();
        assert_eq!(
            link.command_strings(),
            vec!["INST:SEL Ch2", "SOUR:VOLT 0.50", "INST:SEL Ch2", "SOUR:VOLT -0.50"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_dwell_still_waits_for_pixel_pulse() {
        let link = MockAdapter::new();
        let (mut engine, recorder) = engine(link.clone());

        engine
            .scan_line(Axis::X, &[1.0, 2.0], ms(20), LineMode::Standard)
            .await
            .unwrap();

        let pixels = recorder.pulses(Signal::Pixel);
        let second_set = link
            .commands()
            .into_iter()
            .filter(|c| c.command.starts_with("SOUR:VOLT "))
            .nth(1)
            .unwrap();
        // 50 ms high plus 50 ms low before the next position
        assert!(second_set.at >= pixels[0].fall + ms(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_verified_line_reads_back_on_current_channel() {
        let link = MockAdapter::new();
        let (mut engine, recorder) = engine(link.clone());
        engine.stage_mut().calibration(Axis::X).await.unwrap();
        link.clear_log();

        let start = Instant::now();
        let report = engine
            .scan_line(Axis::X, &[1.0, 2.0], ms(100), LineMode::Verified)
            .await
            .unwrap();

        // line pulse 100, then (10 ms pixel + 100 ms dwell) per sample
        assert_eq!(start.elapsed(), ms(320));
        assert_eq!(report.readback, Some(vec![1.0, 2.0]));
        assert_eq!(
            link.command_strings(),
            vec![
                "INST:SEL Ch1",
                "SOUR:VOLT 1.00",
                "SOUR:VOLT 1.00",
                "MEAS:VOLT?",
                "SOUR:VOLT 2.00",
                "MEAS:VOLT?",
            ]
        );
        assert!(recorder
            .pulses(Signal::Pixel)
            .iter()
            .all(|p| p.width() == ms(10)));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_verified_readback_is_logged() {
        let link = MockAdapter::new();
        let (mut engine, _recorder) = engine(link);
        engine
            .scan_line(Axis::Z, &[0.25], ms(100), LineMode::Verified)
            .await
            .unwrap();
        assert!(logs_contain("readback=0.25"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_line_sends_nothing() {
        let link = MockAdapter::new();
        let (mut engine, recorder) = engine(link.clone());
        let report = engine
            .scan_line(Axis::X, &[], ms(100), LineMode::Verified)
            .await
            .unwrap();
        assert_eq!(report.readback, Some(Vec::new()));
        assert!(link.commands().is_empty());
        assert!(recorder.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_line_on_active_channel() {
        let link = MockAdapter::new();
        let (mut engine, _recorder) = engine(link.clone());
        assert!(matches!(
            engine
                .scan_line_on_active(&[1.0], ms(100), LineMode::Standard)
                .await,
            Err(ScanError::NoActiveChannel)
        ));

        engine.stage_mut().select_channel(Axis::Y).await.unwrap();
        engine
            .scan_line_on_active(&[1.5], ms(100), LineMode::Standard)
            .await
            .unwrap();
        assert_eq!(link.voltage_sets(), vec![(Axis::Y, 1.5)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_failure_returns_engine_to_idle() {
        let link = MockAdapter::new();
        let (mut engine, recorder) = engine(link.clone());
        recorder.fail_next();

        let err = engine
            .scan_line(Axis::X, &[1.0], ms(100), LineMode::Standard)
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Trigger(_)));
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(link.voltage_sets().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_settling_enabled_prepositions_first_sample() {
        let link = MockAdapter::new().with_slew_per_poll(1.0);
        let (engine, _recorder) = engine(link.clone());
        let mut engine = engine.with_settle(SettleConfig {
            enabled: true,
            tolerance: 0.1,
            poll_interval_ms: 5,
            timeout_ms: Some(1000),
        });

        engine
            .scan_line(Axis::X, &[3.0, 4.0], ms(100), LineMode::Standard)
            .await
            .unwrap();

        let sent = link.command_strings();
        let first_poll = sent.iter().position(|c| c == "MEAS:VOLT?").unwrap();
        let first_set = sent.iter().position(|c| c == "SOUR:VOLT 3.00").unwrap();
        assert!(first_set < first_poll);
        // 1, 2, 3 V
        assert_eq!(sent.iter().filter(|c| *c == "MEAS:VOLT?").count(), 3);
    }

    #[tokio::test]
    async fn test_await_settled_converges() {
        let link = MockAdapter::new().with_slew_per_poll(1.0);
        let (mut engine, _recorder) = engine(link.clone());
        engine.stage_mut().command_voltage(Axis::X, 5.0).await.unwrap();

        let reading = engine
            .await_settled(Axis::X, 5.0, 0.5, SettleLimit::Unbounded)
            .await
            .unwrap();
        assert_eq!(reading, 5.0);
        assert_eq!(
            link.command_strings()
                .iter()
                .filter(|c| *c == "MEAS:VOLT?")
                .count(),
            5
        );
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_await_settled_deadline() {
        let link = MockAdapter::new().with_slew_per_poll(0.1);
        let (engine, _recorder) = engine(link.clone());
        let mut engine = engine.with_settle(polling(10));
        engine.stage_mut().command_voltage(Axis::X, 9.0).await.unwrap();

        let start = Instant::now();
        let err = engine
            .await_settled(Axis::X, 9.0, 0.01, SettleLimit::Deadline(ms(50)))
            .await
            .unwrap_err();

        assert_eq!(start.elapsed(), ms(50));
        assert!(logs_contain("settling timed out"));
        match err {
            ScanError::SettleTimeout { axis, target, last } => {
                assert_eq!(axis, Axis::X);
                assert_eq!(target, 9.0);
                assert!(last > 0.0 && last < 1.0, "last reading {}", last);
            }
            other => panic!("expected SettleTimeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_settled_cancel() {
        let link = MockAdapter::new()
            .with_calibration(Axis::Z, Calibration::new(-20.0, 20.0, 0.0))
            .with_slew_per_poll(0.01);
        let (engine, _recorder) = engine(link.clone());
        let mut engine = engine.with_settle(polling(10));
        engine.stage_mut().command_voltage(Axis::Z, 15.0).await.unwrap();

        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(35)).await;
            let _ = tx.send(true);
        });

        let start = Instant::now();
        let err = engine
            .await_settled(Axis::Z, 15.0, 0.1, SettleLimit::Cancel(rx))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::SettleCancelled { axis: Axis::Z }));
        assert_eq!(start.elapsed(), ms(35));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_flag_already_set() {
        let link = MockAdapter::new();
        let (mut engine, _recorder) = engine(link.clone());
        let (_tx, rx) = watch::channel(true);

        let result = engine
            .await_settled(Axis::X, 0.0, 1.0, SettleLimit::Cancel(rx))
            .await;
        assert!(matches!(result, Err(ScanError::SettleCancelled { .. })));
        assert!(link.commands().is_empty());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(EngineState::FrameActive.to_string(), "FrameActive");
    }
}
