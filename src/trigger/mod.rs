//! Pixel, line and frame trigger pulses.
//!
//! The physical pin driver is an external collaborator behind
//! [`TriggerOutput`]: three independent digital outputs that can be switched
//! on and off. [`TriggerSync`] builds the pulse primitives on top of it:
//!
//! - synchronous pulses (on, hold, off) used for line and frame boundaries and
//!   by verified line scans for pixels;
//! - background blinks, spawned as tokio timer tasks, used for pixel pulses in
//!   standard line scans so the falling edge does not hold up the next sample.
//!
//! All timing goes through `tokio::time`, so tests can run on a paused clock
//! and observe exact pulse widths.

pub mod mock;

pub use mock::{Pulse, RecordingTrigger, TriggerEvent};

use crate::error::{ScanError, ScanResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One of the three trigger lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Fires with every position update
    Pixel,
    /// Fires at the start of each line
    Line,
    /// Fires at frame boundaries
    Frame,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Signal::Pixel => "pixel",
            Signal::Line => "line",
            Signal::Frame => "frame",
        })
    }
}

/// Capability: digital trigger outputs
///
/// # Contract
/// - Each signal is independent
/// - `set` takes effect immediately; timing is the caller's business
#[async_trait]
pub trait TriggerOutput: Send + Sync + 'static {
    /// Drive `signal` high (`true`) or low (`false`).
    async fn set(&self, signal: Signal, high: bool) -> ScanResult<()>;
}

/// Trigger output that only logs edges.
///
/// Used when no pin driver is wired up, e.g. for dry runs from the CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTrigger;

#[async_trait]
impl TriggerOutput for LogTrigger {
    async fn set(&self, signal: Signal, high: bool) -> ScanResult<()> {
        debug!(%signal, high, "trigger edge");
        Ok(())
    }
}

/// On/off timing of a blink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlinkPattern {
    /// High time per cycle
    pub on_time: Duration,
    /// Low time per cycle
    pub off_time: Duration,
    /// Number of on/off cycles
    pub repeat: u32,
    /// Run on a timer task instead of blocking the caller
    pub background: bool,
}

impl BlinkPattern {
    /// Single background pulse.
    pub fn background(on_time: Duration, off_time: Duration) -> Self {
        Self {
            on_time,
            off_time,
            repeat: 1,
            background: true,
        }
    }

    /// Total time the pattern occupies, or `None` if it does not fit a [`Duration`].
    pub fn period(&self) -> Option<Duration> {
        self.on_time
            .checked_add(self.off_time)?
            .checked_mul(self.repeat)
    }
}

/// Handle to a blink running on a timer task.
pub struct PulseHandle {
    task: JoinHandle<ScanResult<()>>,
}

impl PulseHandle {
    /// Whether the blink has run to completion (or failed)
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the blink where it is. The line may be left high.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Wait for the blink to complete and surface its error, if any.
    pub async fn join(self) -> ScanResult<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(ScanError::Trigger(format!("pulse task failed: {}", e))),
        }
    }
}

async fn run_blink<T: TriggerOutput>(
    output: &T,
    signal: Signal,
    pattern: BlinkPattern,
) -> ScanResult<()> {
    for _ in 0..pattern.repeat {
        output.set(signal, true).await?;
        tokio::time::sleep(pattern.on_time).await;
        output.set(signal, false).await?;
        tokio::time::sleep(pattern.off_time).await;
    }
    Ok(())
}

/// Pulse generator over a [`TriggerOutput`].
pub struct TriggerSync<T: TriggerOutput> {
    output: Arc<T>,
    pending: HashMap<Signal, PulseHandle>,
}

impl<T: TriggerOutput> TriggerSync<T> {
    /// Wrap an output. Callers should make sure all lines start low, see [`Self::reset`].
    pub fn new(output: T) -> Self {
        Self {
            output: Arc::new(output),
            pending: HashMap::new(),
        }
    }

    /// The wrapped output
    pub fn output(&self) -> &T {
        &self.output
    }

    /// Drive every line low and drop any blink in flight.
    pub async fn reset(&mut self) -> ScanResult<()> {
        for (_, handle) in self.pending.drain() {
            handle.abort();
        }
        for signal in [Signal::Pixel, Signal::Line, Signal::Frame] {
            self.output.set(signal, false).await?;
        }
        Ok(())
    }

    /// Drive `signal` high
    pub async fn on(&mut self, signal: Signal) -> ScanResult<()> {
        self.output.set(signal, true).await
    }

    /// Drive `signal` low
    pub async fn off(&mut self, signal: Signal) -> ScanResult<()> {
        self.output.set(signal, false).await
    }

    /// On, hold for `width`, off. Returns after the falling edge.
    pub async fn pulse(&mut self, signal: Signal, width: Duration) -> ScanResult<()> {
        self.wait_pending(signal).await?;
        self.output.set(signal, true).await?;
        tokio::time::sleep(width).await;
        self.output.set(signal, false).await
    }

    /// Run a blink pattern, in the background if the pattern says so.
    ///
    /// A new background blink replaces one still running on the same line.
    pub async fn blink(&mut self, signal: Signal, pattern: BlinkPattern) -> ScanResult<()> {
        if let Some(previous) = self.pending.remove(&signal) {
            if !previous.is_finished() {
                warn!(%signal, "replacing a blink that is still running");
                previous.abort();
            }
        }

        if !pattern.background {
            return run_blink(self.output.as_ref(), signal, pattern).await;
        }

        let output = Arc::clone(&self.output);
        let task = tokio::spawn(async move { run_blink(output.as_ref(), signal, pattern).await });
        self.pending.insert(signal, PulseHandle { task });
        Ok(())
    }

    /// True while a background blink on `signal` has not completed.
    pub fn is_pending(&self, signal: Signal) -> bool {
        self.pending
            .get(&signal)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Wait for a background blink on `signal` to complete.
    pub async fn wait_pending(&mut self, signal: Signal) -> ScanResult<()> {
        match self.pending.remove(&signal) {
            Some(handle) => handle.join().await,
            None => Ok(()),
        }
    }

    /// Wait for every background blink.
    pub async fn wait_all(&mut self) -> ScanResult<()> {
        for signal in [Signal::Pixel, Signal::Line, Signal::Frame] {
            self.wait_pending(signal).await?;
        }
        Ok(())
    }
}
