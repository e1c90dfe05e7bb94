//! Recording trigger output for tests.
//!
//! Every edge is stored with its tokio timestamp; clones share the record.

use super::{Signal, TriggerOutput};
use crate::error::{ScanError, ScanResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// One edge on one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerEvent {
    /// Time of the edge (tokio clock)
    pub at: Instant,
    /// Line that changed
    pub signal: Signal,
    /// Level after the edge
    pub high: bool,
}

/// A completed high period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pulse {
    /// Rising edge
    pub rise: Instant,
    /// Falling edge
    pub fall: Instant,
}

impl Pulse {
    /// Time spent high
    pub fn width(&self) -> Duration {
        self.fall - self.rise
    }
}

/// Trigger output that records every edge with its timestamp.
///
/// Clones share the same log, so a test can keep one and hand the other to
/// the engine.
#[derive(Clone, Default)]
pub struct RecordingTrigger {
    events: Arc<Mutex<Vec<TriggerEvent>>>,
    fail_next: Arc<AtomicBool>,
}

impl RecordingTrigger {
    /// Empty log, no failure armed
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `set` call fail
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Every edge so far, oldest first
    pub fn events(&self) -> Vec<TriggerEvent> {
        self.lock().clone()
    }

    /// Completed pulses on `signal`, in order. Redundant edges are ignored.
    pub fn pulses(&self, signal: Signal) -> Vec<Pulse> {
        let mut pulses = Vec::new();
        let mut rise = None;
        for event in self.lock().iter().filter(|e| e.signal == signal) {
            match (event.high, rise) {
                (true, None) => rise = Some(event.at),
                (false, Some(at)) => {
                    pulses.push(Pulse {
                        rise: at,
                        fall: event.at,
                    });
                    rise = None;
                }
                _ => {}
            }
        }
        pulses
    }

    /// Current level of `signal`
    pub fn is_high(&self, signal: Signal) -> bool {
        self.lock()
            .iter()
            .rev()
            .find(|e| e.signal == signal)
            .is_some_and(|e| e.high)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TriggerEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl TriggerOutput for RecordingTrigger {
    async fn set(&self, signal: Signal, high: bool) -> ScanResult<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ScanError::Trigger(format!("injected failure on {}", signal)));
        }
        self.lock().push(TriggerEvent {
            at: Instant::now(),
            signal,
            high,
        });
        Ok(())
    }
}
