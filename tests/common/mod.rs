//! Shared fixtures for scan integration tests
//!
//! Every test drives a [`ScanEngine`] over the simulated controller and a
//! recording trigger output, on tokio's paused clock.

#![allow(dead_code)] // Not every test file uses every helper

use piezo_scan::adapters::MockAdapter;
use piezo_scan::axis::Axis;
use piezo_scan::scan::ScanEngine;
use piezo_scan::stage::PiezoStage;
use piezo_scan::trigger::RecordingTrigger;
use std::time::Duration;

pub type TestEngine = ScanEngine<MockAdapter, RecordingTrigger>;

pub fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// Engine with default configuration plus handles to inspect the link and triggers.
pub fn engine_with(link: MockAdapter) -> (TestEngine, MockAdapter, RecordingTrigger) {
    let recorder = RecordingTrigger::new();
    let engine = ScanEngine::new(PiezoStage::new(link.clone()), recorder.clone());
    (engine, link, recorder)
}

pub fn engine() -> (TestEngine, MockAdapter, RecordingTrigger) {
    engine_with(MockAdapter::new())
}

/// `(fast, slow)` coordinates of every fast-axis voltage set, pairing each
/// with the slow-axis voltage most recently set before it.
pub fn grid_points(link: &MockAdapter, fast: Axis, slow: Axis) -> Vec<(f64, f64)> {
    let mut current_slow = f64::NAN;
    let mut points = Vec::new();
    for (axis, volts) in link.voltage_sets() {
        if axis == slow {
            current_slow = volts;
        } else if axis == fast {
            points.push((volts, current_slow));
        }
    }
    points
}
