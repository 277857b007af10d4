//! Speed prediction for position-targeting stroker hardware.
//!
//! The device takes `(position, speed)` pairs and moves at the commanded
//! speed until it reaches the target. To land on the target exactly when the
//! script's next action falls due, we model the hardware as covering its
//! full positional range in a fixed time at top speed
//! (`full_lengths_per_second`), plus a constant per-move reversal overhead
//! (`turnaround_delay`).

use crate::types::{POSITION_MAX, SPEED_MAX};

/// Calibration constants for one device model. The defaults fit the common
/// Bluetooth stroker firmware; both are CLI-tunable.
#[derive(Debug, Clone, Copy)]
pub struct SpeedPredictor {
    /// Full 0→99 traversals the device can make per second at speed 99.
    pub full_lengths_per_second: f64,
    /// Seconds lost to direction reversal per move.
    pub turnaround_delay: f64,
}

impl Default for SpeedPredictor {
    fn default() -> Self {
        Self {
            full_lengths_per_second: 6.0,
            turnaround_delay: 0.02,
        }
    }
}

impl SpeedPredictor {
    /// Speed (0–99) that traverses `position_delta` within `time_delta`
    /// seconds.
    ///
    /// Precondition: `time_delta > 0`. Same-timestamp action pairs must be
    /// filtered out by the caller; the playback driver never invokes the
    /// predictor across a zero time window.
    pub fn predict(&self, time_delta: f64, position_delta: u8) -> u8 {
        debug_assert!(time_delta > 0.0, "predict() requires a positive time window");
        let relative_length = position_delta.min(POSITION_MAX) as f64 / POSITION_MAX as f64;
        let duration_at_full_speed =
            self.turnaround_delay + relative_length / self.full_lengths_per_second;
        let speed = duration_at_full_speed / time_delta * SPEED_MAX as f64;
        speed.round().clamp(0.0, SPEED_MAX as f64) as u8
    }
}

/// Blend a new speed target against the previously commanded speed:
/// rise by 1/6 of the gap, fall by 1/2 of it.
///
/// The asymmetry (and both constants) are empirical, carried over from field
/// calibration against Kiiroo-generation hardware; no physical model backs
/// them. Opt-in via the driver's smoothing flag.
pub fn smooth_speed(previous: u8, target: u8) -> u8 {
    let prev = previous as f64;
    let tgt = target as f64;
    let blended = if tgt > prev {
        prev + (tgt - prev) / 6.0
    } else {
        prev - (prev - tgt) / 2.0
    };
    blended.round().clamp(0.0, SPEED_MAX as f64) as u8
}
