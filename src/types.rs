use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

// ─── Script data ────────────────────────────────────────────────────────────

/// One timestamped motion command from a loaded script.
/// Sequences are ordered by `at_ms`, non-decreasing (ties allowed but
/// discouraged). Immutable once loaded; replaced wholesale on reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptAction {
    /// Milliseconds from the start of the media timeline.
    pub at_ms: u64,
    /// Target position, 0 (fully retracted) to 99 (fully extended).
    pub pos: u8,
}

impl fmt::Display for ScriptAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms→{}", self.at_ms, self.pos)
    }
}

// ─── Device commands ────────────────────────────────────────────────────────

/// A single motion command bound for the device. Transient: created per
/// dispatch, consumed by the scheduler, discarded after send.
#[derive(Debug, Clone, Copy)]
pub struct DeviceCommand {
    /// Target position, 0–99.
    pub position: u8,
    /// Traversal speed, 0–99 (clamped to device-safe bounds before here).
    pub speed: u8,
    /// When the command was produced (for staleness diagnostics).
    pub issued_at: Instant,
}

impl DeviceCommand {
    pub fn new(position: u8, speed: u8) -> Self {
        Self {
            position: position.min(POSITION_MAX),
            speed: speed.min(SPEED_MAX),
            issued_at: Instant::now(),
        }
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pos={} spd={}", self.position, self.speed)
    }
}

/// Hardware-imposed command bounds. Positions outside 0–99 are clamped at
/// load; speeds are clamped to this window at the predictor→scheduler
/// boundary. A speed of 0 stalls real hardware and values near the raw
/// ceiling exceed what some firmware accepts, hence the narrowed window.
#[derive(Debug, Clone, Copy)]
pub struct DeviceLimits {
    pub min_speed: u8,
    pub max_speed: u8,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            min_speed: 20,
            max_speed: 95,
        }
    }
}

impl DeviceLimits {
    /// Clamp a predicted speed into the device-safe window.
    pub fn clamp_speed(&self, speed: u8) -> u8 {
        speed.clamp(self.min_speed, self.max_speed)
    }
}

// ─── Device roster ──────────────────────────────────────────────────────────

/// A device as reported by the control server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Server-assigned index, stable for the life of the connection.
    pub index: u32,
    pub name: String,
    /// Command message types the device accepts.
    pub messages: Vec<String>,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.index, self.name)
    }
}

/// Roster-change notifications surfaced to observers (UI, tests).
/// Produced only from the transport's dispatch context.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Added(DeviceInfo),
    Removed(u32),
    ScanningFinished,
}

// ─── Playback ───────────────────────────────────────────────────────────────

/// Playback driver state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Playing,
    Seeking,
}

// ─── Session clock ──────────────────────────────────────────────────────────

/// Monotonic clock standing in for the video playback position when the
/// engine runs without a real player attached.
#[derive(Clone)]
pub struct SessionClock {
    start: Instant,
}

impl SessionClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Constants ──────────────────────────────────────────────────────────────

/// Top of the position range understood by the device protocol.
pub const POSITION_MAX: u8 = 99;
/// Top of the speed range understood by the device protocol.
pub const SPEED_MAX: u8 = 99;
