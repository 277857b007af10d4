//! Script file loading.
//!
//! Two input shapes feed the engine: funscript JSON documents with an
//! `actions` array of `{at (ms), pos}` objects, and plain-text beat files
//! with one timestamp per line (seconds, fractional allowed) for beat-only
//! editor data. Loaders normalize on the way in (positions clamped to the
//! device range, actions sorted by timestamp) so downstream code can rely
//! on the ordering invariant.

use crate::types::{ScriptAction, POSITION_MAX};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("parse funscript: {0}")]
    Json(#[from] serde_json::Error),
    #[error("line {line}: bad timestamp {text:?}")]
    BadTimestamp { line: usize, text: String },
    #[error("script contains no actions")]
    Empty,
}

// ─── Funscript ──────────────────────────────────────────────────────────────

/// Raw action as it appears in the file. `pos` is a float in the wild
/// (some generators emit fractional positions) and occasionally out of
/// range; both are normalized on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RawAction {
    at: u64,
    pos: f64,
}

/// Funscript document shell. Metadata fields vary wildly between
/// generators; everything except `actions` is ignored.
#[derive(Debug, Deserialize)]
struct FunscriptDoc {
    actions: Vec<RawAction>,
}

/// Parse funscript JSON text into a normalized action sequence.
pub fn parse_funscript(text: &str) -> Result<Vec<ScriptAction>, ScriptError> {
    let doc: FunscriptDoc = serde_json::from_str(text)?;
    if doc.actions.is_empty() {
        return Err(ScriptError::Empty);
    }
    let mut out_of_range = 0usize;
    let mut actions: Vec<ScriptAction> = doc
        .actions
        .into_iter()
        .map(|raw| {
            let rounded = raw.pos.round();
            if !(0.0..=POSITION_MAX as f64).contains(&rounded) {
                out_of_range += 1;
            }
            ScriptAction {
                at_ms: raw.at,
                pos: rounded.clamp(0.0, POSITION_MAX as f64) as u8,
            }
        })
        .collect();
    if out_of_range > 0 {
        warn!("Clamped {} out-of-range position(s)", out_of_range);
    }
    actions.sort_by_key(|a| a.at_ms);
    Ok(actions)
}

/// Load and parse a funscript file.
pub fn load_funscript(path: &Path) -> Result<Vec<ScriptAction>, ScriptError> {
    let text = fs::read_to_string(path).map_err(|e| ScriptError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let actions = parse_funscript(&text)?;
    info!(
        "Loaded {}: {} actions, {:.1}s",
        path.display(),
        actions.len(),
        actions.last().map(|a| a.at_ms).unwrap_or(0) as f64 / 1000.0
    );
    Ok(actions)
}

// ─── Beat files ─────────────────────────────────────────────────────────────

/// Parse a plain-text beat file: one timestamp in seconds per line.
/// Blank lines and `#` comments are skipped. Output is sorted milliseconds.
pub fn parse_beat_times(text: &str) -> Result<Vec<u64>, ScriptError> {
    let mut beats = Vec::new();
    for (n, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let seconds: f64 = trimmed.parse().map_err(|_| ScriptError::BadTimestamp {
            line: n + 1,
            text: trimmed.to_string(),
        })?;
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(ScriptError::BadTimestamp {
                line: n + 1,
                text: trimmed.to_string(),
            });
        }
        beats.push((seconds * 1000.0).round() as u64);
    }
    beats.sort_unstable();
    Ok(beats)
}

/// Load and parse a beat timestamp file.
pub fn load_beat_times(path: &Path) -> Result<Vec<u64>, ScriptError> {
    let text = fs::read_to_string(path).map_err(|e| ScriptError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    let beats = parse_beat_times(&text)?;
    info!("Loaded {}: {} beats", path.display(), beats.len());
    Ok(beats)
}
