//! Rhythmic pattern detection over beat timestamp sequences.
//!
//! The editor workflow marks beats as bare timestamps; to materialize motion
//! from them we first find which known rhythmic figure the beats follow.
//! Each catalog pattern is a fixed-length boolean cycle: which sub-beat
//! slots of one bar carry a stroke. Matching slides over the timestamps,
//! locks a working cycle duration, then greedily extends the run one beat at
//! a time while the cumulative signed drift between predicted and actual
//! beat times stays inside the tolerance.

use log::debug;

/// Maximum cumulative drift between predicted and actual beat times before
/// a run is cut.
pub const DRIFT_TOLERANCE_MS: f64 = 200.0;

/// Consecutive unmatched start positions to probe before conceding the
/// region and logging it.
const PROBE_RETRIES: usize = 8;

// ─── Patterns ───────────────────────────────────────────────────────────────

/// One rhythmic figure: a cyclic boolean mask over sub-beat slots.
/// Slot 0 is always active; a cycle is anchored on its first stroke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeatPattern {
    pub name: &'static str,
    pub slots: &'static [bool],
}

impl BeatPattern {
    /// Indices of the active slots within one cycle.
    pub fn active_offsets(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, &on)| on)
            .map(|(i, _)| i)
            .collect()
    }

    /// Active strokes per cycle.
    pub fn active_per_cycle(&self) -> usize {
        self.slots.iter().filter(|&&on| on).count()
    }

    /// A usable pattern has at least one slot, at least one active beat,
    /// and is anchored on slot 0.
    pub fn is_valid(&self) -> bool {
        !self.slots.is_empty() && self.active_per_cycle() > 0 && self.slots[0]
    }
}

const T: bool = true;
const F: bool = false;

/// Catalog of known figures, densest first: on equal match length the
/// densest interpretation wins.
pub const KNOWN_PATTERNS: &[BeatPattern] = &[
    BeatPattern {
        name: "every-beat",
        slots: &[T, T, T, T, T, T, T, T],
    },
    BeatPattern {
        name: "seven-of-eight",
        slots: &[T, T, T, T, T, T, T, F],
    },
    BeatPattern {
        name: "gallop",
        slots: &[T, T, F, F, T, T, F, F],
    },
    BeatPattern {
        name: "half-beat",
        slots: &[T, F, T, F, T, F, T, F],
    },
    BeatPattern {
        name: "triplet-rest",
        slots: &[T, F, F, T, F, F, T, F],
    },
    BeatPattern {
        name: "quarter-beat",
        slots: &[T, F, F, F, T, F, F, F],
    },
    BeatPattern {
        name: "whole-bar",
        slots: &[T, F, F, F, F, F, F, F],
    },
];

// ─── Segments ───────────────────────────────────────────────────────────────

/// A contiguous run of beats that fits one pattern.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeatSegment {
    /// Timestamp of the first matched beat.
    pub start_ms: u64,
    /// Working cycle duration after refinement over the whole run.
    pub cycle_ms: f64,
    /// Time the run spans, through the end of its last started cycle.
    pub total_ms: f64,
    /// Matched beat count.
    pub beats: usize,
    pub pattern: BeatPattern,
}

#[derive(Debug, Clone, Copy)]
struct CandidateMatch {
    beats: usize,
    cycles: usize,
    cycle_ms: f64,
}

// ─── Matching ───────────────────────────────────────────────────────────────

/// Try to match `pattern` against `beats` starting at index `start`.
///
/// The first full cycle (the gap from the first beat to the first beat of
/// the next cycle) seeds the working cycle duration; every further beat must
/// land within `tolerance_ms` of its predicted time, and the estimate is
/// re-derived at each completed cycle boundary. The final estimate divides
/// the elapsed span by the repeats it implies. The fractional tail after
/// the cycle's last active beat is discounted, since nothing inside the
/// cycle bounds that beat's duration.
fn match_at(
    beats: &[u64],
    start: usize,
    pattern: &BeatPattern,
    tolerance_ms: f64,
) -> Option<CandidateMatch> {
    if !pattern.is_valid() {
        return None;
    }
    let offsets = pattern.active_offsets();
    let per_cycle = offsets.len();
    let slot_count = pattern.slots.len() as f64;

    // Need one full cycle plus its closing beat to seed the estimate.
    if start + per_cycle >= beats.len() {
        return None;
    }
    let base = beats[start];
    let first_cycle = (beats[start + per_cycle] - base) as f64;
    if first_cycle <= 0.0 {
        return None;
    }

    let mut cycle = first_cycle;
    let mut matched = 1usize; // beat 0 anchors the run
    for m in 1.. {
        let idx = start + m;
        if idx >= beats.len() {
            break;
        }
        let cycle_no = m / per_cycle;
        let slot = offsets[m % per_cycle];
        let predicted = (cycle_no as f64 + slot as f64 / slot_count) * cycle;
        let actual = (beats[idx] - base) as f64;
        if (actual - predicted).abs() > tolerance_ms {
            break;
        }
        matched += 1;
        if m % per_cycle == 0 {
            // Completed cycle boundary: re-derive the working estimate.
            cycle = actual / cycle_no as f64;
        }
    }

    // A run shorter than one closed cycle proves nothing.
    if matched <= per_cycle {
        return None;
    }

    let last = matched - 1;
    let implied_cycles =
        (last / per_cycle) as f64 + offsets[last % per_cycle] as f64 / slot_count;
    if implied_cycles <= 0.0 {
        return None;
    }
    let elapsed = (beats[start + last] - base) as f64;
    let cycle_ms = elapsed / implied_cycles;

    Some(CandidateMatch {
        beats: matched,
        cycles: last / per_cycle + 1,
        cycle_ms,
    })
}

/// Segment a monotonic beat timestamp sequence against the pattern catalog.
///
/// At each position, the pattern matching the most beats wins; positions
/// where nothing matches are skipped (gaps produce no segment). After
/// `PROBE_RETRIES` consecutive misses the region is conceded with a debug
/// line and scanning simply continues.
pub fn segment_beats(beats: &[u64], catalog: &[BeatPattern], tolerance_ms: f64) -> Vec<BeatSegment> {
    debug_assert!(
        beats.windows(2).all(|w| w[0] <= w[1]),
        "beat timestamps must be monotonic"
    );
    let mut segments = Vec::new();
    let mut index = 0;
    let mut misses = 0;
    while index < beats.len() {
        // First strictly-better match wins: catalog order breaks ties.
        let mut best: Option<(&BeatPattern, CandidateMatch)> = None;
        for pattern in catalog {
            if let Some(m) = match_at(beats, index, pattern, tolerance_ms) {
                if best.map_or(true, |(_, b)| m.beats > b.beats) {
                    best = Some((pattern, m));
                }
            }
        }
        match best {
            Some((pattern, m)) => {
                segments.push(BeatSegment {
                    start_ms: beats[index],
                    cycle_ms: m.cycle_ms,
                    total_ms: m.cycles as f64 * m.cycle_ms,
                    beats: m.beats,
                    pattern: *pattern,
                });
                index += m.beats;
                misses = 0;
            }
            None => {
                index += 1;
                misses += 1;
                if misses >= PROBE_RETRIES {
                    debug!("No pattern fits near beat index {}; moving on", index);
                    misses = 0;
                }
            }
        }
    }
    segments
}

/// Catalog segmentation with the standard tolerance.
pub fn segment(beats: &[u64]) -> Vec<BeatSegment> {
    segment_beats(beats, KNOWN_PATTERNS, DRIFT_TOLERANCE_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUARTER: BeatPattern = BeatPattern {
        name: "quarter-test",
        slots: &[T, F, F, F],
    };

    /// `cycles` repeats of `pattern` at `cycle_ms`, zero jitter.
    fn synthesize(pattern: &BeatPattern, cycle_ms: u64, cycles: usize) -> Vec<u64> {
        let slot_ms = cycle_ms as f64 / pattern.slots.len() as f64;
        let mut out = Vec::new();
        for c in 0..cycles {
            for (i, &on) in pattern.slots.iter().enumerate() {
                if on {
                    out.push((c as u64 * cycle_ms) + (i as f64 * slot_ms).round() as u64);
                }
            }
        }
        out
    }

    #[test]
    fn test_exact_repeats_form_one_segment() {
        // Pattern [T,F,F,F] × 5 at a fixed cycle: exactly one segment
        // spanning all five cycles.
        let beats = synthesize(&QUARTER, 1000, 5);
        let segments = segment_beats(&beats, &[QUARTER], DRIFT_TOLERANCE_MS);
        assert_eq!(segments.len(), 1);
        let seg = &segments[0];
        assert_eq!(seg.start_ms, 0);
        assert_eq!(seg.beats, 5);
        assert!((seg.cycle_ms - 1000.0).abs() < 1e-6);
        assert!((seg.total_ms - 5000.0).abs() < 1e-6);
    }

    #[test]
    fn test_excess_jitter_splits_the_run() {
        // Push cycle 3's beat past the tolerance: two segments, before and
        // after the discontinuity.
        let mut beats = synthesize(&QUARTER, 1000, 5);
        for b in beats.iter_mut().skip(3) {
            *b += 350; // > 200ms drift from cycle 3 onward
        }
        let segments = segment_beats(&beats, &[QUARTER], DRIFT_TOLERANCE_MS);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].beats, 3);
        assert_eq!(segments[1].beats, 2);
        assert_eq!(segments[1].start_ms, 3350);
    }

    #[test]
    fn test_small_jitter_tolerated() {
        let mut beats = synthesize(&QUARTER, 1000, 6);
        // ±60ms wobble stays well inside the tolerance.
        for (i, b) in beats.iter_mut().enumerate() {
            if i % 2 == 1 {
                *b += 60;
            }
        }
        let segments = segment_beats(&beats, &[QUARTER], DRIFT_TOLERANCE_MS);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].beats, 6);
    }

    #[test]
    fn test_multi_slot_pattern_matches_offsets() {
        let half = BeatPattern {
            name: "half-test",
            slots: &[T, F, T, F],
        };
        let beats = synthesize(&half, 1000, 4); // strokes every 500ms
        let segments = segment_beats(&beats, &[half], DRIFT_TOLERANCE_MS);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].beats, 8);
        assert!((segments[0].cycle_ms - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn test_catalog_prefers_longest_match() {
        // Uniform 250ms beats: several catalog figures fit, all matching
        // every beat; the densest (first) interpretation is reported.
        let beats: Vec<u64> = (0..32).map(|i| i * 250).collect();
        let segments = segment(&beats);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].beats, 32);
        assert_eq!(segments[0].pattern.name, "every-beat");
    }

    #[test]
    fn test_unmatched_gap_is_skipped_silently() {
        // A clean run, then a stray beat nothing can anchor a cycle on.
        let mut beats = synthesize(&QUARTER, 1000, 4);
        beats.push(9000);
        let segments = segment_beats(&beats, &[QUARTER], DRIFT_TOLERANCE_MS);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].beats, 4);
    }

    #[test]
    fn test_zero_active_pattern_rejected() {
        let dead = BeatPattern {
            name: "dead",
            slots: &[F, F, F, F],
        };
        assert!(!dead.is_valid());
        let beats: Vec<u64> = (0..8).map(|i| i * 500).collect();
        assert!(segment_beats(&beats, &[dead], DRIFT_TOLERANCE_MS).is_empty());
    }

    #[test]
    fn test_tied_timestamps_do_not_divide_by_zero() {
        // Zero-width first cycle must read as no-match, not a fault.
        let beats = vec![1000, 1000, 1000, 1000];
        let every = BeatPattern {
            name: "every-test",
            slots: &[T],
        };
        assert!(segment_beats(&beats, &[every], DRIFT_TOLERANCE_MS).is_empty());
    }

    #[test]
    fn test_too_few_beats_no_match() {
        let beats = vec![0];
        assert!(segment_beats(&beats, &[QUARTER], DRIFT_TOLERANCE_MS).is_empty());
        assert!(segment(&[]).is_empty());
    }
}
