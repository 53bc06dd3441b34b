//! # Feature Extraction Engine
//!
//! Computes the seven difficulty statistics from the reconstructed staves
//! of a keyboard part.
//!
//! ## Capability Interface
//!
//! The three format dialects share no data-level types, so the engine is
//! written once against [`StaffMetrics`]. A dialect exposes a staff through
//! the four required methods and inherits the per-staff statistics from the
//! provided methods:
//!
//! - `notes()` - the raw note stream (pre-merge), for pitch statistics
//! - `merged_chords()` - chord strokes after voice merging, for the hand
//!   statistics
//! - `stroke_tick_sets()` - per-measure distinct stroke ticks
//! - `playing_speed()` - needs document-level tempo context, so each
//!   dialect computes it with [`average_playing_speed`]
//!
//! ## Statistics
//!
//! | field | meaning |
//! |-------|---------|
//! | PS    | playing speed, tick-length weighted over tempo segments |
//! | PE    | Shannon entropy of the MIDI pitch multiset |
//! | DSR   | 1 - shared stroke ticks / all stroke ticks, across staves |
//! | HDR   | mean pairwise chord displacement cost / 2 |
//! | HS    | distance between the two staves' mean pitches |
//! | PPR   | multi-note fraction of non-tied chord strokes |
//! | ANR   | fraction of notes carrying an accidental |
//!
//! Every reported float is rounded to five significant digits. A statistic
//! whose input is empty is absent rather than zero.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::stats::{entropy, round_to_significant};

/// Significant digits kept in reported feature values.
pub const SIGNIFICANT_DIGITS: i32 = 5;

/// One value per hand. `left` is the higher-numbered staff of the keyboard
/// part, `right` the lower-numbered one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HandPair {
    pub left: Option<f64>,
    pub right: Option<f64>,
}

/// The difficulty statistics extracted from one document.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Features {
    pub playing_speed: HandPair,
    pub pitch_entropy: Option<f64>,
    pub distinct_stroke_rate: Option<f64>,
    pub hand_displacement_rate: HandPair,
    pub hand_stretch: Option<f64>,
    pub polyphony_rate: HandPair,
    pub altered_note_rate: Option<f64>,
}

/// A note as seen by the pitch statistics: raw stream order, before voice
/// merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotePoint {
    /// MIDI note number.
    pub pitch: i32,
    /// Carries an explicit accidental marking.
    pub altered: bool,
}

/// A merged chord stroke as seen by the hand statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChordPoint {
    /// Notes sounding in the stroke.
    pub notes: usize,
    /// Every note continues a tie from the previous stroke.
    pub all_tied: bool,
    /// Lowest MIDI pitch in the stroke.
    pub low: i32,
    /// Highest MIDI pitch in the stroke.
    pub high: i32,
}

/// Per-staff view consumed by the engine, implemented independently by the
/// three dialect modules.
pub trait StaffMetrics {
    /// Notes in raw stream order, before voice merging.
    fn notes(&self) -> Vec<NotePoint>;

    /// Chord strokes after voice merging, in tick order.
    fn merged_chords(&self) -> Vec<ChordPoint>;

    /// Distinct stroke ticks for each measure, in measure order.
    fn stroke_tick_sets(&self) -> Vec<BTreeSet<i64>>;

    /// Tick-length weighted playing speed, absent when the document has no
    /// tempo markings.
    fn playing_speed(&self) -> Option<f64>;

    /// Mean MIDI pitch, absent when the staff has no notes.
    fn average_pitch(&self) -> Option<f64> {
        let notes = self.notes();
        if notes.is_empty() {
            return None;
        }
        let sum: i64 = notes.iter().map(|n| n.pitch as i64).sum();
        Some(sum as f64 / notes.len() as f64)
    }

    /// Mean pairwise displacement cost between consecutive chord strokes,
    /// halved. Absent when the staff has no chords.
    fn hand_displacement_rate(&self) -> Option<f64> {
        let chords = self.merged_chords();
        if chords.is_empty() {
            return None;
        }
        let costs: Vec<f64> = chords
            .windows(2)
            .map(|pair| displacement_cost(&pair[0], &pair[1]))
            .collect();
        // a single chord yields an empty cost list and a NaN mean
        Some(costs.iter().sum::<f64>() / costs.len() as f64 / 2.0)
    }

    /// Fraction of non-tied chord strokes sounding more than one note.
    /// Absent when no stroke qualifies.
    fn polyphony_rate(&self) -> Option<f64> {
        let mut strokes = 0u64;
        let mut chord_strokes = 0u64;
        for chord in self.merged_chords() {
            // a fully tied stroke only lengthens the previous one
            if !chord.all_tied {
                strokes += 1;
                if chord.notes > 1 {
                    chord_strokes += 1;
                }
            }
        }
        if strokes == 0 {
            return None;
        }
        Some(chord_strokes as f64 / strokes as f64)
    }
}

/// Movement cost between two consecutive chord strokes: 2 when the pitch
/// span across both is at least an octave, 1 when at least a fifth, else 0.
pub fn displacement_cost(a: &ChordPoint, b: &ChordPoint) -> f64 {
    let span = a.high.max(b.high) - a.low.min(b.low);
    if span >= 12 {
        2.0
    } else if span >= 7 {
        1.0
    } else {
        0.0
    }
}

/// Segment index for a stroke tick against sorted tempo ticks. A tick
/// before the first tempo falls into the final segment.
pub fn tempo_segment(tempo_ticks: &[i64], tick: i64) -> usize {
    let idx = tempo_ticks.partition_point(|&t| t <= tick);
    if idx == 0 {
        tempo_ticks.len() - 1
    } else {
        idx - 1
    }
}

/// Tick-length weighted average playing speed over tempo segments.
///
/// `tempos` holds `(tick, relative tempo value)` pairs sorted by tick, and
/// `pulsations[i]` the pulsation of every chord stroke in segment `i`. A
/// segment's speed is the mean chord pulsation divided by the tempo value,
/// or 0 when it has no chords; the average weighs each segment by its tick
/// span up to `last_tick`.
pub fn average_playing_speed(tempos: &[(i64, f64)], pulsations: &[Vec<f64>], last_tick: i64) -> f64 {
    let mut area = 0.0;
    for (i, &(tick, tempo)) in tempos.iter().enumerate() {
        let segment = &pulsations[i];
        let speed = if segment.is_empty() {
            0.0
        } else {
            segment.iter().sum::<f64>() / tempo / segment.len() as f64
        };
        let next_tick = tempos.get(i + 1).map_or(last_tick, |t| t.0);
        area += (next_tick - tick) as f64 * speed;
    }
    area / last_tick as f64
}

/// `1 - shared / all` over the zipped per-staff measure sequences, where
/// shared counts stroke ticks present in every staff's measure and all
/// counts ticks present in any. Absent when no measures align.
pub fn distinct_stroke_rate(staffs: &[&dyn StaffMetrics]) -> Option<f64> {
    let per_staff: Vec<Vec<BTreeSet<i64>>> = staffs.iter().map(|s| s.stroke_tick_sets()).collect();
    let measure_count = per_staff.iter().map(Vec::len).min()?;
    let mut shared = 0usize;
    let mut all = 0usize;
    for m in 0..measure_count {
        let mut intersection = per_staff[0][m].clone();
        let mut union = per_staff[0][m].clone();
        for staff in &per_staff[1..] {
            intersection = intersection.intersection(&staff[m]).copied().collect();
            union = union.union(&staff[m]).copied().collect();
        }
        shared += intersection.len();
        all += union.len();
    }
    if all == 0 {
        return None;
    }
    Some(1.0 - shared as f64 / all as f64)
}

/// Compute the full feature record from the qualifying staves, lower hand
/// first in the paired statistics.
pub fn collect_features(staffs: &[&dyn StaffMetrics]) -> Features {
    let mut avg_pitches = Vec::with_capacity(staffs.len());
    let mut ps = Vec::with_capacity(staffs.len());
    let mut hdr = Vec::with_capacity(staffs.len());
    let mut ppr = Vec::with_capacity(staffs.len());
    // reversed so index 0 is the higher-numbered staff (lower hand)
    for staff in staffs.iter().rev() {
        avg_pitches.push(staff.average_pitch());
        ps.push(staff.playing_speed());
        hdr.push(staff.hand_displacement_rate());
        ppr.push(staff.polyphony_rate());
    }

    let hand_stretch = match (avg_pitches.first().copied().flatten(), avg_pitches.get(1).copied().flatten()) {
        (Some(a), Some(b)) if avg_pitches.len() == 2 => Some((b - a).abs()),
        _ => None,
    };

    let mut occurrences: BTreeMap<i32, u64> = BTreeMap::new();
    let mut altered = 0u64;
    let mut total = 0u64;
    for staff in staffs {
        for note in staff.notes() {
            *occurrences.entry(note.pitch).or_insert(0) += 1;
            if note.altered {
                altered += 1;
            }
            total += 1;
        }
    }
    let pitch_entropy = if total == 0 {
        None
    } else {
        let counts: Vec<u64> = occurrences.values().copied().collect();
        Some(entropy(&counts))
    };
    let altered_note_rate = if total == 0 {
        None
    } else {
        Some(altered as f64 / total as f64)
    };

    let distinct = distinct_stroke_rate(staffs);

    Features {
        playing_speed: hand_pair(&ps),
        pitch_entropy: pitch_entropy.map(round),
        distinct_stroke_rate: distinct.map(round),
        hand_displacement_rate: hand_pair(&hdr),
        hand_stretch: hand_stretch.map(round),
        polyphony_rate: hand_pair(&ppr),
        altered_note_rate: altered_note_rate.map(round),
    }
}

fn round(value: f64) -> f64 {
    round_to_significant(value, SIGNIFICANT_DIGITS)
}

fn hand_pair(values: &[Option<f64>]) -> HandPair {
    HandPair {
        left: values.first().copied().flatten().map(round),
        right: values.get(1).copied().flatten().map(round),
    }
}
