//! # Diagnostics
//!
//! Structured non-fatal findings accumulated during a single extraction.
//!
//! Nothing here aborts a document. Unknown instrument names feed the
//! keyboard-vocabulary curation loop, ambiguous keyboard parts explain why
//! a document produced no features, and unrecognized tags flag material
//! a future format revision may have introduced.
//!
//! The collector is passed explicitly through parsing and classification
//! rather than held in module state, so concurrent extractions never share
//! anything.

use serde::Serialize;
use std::collections::BTreeSet;

/// A keyboard part whose staff count prevented a left/right hand split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AmbiguousPart {
    pub part_name: String,
    pub staff_count: usize,
}

/// Non-fatal findings from one extraction run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Diagnostics {
    /// Candidate instrument strings that matched no known keyboard name,
    /// case-folded. Collected only from parts that failed to classify.
    pub unknown_instruments: BTreeSet<String>,
    /// Keyboard parts skipped because they do not have exactly two staves.
    pub ambiguous_parts: Vec<AmbiguousPart>,
    /// Additional two-staff keyboard parts beyond the one used.
    pub surplus_parts: Vec<String>,
    /// Event-stream child tags no dialect record recognizes, as
    /// `Parent/tag` pairs.
    pub unknown_tags: BTreeSet<String>,
    /// Children observed on records that are known to sometimes carry them
    /// but are not parsed yet, as `Record/tag` pairs.
    pub unexpected_fields: BTreeSet<String>,
}

impl Diagnostics {
    pub fn note_unknown_instrument(&mut self, value: &str) {
        log::debug!("unknown instrument name: {value:?}");
        self.unknown_instruments.insert(value.to_string());
    }

    pub fn note_ambiguous_part(&mut self, part_name: &str, staff_count: usize) {
        log::warn!("keyboard part {part_name:?} has {staff_count} staves, skipping");
        self.ambiguous_parts.push(AmbiguousPart {
            part_name: part_name.to_string(),
            staff_count,
        });
    }

    pub fn note_surplus_part(&mut self, part_name: &str) {
        log::warn!("additional keyboard part {part_name:?} ignored");
        self.surplus_parts.push(part_name.to_string());
    }

    pub fn note_unknown_tag(&mut self, parent: &str, tag: &str) {
        log::debug!("skipping unknown tag <{tag}> in <{parent}>");
        self.unknown_tags.insert(format!("{parent}/{tag}"));
    }

    pub fn note_unexpected_field(&mut self, record: &str, tag: &str) {
        log::debug!("found tag <{tag}> in <{record}>");
        self.unexpected_fields.insert(format!("{record}/{tag}"));
    }
}
