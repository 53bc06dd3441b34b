//! # Keyboard-Part Classification
//!
//! Decides whether a part belongs to a two-handed keyboard instrument by
//! matching its display and instrument names against a fixed vocabulary.
//!
//! Matching is case-folded. Candidate strings that match nothing are kept
//! in the diagnostics collector so the vocabulary can be grown from real
//! corpus data; they are never an error.

use crate::diag::Diagnostics;

/// Names that identify a keyboard part, lowercase.
const KNOWN_KEYBOARD_NAMES: &[&str] = &[
    "piano",
    "grand piano",
    "keyboard",
    "pno.",
    "ピアノ",
    "keyboard.piano",
    "keyboard.harpsichord",
];

/// Returns true when any candidate string case-folds to a known keyboard
/// name. Candidates are checked in order and the first match wins; misses
/// are recorded only when the whole part fails to classify.
pub fn is_keyboard_part<'a, I>(candidates: I, diag: &mut Diagnostics) -> bool
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    let mut misses: Vec<String> = Vec::new();
    for value in candidates.into_iter().flatten() {
        if value.is_empty() {
            continue;
        }
        let folded = value.to_lowercase();
        if KNOWN_KEYBOARD_NAMES.contains(&folded.as_str()) {
            return true;
        }
        misses.push(folded);
    }
    for miss in &misses {
        diag.note_unknown_instrument(miss);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_case_folded() {
        let mut diag = Diagnostics::default();
        assert!(is_keyboard_part([Some("Piano")], &mut diag));
        assert!(is_keyboard_part([Some("GRAND PIANO")], &mut diag));
        assert!(is_keyboard_part([Some("keyboard.piano")], &mut diag));
        assert!(is_keyboard_part([Some("ピアノ")], &mut diag));
        assert!(diag.unknown_instruments.is_empty());
    }

    #[test]
    fn test_first_match_wins_over_later_candidates() {
        let mut diag = Diagnostics::default();
        assert!(is_keyboard_part([Some("Violin"), Some("Pno.")], &mut diag));
        // the miss before the match is discarded
        assert!(diag.unknown_instruments.is_empty());
    }

    #[test]
    fn test_misses_recorded_on_failure() {
        let mut diag = Diagnostics::default();
        assert!(!is_keyboard_part(
            [Some("Violin"), None, Some(""), Some("strings.violin")],
            &mut diag
        ));
        assert!(diag.unknown_instruments.contains("violin"));
        assert!(diag.unknown_instruments.contains("strings.violin"));
        assert_eq!(diag.unknown_instruments.len(), 2);
    }
}
