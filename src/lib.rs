//! # musefeat
//!
//! Difficulty feature extraction for MuseScore notation archives.
//!
//! The pipeline ingests a score package (a zip archive holding one
//! notation document), parses the document with the parser matching its
//! declared format version, reconstructs an absolute tick timeline for
//! every staff, merges concurrent voices into one canonical stroke
//! sequence per measure, and derives seven difficulty statistics from the
//! staves of the document's keyboard part.
//!
//! ## Pipeline
//! 1. Locate the notation entry in the archive ([`archive`])
//! 2. Dispatch on the declared version to a dialect parser ([`dialect`])
//! 3. Reconstruct ticks and merge voices (inside each dialect module)
//! 4. Classify keyboard staves ([`piano`]) and compute [`Features`]
//!
//! Everything is synchronous and per-document independent; callers may
//! run any number of extractions in parallel.
//!
//! ## Example
//! ```rust,no_run
//! use musefeat::extract_archive;
//!
//! let data = std::fs::read("1234.mscz")?;
//! let extraction = extract_archive(&data, "1234")?;
//! match extraction.features {
//!     Some(features) => println!("{features:?}"),
//!     None => println!("no two-staff keyboard part"),
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod archive;
pub mod diag;
pub mod dialect;
pub mod duration;
pub mod error;
pub mod features;
pub mod meta;
pub mod piano;
pub mod stats;

pub use diag::Diagnostics;
pub use dialect::{parse_document, Document};
pub use error::ExtractError;
pub use features::{collect_features, Features, HandPair, StaffMetrics};
pub use meta::ScoreMeta;

/// Everything produced from one document: the feature record when a
/// keyboard part was found, the identification metadata, and the non-fatal
/// findings accumulated along the way.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub features: Option<Features>,
    pub meta: ScoreMeta,
    pub diagnostics: Diagnostics,
}

/// Extract difficulty features from a score package.
/// This is the main entry point for the library.
///
/// `id` identifies the document towards the caller (typically the archive
/// file stem) and is echoed back in the metadata record.
pub fn extract_archive(data: &[u8], id: &str) -> Result<Extraction, ExtractError> {
    let (entry, xml) = archive::read_primary_document(data)?;
    extract_with_entry(&xml, id, &entry)
}

/// Extract difficulty features from an already-unpacked notation document.
pub fn extract_document(xml: &str, id: &str) -> Result<Extraction, ExtractError> {
    extract_with_entry(xml, id, "")
}

fn extract_with_entry(xml: &str, id: &str, entry: &str) -> Result<Extraction, ExtractError> {
    let mut diagnostics = Diagnostics::default();
    let document = dialect::parse_document(xml, &mut diagnostics)?;
    let features = document.features(&mut diagnostics);
    let meta = ScoreMeta::from_document(id, entry, &document);
    Ok(Extraction {
        features,
        meta,
        diagnostics,
    })
}
