//! # Error Types
//!
//! This module defines all error types for the extraction pipeline.
//!
//! Errors are fatal to the single document being processed; a batch caller
//! recovers by skipping the document and moving on. Non-fatal conditions
//! (unknown instrument names, ambiguous hand assignment, unrecognized tags)
//! never surface here; they accumulate in [`crate::Diagnostics`] instead.
//!
//! ## Error Types
//! - `UnsupportedVersion` - the document declares a format version outside
//!   the three known dialect families
//! - `MalformedDocument` - a required field or child is missing where the
//!   dialect mandates it, or an internal consistency check failed
//! - `PrimaryDocumentNotFound` - the archive holds no notation document
//!
//! ## Usage
//! ```rust
//! use musefeat::{extract_archive, ExtractError};
//!
//! # let data: &[u8] = &[];
//! match extract_archive(data, "123") {
//!     Ok(extraction) => println!("{:?}", extraction.features),
//!     Err(ExtractError::UnsupportedVersion(v)) => {
//!         eprintln!("skipping document with version {}", v);
//!     }
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    /// The root element declares a version string that matches none of the
    /// known dialect families ("1.14", "2.06", "3.01"/"3.02").
    #[error("unsupported format version: {0:?}")]
    UnsupportedVersion(String),

    /// A required field or child element is absent where the dialect
    /// mandates it, or a reconstruction invariant failed (duplicate stroke
    /// tick, tempo marking with no following stroke, measure without
    /// strokes).
    #[error("malformed document: {0}")]
    MalformedDocument(String),

    /// The archive contains no entry with the notation-document extension.
    #[error("archive contains no score document entry")]
    PrimaryDocumentNotFound,

    /// The notation document is not well-formed XML.
    #[error("invalid XML: {0}")]
    Xml(#[from] roxmltree::Error),

    /// The container is not a readable zip archive.
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExtractError {
    /// Shorthand for [`ExtractError::MalformedDocument`] with a formatted
    /// message.
    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        ExtractError::MalformedDocument(message.into())
    }
}
