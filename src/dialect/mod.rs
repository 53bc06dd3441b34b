//! # Dialect Selection
//!
//! The format went through three structurally incompatible major-version
//! families. Each family gets its own document model and parser; this
//! module inspects the declared version attribute on the root element and
//! dispatches to the matching one.
//!
//! | versions        | module |
//! |-----------------|--------|
//! | "1.14"          | [`v1`] |
//! | "2.06"          | [`v2`] |
//! | "3.01", "3.02"  | [`v3`] |
//!
//! Any other version yields [`ExtractError::UnsupportedVersion`].

pub mod v1;
pub mod v2;
pub mod v3;
pub(crate) mod xml;

use std::collections::BTreeMap;

use crate::diag::Diagnostics;
use crate::error::ExtractError;
use crate::features::Features;

/// Version strings handled by the [`v1`] parser.
pub const V1_VERSIONS: &[&str] = &["1.14"];
/// Version strings handled by the [`v2`] parser.
pub const V2_VERSIONS: &[&str] = &["2.06"];
/// Version strings handled by the [`v3`] parser.
pub const V3_VERSIONS: &[&str] = &["3.01", "3.02"];

/// A parsed notation document of any supported dialect.
#[derive(Debug, Clone)]
pub enum Document {
    V1(v1::Document),
    V2(v2::Document),
    V3(v3::Document),
}

impl Document {
    /// Declared format version.
    pub fn version(&self) -> &str {
        match self {
            Document::V1(doc) => &doc.version,
            Document::V2(doc) => &doc.version,
            Document::V3(doc) => &doc.version,
        }
    }

    /// Version of the program that wrote the document.
    pub fn program_version(&self) -> &str {
        match self {
            Document::V1(doc) => &doc.program_version,
            Document::V2(doc) => &doc.program_version,
            Document::V3(doc) => &doc.program_version,
        }
    }

    /// Difficulty features of the document's keyboard part, or `None` when
    /// no two-staff keyboard part exists.
    pub fn features(&self, diag: &mut Diagnostics) -> Option<Features> {
        match self {
            Document::V1(doc) => doc.features(diag),
            Document::V2(doc) => doc.features(diag),
            Document::V3(doc) => doc.features(diag),
        }
    }

    /// Title, composer and similar texts keyed by their document labels,
    /// front matter preferred over document-level meta entries.
    pub fn meta_info(&self) -> BTreeMap<String, String> {
        match self {
            Document::V1(doc) => doc.meta_info(),
            Document::V2(doc) => doc.meta_info(),
            Document::V3(doc) => doc.meta_info(),
        }
    }
}

/// Parse a notation document, dispatching on the declared version.
pub fn parse_document(xml: &str, diag: &mut Diagnostics) -> Result<Document, ExtractError> {
    let tree = roxmltree::Document::parse(xml)?;
    let root = tree.root_element();
    if !root.has_tag_name("museScore") {
        return Err(ExtractError::malformed(format!(
            "unexpected root element <{}>",
            root.tag_name().name()
        )));
    }
    let version = root.attribute("version").unwrap_or("");
    if V1_VERSIONS.contains(&version) {
        Ok(Document::V1(v1::Document::parse(root, diag)?))
    } else if V2_VERSIONS.contains(&version) {
        Ok(Document::V2(v2::Document::parse(root, diag)?))
    } else if V3_VERSIONS.contains(&version) {
        Ok(Document::V3(v3::Document::parse(root, diag)?))
    } else {
        Err(ExtractError::UnsupportedVersion(version.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_version_is_unsupported() {
        let mut diag = Diagnostics::default();
        let result = parse_document(r#"<museScore version="4.00"/>"#, &mut diag);
        match result {
            Err(ExtractError::UnsupportedVersion(version)) => assert_eq!(version, "4.00"),
            other => panic!("expected UnsupportedVersion, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_version_is_unsupported() {
        let mut diag = Diagnostics::default();
        assert!(matches!(
            parse_document("<museScore/>", &mut diag),
            Err(ExtractError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_wrong_root_is_malformed() {
        let mut diag = Diagnostics::default();
        assert!(matches!(
            parse_document("<score/>", &mut diag),
            Err(ExtractError::MalformedDocument(_))
        ));
    }

    #[test]
    fn test_invalid_xml_is_reported() {
        let mut diag = Diagnostics::default();
        assert!(matches!(
            parse_document("<museScore", &mut diag),
            Err(ExtractError::Xml(_))
        ));
    }
}
