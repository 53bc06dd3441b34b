//! # Archive Input
//!
//! A score package is a zip archive holding one notation document plus
//! auxiliary entries (thumbnails, part renderings). Only the notation
//! entry matters here; it is located by its file extension.

use std::io::{Cursor, Read};

use zip::ZipArchive;

use crate::error::ExtractError;

/// Extension of the notation document inside a score package.
pub const SCORE_ENTRY_EXTENSION: &str = ".mscx";

/// Locate and read the primary notation document from archive bytes.
/// Returns the entry name and its XML text.
pub fn read_primary_document(data: &[u8]) -> Result<(String, String), ExtractError> {
    let mut archive = ZipArchive::new(Cursor::new(data))?;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        if !entry.name().ends_with(SCORE_ENTRY_EXTENSION) {
            continue;
        }
        let name = entry.name().to_string();
        let mut xml = String::new();
        entry.read_to_string(&mut xml)?;
        return Ok((name, xml));
    }
    Err(ExtractError::PrimaryDocumentNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;
    use zip::ZipWriter;

    fn build_archive(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, content) in entries {
            writer.start_file(*name, FileOptions::default()).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_picks_first_notation_entry() {
        let data = build_archive(&[
            ("thumbnail.png", "not xml"),
            ("piece.mscx", "<museScore/>"),
            ("other.mscx", "<museScore version=\"9\"/>"),
        ]);
        let (name, xml) = read_primary_document(&data).unwrap();
        assert_eq!(name, "piece.mscx");
        assert_eq!(xml, "<museScore/>");
    }

    #[test]
    fn test_missing_notation_entry() {
        let data = build_archive(&[("thumbnail.png", "not xml")]);
        assert!(matches!(
            read_primary_document(&data),
            Err(ExtractError::PrimaryDocumentNotFound)
        ));
    }

    #[test]
    fn test_garbage_bytes_are_an_archive_error() {
        assert!(matches!(
            read_primary_document(b"not a zip"),
            Err(ExtractError::Archive(_))
        ));
    }
}
