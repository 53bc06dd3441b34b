//! # Document Metadata
//!
//! The metadata record handed to the serving and batch-export layers next
//! to the feature record.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::dialect::Document;

/// Identification and descriptive texts for one extracted document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScoreMeta {
    /// Caller-supplied document id, typically the archive file stem.
    pub id: String,
    /// Name of the notation entry inside the archive.
    pub primary_entry: String,
    /// Declared format version.
    pub version: String,
    /// Version of the program that wrote the document.
    pub program_version: String,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub composer: Option<String>,
}

impl ScoreMeta {
    pub fn from_document(id: &str, primary_entry: &str, document: &Document) -> Self {
        let info = document.meta_info();
        ScoreMeta {
            id: id.to_string(),
            primary_entry: primary_entry.to_string(),
            version: document.version().to_string(),
            program_version: document.program_version().to_string(),
            title: pick(&info, &["workTitle", "Title"]),
            subtitle: pick(&info, &["Subtitle"]),
            composer: pick(&info, &["composer", "Composer"]),
        }
    }
}

fn pick(info: &BTreeMap<String, String>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| info.get(*key).cloned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_prefers_earlier_keys() {
        let mut info = BTreeMap::new();
        info.insert("Title".to_string(), "front".to_string());
        info.insert("workTitle".to_string(), "meta".to_string());
        assert_eq!(pick(&info, &["workTitle", "Title"]).as_deref(), Some("meta"));
        assert_eq!(pick(&info, &["Subtitle"]), None);
    }
}
