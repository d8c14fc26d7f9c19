//! Pre-classified policy corpus: two disjoint record sets (procedural and
//! primary) with a keyword index over each. Loaded once at startup and
//! read-only afterward.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{Result, VerifyError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyClass {
    Procedural,
    Primary,
}

impl fmt::Display for PolicyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Procedural => f.write_str("procedural"),
            Self::Primary => f.write_str("primary"),
        }
    }
}

/// One regulation clause: citation, title, text, and its pre-assigned class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub section: String,
    pub title: String,
    pub text: String,
    pub class: PolicyClass,
}

impl PolicyRecord {
    pub fn new(
        section: impl Into<String>,
        title: impl Into<String>,
        text: impl Into<String>,
        class: PolicyClass,
    ) -> Self {
        Self {
            section: section.into(),
            title: title.into(),
            text: text.into(),
            class,
        }
    }
}

/// Wire-shape record. Source files disagree on which field carries the
/// clause body, so all three are accepted and the first non-empty wins.
#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(default)]
    section: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    natural_language: String,
}

impl RawRecord {
    fn body(&self) -> &str {
        [&self.text, &self.description, &self.natural_language]
            .into_iter()
            .find(|s| !s.is_empty())
            .map(String::as_str)
            .unwrap_or("")
    }

    fn into_record(self, class: PolicyClass) -> PolicyRecord {
        let text = self.body().to_string();
        PolicyRecord {
            section: self.section,
            title: self.title,
            text,
            class,
        }
    }
}

/// Policy files arrive either as a bare array or wrapped in a container
/// object; both normalize to one record list here.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PolicyFile {
    Records(Vec<RawRecord>),
    Wrapped { policies: Vec<RawRecord> },
}

impl PolicyFile {
    fn into_records(self, class: PolicyClass) -> Vec<PolicyRecord> {
        let raw = match self {
            Self::Records(records) => records,
            Self::Wrapped { policies } => policies,
        };
        raw.into_iter().map(|r| r.into_record(class)).collect()
    }
}

/// Lower-cased words of a text with surrounding punctuation trimmed,
/// keeping only words longer than three characters.
pub fn significant_words(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(trim_punctuation)
        .filter(|w| w.len() > 3)
        .map(str::to_string)
        .collect()
}

fn trim_punctuation(word: &str) -> &str {
    word.trim_matches(|c: char| {
        matches!(
            c,
            '.' | ',' | ';' | ':' | '!' | '?' | '(' | ')' | '[' | ']' | '{' | '}'
        )
    })
}

#[derive(Debug, Clone)]
pub struct CorpusStats {
    pub procedural_records: usize,
    pub primary_records: usize,
    pub procedural_keywords: usize,
    pub primary_keywords: usize,
}

#[derive(Debug)]
pub struct CorpusIndex {
    procedural: Vec<PolicyRecord>,
    primary: Vec<PolicyRecord>,
    procedural_keywords: HashMap<String, Vec<usize>>,
    primary_keywords: HashMap<String, Vec<usize>>,
}

impl CorpusIndex {
    /// Load both classified policy files. A missing file yields an empty
    /// set (the router reports degeneracy later); a malformed file is a
    /// startup error.
    pub async fn load(procedural_path: &Path, primary_path: &Path) -> Result<Self> {
        let procedural = Self::load_file(procedural_path, PolicyClass::Procedural).await?;
        let primary = Self::load_file(primary_path, PolicyClass::Primary).await?;

        let index = Self::from_records(procedural, primary);
        let stats = index.stats();
        info!(
            procedural = stats.procedural_records,
            primary = stats.primary_records,
            "Policy corpus loaded"
        );
        Ok(index)
    }

    async fn load_file(path: &Path, class: PolicyClass) -> Result<Vec<PolicyRecord>> {
        if !path.exists() {
            warn!(path = %path.display(), class = %class, "Policy file not found, using empty set");
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(path).await?;
        let file: PolicyFile =
            serde_json::from_str(&content).map_err(|e| VerifyError::CorpusLoad {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        Ok(file.into_records(class))
    }

    pub fn from_records(procedural: Vec<PolicyRecord>, primary: Vec<PolicyRecord>) -> Self {
        let procedural_keywords = Self::build_index(&procedural);
        let primary_keywords = Self::build_index(&primary);
        debug!(
            procedural_keywords = procedural_keywords.len(),
            primary_keywords = primary_keywords.len(),
            "Keyword indices built"
        );
        Self {
            procedural,
            primary,
            procedural_keywords,
            primary_keywords,
        }
    }

    fn build_index(records: &[PolicyRecord]) -> HashMap<String, Vec<usize>> {
        let mut index: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, record) in records.iter().enumerate() {
            for word in significant_words(&record.text) {
                let entry = index.entry(word).or_default();
                if entry.last() != Some(&idx) {
                    entry.push(idx);
                }
            }
        }
        index
    }

    pub fn records(&self, class: PolicyClass) -> &[PolicyRecord] {
        match class {
            PolicyClass::Procedural => &self.procedural,
            PolicyClass::Primary => &self.primary,
        }
    }

    pub fn contains_keyword(&self, class: PolicyClass, word: &str) -> bool {
        self.keyword_index(class).contains_key(word)
    }

    fn keyword_index(&self, class: PolicyClass) -> &HashMap<String, Vec<usize>> {
        match class {
            PolicyClass::Procedural => &self.procedural_keywords,
            PolicyClass::Primary => &self.primary_keywords,
        }
    }

    pub fn stats(&self) -> CorpusStats {
        CorpusStats {
            procedural_records: self.procedural.len(),
            primary_records: self.primary.len(),
            procedural_keywords: self.procedural_keywords.len(),
            primary_keywords: self.primary_keywords.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(section: &str, text: &str, class: PolicyClass) -> PolicyRecord {
        PolicyRecord::new(section, "", text, class)
    }

    #[test]
    fn test_significant_words_filters_short_and_punctuation() {
        let words = significant_words("A covered entity may use (or disclose) PHI.");
        assert!(words.contains("covered"));
        assert!(words.contains("entity"));
        assert!(words.contains("disclose"));
        assert!(!words.contains("may"));
        assert!(!words.contains("use"));
        assert!(!words.contains("phi"));
    }

    #[test]
    fn test_index_lookup() {
        let index = CorpusIndex::from_records(
            vec![record(
                "164.506",
                "Treatment disclosures are permitted",
                PolicyClass::Procedural,
            )],
            vec![record(
                "164.502",
                "Disclosure prohibited without authorization",
                PolicyClass::Primary,
            )],
        );

        assert!(index.contains_keyword(PolicyClass::Procedural, "treatment"));
        assert!(!index.contains_keyword(PolicyClass::Procedural, "prohibited"));
        assert!(index.contains_keyword(PolicyClass::Primary, "authorization"));
    }

    #[test]
    fn test_loader_accepts_both_wire_shapes() {
        let bare: PolicyFile = serde_json::from_str(
            r#"[{"section": "164.506", "text": "Treatment disclosures"}]"#,
        )
        .unwrap();
        let wrapped: PolicyFile = serde_json::from_str(
            r#"{"policies": [{"section": "164.506", "text": "Treatment disclosures"}]}"#,
        )
        .unwrap();

        let bare_records = bare.into_records(PolicyClass::Procedural);
        let wrapped_records = wrapped.into_records(PolicyClass::Procedural);
        assert_eq!(bare_records, wrapped_records);
        assert_eq!(bare_records[0].section, "164.506");
    }

    #[test]
    fn test_body_field_fallback_chain() {
        let raw: RawRecord = serde_json::from_str(
            r#"{"section": "164.510", "description": "From the description field"}"#,
        )
        .unwrap();
        assert_eq!(raw.body(), "From the description field");

        let raw: RawRecord = serde_json::from_str(
            r#"{"section": "164.510", "natural_language": "From natural language"}"#,
        )
        .unwrap();
        assert_eq!(raw.body(), "From natural language");
    }

    #[tokio::test]
    async fn test_load_missing_file_yields_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        let index = CorpusIndex::load(
            &dir.path().join("missing_procedural.json"),
            &dir.path().join("missing_primary.json"),
        )
        .await
        .unwrap();

        let stats = index.stats();
        assert_eq!(stats.procedural_records, 0);
        assert_eq!(stats.primary_records, 0);
    }

    #[tokio::test]
    async fn test_load_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let procedural_path = dir.path().join("procedural.json");
        let primary_path = dir.path().join("primary.json");

        std::fs::write(
            &procedural_path,
            r#"[{"section": "164.506(c)(2)", "title": "Treatment", "text": "Disclosure for treatment activities is permitted"}]"#,
        )
        .unwrap();
        std::fs::write(
            &primary_path,
            r#"{"policies": [{"section": "164.502(a)", "text": "Use or disclosure prohibited except as permitted"}]}"#,
        )
        .unwrap();

        let index = CorpusIndex::load(&procedural_path, &primary_path)
            .await
            .unwrap();
        let stats = index.stats();
        assert_eq!(stats.procedural_records, 1);
        assert_eq!(stats.primary_records, 1);
        assert!(index.contains_keyword(PolicyClass::Primary, "prohibited"));
    }

    #[tokio::test]
    async fn test_load_malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{not json").unwrap();

        let err = CorpusIndex::load(&bad, &dir.path().join("missing.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::CorpusLoad { .. }));
    }
}
