//! Keyword list loading.
//!
//! Two file formats are accepted:
//!
//! **Text** (any extension other than `.json`): one term per line,
//! optionally followed by `:Category`. Blank lines and lines starting with
//! `#` are ignored. A term without a category is its own category. The
//! last unescaped `:` separates the category, so a colon inside a term is
//! written `\:`.
//!
//! ```text
//! # endocrine
//! diabetes:Endocrine
//! insulin resistance:Endocrine
//! lung cancer:Oncology
//! HER2\:neu:Oncology
//! asthma
//! ```
//!
//! **JSON** (`.json`): an object mapping each category to its terms, or a
//! plain array of terms.
//!
//! ```json
//! { "Endocrine": ["diabetes", "insulin resistance"], "Oncology": ["lung cancer"] }
//! ```
//!
//! JSON object keys are read in sorted order.
//!
//! Terms compare case-insensitively; a repeated term keeps its first
//! occurrence. An empty or unreadable list is a configuration error.

use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;

use crate::error::HarvestError;

/// One classification term and the category it reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordEntry {
    pub term: String,
    pub category: String,
}

/// An ordered, duplicate-free list of terms. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordSet {
    entries: Vec<KeywordEntry>,
    duplicates: usize,
}

impl KeywordSet {
    /// Build a set from `(term, category)` pairs, collapsing repeated terms.
    pub fn from_pairs<I, T, C>(pairs: I) -> Result<Self, HarvestError>
    where
        I: IntoIterator<Item = (T, C)>,
        T: Into<String>,
        C: Into<String>,
    {
        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        let mut duplicates = 0;

        for (term, category) in pairs {
            let term: String = term.into();
            let term = collapse_whitespace(&term);
            if term.is_empty() {
                continue;
            }
            let category: String = category.into();
            let category = collapse_whitespace(&category);
            let category = if category.is_empty() {
                term.clone()
            } else {
                category
            };

            if seen.insert(term.to_lowercase()) {
                entries.push(KeywordEntry { term, category });
            } else {
                duplicates += 1;
            }
        }

        if entries.is_empty() {
            return Err(HarvestError::config("keyword list contains no terms"));
        }

        Ok(Self {
            entries,
            duplicates,
        })
    }

    pub fn entries(&self) -> &[KeywordEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of repeated terms dropped while loading.
    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    /// Distinct categories in order of first appearance.
    pub fn categories(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .map(|e| e.category.as_str())
            .filter(|c| seen.insert(*c))
            .collect()
    }
}

/// Load a keyword file, choosing the format by extension.
pub fn load_keyword_file(path: &Path) -> Result<KeywordSet, HarvestError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        HarvestError::config(format!(
            "failed to read keyword file {}: {}",
            path.display(),
            e
        ))
    })?;

    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let result = if is_json {
        parse_json_keywords(&content)
    } else {
        parse_text_keywords(&content)
    };

    result.map_err(|e| match e {
        HarvestError::Configuration(msg) => {
            HarvestError::config(format!("{}: {}", path.display(), msg))
        }
        other => other,
    })
}

/// Parse the line-oriented `term[:Category]` format.
pub fn parse_text_keywords(content: &str) -> Result<KeywordSet, HarvestError> {
    let mut pairs = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim().trim_start_matches('\u{feff}');
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (term, category) = split_category(line);
        if term.is_empty() {
            return Err(HarvestError::config(format!(
                "line {}: category '{}' has no term",
                idx + 1,
                category
            )));
        }
        pairs.push((term, category));
    }
    KeywordSet::from_pairs(pairs)
}

/// Split `term[:Category]` at the last colon not escaped as `\:`.
fn split_category(line: &str) -> (String, String) {
    let mut separator = None;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match c {
            '\\' if !escaped => {
                escaped = true;
                continue;
            }
            ':' if !escaped => separator = Some(i),
            _ => {}
        }
        escaped = false;
    }

    let unescape = |s: &str| s.trim().replace("\\:", ":");
    match separator {
        Some(i) => (unescape(&line[..i]), unescape(&line[i + 1..])),
        None => (unescape(line), String::new()),
    }
}

/// Parse a JSON category → terms object, or a JSON array of terms.
pub fn parse_json_keywords(content: &str) -> Result<KeywordSet, HarvestError> {
    let value: Value = serde_json::from_str(content)
        .map_err(|e| HarvestError::config(format!("invalid JSON keyword list: {}", e)))?;

    let mut pairs = Vec::new();
    match value {
        Value::Object(groups) => {
            for (category, terms) in groups {
                let terms = terms.as_array().ok_or_else(|| {
                    HarvestError::config(format!(
                        "category '{}' must map to a list of terms",
                        category
                    ))
                })?;
                for term in terms {
                    let term = json_term(term)?;
                    pairs.push((term.to_string(), category.clone()));
                }
            }
        }
        Value::Array(terms) => {
            for term in &terms {
                let term = json_term(term)?;
                pairs.push((term.to_string(), String::new()));
            }
        }
        _ => {
            return Err(HarvestError::config(
                "JSON keyword list must be an object or an array",
            ))
        }
    }
    KeywordSet::from_pairs(pairs)
}

fn json_term(value: &Value) -> Result<&str, HarvestError> {
    value
        .as_str()
        .ok_or_else(|| HarvestError::config(format!("keyword must be text, found {}", value)))
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_format_with_categories() {
        let set = parse_text_keywords("diabetes:Endocrine\nlung cancer:Oncology\n").unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.entries()[0].term, "diabetes");
        assert_eq!(set.entries()[0].category, "Endocrine");
        assert_eq!(set.entries()[1].term, "lung cancer");
        assert_eq!(set.categories(), vec!["Endocrine", "Oncology"]);
    }

    #[test]
    fn term_without_category_is_its_own_label() {
        let set = parse_text_keywords("asthma\n").unwrap();
        assert_eq!(set.entries()[0].category, "asthma");
    }

    #[test]
    fn escaped_colon_stays_in_term() {
        let set = parse_text_keywords("HER2\\:neu\nHER2\\:neu positive:Oncology\n").unwrap();
        assert_eq!(set.entries()[0].term, "HER2:neu");
        assert_eq!(set.entries()[0].category, "HER2:neu");
        assert_eq!(set.entries()[1].term, "HER2:neu positive");
        assert_eq!(set.entries()[1].category, "Oncology");
    }

    #[test]
    fn comments_and_blank_lines_skipped() {
        let set = parse_text_keywords("# header\n\n   \ngene therapy:Advanced\n").unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn duplicate_terms_collapse_case_insensitively() {
        let set =
            parse_text_keywords("Diabetes:Endocrine\ndiabetes:Metabolic\nDIABETES\n").unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.entries()[0].category, "Endocrine");
        assert_eq!(set.duplicates(), 2);
    }

    #[test]
    fn empty_list_is_configuration_error() {
        let err = parse_text_keywords("# nothing here\n\n").unwrap_err();
        assert_eq!(err.stage(), "configuration");
    }

    #[test]
    fn category_without_term_rejected() {
        let err = parse_text_keywords("diabetes\n:Oncology\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn json_object_format() {
        let set = parse_json_keywords(
            r#"{"Oncology": ["lung cancer", "melanoma"], "Endocrine": ["diabetes"]}"#,
        )
        .unwrap();
        assert_eq!(set.len(), 3);
        // object keys are read in sorted order
        assert_eq!(set.categories(), vec!["Endocrine", "Oncology"]);
    }

    #[test]
    fn json_array_format() {
        let set = parse_json_keywords(r#"["CRISPR", "gene therapy"]"#).unwrap();
        assert_eq!(set.categories(), vec!["CRISPR", "gene therapy"]);
    }

    #[test]
    fn json_non_text_term_rejected() {
        assert!(parse_json_keywords(r#"{"Oncology": [1, 2]}"#).is_err());
        assert!(parse_json_keywords(r#""just a string""#).is_err());
    }

    #[test]
    fn unreadable_file_is_configuration_error() {
        let err = load_keyword_file(Path::new("/nonexistent/keywords.txt")).unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("keywords.txt"));
    }

    #[test]
    fn load_picks_format_by_extension() {
        let tmp = tempfile::TempDir::new().unwrap();
        let json_path = tmp.path().join("genetic.JSON");
        std::fs::write(&json_path, r#"{"Genetic": ["BRCA1"]}"#).unwrap();
        let set = load_keyword_file(&json_path).unwrap();
        assert_eq!(set.entries()[0].category, "Genetic");

        let text_path = tmp.path().join("genetic.txt");
        std::fs::write(&text_path, "BRCA1:Genetic\n").unwrap();
        assert_eq!(load_keyword_file(&text_path).unwrap(), set);
    }
}
