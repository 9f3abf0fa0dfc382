//! Keyword classification.
//!
//! A trial is classified by searching its designated text fields for the
//! terms of each configured keyword list. Matching is case-insensitive and
//! word-boundary aware: a term that starts (or ends) with a letter or digit
//! must not be glued to another letter or digit on that side, so `AI`
//! matches "AI-based diagnostics" but not "maintain". Internal whitespace in
//! a term matches any run of whitespace.
//!
//! Every matching term contributes its category; a trial may end up with
//! zero, one or many categories per list. Classification is a pure function
//! of the record and the compiled lists.

use regex::{RegexSet, RegexSetBuilder};

use crate::config::{ClassificationConfig, TextField};
use crate::error::HarvestError;
use crate::keywords::{load_keyword_file, KeywordSet};
use crate::models::TrialRecord;

/// Compiled form of one [`KeywordSet`].
#[derive(Debug, Clone)]
pub struct KeywordMatcher {
    set: RegexSet,
    /// Category index for each term, parallel to the patterns in `set`.
    term_category: Vec<usize>,
    categories: Vec<String>,
}

impl KeywordMatcher {
    pub fn new(keywords: &KeywordSet) -> Result<Self, HarvestError> {
        let categories: Vec<String> = keywords
            .categories()
            .into_iter()
            .map(str::to_string)
            .collect();

        let mut patterns = Vec::with_capacity(keywords.len());
        let mut term_category = Vec::with_capacity(keywords.len());
        for entry in keywords.entries() {
            patterns.push(term_pattern(&entry.term));
            let idx = categories
                .iter()
                .position(|c| *c == entry.category)
                .ok_or_else(|| {
                    HarvestError::Classification(format!(
                        "category '{}' missing from its own keyword set",
                        entry.category
                    ))
                })?;
            term_category.push(idx);
        }

        let set = RegexSetBuilder::new(&patterns)
            .case_insensitive(true)
            .build()
            .map_err(|e| HarvestError::config(format!("cannot compile keyword list: {}", e)))?;

        Ok(Self {
            set,
            term_category,
            categories,
        })
    }

    /// Categories whose terms occur in any of `texts`, in keyword-list order.
    ///
    /// Each text is searched on its own; a term never spans two texts.
    pub fn labels<'a, I>(&self, texts: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut hit = vec![false; self.categories.len()];
        for text in texts {
            for term_idx in self.set.matches(text).iter() {
                hit[self.term_category[term_idx]] = true;
            }
        }
        self.categories
            .iter()
            .zip(hit)
            .filter_map(|(category, matched)| matched.then(|| category.clone()))
            .collect()
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }
}

/// Regex for one term: escaped words joined by `\s+`, with `\b` on any
/// side that begins or ends in a word character.
fn term_pattern(term: &str) -> String {
    let body = term
        .split_whitespace()
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(r"\s+");

    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    let mut pattern = String::with_capacity(body.len() + 4);
    if term.chars().next().is_some_and(is_word) {
        pattern.push_str(r"\b");
    }
    pattern.push_str(&body);
    if term.chars().last().is_some_and(is_word) {
        pattern.push_str(r"\b");
    }
    pattern
}

/// One keyword list as it appears in the output schema.
#[derive(Debug, Clone)]
pub struct ListClassifier {
    pub column: String,
    pub unmatched: Option<String>,
    pub matcher: KeywordMatcher,
    pub terms: usize,
}

/// Matched categories for one trial, one entry per keyword list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationResult {
    pub nct_id: Option<String>,
    pub labels: Vec<Vec<String>>,
}

impl ClassificationResult {
    /// Union of all lists' categories, first occurrence order.
    pub fn all_labels(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for label in self.labels.iter().flatten() {
            if !out.contains(&label.as_str()) {
                out.push(label);
            }
        }
        out
    }

    pub fn is_unclassified(&self) -> bool {
        self.labels.iter().all(Vec::is_empty)
    }
}

/// All keyword lists of a run plus the fields they search.
#[derive(Debug, Clone)]
pub struct Classifier {
    fields: Vec<TextField>,
    lists: Vec<ListClassifier>,
}

impl Classifier {
    /// Load and compile every configured keyword list.
    ///
    /// Fails on the first unreadable or empty list, before any record is
    /// fetched.
    pub fn load(config: &ClassificationConfig) -> Result<Self, HarvestError> {
        let mut lists = Vec::with_capacity(config.lists.len());
        for list in &config.lists {
            let keywords = load_keyword_file(&list.path)?;
            if keywords.duplicates() > 0 {
                tracing::warn!(
                    list = %list.column,
                    duplicates = keywords.duplicates(),
                    "repeated keyword terms collapsed"
                );
            }
            lists.push((list.column.clone(), list.unmatched.clone(), keywords));
        }
        Self::new(config.fields.clone(), lists)
    }

    /// Compile already-loaded lists given as `(column, unmatched, keywords)`.
    pub fn new(
        fields: Vec<TextField>,
        lists: Vec<(String, Option<String>, KeywordSet)>,
    ) -> Result<Self, HarvestError> {
        if lists.is_empty() {
            return Err(HarvestError::config("no keyword lists configured"));
        }
        let lists = lists
            .into_iter()
            .map(|(column, unmatched, keywords)| {
                Ok(ListClassifier {
                    column,
                    unmatched,
                    terms: keywords.len(),
                    matcher: KeywordMatcher::new(&keywords)?,
                })
            })
            .collect::<Result<Vec<_>, HarvestError>>()?;
        Ok(Self { fields, lists })
    }

    pub fn lists(&self) -> &[ListClassifier] {
        &self.lists
    }

    pub fn fields(&self) -> &[TextField] {
        &self.fields
    }

    /// Classify one record against every list.
    pub fn classify(&self, record: &TrialRecord) -> ClassificationResult {
        let texts: Vec<&str> = self
            .fields
            .iter()
            .flat_map(|field| record.text(*field))
            .collect();

        ClassificationResult {
            nct_id: record.nct_id.clone(),
            labels: self
                .lists
                .iter()
                .map(|list| list.matcher.labels(texts.iter().copied()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keywords::parse_text_keywords;
    use crate::models::Intervention;

    fn matcher(lines: &str) -> KeywordMatcher {
        KeywordMatcher::new(&parse_text_keywords(lines).unwrap()).unwrap()
    }

    fn classifier(lines: &str) -> Classifier {
        Classifier::new(
            vec![
                TextField::Title,
                TextField::Conditions,
                TextField::BriefSummary,
            ],
            vec![(
                "category".to_string(),
                None,
                parse_text_keywords(lines).unwrap(),
            )],
        )
        .unwrap()
    }

    #[test]
    fn short_term_respects_word_boundaries() {
        let m = matcher("AI:Digital\n");
        assert!(m.labels(["How we maintain the cohort"]).is_empty());
        assert_eq!(m.labels(["AI-based diagnostics"]), vec!["Digital"]);
        assert_eq!(m.labels(["uses ai."]), vec!["Digital"]);
    }

    #[test]
    fn matching_is_case_insensitive() {
        let m = matcher("Lung Cancer:Oncology\n");
        assert_eq!(m.labels(["EARLY-STAGE LUNG CANCER"]), vec!["Oncology"]);
    }

    #[test]
    fn multiword_term_tolerates_whitespace_runs() {
        let m = matcher("lung cancer:Oncology\n");
        assert_eq!(m.labels(["non-small-cell lung\n  cancer"]), vec!["Oncology"]);
        assert!(m.labels(["lungcancer"]).is_empty());
    }

    #[test]
    fn term_with_symbol_edge_matches_without_boundary_on_that_side() {
        let m = matcher("c++\nCOVID-19:Infectious\n");
        assert_eq!(m.labels(["written in C++ and Rust"]), vec!["c++"]);
        assert_eq!(m.labels(["post COVID-19 syndrome"]), vec!["Infectious"]);
    }

    #[test]
    fn terms_do_not_span_separate_texts() {
        let m = matcher("lung cancer:Oncology\n");
        assert!(m.labels(["lung", "cancer"]).is_empty());
    }

    #[test]
    fn example_scenario_matches_both_categories() {
        let c = classifier("diabetes:Endocrine\nlung cancer:Oncology\n");
        let record = TrialRecord {
            nct_id: Some("NCT1".into()),
            conditions: vec!["Type 2 Diabetes Mellitus".into()],
            brief_summary: Some("An early-stage lung cancer trial".into()),
            ..Default::default()
        };
        let result = c.classify(&record);
        assert_eq!(result.labels, vec![vec!["Endocrine", "Oncology"]]);
        assert_eq!(result.nct_id.as_deref(), Some("NCT1"));
    }

    #[test]
    fn all_matches_recorded_in_keyword_order() {
        let c = classifier("melanoma:Skin\ndiabetes:Endocrine\ninsulin:Endocrine\n");
        let record = TrialRecord {
            brief_title: Some("Insulin and diabetes in melanoma survivors".into()),
            ..Default::default()
        };
        assert_eq!(c.classify(&record).labels[0], vec!["Skin", "Endocrine"]);
    }

    #[test]
    fn unclassified_is_a_valid_outcome() {
        let c = classifier("diabetes:Endocrine\n");
        let result = c.classify(&TrialRecord::default());
        assert!(result.is_unclassified());
        assert_eq!(result.labels, vec![Vec::<String>::new()]);
    }

    #[test]
    fn classification_is_deterministic() {
        let c = classifier("diabetes:Endocrine\nlung cancer:Oncology\nasthma\n");
        let record = TrialRecord {
            brief_title: Some("Asthma and diabetes".into()),
            ..Default::default()
        };
        let first = c.classify(&record);
        let other = TrialRecord {
            brief_title: Some("Lung cancer".into()),
            ..Default::default()
        };
        let _ = c.classify(&other);
        assert_eq!(c.classify(&record), first);
    }

    #[test]
    fn only_designated_fields_are_searched() {
        let c = classifier("semaglutide:GLP-1\n");
        let record = TrialRecord {
            interventions: vec![Intervention {
                name: Some("Semaglutide".into()),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(c.classify(&record).is_unclassified());
    }

    #[test]
    fn union_across_lists_keeps_first_occurrence() {
        let c = Classifier::new(
            vec![TextField::Title],
            vec![
                (
                    "a".into(),
                    None,
                    parse_text_keywords("diabetes:Endocrine\n").unwrap(),
                ),
                (
                    "b".into(),
                    Some("NO".into()),
                    parse_text_keywords("insulin:Endocrine\ngene:Genetic\n").unwrap(),
                ),
            ],
        )
        .unwrap();
        let record = TrialRecord {
            brief_title: Some("Insulin gene therapy for diabetes".into()),
            ..Default::default()
        };
        let result = c.classify(&record);
        assert_eq!(result.all_labels(), vec!["Endocrine", "Genetic"]);
    }
}
