//! Core data models used throughout the harvester.
//!
//! A [`TrialRecord`] is built fresh from each registry payload and never
//! edited afterwards: classification reads it, normalization derives a new
//! row from it. Every attribute is explicitly present (`Some`) or absent
//! (`None`); absent values are never replaced by a made-up default.

use crate::config::TextField;

/// One clinical trial as returned by the registry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrialRecord {
    /// Registry identifier (NCT number). Stable across runs.
    pub nct_id: Option<String>,
    pub brief_title: Option<String>,
    pub official_title: Option<String>,
    pub organization_class: Option<String>,
    pub study_type: Option<String>,
    pub status: Option<String>,
    /// Dates as the registry wrote them; parsed during normalization.
    pub start_date: Option<String>,
    pub completion_date: Option<String>,
    pub last_update_date: Option<String>,
    pub phases: Vec<String>,
    pub sponsor: Option<String>,
    pub conditions: Vec<String>,
    pub keywords: Vec<String>,
    pub brief_summary: Option<String>,
    pub detailed_description: Option<String>,
    pub interventions: Vec<Intervention>,
    pub locations: Vec<Location>,
    pub sex: Option<String>,
    pub minimum_age: Option<String>,
    pub maximum_age: Option<String>,
    pub healthy_volunteers: Option<bool>,
    pub enrollment: Option<u64>,
    pub eligibility_criteria: Option<String>,
    /// Fields that were present in the payload but could not be read.
    pub issues: Vec<FieldIssue>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Intervention {
    pub name: Option<String>,
    pub kind: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    pub country: Option<String>,
    pub city: Option<String>,
}

/// A recovered field-level problem: the field was marked absent and the
/// record kept going.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldIssue {
    pub field: String,
    pub reason: String,
}

impl FieldIssue {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl TrialRecord {
    /// The text values of one designated field, in source order.
    ///
    /// Multi-valued fields yield one entry per value so that a term never
    /// matches across the boundary of two values.
    pub fn text(&self, field: TextField) -> Vec<&str> {
        match field {
            TextField::Title => self.brief_title.as_deref().into_iter().collect(),
            TextField::OfficialTitle => self.official_title.as_deref().into_iter().collect(),
            TextField::Conditions => self.conditions.iter().map(String::as_str).collect(),
            TextField::Keywords => self.keywords.iter().map(String::as_str).collect(),
            TextField::BriefSummary => self.brief_summary.as_deref().into_iter().collect(),
            TextField::DetailedDescription => {
                self.detailed_description.as_deref().into_iter().collect()
            }
            TextField::Interventions => self
                .interventions
                .iter()
                .flat_map(|i| [i.name.as_deref(), i.description.as_deref()])
                .flatten()
                .collect(),
            TextField::InclusionCriteria => self.criteria().0.into_iter().collect(),
        }
    }

    /// Eligibility text split into (inclusion, exclusion) at the registry's
    /// section headings. Text missing either heading yields neither part.
    pub fn criteria(&self) -> (Option<&str>, Option<&str>) {
        const INCLUSION: &str = "Inclusion Criteria:";
        const EXCLUSION: &str = "Exclusion Criteria:";

        let Some(text) = self.eligibility_criteria.as_deref() else {
            return (None, None);
        };
        let Some(inc) = text.find(INCLUSION) else {
            return (None, None);
        };
        let body = &text[inc + INCLUSION.len()..];
        let Some(exc) = body.find(EXCLUSION) else {
            return (None, None);
        };
        (
            non_empty(&body[..exc]),
            non_empty(&body[exc + EXCLUSION.len()..]),
        )
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}
