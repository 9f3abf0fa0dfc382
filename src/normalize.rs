//! Flattening a classified [`TrialRecord`] into a schema-stable row.
//!
//! Every row has exactly one cell per column of the run's [`Schema`]: the
//! fixed columns below, one column per keyword list, then
//! `matched_categories` and `field_issues`. Absent source data yields an
//! empty cell.
//!
//! # Cell formats
//!
//! | Kind | Format |
//! |------|--------|
//! | Dates | `YYYY-MM-DD`, `YYYY-MM` or `YYYY`, with a `*_precision` column (`day`, `month`, `year`, `unparsed`) |
//! | Multi-valued | items joined by `|`; a literal `|` or `\` in an item is backslash-escaped (see [`split_multi`]) |
//! | Ages | numeric value column plus unit column (`Years`, `Months`, ...) |
//! | Booleans | `Yes` / `No` |
//!
//! Derived columns (`duration_days`, `trial_age_days`, `matched_categories`)
//! are computed from normalized values only. Partial dates anchor to the
//! first day of their period.

use chrono::{Datelike, NaiveDate};
use regex::Regex;
use std::sync::OnceLock;

use crate::classify::{ClassificationResult, Classifier};
use crate::config::{Config, SponsorsConfig};
use crate::error::HarvestError;
use crate::models::{FieldIssue, TrialRecord};

/// Separator between items of a multi-valued cell.
pub const MULTI_VALUE_SEPARATOR: char = '|';

/// Columns present in every run, in output order.
pub const FIXED_COLUMNS: &[&str] = &[
    "nct_id",
    "url",
    "study_type",
    "title",
    "official_title",
    "status",
    "start_date",
    "start_date_precision",
    "completion_date",
    "completion_date_precision",
    "last_update_date",
    "phase",
    "sponsor",
    "sponsor_group",
    "organization_class",
    "country",
    "city",
    "countries",
    "conditions",
    "keywords",
    "intervention_names",
    "intervention_types",
    "intervention_descriptions",
    "brief_summary",
    "detailed_description",
    "gender",
    "minimum_age_value",
    "minimum_age_unit",
    "maximum_age_value",
    "maximum_age_unit",
    "healthy_volunteers",
    "enrollment",
    "inclusion_criteria",
    "exclusion_criteria",
    "duration_days",
    "trial_age_days",
];

/// Columns that follow the keyword-list columns.
pub const TRAILING_COLUMNS: &[&str] = &["matched_categories", "field_issues"];

/// Whether `name` is taken by a built-in column.
pub fn is_reserved_column(name: &str) -> bool {
    FIXED_COLUMNS.contains(&name) || TRAILING_COLUMNS.contains(&name)
}

// ═══════════════════════════════════════════════════════════════════════
// Schema and rows
// ═══════════════════════════════════════════════════════════════════════

/// The ordered column set of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<String>,
}

impl Schema {
    pub fn new<I, S>(list_columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns = FIXED_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .chain(list_columns.into_iter().map(Into::into))
            .chain(TRAILING_COLUMNS.iter().map(|c| c.to_string()))
            .collect();
        Self { columns }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn index_of(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }
}

/// One output row. `cells` is parallel to the run's [`Schema`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRow {
    pub nct_id: Option<String>,
    pub sponsor_group: Option<String>,
    pub cells: Vec<String>,
}

impl NormalizedRow {
    pub fn get<'a>(&'a self, schema: &Schema, column: &str) -> Option<&'a str> {
        schema
            .index_of(column)
            .and_then(|idx| self.cells.get(idx))
            .map(String::as_str)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Normalizer
// ═══════════════════════════════════════════════════════════════════════

/// Turns (record, classification) pairs into rows for one run.
#[derive(Debug, Clone)]
pub struct Normalizer {
    schema: Schema,
    study_url_base: String,
    as_of: NaiveDate,
    sponsors: SponsorMatcher,
    unmatched: Vec<Option<String>>,
}

impl Normalizer {
    /// `as_of` is the run's reference date, used for `trial_age_days`.
    pub fn new(config: &Config, classifier: &Classifier, as_of: NaiveDate) -> Self {
        Self {
            schema: Schema::new(classifier.lists().iter().map(|l| l.column.clone())),
            study_url_base: config.registry.study_url_base.clone(),
            as_of,
            sponsors: SponsorMatcher::new(&config.sponsors),
            unmatched: classifier
                .lists()
                .iter()
                .map(|l| l.unmatched.clone())
                .collect(),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Produce exactly one row for `record`.
    ///
    /// Only fails when the classification does not line up with the
    /// configured keyword lists, which indicates a defect upstream.
    pub fn normalize(
        &self,
        record: &TrialRecord,
        classification: &ClassificationResult,
    ) -> Result<NormalizedRow, HarvestError> {
        if classification.labels.len() != self.unmatched.len() {
            return Err(HarvestError::Classification(format!(
                "{} keyword list result(s) for {}, expected {}",
                classification.labels.len(),
                record.nct_id.as_deref().unwrap_or("<no id>"),
                self.unmatched.len()
            )));
        }
        if classification.nct_id != record.nct_id {
            return Err(HarvestError::Classification(format!(
                "classification for {:?} paired with record {:?}",
                classification.nct_id, record.nct_id
            )));
        }

        let mut issues: Vec<FieldIssue> = record.issues.clone();

        let start = parse_date_field(record.start_date.as_deref(), "start_date", &mut issues);
        let completion = parse_date_field(
            record.completion_date.as_deref(),
            "completion_date",
            &mut issues,
        );
        let last_update = parse_date_field(
            record.last_update_date.as_deref(),
            "last_update_date",
            &mut issues,
        );
        let min_age = parse_age_field(record.minimum_age.as_deref(), "minimum_age", &mut issues);
        let max_age = parse_age_field(record.maximum_age.as_deref(), "maximum_age", &mut issues);

        let sponsor_group = record
            .sponsor
            .as_deref()
            .and_then(|s| self.sponsors.group(s))
            .map(str::to_string);

        let first_location = record.locations.first();
        let (inclusion, exclusion) = record.criteria();

        let start_anchor = start.as_ref().and_then(PartialDate::anchor);
        let completion_anchor = completion.as_ref().and_then(PartialDate::anchor);
        let duration_days = match (start_anchor, completion_anchor) {
            (Some(s), Some(c)) => Some((c - s).num_days()),
            _ => None,
        };
        let trial_age_days = start_anchor.map(|s| (self.as_of - s).num_days());

        let mut cells = Vec::with_capacity(self.schema.len());
        cells.push(opt(record.nct_id.as_deref()));
        cells.push(
            record
                .nct_id
                .as_deref()
                .map(|id| format!("{}{}", self.study_url_base, id))
                .unwrap_or_default(),
        );
        cells.push(opt(record.study_type.as_deref()));
        cells.push(opt(record.brief_title.as_deref()));
        cells.push(opt(record.official_title.as_deref()));
        cells.push(opt(record.status.as_deref()));
        cells.push(date_cell(&start));
        cells.push(precision_cell(&start));
        cells.push(date_cell(&completion));
        cells.push(precision_cell(&completion));
        cells.push(date_cell(&last_update));
        cells.push(join_multi(record.phases.iter().map(|p| normalize_phase(p))));
        cells.push(opt(record.sponsor.as_deref()));
        cells.push(opt(sponsor_group.as_deref()));
        cells.push(opt(record.organization_class.as_deref()));
        cells.push(opt(first_location.and_then(|l| l.country.as_deref())));
        cells.push(opt(first_location.and_then(|l| l.city.as_deref())));
        cells.push(join_multi(
            record.locations.iter().filter_map(|l| l.country.clone()),
        ));
        cells.push(join_multi(record.conditions.iter().cloned()));
        cells.push(join_multi(record.keywords.iter().cloned()));
        cells.push(join_multi(
            record.interventions.iter().filter_map(|i| i.name.clone()),
        ));
        cells.push(join_multi(
            record.interventions.iter().filter_map(|i| i.kind.clone()),
        ));
        cells.push(join_multi(
            record
                .interventions
                .iter()
                .filter_map(|i| i.description.clone()),
        ));
        cells.push(opt(record.brief_summary.as_deref()));
        cells.push(opt(record.detailed_description.as_deref()));
        cells.push(record.sex.as_deref().map(normalize_gender).unwrap_or_default());
        cells.push(opt_num(min_age.as_ref().map(|a| a.value)));
        cells.push(opt(min_age.as_ref().and_then(|a| a.unit)));
        cells.push(opt_num(max_age.as_ref().map(|a| a.value)));
        cells.push(opt(max_age.as_ref().and_then(|a| a.unit)));
        cells.push(
            record
                .healthy_volunteers
                .map(|b| if b { "Yes" } else { "No" }.to_string())
                .unwrap_or_default(),
        );
        cells.push(opt_num(record.enrollment));
        cells.push(opt(inclusion));
        cells.push(opt(exclusion));
        cells.push(opt_num(duration_days));
        cells.push(opt_num(trial_age_days));

        for (labels, unmatched) in classification.labels.iter().zip(&self.unmatched) {
            if labels.is_empty() {
                cells.push(unmatched.clone().unwrap_or_default());
            } else {
                cells.push(join_multi(labels.iter().cloned()));
            }
        }
        cells.push(join_multi(
            classification.all_labels().into_iter().map(str::to_string),
        ));
        cells.push(join_multi(
            issues
                .iter()
                .map(|i| format!("{}: {}", i.field, i.reason)),
        ));

        if cells.len() != self.schema.len() {
            return Err(HarvestError::Classification(format!(
                "row for {} has {} cells, schema has {}",
                record.nct_id.as_deref().unwrap_or("<no id>"),
                cells.len(),
                self.schema.len()
            )));
        }

        Ok(NormalizedRow {
            nct_id: record.nct_id.clone(),
            sponsor_group,
            cells,
        })
    }
}

fn opt(value: Option<&str>) -> String {
    value.unwrap_or_default().to_string()
}

fn opt_num<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn date_cell(date: &Option<PartialDate>) -> String {
    date.as_ref().map(PartialDate::canonical).unwrap_or_default()
}

fn precision_cell(date: &Option<PartialDate>) -> String {
    date.as_ref()
        .map(|d| d.precision().to_string())
        .unwrap_or_default()
}

fn parse_date_field(
    raw: Option<&str>,
    field: &str,
    issues: &mut Vec<FieldIssue>,
) -> Option<PartialDate> {
    let date = PartialDate::parse(raw?);
    if let PartialDate::Unparsed(ref text) = date {
        issues.push(FieldIssue::new(field, format!("unrecognised date '{}'", text)));
    }
    Some(date)
}

fn parse_age_field(raw: Option<&str>, field: &str, issues: &mut Vec<FieldIssue>) -> Option<Age> {
    let raw = raw?;
    let age = Age::parse(raw);
    if age.is_none() {
        issues.push(FieldIssue::new(field, format!("unrecognised age '{}'", raw)));
    }
    age
}

// ═══════════════════════════════════════════════════════════════════════
// Multi-valued cells
// ═══════════════════════════════════════════════════════════════════════

/// Join items with [`MULTI_VALUE_SEPARATOR`].
///
/// Items are trimmed, empty items dropped, and duplicates removed
/// case-insensitively keeping the first spelling.
pub fn join_multi<I, S>(items: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen: Vec<String> = Vec::new();
    let mut out = String::new();
    for item in items {
        let item = item.as_ref().trim();
        if item.is_empty() {
            continue;
        }
        let key = item.to_lowercase();
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        if !out.is_empty() {
            out.push(MULTI_VALUE_SEPARATOR);
        }
        for c in item.chars() {
            if c == MULTI_VALUE_SEPARATOR || c == '\\' {
                out.push('\\');
            }
            out.push(c);
        }
    }
    out
}

/// Inverse of [`join_multi`]: split a cell back into its items.
pub fn split_multi(cell: &str) -> Vec<String> {
    if cell.is_empty() {
        return Vec::new();
    }
    let mut items = Vec::new();
    let mut current = String::new();
    let mut chars = cell.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            MULTI_VALUE_SEPARATOR => items.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    items.push(current);
    items
}

// ═══════════════════════════════════════════════════════════════════════
// Dates
// ═══════════════════════════════════════════════════════════════════════

/// A date at the best granularity the registry provided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartialDate {
    Day(NaiveDate),
    Month { year: i32, month: u32 },
    Year(i32),
    /// Text that is not a recognisable date, kept verbatim.
    Unparsed(String),
}

impl PartialDate {
    /// Parse `2023-05-15`, `2023-05`, `2023`, `May 15, 2023` or `May 2023`.
    /// A timestamp such as `2023-05-15T10:00:00` keeps its date part.
    pub fn parse(raw: &str) -> PartialDate {
        let s = raw.trim();

        if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return PartialDate::Day(d);
        }
        if let Some(Ok(d)) = s
            .get(..10)
            .filter(|_| s[10..].starts_with('T') || s[10..].starts_with(' '))
            .map(|head| NaiveDate::parse_from_str(head, "%Y-%m-%d"))
        {
            return PartialDate::Day(d);
        }
        if let Some(caps) = year_month_re().captures(s) {
            let year: i32 = caps[1].parse().unwrap_or(0);
            let month: u32 = caps[2].parse().unwrap_or(0);
            if (1..=12).contains(&month) {
                return PartialDate::Month { year, month };
            }
        }
        if s.len() == 4 && s.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(year) = s.parse() {
                return PartialDate::Year(year);
            }
        }
        if let Ok(d) = NaiveDate::parse_from_str(s, "%B %d, %Y") {
            return PartialDate::Day(d);
        }
        if let Ok(d) = NaiveDate::parse_from_str(&format!("1 {}", s), "%d %B %Y") {
            return PartialDate::Month {
                year: d.year(),
                month: d.month(),
            };
        }
        PartialDate::Unparsed(s.to_string())
    }

    pub fn canonical(&self) -> String {
        match self {
            PartialDate::Day(d) => d.format("%Y-%m-%d").to_string(),
            PartialDate::Month { year, month } => format!("{:04}-{:02}", year, month),
            PartialDate::Year(year) => format!("{:04}", year),
            PartialDate::Unparsed(text) => text.clone(),
        }
    }

    pub fn precision(&self) -> &'static str {
        match self {
            PartialDate::Day(_) => "day",
            PartialDate::Month { .. } => "month",
            PartialDate::Year(_) => "year",
            PartialDate::Unparsed(_) => "unparsed",
        }
    }

    /// First day of the period, if the date was understood.
    pub fn anchor(&self) -> Option<NaiveDate> {
        match self {
            PartialDate::Day(d) => Some(*d),
            PartialDate::Month { year, month } => NaiveDate::from_ymd_opt(*year, *month, 1),
            PartialDate::Year(year) => NaiveDate::from_ymd_opt(*year, 1, 1),
            PartialDate::Unparsed(_) => None,
        }
    }
}

fn year_month_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{4})-(\d{1,2})$").unwrap())
}

// ═══════════════════════════════════════════════════════════════════════
// Field value maps
// ═══════════════════════════════════════════════════════════════════════

/// An eligibility age such as `18 Years`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Age {
    pub value: u32,
    pub unit: Option<&'static str>,
}

impl Age {
    pub fn parse(raw: &str) -> Option<Age> {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| {
            Regex::new(r"(?i)^\s*(\d+)\s*(years?|months?|weeks?|days?|hours?|minutes?)?\s*$")
                .unwrap()
        });
        let caps = re.captures(raw)?;
        let value = caps[1].parse().ok()?;
        let unit = caps.get(2).map(|m| {
            let lower = m.as_str().to_lowercase();
            match lower.trim_end_matches('s') {
                "year" => "Years",
                "month" => "Months",
                "week" => "Weeks",
                "day" => "Days",
                "hour" => "Hours",
                _ => "Minutes",
            }
        });
        Some(Age { value, unit })
    }
}

/// `ALL`/`MALE`/`FEMALE` (and `M`/`F`) to title case; anything else as is.
pub fn normalize_gender(raw: &str) -> String {
    match raw.trim().to_ascii_uppercase().as_str() {
        "ALL" => "All".to_string(),
        "MALE" | "M" => "Male".to_string(),
        "FEMALE" | "F" => "Female".to_string(),
        _ => raw.trim().to_string(),
    }
}

/// `PHASE2` → `Phase 2`, `EARLY_PHASE1` → `Early Phase 1`, `NA` → `Not Applicable`.
pub fn normalize_phase(raw: &str) -> String {
    let upper = raw.trim().to_ascii_uppercase();
    if upper == "NA" {
        return "Not Applicable".to_string();
    }
    if let Some(n) = upper.strip_prefix("EARLY_PHASE") {
        return format!("Early Phase {}", n);
    }
    if let Some(n) = upper.strip_prefix("PHASE") {
        return format!("Phase {}", n.trim_start_matches('_'));
    }
    raw.trim().to_string()
}

/// Maps free-form sponsor names onto configured canonical groups.
#[derive(Debug, Clone, Default)]
pub struct SponsorMatcher {
    /// (lowercased fragment, canonical name); aliases first, then groups.
    rules: Vec<(String, String)>,
}

impl SponsorMatcher {
    pub fn new(config: &SponsorsConfig) -> Self {
        let rules = config
            .aliases
            .iter()
            .map(|(fragment, canonical)| (fragment.to_lowercase(), canonical.clone()))
            .chain(
                config
                    .groups
                    .iter()
                    .map(|group| (group.to_lowercase(), group.clone())),
            )
            .filter(|(fragment, _)| !fragment.trim().is_empty())
            .collect();
        Self { rules }
    }

    /// Canonical group whose fragment occurs in `sponsor`, if any.
    pub fn group(&self, sponsor: &str) -> Option<&str> {
        let lower = sponsor.to_lowercase();
        self.rules
            .iter()
            .find(|(fragment, _)| lower.contains(fragment.as_str()))
            .map(|(_, canonical)| canonical.as_str())
    }
}
