//! TOML configuration.
//!
//! ```toml
//! [db]
//! path = "./data/trials.sqlite"
//!
//! [registry]
//! page_size = 1000
//! max_retries = 5
//! condition = "diabetes"
//!
//! [[classification.lists]]
//! column = "condition_group"
//! path = "./keywords/conditions.txt"
//! unmatched = "OTHER"
//!
//! [output]
//! dir = "./output"
//!
//! [sponsors]
//! groups = ["Novo Nordisk", "Pfizer", "MSD"]
//! aliases = { "Merck Sharp & Dohme" = "MSD" }
//! ```
//!
//! Only `[[classification.lists]]` is required; every other key has a default.

use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::HarvestError;
use crate::normalize::is_reserved_column;

/// Largest page the registry will serve.
pub const MAX_PAGE_SIZE: u32 = 1000;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    pub classification: ClassificationConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub sponsors: SponsorsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/trials.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_study_url_base")]
    pub study_url_base: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default)]
    pub max_records: Option<usize>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_sort")]
    pub sort: String,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub term: Option<String>,
    #[serde(default)]
    pub overall_status: Vec<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            study_url_base: default_study_url_base(),
            page_size: default_page_size(),
            max_records: None,
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            timeout_secs: default_timeout_secs(),
            sort: default_sort(),
            condition: None,
            term: None,
            overall_status: Vec::new(),
        }
    }
}

fn default_base_url() -> String {
    "https://clinicaltrials.gov/api/v2/studies".to_string()
}
fn default_study_url_base() -> String {
    "https://clinicaltrials.gov/study/".to_string()
}
fn default_page_size() -> u32 {
    MAX_PAGE_SIZE
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_backoff_ms() -> u64 {
    5000
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_sort() -> String {
    "LastUpdatePostDate".to_string()
}

/// Free-text fields of a trial the classifier may search.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TextField {
    Title,
    OfficialTitle,
    Conditions,
    Keywords,
    BriefSummary,
    DetailedDescription,
    Interventions,
    InclusionCriteria,
}

impl TextField {
    pub fn as_str(&self) -> &'static str {
        match self {
            TextField::Title => "title",
            TextField::OfficialTitle => "official_title",
            TextField::Conditions => "conditions",
            TextField::Keywords => "keywords",
            TextField::BriefSummary => "brief_summary",
            TextField::DetailedDescription => "detailed_description",
            TextField::Interventions => "interventions",
            TextField::InclusionCriteria => "inclusion_criteria",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClassificationConfig {
    #[serde(default = "default_fields")]
    pub fields: Vec<TextField>,
    pub lists: Vec<KeywordListConfig>,
}

fn default_fields() -> Vec<TextField> {
    vec![
        TextField::Title,
        TextField::OfficialTitle,
        TextField::Conditions,
        TextField::Keywords,
        TextField::BriefSummary,
        TextField::DetailedDescription,
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct KeywordListConfig {
    /// Output column holding this list's matched categories.
    pub column: String,
    pub path: PathBuf,
    /// Placeholder written when no term of this list matched.
    #[serde(default)]
    pub unmatched: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            prefix: default_prefix(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./output")
}
fn default_prefix() -> String {
    "clinical_trials".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SponsorsConfig {
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

impl SponsorsConfig {
    pub fn filter_enabled(&self) -> bool {
        !self.groups.is_empty()
    }
}

/// Read and validate a configuration file.
///
/// Relative keyword-list paths are resolved against the directory holding
/// the configuration file, so a config can travel with its keyword lists.
pub fn load_config(path: &Path) -> Result<Config, HarvestError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        HarvestError::config(format!(
            "failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;

    let mut config = parse_config(&content)?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    for list in &mut config.classification.lists {
        if list.path.is_relative() {
            list.path = base.join(&list.path);
        }
    }

    Ok(config)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config, HarvestError> {
    let config: Config = toml::from_str(content)
        .map_err(|e| HarvestError::config(format!("failed to parse config file: {}", e)))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), HarvestError> {
    let registry = &config.registry;
    if registry.base_url.trim().is_empty() {
        return Err(HarvestError::config("registry.base_url must not be empty"));
    }
    if !(1..=MAX_PAGE_SIZE).contains(&registry.page_size) {
        return Err(HarvestError::config(format!(
            "registry.page_size must be in 1..={}",
            MAX_PAGE_SIZE
        )));
    }
    if registry.timeout_secs == 0 {
        return Err(HarvestError::config("registry.timeout_secs must be > 0"));
    }
    if registry.max_records == Some(0) {
        return Err(HarvestError::config("registry.max_records must be > 0"));
    }

    let classification = &config.classification;
    if classification.lists.is_empty() {
        return Err(HarvestError::config(
            "at least one [[classification.lists]] entry is required",
        ));
    }
    if classification.fields.is_empty() {
        return Err(HarvestError::config(
            "classification.fields must name at least one field",
        ));
    }

    let mut seen = HashSet::new();
    for list in &classification.lists {
        let column = list.column.trim();
        if column.is_empty() {
            return Err(HarvestError::config(
                "classification.lists.column must not be empty",
            ));
        }
        if is_reserved_column(column) {
            return Err(HarvestError::config(format!(
                "classification column '{}' clashes with a built-in column",
                column
            )));
        }
        if !seen.insert(column.to_string()) {
            return Err(HarvestError::config(format!(
                "duplicate classification column '{}'",
                column
            )));
        }
    }

    if config.output.prefix.trim().is_empty() {
        return Err(HarvestError::config("output.prefix must not be empty"));
    }

    Ok(())
}
