//! Pre-flight validation for `trials check`.
//!
//! Loads every keyword list the way a run would and reports what the next
//! run would do, without contacting the registry or writing anything.

use crate::classify::Classifier;
use crate::client::QuerySpec;
use crate::config::Config;
use crate::db;
use crate::error::HarvestError;
use crate::normalize::Schema;
use crate::state;

/// Summary of one keyword list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListSummary {
    pub column: String,
    pub terms: usize,
    pub categories: usize,
}

/// Validate the configuration and keyword lists and print a report.
pub async fn run_check(config: &Config) -> Result<Vec<ListSummary>, HarvestError> {
    let classifier = Classifier::load(&config.classification)?;
    let summaries = summarize(&classifier);
    let schema = Schema::new(summaries.iter().map(|s| s.column.clone()));

    println!("{:<24} {:>6} {:>11}", "LIST", "TERMS", "CATEGORIES");
    for s in &summaries {
        println!("{:<24} {:>6} {:>11}", s.column, s.terms, s.categories);
    }
    println!();

    let fields: Vec<&str> = classifier.fields().iter().map(|f| f.as_str()).collect();
    println!("fields searched: {}", fields.join(", "));
    println!("output columns: {}", schema.len());
    println!("output dir: {}", config.output.dir.display());
    if config.sponsors.filter_enabled() {
        println!("sponsor groups: {}", config.sponsors.groups.join(", "));
    }

    // Only read the ledger if one exists; check never creates it.
    let cursor = if config.db.path.exists() {
        let pool = db::connect(config).await?;
        let has_table: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='checkpoints'",
        )
        .fetch_one(&pool)
        .await?;
        let cursor = if has_table {
            state::get_cursor(&pool).await?
        } else {
            None
        };
        pool.close().await;
        cursor
    } else {
        None
    };
    let since = cursor.as_ref().map(|c| c.since);
    match since {
        Some(since) => println!("cursor: {}", since.format("%Y-%m-%d")),
        None => println!("cursor: none (next run is a full snapshot)"),
    }

    let query = QuerySpec::from_config(&config.registry, since);
    let params: Vec<String> = query
        .params(None)
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    println!("query: {}?{}", config.registry.base_url, params.join("&"));
    println!("ok");

    Ok(summaries)
}

pub fn summarize(classifier: &Classifier) -> Vec<ListSummary> {
    classifier
        .lists()
        .iter()
        .map(|l| ListSummary {
            column: l.column.clone(),
            terms: l.terms,
            categories: l.matcher.categories().len(),
        })
        .collect()
}
