//! Run orchestrator.
//!
//! One harvest pass: resolve the run window from the stored cursor and the
//! CLI flags, stream pages from the registry, classify and normalize every
//! record, then write the output tables and advance the cursor.
//!
//! ```text
//! cursor ──► RunWindow ──► PageStream ──► classify ──► normalize ──► sort
//!                                                                     │
//!                            cursor ◄── ledger ◄── commit ◄── OutputBatch
//! ```
//!
//! The run is all-or-nothing. Output tables are staged and only renamed
//! into place once every page was retrieved and every table was written.
//! The cursor moves only after that commit, so a failed or interrupted run
//! leaves the next run covering the same window.

use chrono::{NaiveDate, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::classify::Classifier;
use crate::client::{HttpFetcher, PageFetcher, QuerySpec, RegistryClient};
use crate::config::Config;
use crate::db;
use crate::error::HarvestError;
use crate::export::{sort_rows, table_file_name, OutputBatch, TableFile};
use crate::migrate::ensure_schema;
use crate::normalize::{NormalizedRow, Normalizer};
use crate::progress::{HarvestProgressEvent, HarvestProgressReporter};
use crate::state::{self, Cursor, RunOutcome};

/// Flags of one `trials run` invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Ignore the stored cursor and take a full snapshot.
    pub full: bool,
    /// Explicit lower bound, overriding the stored cursor.
    pub since: Option<NaiveDate>,
    /// Reference date of the run; defaults to today (UTC).
    pub as_of: Option<NaiveDate>,
    /// Fetch, classify and normalize, but write nothing.
    pub dry_run: bool,
}

/// The slice of the registry a run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunWindow {
    /// `None` for a full snapshot.
    pub since: Option<NaiveDate>,
    pub as_of: NaiveDate,
}

impl RunWindow {
    pub fn resolve(
        options: &RunOptions,
        cursor: Option<&Cursor>,
        today: NaiveDate,
    ) -> Result<Self, HarvestError> {
        if options.full && options.since.is_some() {
            return Err(HarvestError::config("--full and --since are mutually exclusive"));
        }
        let since = if options.full {
            None
        } else {
            options.since.or(cursor.map(|c| c.since))
        };
        let as_of = options.as_of.unwrap_or(today);
        // The cursor becomes `as_of`; a future one would reject every later run.
        if as_of > today {
            return Err(HarvestError::config(format!(
                "reference date {} is after today ({})",
                as_of, today
            )));
        }
        if let Some(since) = since {
            if since > as_of {
                return Err(HarvestError::config(format!(
                    "window start {} is after the reference date {}",
                    since, as_of
                )));
            }
        }
        Ok(Self { since, as_of })
    }

    pub fn label(&self) -> String {
        match self.since {
            Some(since) => format!("since {}", since.format("%Y-%m-%d")),
            None => "full".to_string(),
        }
    }
}

/// What a run did.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub window: RunWindow,
    pub pages: u32,
    pub pages_expected: Option<u32>,
    pub records: usize,
    pub duplicates: usize,
    pub unclassified: usize,
    /// Records that carried at least one field issue.
    pub records_with_issues: usize,
    /// The record cap stopped retrieval before the registry ran out.
    pub truncated: bool,
    pub tables: Vec<TableFile>,
    /// New cursor value, when the run advanced it.
    pub cursor: Option<NaiveDate>,
    pub dry_run: bool,
}

impl RunReport {
    /// Print the run summary on stdout.
    pub fn print(&self) {
        println!("harvest {}", self.window.label());
        println!("  as of: {}", self.window.as_of.format("%Y-%m-%d"));
        match self.pages_expected {
            Some(total) => println!("  pages: {} / {}", self.pages, total),
            None => println!("  pages: {}", self.pages),
        }
        println!("  records: {}", self.records);
        if self.duplicates > 0 {
            println!("  duplicates skipped: {}", self.duplicates);
        }
        println!("  unclassified: {}", self.unclassified);
        println!("  records with field issues: {}", self.records_with_issues);
        if self.dry_run {
            println!("  dry run: no tables written");
        }
        for table in &self.tables {
            println!(
                "  table: {} ({} rows, sha256 {})",
                table.path.display(),
                table.rows,
                table.digest
            );
        }
        match (self.cursor, self.dry_run, self.truncated) {
            (Some(cursor), _, _) => println!("  cursor: {}", cursor.format("%Y-%m-%d")),
            (None, true, _) => println!("  cursor: unchanged (dry run)"),
            (None, false, true) => println!("  cursor: unchanged (record cap reached)"),
            (None, false, false) => println!("  cursor: unchanged"),
        }
        println!("ok");
    }
}

/// Run one harvest pass against the live registry.
///
/// Ctrl-C aborts the run with [`HarvestError::Interrupted`]; nothing is
/// committed and the cursor is left alone.
pub async fn run_harvest(
    config: &Config,
    options: &RunOptions,
    progress: &dyn HarvestProgressReporter,
) -> Result<RunReport, HarvestError> {
    let fetcher: Arc<dyn PageFetcher> = Arc::new(HttpFetcher::new(&config.registry)?);
    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    run_harvest_with(config, options, fetcher, progress, shutdown).await
}

/// Run one harvest pass with an explicit fetcher and cancellation signal.
///
/// The run aborts as soon as `shutdown` completes.
pub async fn run_harvest_with<F>(
    config: &Config,
    options: &RunOptions,
    fetcher: Arc<dyn PageFetcher>,
    progress: &dyn HarvestProgressReporter,
    shutdown: F,
) -> Result<RunReport, HarvestError>
where
    F: Future<Output = ()>,
{
    // Configuration problems surface before any network call.
    let classifier = Classifier::load(&config.classification)?;

    let pool = db::connect(config).await?;
    ensure_schema(&pool).await?;

    let cursor = if options.full {
        None
    } else {
        state::get_cursor(&pool).await?
    };
    let window = RunWindow::resolve(options, cursor.as_ref(), Utc::now().date_naive())?;
    let run_id = Uuid::new_v4().to_string();

    tracing::info!(
        run_id = %run_id,
        window = %window.label(),
        as_of = %window.as_of,
        dry_run = options.dry_run,
        "harvest started"
    );

    if !options.dry_run {
        state::record_run_start(&pool, &run_id, window.since, window.as_of).await?;
    }

    let pages_done = AtomicU32::new(0);
    let result = tokio::select! {
        result = execute(config, &classifier, window, fetcher, progress, options.dry_run, &pages_done) => result,
        _ = shutdown => Err(HarvestError::Interrupted {
            pages_completed: pages_done.load(Ordering::Relaxed),
        }),
    };

    let result = match result {
        Ok(mut report) => {
            report.run_id = run_id.clone();
            let finished = if options.dry_run {
                Ok(())
            } else {
                finish_run(&pool, &run_id, &mut report).await
            };
            finished.map(|()| report)
        }
        Err(e) => Err(e),
    };

    if let Err(ref e) = result {
        tracing::error!(run_id = %run_id, stage = e.stage(), error = %e, "harvest failed");
        if !options.dry_run {
            let outcome = RunOutcome::Failed {
                stage: e.stage(),
                message: e.to_string(),
                pages: pages_done.load(Ordering::Relaxed),
            };
            if let Err(ledger) = state::record_run_finish(&pool, &run_id, &outcome).await {
                tracing::warn!(error = %ledger, "could not record failed run");
            }
        }
    }

    pool.close().await;
    result
}

/// Record success and advance the cursor, after the tables are committed.
async fn finish_run(
    pool: &sqlx::SqlitePool,
    run_id: &str,
    report: &mut RunReport,
) -> Result<(), HarvestError> {
    if report.truncated {
        tracing::warn!(
            records = report.records,
            "record cap reached; cursor not advanced"
        );
    } else {
        state::set_cursor(pool, report.window.as_of).await?;
        report.cursor = Some(report.window.as_of);
    }
    let outcome = RunOutcome::Succeeded {
        rows: report.records,
        pages: report.pages,
        digest: report.tables.first().map(|t| t.digest.clone()),
    };
    state::record_run_finish(pool, run_id, &outcome).await?;
    tracing::info!(
        run_id = %run_id,
        rows = report.records,
        tables = report.tables.len(),
        "harvest committed"
    );
    Ok(())
}

async fn execute(
    config: &Config,
    classifier: &Classifier,
    window: RunWindow,
    fetcher: Arc<dyn PageFetcher>,
    progress: &dyn HarvestProgressReporter,
    dry_run: bool,
    pages_done: &AtomicU32,
) -> Result<RunReport, HarvestError> {
    let query = QuerySpec::from_config(&config.registry, window.since);
    let client = RegistryClient::new(fetcher, query, &config.registry);
    let normalizer = Normalizer::new(config, classifier, window.as_of);

    let mut rows: Vec<NormalizedRow> = Vec::new();
    let mut unclassified = 0;
    let mut records_with_issues = 0;

    let mut stream = client.pages();
    while let Some(page) = stream.next_page().await? {
        for record in &page.records {
            let classification = classifier.classify(record);
            if classification.is_unclassified() {
                unclassified += 1;
            }
            if !record.issues.is_empty() {
                records_with_issues += 1;
            }
            rows.push(normalizer.normalize(record, &classification)?);
        }
        pages_done.store(page.number, Ordering::Relaxed);
        progress.report(HarvestProgressEvent::Fetching {
            page: page.number,
            pages_expected: stream.pages_expected(),
            records: rows.len() as u64,
        });
    }

    tracing::info!(
        pages = stream.pages_completed(),
        records = rows.len(),
        duplicates = stream.duplicates(),
        "retrieval complete"
    );
    if records_with_issues > 0 {
        tracing::warn!(
            records = records_with_issues,
            "records with unreadable fields; see the field_issues column"
        );
    }

    sort_rows(&mut rows);

    let mut report = RunReport {
        run_id: String::new(),
        window,
        pages: stream.pages_completed(),
        pages_expected: stream.pages_expected(),
        records: rows.len(),
        duplicates: stream.duplicates(),
        unclassified,
        records_with_issues,
        truncated: stream.truncated(),
        tables: Vec::new(),
        cursor: None,
        dry_run,
    };
    if dry_run {
        return Ok(report);
    }

    let schema = normalizer.schema();
    let output = &config.output;
    let mut batch = OutputBatch::new(&output.dir)?;
    let main_name = table_file_name(&output.prefix, window.since, window.as_of, None);
    batch.stage(&main_name, schema, &rows)?;

    if config.sponsors.filter_enabled() {
        let sponsored: Vec<&NormalizedRow> =
            rows.iter().filter(|r| r.sponsor_group.is_some()).collect();
        let name = table_file_name(
            &output.prefix,
            window.since,
            window.as_of,
            Some("sponsors"),
        );
        batch.stage(&name, schema, sponsored.iter().copied())?;
    }

    progress.report(HarvestProgressEvent::Writing {
        rows: rows.len() as u64,
        tables: batch.tables().len(),
    });
    report.tables = batch.commit()?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn cursor(s: &str) -> Cursor {
        Cursor {
            since: date(s),
            updated_at: 0,
        }
    }

    #[test]
    fn window_uses_cursor_by_default() {
        let w = RunWindow::resolve(
            &RunOptions::default(),
            Some(&cursor("2024-05-01")),
            date("2024-06-01"),
        )
        .unwrap();
        assert_eq!(w.since, Some(date("2024-05-01")));
        assert_eq!(w.as_of, date("2024-06-01"));
        assert_eq!(w.label(), "since 2024-05-01");
    }

    #[test]
    fn full_ignores_cursor() {
        let options = RunOptions {
            full: true,
            ..Default::default()
        };
        let w = RunWindow::resolve(&options, Some(&cursor("2024-05-01")), date("2024-06-01"))
            .unwrap();
        assert_eq!(w.since, None);
        assert_eq!(w.label(), "full");
    }

    #[test]
    fn explicit_since_and_as_of_override() {
        let options = RunOptions {
            since: Some(date("2023-01-01")),
            as_of: Some(date("2023-02-01")),
            ..Default::default()
        };
        let w = RunWindow::resolve(&options, Some(&cursor("2024-05-01")), date("2024-06-01"))
            .unwrap();
        assert_eq!(w.since, Some(date("2023-01-01")));
        assert_eq!(w.as_of, date("2023-02-01"));
    }

    #[test]
    fn inverted_window_rejected() {
        let options = RunOptions {
            since: Some(date("2024-07-01")),
            ..Default::default()
        };
        let err = RunWindow::resolve(&options, None, date("2024-06-01")).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn future_reference_date_rejected() {
        let options = RunOptions {
            as_of: Some(date("2030-01-01")),
            ..Default::default()
        };
        let err = RunWindow::resolve(&options, None, date("2024-06-01")).unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("after today"));

        let options = RunOptions {
            as_of: Some(date("2024-06-01")),
            ..Default::default()
        };
        assert!(RunWindow::resolve(&options, None, date("2024-06-01")).is_ok());
    }

    #[test]
    fn full_with_since_rejected() {
        let options = RunOptions {
            full: true,
            since: Some(date("2024-01-01")),
            ..Default::default()
        };
        assert!(RunWindow::resolve(&options, None, date("2024-06-01")).is_err());
    }
}
