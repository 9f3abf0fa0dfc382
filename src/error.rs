//! Run-level error taxonomy.
//!
//! Every failure of a harvest run is one of the [`HarvestError`] variants.
//! Each variant names the pipeline stage that failed and maps to a distinct
//! process exit code, so the scheduler (or a person at a terminal) can tell
//! a bad keyword file from an unreachable registry without reading logs.
//!
//! Field-level problems inside a single study are *not* errors at this
//! level: they are absorbed as [`crate::models::FieldIssue`]s and annotated
//! in the output row.

use std::fmt;

/// A fatal error that aborts a harvest run.
#[derive(Debug, thiserror::Error)]
pub enum HarvestError {
    /// Missing or invalid configuration, unreadable or empty keyword list.
    /// Raised before any network call.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The registry could not be read to completion.
    #[error("retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    /// Classification produced a result that does not fit the run's schema.
    /// Matching itself is total, so this always indicates a defect.
    #[error("classification defect: {0}")]
    Classification(String),

    /// An output table could not be written or committed.
    #[error("could not write output ({rows_ready} rows ready): {reason}")]
    Sink { rows_ready: usize, reason: String },

    /// The run ledger (cursor and run history) could not be read or written.
    #[error("run ledger error: {0}")]
    State(#[from] sqlx::Error),

    /// The run was cancelled before the output was committed.
    #[error("run interrupted after {pages_completed} complete page(s); nothing was written")]
    Interrupted { pages_completed: u32 },
}

impl HarvestError {
    pub fn config(msg: impl Into<String>) -> Self {
        HarvestError::Configuration(msg.into())
    }

    pub fn sink(rows_ready: usize, reason: impl fmt::Display) -> Self {
        HarvestError::Sink {
            rows_ready,
            reason: reason.to_string(),
        }
    }

    /// Name of the pipeline stage that failed.
    pub fn stage(&self) -> &'static str {
        match self {
            HarvestError::Configuration(_) => "configuration",
            HarvestError::Retrieval(_) => "retrieval",
            HarvestError::Classification(_) => "classification",
            HarvestError::Sink { .. } => "output",
            HarvestError::State(_) => "run-ledger",
            HarvestError::Interrupted { .. } => "interrupted",
        }
    }

    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            HarvestError::Configuration(_) => 2,
            HarvestError::Retrieval(_) => 3,
            HarvestError::Classification(_) => 4,
            HarvestError::Sink { .. } => 5,
            HarvestError::State(_) => 6,
            HarvestError::Interrupted { .. } => 130,
        }
    }
}

/// A page of registry results could not be obtained.
///
/// Carries enough context for the caller to judge how far the run got:
/// the page that failed, how many pages were complete before it, and how
/// many pages the registry said there would be (when it reported a total).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalError {
    /// 1-based number of the page that failed.
    pub page: u32,
    /// Continuation token of the failed page (`None` for the first page).
    pub page_token: Option<String>,
    /// Pages fully retrieved before the failure.
    pub pages_completed: u32,
    /// Total pages implied by the registry's `totalCount`, if known.
    pub pages_expected: Option<u32>,
    /// Last HTTP status seen for the failed page, if any response arrived.
    pub last_status: Option<u16>,
    /// Attempts made for the failed page.
    pub attempts: u32,
    pub reason: String,
}

impl RetrievalError {
    /// `"N/M"` progress string, with `?` when the total is unknown.
    pub fn progress(&self) -> String {
        match self.pages_expected {
            Some(total) => format!("{}/{}", self.pages_completed, total),
            None => format!("{}/?", self.pages_completed),
        }
    }
}

impl fmt::Display for RetrievalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page {} failed after {} attempt(s)", self.page, self.attempts)?;
        if let Some(status) = self.last_status {
            write!(f, " (last status {})", status)?;
        }
        write!(f, ": {}; {} pages complete", self.reason, self.progress())?;
        if let Some(ref token) = self.page_token {
            write!(f, " (page token {})", token)?;
        }
        Ok(())
    }
}

impl std::error::Error for RetrievalError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn retrieval(expected: Option<u32>) -> RetrievalError {
        RetrievalError {
            page: 4,
            page_token: Some("abc".to_string()),
            pages_completed: 3,
            pages_expected: expected,
            last_status: Some(503),
            attempts: 6,
            reason: "HTTP 503 Service Unavailable".to_string(),
        }
    }

    #[test]
    fn retrieval_message_reports_progress() {
        let msg = retrieval(Some(7)).to_string();
        assert!(msg.contains("page 4"));
        assert!(msg.contains("3/7 pages complete"));
        assert!(msg.contains("last status 503"));
        assert!(msg.contains("abc"));
    }

    #[test]
    fn retrieval_progress_with_unknown_total() {
        assert_eq!(retrieval(None).progress(), "3/?");
    }

    #[test]
    fn exit_codes_are_distinct_and_nonzero() {
        let errors = [
            HarvestError::config("x"),
            HarvestError::Retrieval(retrieval(None)),
            HarvestError::Classification("x".into()),
            HarvestError::sink(3, "disk full"),
            HarvestError::State(sqlx::Error::PoolClosed),
            HarvestError::Interrupted { pages_completed: 1 },
        ];
        let mut codes: Vec<i32> = errors.iter().map(|e| e.exit_code()).collect();
        assert!(codes.iter().all(|c| *c != 0));
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn sink_error_mentions_ready_rows() {
        let e = HarvestError::sink(42, "permission denied");
        assert_eq!(e.stage(), "output");
        assert!(e.to_string().contains("42 rows ready"));
    }
}
