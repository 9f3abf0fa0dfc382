//! Harvest progress reporting.
//!
//! Reports pages fetched (against the registry's reported total, when
//! known) and the tables being written. Progress goes to **stderr** so the
//! run summary on stdout stays parseable for scripts.

use std::io::Write;

/// A single progress event for a harvest run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HarvestProgressEvent {
    /// A page was retrieved. `pages_expected` is `None` until the registry
    /// reports a total.
    Fetching {
        page: u32,
        pages_expected: Option<u32>,
        records: u64,
    },
    /// Output tables are being written.
    Writing { rows: u64, tables: usize },
}

/// Reports harvest progress. Implementations write to stderr (human or JSON).
pub trait HarvestProgressReporter: Send + Sync {
    fn report(&self, event: HarvestProgressEvent);
}

/// Human-friendly progress: "harvest  fetching  page 3 / 12  2,000 records".
pub struct StderrProgress;

impl HarvestProgressReporter for StderrProgress {
    fn report(&self, event: HarvestProgressEvent) {
        let line = match &event {
            HarvestProgressEvent::Fetching {
                page,
                pages_expected,
                records,
            } => {
                let total = pages_expected
                    .map(|t| format_number(u64::from(t)))
                    .unwrap_or_else(|| "?".to_string());
                format!(
                    "harvest  fetching  page {} / {}  {} records\n",
                    format_number(u64::from(*page)),
                    total,
                    format_number(*records)
                )
            }
            HarvestProgressEvent::Writing { rows, tables } => {
                format!(
                    "harvest  writing  {} rows to {} table(s)\n",
                    format_number(*rows),
                    tables
                )
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl HarvestProgressReporter for JsonProgress {
    fn report(&self, event: HarvestProgressEvent) {
        let obj = match &event {
            HarvestProgressEvent::Fetching {
                page,
                pages_expected,
                records,
            } => serde_json::json!({
                "event": "progress",
                "phase": "fetching",
                "page": page,
                "pages_expected": pages_expected,
                "records": records
            }),
            HarvestProgressEvent::Writing { rows, tables } => serde_json::json!({
                "event": "progress",
                "phase": "writing",
                "rows": rows,
                "tables": tables
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl HarvestProgressReporter for NoProgress {
    fn report(&self, _event: HarvestProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Parse the `--progress` flag. `auto` is human on a TTY, otherwise off.
    pub fn from_flag(flag: &str) -> Option<Self> {
        match flag {
            "auto" => Some(Self::default_for_tty()),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            "off" => Some(ProgressMode::Off),
            _ => None,
        }
    }

    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn HarvestProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
