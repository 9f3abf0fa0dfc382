//! CSV output with commit-on-success semantics.
//!
//! Each table of a run is rendered in memory, hashed, and written to a
//! hidden temporary file inside the output directory. Nothing is visible
//! under its final name until [`OutputBatch::commit`] renames every staged
//! table into place. Dropping an uncommitted batch (failure, cancellation)
//! deletes the temporaries, so consumers never see a partial artifact.

use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::error::HarvestError;
use crate::normalize::{NormalizedRow, Schema};

/// A table written (or about to be written) by a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableFile {
    pub name: String,
    pub path: PathBuf,
    pub rows: usize,
    /// SHA-256 of the file contents, lowercase hex.
    pub digest: String,
}

/// File name for one table of a run.
///
/// `<prefix>_full_<as_of>.csv` for a full snapshot,
/// `<prefix>_<since>_<as_of>.csv` for a bounded window, with `_<suffix>`
/// inserted before the extension for secondary tables.
pub fn table_file_name(
    prefix: &str,
    since: Option<NaiveDate>,
    as_of: NaiveDate,
    suffix: Option<&str>,
) -> String {
    let window = match since {
        Some(since) => since.format("%Y-%m-%d").to_string(),
        None => "full".to_string(),
    };
    let mut name = format!("{}_{}_{}", prefix, window, as_of.format("%Y-%m-%d"));
    if let Some(suffix) = suffix {
        name.push('_');
        name.push_str(suffix);
    }
    name.push_str(".csv");
    name
}

/// Order rows by trial identifier; rows without one go last, in arrival order.
pub fn sort_rows(rows: &mut [NormalizedRow]) {
    rows.sort_by(|a, b| match (&a.nct_id, &b.nct_id) {
        (Some(x), Some(y)) => x.cmp(y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
}

/// Render a header plus `rows` as CSV bytes.
pub fn render_csv<'a, I>(schema: &Schema, rows: I) -> Result<Vec<u8>, csv::Error>
where
    I: IntoIterator<Item = &'a NormalizedRow>,
{
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(schema.columns())?;
    for row in rows {
        writer.write_record(&row.cells)?;
    }
    writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))
}

struct StagedTable {
    file: NamedTempFile,
    info: TableFile,
}

/// The set of tables a run produces, staged until commit.
pub struct OutputBatch {
    dir: PathBuf,
    staged: Vec<StagedTable>,
}

impl OutputBatch {
    /// Prepare a batch in `dir`, creating the directory if needed.
    pub fn new(dir: &Path) -> Result<Self, HarvestError> {
        std::fs::create_dir_all(dir).map_err(|e| {
            HarvestError::sink(0, format!("cannot create {}: {}", dir.display(), e))
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
            staged: Vec::new(),
        })
    }

    /// Write one table to a temporary file in the output directory.
    pub fn stage<'a, I>(
        &mut self,
        name: &str,
        schema: &Schema,
        rows: I,
    ) -> Result<&TableFile, HarvestError>
    where
        I: IntoIterator<Item = &'a NormalizedRow>,
        I::IntoIter: ExactSizeIterator,
    {
        let rows = rows.into_iter();
        let count = rows.len();
        let bytes = render_csv(schema, rows).map_err(|e| HarvestError::sink(count, e))?;
        let digest = format!("{:x}", Sha256::digest(&bytes));

        let mut file = tempfile::Builder::new()
            .prefix(".trials-")
            .suffix(".csv.tmp")
            .tempfile_in(&self.dir)
            .map_err(|e| HarvestError::sink(count, e))?;
        file.write_all(&bytes)
            .and_then(|_| file.as_file().sync_all())
            .map_err(|e| HarvestError::sink(count, e))?;

        tracing::debug!(table = name, rows = count, temp = %file.path().display(), "table staged");

        self.staged.push(StagedTable {
            file,
            info: TableFile {
                name: name.to_string(),
                path: self.dir.join(name),
                rows: count,
                digest,
            },
        });
        Ok(&self.staged[self.staged.len() - 1].info)
    }

    pub fn tables(&self) -> Vec<&TableFile> {
        self.staged.iter().map(|s| &s.info).collect()
    }

    /// Rows of the first (main) table, or zero when nothing is staged.
    pub fn rows_ready(&self) -> usize {
        self.staged.first().map(|s| s.info.rows).unwrap_or(0)
    }

    /// Move every staged table to its final name.
    ///
    /// Tables already present under a final name are set aside first. If
    /// any rename fails, tables already moved by this call are removed, the
    /// set-aside tables are put back and the remaining temporaries are
    /// discarded.
    pub fn commit(self) -> Result<Vec<TableFile>, HarvestError> {
        let rows_ready = self.rows_ready();

        let mut backups: Vec<(PathBuf, PathBuf)> = Vec::new();
        for staged in &self.staged {
            let target = &staged.info.path;
            if !target.is_file() {
                continue;
            }
            let backup = self.dir.join(format!(".trials-{}.bak", staged.info.name));
            if let Err(e) = std::fs::rename(target, &backup) {
                restore(&backups);
                return Err(HarvestError::sink(
                    rows_ready,
                    format!("cannot set aside existing {}: {}", staged.info.name, e),
                ));
            }
            backups.push((backup, target.clone()));
        }

        let mut committed: Vec<TableFile> = Vec::with_capacity(self.staged.len());
        for staged in self.staged {
            if let Err(e) = staged.file.persist(&staged.info.path) {
                for table in &committed {
                    let _ = std::fs::remove_file(&table.path);
                }
                restore(&backups);
                return Err(HarvestError::sink(
                    rows_ready,
                    format!("cannot move {} into place: {}", staged.info.name, e.error),
                ));
            }
            committed.push(staged.info);
        }

        for (backup, _) in &backups {
            let _ = std::fs::remove_file(backup);
        }
        Ok(committed)
    }
}

/// Put set-aside tables back under their own names.
fn restore(backups: &[(PathBuf, PathBuf)]) {
    for (backup, target) in backups {
        if let Err(e) = std::fs::rename(backup, target) {
            tracing::error!(
                backup = %backup.display(),
                error = %e,
                "could not restore previous table"
            );
        }
    }
}
