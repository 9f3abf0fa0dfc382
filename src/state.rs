//! Run ledger: the "since last run" cursor and the history of runs.
//!
//! The cursor lives in the `checkpoints` table under the key
//! [`CURSOR_SOURCE`] and holds the reference date of the last successful
//! run. The orchestrator reads it at start and writes it only after the
//! output is committed.

use chrono::{NaiveDate, Utc};
use sqlx::{Row, SqlitePool};

pub const CURSOR_SOURCE: &str = "registry";

/// Stored "since last run" marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub since: NaiveDate,
    /// Unix seconds of the last write.
    pub updated_at: i64,
}

pub async fn get_cursor(pool: &SqlitePool) -> Result<Option<Cursor>, sqlx::Error> {
    let row = sqlx::query("SELECT cursor, updated_at FROM checkpoints WHERE source = ?")
        .bind(CURSOR_SOURCE)
        .fetch_optional(pool)
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let value: String = row.get("cursor");
    let since = NaiveDate::parse_from_str(&value, "%Y-%m-%d")
        .map_err(|e| sqlx::Error::Decode(format!("stored cursor '{}': {}", value, e).into()))?;
    Ok(Some(Cursor {
        since,
        updated_at: row.get("updated_at"),
    }))
}

pub async fn set_cursor(pool: &SqlitePool, since: NaiveDate) -> Result<(), sqlx::Error> {
    let now = Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO checkpoints (source, cursor, updated_at) VALUES (?, ?, ?)
        ON CONFLICT(source) DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at
        "#,
    )
    .bind(CURSOR_SOURCE)
    .bind(since.format("%Y-%m-%d").to_string())
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

/// Remove the cursor. Returns whether one was stored.
pub async fn clear_cursor(pool: &SqlitePool) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM checkpoints WHERE source = ?")
        .bind(CURSOR_SOURCE)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Outcome of a finished run, as written to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded {
        rows: usize,
        pages: u32,
        digest: Option<String>,
    },
    Failed {
        stage: &'static str,
        message: String,
        pages: u32,
    },
}

/// One row of the `runs` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub id: String,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub since: Option<String>,
    pub as_of: String,
    pub status: String,
    pub stage: Option<String>,
    pub message: Option<String>,
    pub rows: i64,
    pub pages: i64,
    pub digest: Option<String>,
}

pub async fn record_run_start(
    pool: &SqlitePool,
    id: &str,
    since: Option<NaiveDate>,
    as_of: NaiveDate,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO runs (id, started_at, window_since, as_of, status) VALUES (?, ?, ?, ?, 'running')",
    )
    .bind(id)
    .bind(Utc::now().timestamp())
    .bind(since.map(|d| d.format("%Y-%m-%d").to_string()))
    .bind(as_of.format("%Y-%m-%d").to_string())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn record_run_finish(
    pool: &SqlitePool,
    id: &str,
    outcome: &RunOutcome,
) -> Result<(), sqlx::Error> {
    let now = Utc::now().timestamp();
    match outcome {
        RunOutcome::Succeeded {
            rows,
            pages,
            digest,
        } => {
            sqlx::query(
                "UPDATE runs SET status = 'succeeded', finished_at = ?, rows = ?, pages = ?, digest = ? WHERE id = ?",
            )
            .bind(now)
            .bind(*rows as i64)
            .bind(i64::from(*pages))
            .bind(digest.as_deref())
            .bind(id)
            .execute(pool)
            .await?;
        }
        RunOutcome::Failed {
            stage,
            message,
            pages,
        } => {
            sqlx::query(
                "UPDATE runs SET status = 'failed', finished_at = ?, stage = ?, message = ?, pages = ? WHERE id = ?",
            )
            .bind(now)
            .bind(*stage)
            .bind(message)
            .bind(i64::from(*pages))
            .bind(id)
            .execute(pool)
            .await?;
        }
    }
    Ok(())
}

/// Most recent runs first.
pub async fn recent_runs(pool: &SqlitePool, limit: i64) -> Result<Vec<RunRecord>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT id, started_at, finished_at, window_since, as_of, status, stage, message, rows, pages, digest
        FROM runs
        ORDER BY started_at DESC, rowid DESC
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| RunRecord {
            id: row.get("id"),
            started_at: row.get("started_at"),
            finished_at: row.get("finished_at"),
            since: row.get("window_since"),
            as_of: row.get("as_of"),
            status: row.get("status"),
            stage: row.get("stage"),
            message: row.get("message"),
            rows: row.get("rows"),
            pages: row.get("pages"),
            digest: row.get("digest"),
        })
        .collect())
}
