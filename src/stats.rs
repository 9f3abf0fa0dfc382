//! Run ledger overview.
//!
//! Shows the stored cursor and the most recent runs with their outcome.
//! Used by `trials stats` to confirm that scheduled runs are succeeding and
//! the window is moving forward.

use anyhow::Result;

use crate::config::Config;
use crate::db;
use crate::migrate::ensure_schema;
use crate::state;

const RECENT_RUNS: i64 = 10;

/// Run the stats command: query the ledger and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    ensure_schema(&pool).await?;

    let cursor = state::get_cursor(&pool).await?;
    let total_runs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM runs")
        .fetch_one(&pool)
        .await?;
    let succeeded: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM runs WHERE status = 'succeeded'")
        .fetch_one(&pool)
        .await?;
    let runs = state::recent_runs(&pool, RECENT_RUNS).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Trial Harvest — Run Ledger");
    println!("==========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Output:      {}", config.output.dir.display());
    println!();
    match cursor {
        Some(ref c) => println!(
            "  Cursor:      {} (set {})",
            c.since.format("%Y-%m-%d"),
            format_ts_relative(c.updated_at)
        ),
        None => println!("  Cursor:      none (next run is a full snapshot)"),
    }
    println!("  Runs:        {} ({} succeeded)", total_runs, succeeded);

    if !runs.is_empty() {
        println!();
        println!("  Recent runs:");
        println!(
            "  {:<18} {:<12} {:<12} {:<10} {:>7} {:>6}   {}",
            "STARTED", "SINCE", "AS OF", "STATUS", "ROWS", "PAGES", "STAGE"
        );
        println!("  {}", "-".repeat(84));

        for run in &runs {
            println!(
                "  {:<18} {:<12} {:<12} {:<10} {:>7} {:>6}   {}",
                format_ts_relative(run.started_at),
                run.since.as_deref().unwrap_or("full"),
                run.as_of,
                run.status,
                run.rows,
                run.pages,
                run.stage.as_deref().unwrap_or("-")
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Print the stored cursor (`trials cursor show`).
pub async fn run_cursor_show(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    ensure_schema(&pool).await?;
    match state::get_cursor(&pool).await? {
        Some(c) => println!("{}", c.since.format("%Y-%m-%d")),
        None => println!("none"),
    }
    pool.close().await;
    Ok(())
}

/// Clear the stored cursor so the next run is a full snapshot
/// (`trials cursor reset`).
pub async fn run_cursor_reset(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    ensure_schema(&pool).await?;
    if state::clear_cursor(&pool).await? {
        tracing::info!("cursor cleared");
        println!("cursor cleared; next run is a full snapshot");
    } else {
        println!("no cursor stored");
    }
    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    format_ts_relative_to(ts, chrono::Utc::now().timestamp())
}

fn format_ts_relative_to(ts: i64, now: i64) -> String {
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
