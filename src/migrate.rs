use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the run-ledger schema. Safe to run repeatedly.
pub async fn run_migrations(config: &Config) -> Result<(), sqlx::Error> {
    let pool = db::connect(config).await?;
    ensure_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn ensure_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    // "since last run" cursor, one row per source
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            source TEXT PRIMARY KEY,
            cursor TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id TEXT PRIMARY KEY,
            started_at INTEGER NOT NULL,
            finished_at INTEGER,
            window_since TEXT,
            as_of TEXT NOT NULL,
            status TEXT NOT NULL,
            stage TEXT,
            message TEXT,
            rows INTEGER NOT NULL DEFAULT 0,
            pages INTEGER NOT NULL DEFAULT 0,
            digest TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at DESC)")
        .execute(pool)
        .await?;

    Ok(())
}
