use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

/// Opens the lead store, creating the file if needed, and applies pending
/// migrations.
pub async fn init_db(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let connect_options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(connect_options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    let active_leads: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM leads WHERE archived = 0")
        .fetch_one(&pool)
        .await?;
    tracing::info!(database_url, active_leads, "Lead store ready");

    Ok(pool)
}
