use crate::error::{EngineError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::ConnectOptions;
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;

fn build_connect_options(database_url: &str) -> Result<SqliteConnectOptions> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| {
            EngineError::Config(format!("Invalid database url '{}': {}", database_url, e))
        })?
        .create_if_missing(true)
        // WAL lets history writes from poll monitors proceed alongside sync runs.
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    Ok(options.log_statements(log::LevelFilter::Debug))
}

pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<Pool<Sqlite>> {
    if database_url.trim().is_empty() {
        return Err(EngineError::Config("Database url is required".to_string()));
    }

    let options = build_connect_options(database_url)?;

    SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(300))
        .max_lifetime(Duration::from_secs(1800))
        .connect_with(options)
        .await
        .map_err(|e| EngineError::Persistence(format!("Failed to open local DB: {}", e)))
}
