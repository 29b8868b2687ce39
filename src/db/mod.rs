pub mod models;
pub mod queries;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;

pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    // Parse the URL into connect options and enable file creation
    let connect_opts = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = connect(connect_opts).await?;
    tracing::info!("Database initialized at {}", database_url);
    Ok(pool)
}

/// Open a pool for already-built connect options and run the embedded migrations.
///
/// An in-memory database lives and dies with its connection, so it is held on
/// a single connection that is never recycled.
pub async fn connect(connect_opts: SqliteConnectOptions) -> Result<SqlitePool> {
    let filename = connect_opts.clone().get_filename().to_string_lossy().to_string();
    // sqlx rewrites `sqlite::memory:` to a named shared-cache database
    let in_memory = filename.is_empty()
        || filename == ":memory:"
        || filename.starts_with("file:sqlx-in-memory");

    // Ensure the parent directory exists before sqlx tries to open the file
    if !in_memory {
        if let Some(parent) = std::path::Path::new(&filename).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
    }

    let pool_opts = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(10)
    };

    let pool = pool_opts.connect_with(connect_opts).await?;

    // Run embedded migrations
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Fixed-width RFC 3339 form used for every stored timestamp.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_sort_lexicographically() {
        let early = Utc.with_ymd_and_hms(2026, 1, 9, 23, 59, 59).unwrap();
        let late = early + chrono::Duration::milliseconds(1500);
        let (a, b) = (timestamp(early), timestamp(late));
        assert_eq!(a, "2026-01-09T23:59:59.000Z");
        assert_eq!(b, "2026-01-10T00:00:00.500Z");
        assert!(a < b);
        assert_eq!(parse_timestamp(&b), Some(late));
    }

    #[tokio::test]
    async fn memory_pool_keeps_schema() {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM devices")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
