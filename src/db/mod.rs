pub mod cache;
pub mod models;
pub mod user_store;
pub mod writer;

pub use cache::TickerCache;
pub use user_store::{ChangeKind, UserChange, UserStore};
pub use writer::{CacheBatch, CacheWriter};

use crate::error::Result;

/// Open (creating if missing) the SQLite file and apply pending migrations.
pub async fn connect(db_path: &str) -> Result<sqlx::SqlitePool> {
    let pool = sqlx::SqlitePool::connect(&format!("sqlite:{db_path}?mode=rwc")).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

/// Single-connection in-memory database with the schema applied.
#[cfg(test)]
pub async fn test_pool() -> sqlx::SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}
