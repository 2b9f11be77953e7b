//! Database connection and pool management.

use exn::ResultExt;
use sqlx::SqliteConnection;
use sqlx::migrate::Migrator;
use sqlx::pool::PoolConnectionMetadata;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::path::Path;
use tracing::instrument;

use crate::error::{ErrorKind, Result};

/// Embedded migrations that are run automatically on connect.
static MIGRATOR: Migrator = sqlx::migrate!("./migrations/archive");
// Readers are plentiful, SQLite serializes the writers anyway.
const MAX_CONNECTIONS: u32 = 5;

/// Open a pool with the shared options and PRAGMAs, then bring the schema
/// up to date with `migrator`.
pub(crate) async fn open_pool(options: SqliteConnectOptions, max: u32, migrator: &Migrator) -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        // Query-based PRAGMAs have to be applied to EVERY connection the pool
        // opens, not only the first one.
        .after_connect(|conn, meta| Box::pin(async move { apply_pragmas(conn, meta).await }))
        .max_connections(max)
        .connect_with(options)
        .await
        .or_raise(|| ErrorKind::Database)?;
    migrate(&pool, migrator).await?;
    Ok(pool)
}

/// Base connection options shared between file and in-memory databases.
pub(crate) fn base_options() -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        // WAL: readers don't block the single writer and vice versa.
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        // Tag maps, hashes and timestamps all cascade from the entry row.
        .foreign_keys(true)
        .synchronous(SqliteSynchronous::Normal)
        // Concurrent imports queue up on the write lock; give them a moment
        // before SQLITE_BUSY surfaces as an error.
        .busy_timeout(std::time::Duration::from_millis(1500))
        // Reclaiming space is an explicit `vacuum()`.
        .auto_vacuum(sqlx::sqlite::SqliteAutoVacuum::None)
}

/// Apply additional PRAGMA settings that aren't exposed via SqliteConnectOptions.
async fn apply_pragmas(conn: &mut SqliteConnection, _meta: PoolConnectionMetadata) -> sqlx::Result<()> {
    sqlx::query(
        r#"
            PRAGMA wal_autocheckpoint = 800;
            PRAGMA cache_size = -8192;
            PRAGMA temp_store = MEMORY;
            PRAGMA analysis_limit = 1000;
        "#,
    )
    .execute(conn)
    .await?;
    Ok(())
}

#[instrument("performing database migrations", skip_all)]
async fn migrate(pool: &SqlitePool, migrator: &Migrator) -> Result<()> {
    migrator.run(pool).await.or_raise(|| ErrorKind::Migration)
}

/// Write the WAL back into the main database file and truncate it.
pub(crate) async fn checkpoint(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await.or_raise(|| ErrorKind::Database)?;
    Ok(())
}

/// Connection pool for the primary archive database.
///
/// Owns the `archive`, `hashes`, `tags`, `tag_map`, `tags_alias`,
/// `archive_timestamps` and `archive_metadata` tables. Repositories are
/// created from it with `From<&Database>`.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect to the archive database at the given path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let options = base_options().filename(path.as_ref()).create_if_missing(true);
        let pool = open_pool(options, MAX_CONNECTIONS, &MIGRATOR).await?;
        Ok(Self { pool })
    }

    /// Connect to an in-memory database.
    ///
    /// Not behind `#[cfg(test)]` so other crates can use it in their tests.
    pub async fn connect_in_memory() -> Result<Self> {
        // Separate connections to ":memory:" see separate databases, so the
        // pool is limited to a single connection.
        let options = base_options().filename(":memory:");
        let pool = open_pool(options, 1, &MIGRATOR).await?;
        Ok(Self { pool })
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Force a WAL checkpoint.
    #[instrument("checkpointing archive database", skip(self))]
    pub async fn checkpoint(&self) -> Result<()> {
        checkpoint(&self.pool).await
    }

    /// Rebuild the database file, reclaiming space left by removed entries.
    #[instrument("vacuuming archive database", skip(self))]
    pub async fn vacuum(&self) -> Result<()> {
        sqlx::query("VACUUM").execute(&self.pool).await.or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Checkpoint, optimize and close the pool.
    ///
    /// Waits for all connections to be returned first. The Database must not
    /// be used afterwards.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            tracing::warn!(error = %e, "Could not checkpoint archive database before closing");
        }
        // Let SQLite update query planner statistics
        _ = sqlx::query("PRAGMA optimize").execute(&self.pool).await;
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_in_memory() {
        let db = Database::connect_in_memory().await.unwrap();
        assert!(!db.pool().is_closed());
        db.close().await;
        assert!(db.pool().is_closed());
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let db = Database::connect_in_memory().await.unwrap();
        migrate(db.pool(), &MIGRATOR).await.unwrap();
        db.close().await;
    }

    #[tokio::test]
    async fn test_pragmas_are_applied() {
        let db = Database::connect_in_memory().await.unwrap();
        let row: (i64,) = sqlx::query_as("PRAGMA foreign_keys").fetch_one(db.pool()).await.unwrap();
        assert_eq!(row.0, 1, "foreign_keys should be ON");
        let row: (i64,) = sqlx::query_as("PRAGMA wal_autocheckpoint").fetch_one(db.pool()).await.unwrap();
        assert_eq!(row.0, 800, "WAL checkpoint should be 800");
        db.close().await;
    }

    #[tokio::test]
    async fn test_connect_file_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.sqlite3");
        let db = Database::connect(&path).await.unwrap();
        sqlx::query("INSERT INTO tags (text) VALUES ('kept')").execute(db.pool()).await.unwrap();
        db.vacuum().await.unwrap();
        db.close().await;
        let db = Database::connect(&path).await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM tags").fetch_one(db.pool()).await.unwrap();
        assert_eq!(count, 1);
        db.close().await;
    }

    #[tokio::test]
    async fn test_alias_and_tag_namespaces_are_disjoint() {
        let db = Database::connect_in_memory().await.unwrap();
        sqlx::query("INSERT INTO tags (text) VALUES ('foo')").execute(db.pool()).await.unwrap();
        sqlx::query("INSERT INTO tags_alias (text, tag_id) VALUES ('bar', 1)").execute(db.pool()).await.unwrap();
        assert!(sqlx::query("INSERT INTO tags (text) VALUES ('bar')").execute(db.pool()).await.is_err());
        assert!(
            sqlx::query("INSERT INTO tags_alias (text, tag_id) VALUES ('foo', 1)")
                .execute(db.pool())
                .await
                .is_err()
        );
        db.close().await;
    }
}
