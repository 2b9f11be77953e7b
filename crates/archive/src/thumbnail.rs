//! Pre-rendered JPEG thumbnails, kept in their own database file.
//!
//! Thumbnails are derived data: losing the file loses nothing that can't be
//! regenerated, so it is opened, vacuumed and closed independently of the
//! archive database.

use crate::db::{base_options, checkpoint, open_pool};
use crate::error::{ErrorKind, Result};
use crate::models::{EntryId, now_millis};
use crate::savepoint::Savepoint;
use derive_more::Display;
use exn::ResultExt;
use sqlx::SqlitePool;
use sqlx::migrate::Migrator;
use std::path::Path;
use tracing::instrument;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations/thumbnail");
const MAX_CONNECTIONS: u32 = 2;

/// The three rendered sizes of a thumbnail.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Size {
    #[display("small")]
    Small,
    #[display("medium")]
    Medium,
    #[display("large")]
    Large,
}

/// JPEG bytes for every size, stored together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Jpegs {
    pub small: Vec<u8>,
    pub medium: Vec<u8>,
    pub large: Vec<u8>,
}

/// Connection pool for the thumbnail database.
#[derive(Debug, Clone)]
pub struct ThumbnailDatabase {
    pool: SqlitePool,
}

impl ThumbnailDatabase {
    /// Connect to (creating if needed) the thumbnail database at `path`.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let options = base_options().filename(path.as_ref()).create_if_missing(true);
        let pool = open_pool(options, MAX_CONNECTIONS, &MIGRATOR).await?;
        Ok(Self { pool })
    }

    pub async fn connect_in_memory() -> Result<Self> {
        let options = base_options().filename(":memory:");
        let pool = open_pool(options, 1, &MIGRATOR).await?;
        Ok(Self { pool })
    }

    /// Store (or replace) every size for an entry.
    pub async fn set_jpeg(&self, id: EntryId, jpegs: &Jpegs) -> Result<()> {
        sqlx::query(include_str!("../queries/upsert_thumbnail.sql"))
            .bind(id)
            .bind(jpegs.small.as_slice())
            .bind(jpegs.medium.as_slice())
            .bind(jpegs.large.as_slice())
            .bind(now_millis()?)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    pub async fn get_jpeg(&self, id: EntryId, size: Size) -> Result<Option<Vec<u8>>> {
        sqlx::query_scalar(include_str!("../queries/get_thumbnail.sql"))
            .bind(id)
            .bind(size.to_string())
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    pub async fn exists(&self, id: EntryId) -> Result<bool> {
        sqlx::query_scalar(include_str!("../queries/thumbnail_exists.sql"))
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    /// Drop the thumbnails of an entry. Returns whether there were any.
    pub async fn delete(&self, id: EntryId) -> Result<bool> {
        let mut conn = self.pool.acquire().await.or_raise(|| ErrorKind::Database)?;
        let mut sp = Savepoint::begin(&mut conn, "delete").await?;
        let result = sqlx::query(include_str!("../queries/delete_thumbnail.sql"))
            .bind(id)
            .execute(&mut *sp)
            .await
            .or_raise(|| ErrorKind::Database)?;
        sp.release().await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument("vacuuming thumbnail database", skip(self))]
    pub async fn vacuum(&self) -> Result<()> {
        sqlx::query("VACUUM").execute(&self.pool).await.or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    pub async fn close(&self) {
        if let Err(e) = checkpoint(&self.pool).await {
            tracing::warn!(error = %e, "Could not checkpoint thumbnail database before closing");
        }
        self.pool.close().await;
    }
}
