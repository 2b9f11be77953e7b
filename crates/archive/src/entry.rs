//! The content-addressed entry store.
//!
//! An entry is created exactly once per distinct content (keyed by MD5) and
//! owns its hashes, timestamps, metadata and perceptual hashes, all of which
//! cascade away with the entry row.

use crate::Database;
use crate::error::{ErrorKind, Result, is_unique_violation};
use crate::hash::{self, Hashes};
use crate::importer::Importer;
use crate::mime;
use crate::models::{
    Entry, EntryId, EntryRow, HashesRow, Metadata, MetadataRow, TimestampRow, TimestampUpdate, Timestamps,
};
use crate::query::{self, Plan, SearchOptions};
use crate::savepoint::Savepoint;
use exn::{OptionExt, ResultExt};
use moon_storage::BackendHandle;
use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqliteConnection, SqlitePool};
use std::path::Path;
use time::UtcDateTime;
use tracing::instrument;

// =========================================================================
// Statements (single connection, composable inside savepoints)
// =========================================================================

pub(crate) async fn get(conn: &mut SqliteConnection, id: EntryId) -> Result<Option<Entry>> {
    let row: Option<EntryRow> = sqlx::query_as(include_str!("../queries/get_entry.sql"))
        .bind(id)
        .fetch_optional(conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(row.map(Entry::from))
}

pub(crate) async fn delete(conn: &mut SqliteConnection, id: EntryId) -> Result<bool> {
    let result = sqlx::query(include_str!("../queries/delete_entry.sql"))
        .bind(id)
        .execute(conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(result.rows_affected() > 0)
}

async fn insert(conn: &mut SqliteConnection, path: &Path, extension: &str) -> Result<EntryId> {
    let path = path.to_str().ok_or_raise(|| ErrorKind::Validation("path must be UTF-8"))?;
    let result = sqlx::query_scalar(include_str!("../queries/insert_entry.sql"))
        .bind(path)
        .bind(extension)
        .fetch_one(conn)
        .await;
    match result {
        Err(e) if is_unique_violation(&e) => Err(e).or_raise(|| ErrorKind::DuplicateEntry),
        other => other.or_raise(|| ErrorKind::Database),
    }
}

/// Store the digests of an entry, replacing any already stored. Content that
/// another entry already has is a duplicate.
async fn put_hashes(conn: &mut SqliteConnection, id: EntryId, hashes: &Hashes) -> Result<()> {
    let result = sqlx::query(include_str!("../queries/upsert_hashes.sql"))
        .bind(id)
        .bind(hashes.md5.as_slice())
        .bind(hashes.sha1.as_slice())
        .bind(hashes.sha256.as_slice())
        .execute(conn)
        .await;
    match result {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => Err(e).or_raise(|| ErrorKind::DuplicateEntry),
        Err(e) => Err(e).or_raise(|| ErrorKind::Database),
    }
}

async fn get_timestamps(conn: &mut SqliteConnection, id: EntryId) -> Result<Option<Timestamps>> {
    let row: Option<TimestampRow> = sqlx::query_as(include_str!("../queries/get_timestamps.sql"))
        .bind(id)
        .fetch_optional(conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    row.map(Timestamps::try_from).transpose()
}

async fn put_timestamps(conn: &mut SqliteConnection, id: EntryId, timestamps: &Timestamps) -> Result<()> {
    let row = TimestampRow::try_from(timestamps)?;
    sqlx::query(include_str!("../queries/upsert_timestamps.sql"))
        .bind(id)
        .bind(row.date_created)
        .bind(row.date_modified)
        .bind(row.date_imported)
        .execute(conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(())
}

async fn put_metadata(conn: &mut SqliteConnection, id: EntryId, metadata: &Metadata) -> Result<()> {
    let row = MetadataRow::try_from(metadata)?;
    sqlx::query(include_str!("../queries/upsert_metadata.sql"))
        .bind(id)
        .bind(row.file_size)
        .bind(row.mime_type)
        .bind(row.width)
        .bind(row.height)
        .bind(row.orientation)
        .execute(conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(())
}

// =========================================================================
// Repository
// =========================================================================

/// Repository for entries and the data hanging off them.
#[derive(Debug, Clone)]
pub struct EntryRepository {
    pool: SqlitePool,
}
impl From<&Database> for EntryRepository {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}
impl EntryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<PoolConnection<Sqlite>> {
        self.pool.acquire().await.or_raise(|| ErrorKind::Database)
    }

    // =========================================================================
    // Import
    // =========================================================================

    /// Create an entry for the content `importer` supplies and place its
    /// bytes in `media`.
    ///
    /// Either everything (entry row, hashes, timestamps, metadata and the
    /// stored file) exists afterwards, or nothing does. Importing content
    /// that is already archived fails with
    /// [`DuplicateEntry`](ErrorKind::DuplicateEntry).
    #[instrument(skip_all, fields(extension = importer.extension()))]
    pub async fn import(&self, importer: &dyn Importer, media: &BackendHandle) -> Result<EntryId> {
        // Everything that can be rejected without the database is rejected
        // first.
        let hashes = importer.hashes()?;
        let extension = hash::normalize_extension(importer.extension())?;
        let path = hash::build_path(&hashes.md5, &extension);
        let times = importer.timestamps();
        let metadata = Metadata::new(importer.file_size(), mime::guess(&extension, importer.head()));

        let mut conn = self.conn().await?;
        let mut sp = Savepoint::begin(&mut *conn, "import").await?;
        let id = insert(&mut sp, &path, &extension).await?;
        put_hashes(&mut sp, id, &hashes).await?;
        let timestamps = Timestamps { created: times.created, modified: times.modified, imported: UtcDateTime::now() };
        put_timestamps(&mut sp, id, &timestamps).await?;
        put_metadata(&mut sp, id, &metadata).await?;
        importer.store(media, &path).await.or_raise(|| ErrorKind::Storage)?;
        if let Err(err) = sp.release().await {
            // The rows are gone again, the file must follow.
            if let Err(cleanup) = media.delete(&path).await {
                tracing::warn!(path = %path.display(), error = %cleanup, "Failed to remove media after aborted import");
            }
            return Err(err);
        }
        tracing::info!(id, path = %path.display(), "Imported entry");
        Ok(id)
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub async fn get(&self, id: EntryId) -> Result<Option<Entry>> {
        get(&mut *self.conn().await?, id).await
    }

    pub async fn exists(&self, id: EntryId) -> Result<bool> {
        sqlx::query_scalar(include_str!("../queries/entry_exists.sql"))
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    /// Find the entry holding content with this MD5 digest.
    pub async fn get_by_md5(&self, md5: &[u8; hash::MD5_LEN]) -> Result<Option<Entry>> {
        let row: Option<EntryRow> = sqlx::query_as(include_str!("../queries/get_entry_by_md5.sql"))
            .bind(md5.to_vec())
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(row.map(Entry::from))
    }

    /// The entry imported last, by id.
    pub async fn most_recent(&self) -> Result<Option<Entry>> {
        let row: Option<EntryRow> = sqlx::query_as(include_str!("../queries/most_recent_entry.sql"))
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(row.map(Entry::from))
    }

    pub async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(include_str!("../queries/count_entries.sql"))
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        u64::try_from(count).or_raise(|| ErrorKind::InvalidData("entry count"))
    }

    /// A window over every entry, ordered like a search.
    pub async fn page(&self, options: &SearchOptions) -> Result<Vec<Entry>> {
        let plan = Plan::Matching(Vec::new());
        query::with_deadline(options.timeout, async {
            query::execute(&mut *self.conn().await?, &plan, options).await
        })
        .await
    }

    // =========================================================================
    // Hashes
    // =========================================================================

    pub async fn get_hashes(&self, id: EntryId) -> Result<Option<Hashes>> {
        let row: Option<HashesRow> = sqlx::query_as(include_str!("../queries/get_hashes.sql"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(Hashes::try_from).transpose()
    }

    /// Overwrite the stored digests. Raw digests are length-checked before
    /// anything is written.
    pub async fn set_hashes(&self, id: EntryId, md5: &[u8], sha1: &[u8], sha256: &[u8]) -> Result<()> {
        let hashes = Hashes::from_slices(md5, sha1, sha256)?;
        put_hashes(&mut *self.conn().await?, id, &hashes).await
    }

    // =========================================================================
    // Timestamps
    // =========================================================================

    pub async fn get_timestamps(&self, id: EntryId) -> Result<Option<Timestamps>> {
        get_timestamps(&mut *self.conn().await?, id).await
    }

    /// Update some or all timestamps of an entry; fields left empty keep
    /// their stored value. Returns the timestamps as stored.
    pub async fn set_timestamps(&self, id: EntryId, update: TimestampUpdate) -> Result<Timestamps> {
        let mut conn = self.conn().await?;
        let mut sp = Savepoint::begin(&mut *conn, "timestamps").await?;
        let existing = get_timestamps(&mut sp, id).await?;
        let timestamps = update.backfill(existing)?;
        put_timestamps(&mut sp, id, &timestamps).await?;
        sp.release().await?;
        tracing::debug!(id, "Updated entry timestamps");
        Ok(timestamps)
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    pub async fn get_metadata(&self, id: EntryId) -> Result<Option<Metadata>> {
        let row: Option<MetadataRow> = sqlx::query_as(include_str!("../queries/get_metadata.sql"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(Metadata::try_from).transpose()
    }

    pub async fn set_metadata(&self, id: EntryId, metadata: &Metadata) -> Result<()> {
        put_metadata(&mut *self.conn().await?, id, metadata).await
    }

    // =========================================================================
    // Perceptual Hashes
    // =========================================================================

    /// A similarity hash of the given `kind` (e.g. `"phash"`), computed
    /// outside the archive.
    pub async fn get_perceptual_hash(&self, id: EntryId, kind: &str) -> Result<Option<u64>> {
        let hash: Option<i64> = sqlx::query_scalar(include_str!("../queries/get_perceptual_hash.sql"))
            .bind(id)
            .bind(kind)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        // Stored as the two's complement bit pattern.
        Ok(hash.map(|h| h as u64))
    }

    pub async fn set_perceptual_hash(&self, id: EntryId, kind: &str, hash: u64) -> Result<()> {
        if kind.trim().is_empty() {
            exn::bail!(ErrorKind::Validation("perceptual hash kind must not be empty"));
        }
        sqlx::query(include_str!("../queries/upsert_perceptual_hash.sql"))
            .bind(id)
            .bind(kind)
            .bind(hash as i64)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }
}
