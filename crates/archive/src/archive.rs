//! The archive as a whole: databases, media tree and default deadline.

use crate::Database;
use crate::entry::{self, EntryRepository};
use crate::error::{Error, ErrorKind, Result};
use crate::importer::Importer;
use crate::models::{Entry, EntryId};
use crate::query::{self, Order, SearchOptions, SortKey, TagQuery, with_deadline};
use crate::savepoint::Savepoint;
use crate::tag::{self, TagRepository};
use crate::thumbnail::ThumbnailDatabase;
use exn::{OptionExt, ResultExt};
use moon_config::Config;
use moon_storage::BackendHandle;
use moon_storage::backend::LocalBackend;
use moon_storage::error::ErrorKind as StorageErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

/// Outcome of [`Archive::import`].
///
/// The entry itself is all-or-nothing, tagging is best effort: a `tagging`
/// error means the entry exists (under `id`) but carries none of the
/// requested tags.
#[derive(Debug)]
pub struct Imported {
    pub id: EntryId,
    pub tagging: Option<Error>,
}

/// Everything needed to serve the archive, passed explicitly to whoever needs
/// it.
pub struct Archive {
    db: Database,
    thumbnails: Option<ThumbnailDatabase>,
    media: BackendHandle,
    entries: EntryRepository,
    tags: TagRepository,
    timeout: Duration,
}

impl Archive {
    pub fn new(db: Database, thumbnails: Option<ThumbnailDatabase>, media: BackendHandle, timeout: Duration) -> Self {
        let entries = EntryRepository::from(&db);
        let tags = TagRepository::from(&db);
        Self { db, thumbnails, media, entries, tags, timeout }
    }

    /// Open the databases and media tree named by `config`, creating whatever
    /// doesn't exist yet.
    #[instrument("opening archive", skip_all, fields(base = %config.base_path.display()))]
    pub async fn open(config: &Config) -> Result<Self> {
        let archive_file = config.archive_file();
        if let Some(parent) = archive_file.parent() {
            tokio::fs::create_dir_all(parent).await.or_raise(|| ErrorKind::Io)?;
        }
        let db = Database::connect(&archive_file).await?;
        let thumbnails = match config.thumbnail_file() {
            Some(path) => Some(ThumbnailDatabase::connect(path).await?),
            None => None,
        };
        let media_dir = std::path::absolute(config.media_dir()).or_raise(|| ErrorKind::Io)?;
        let media: BackendHandle = Arc::new(LocalBackend::new("media", media_dir).or_raise(|| ErrorKind::Storage)?);
        tracing::debug!(backend = media.name(), thumbnails = thumbnails.is_some(), "Opened archive");
        Ok(Self::new(db, thumbnails, media, config.query_timeout()))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn entries(&self) -> &EntryRepository {
        &self.entries
    }

    pub fn tags(&self) -> &TagRepository {
        &self.tags
    }

    /// `None` when thumbnails are disabled.
    pub fn thumbnails(&self) -> Option<&ThumbnailDatabase> {
        self.thumbnails.as_ref()
    }

    pub fn media(&self) -> &BackendHandle {
        &self.media
    }

    // =========================================================================
    // Import & Removal
    // =========================================================================

    /// Import new content and tag it.
    ///
    /// Fails only if the entry could not be created. Check
    /// [`Imported::tagging`] for the outcome of the tag assignment.
    pub async fn import<S: AsRef<str>>(&self, importer: &dyn Importer, tags: &[S]) -> Result<Imported> {
        let id = match self.entries.import(importer, &self.media).await {
            Ok(id) => id,
            Err(e) => {
                if matches!(&*e, ErrorKind::DuplicateEntry) {
                    tracing::debug!(extension = importer.extension(), "Content is already archived");
                }
                return Err(e);
            },
        };
        if tags.is_empty() {
            return Ok(Imported { id, tagging: None });
        }
        let tagging = self.tags.assign_tags(id, tags).await.err();
        if let Some(e) = &tagging {
            tracing::warn!(id, error = %e, "Imported entry but could not tag it");
        }
        Ok(Imported { id, tagging })
    }

    /// Delete an entry with its tags, thumbnails and media file.
    #[instrument("removing entry", skip(self))]
    pub async fn remove(&self, id: EntryId) -> Result<()> {
        let mut conn = self.db.pool().acquire().await.or_raise(|| ErrorKind::Database)?;
        let entry = entry::get(&mut conn, id).await?.ok_or_raise(|| ErrorKind::NotFound("entry"))?;

        let mut sp = Savepoint::begin(&mut *conn, "remove").await?;
        tag::clear(&mut sp, id).await?;
        entry::delete(&mut sp, id).await?;
        if let Some(thumbnails) = &self.thumbnails
            && let Err(e) = thumbnails.delete(id).await
        {
            tracing::warn!(id, error = %e, "Could not delete thumbnails");
        }
        match self.media.delete(&entry.path).await {
            Ok(()) => {},
            Err(e) if matches!(&*e, StorageErrorKind::NotFound(_)) => {
                tracing::warn!(id, path = %entry.path.display(), "Media file was already missing");
            },
            Err(e) => return Err(e).or_raise(|| ErrorKind::Storage),
        }
        sp.release().await?;

        if let Some(parent) = entry.path.parent().filter(|p| !p.as_os_str().is_empty())
            && let Err(e) = self.media.remove_dir_if_empty(parent).await
        {
            tracing::warn!(path = %parent.display(), error = %e, "Could not remove media directory");
        }
        tracing::info!(id, path = %entry.path.display(), "Removed entry");
        Ok(())
    }

    // =========================================================================
    // Retrieval
    // =========================================================================

    /// Run a tag query. Without an explicit timeout in `options` the archive's
    /// default deadline applies.
    pub async fn search(&self, query: &TagQuery, options: SearchOptions) -> Result<Vec<Entry>> {
        let options = self.with_default_deadline(options);
        with_deadline(options.timeout, async {
            let mut conn = self.db.pool().acquire().await.or_raise(|| ErrorKind::Database)?;
            query::search(&mut conn, query, &options).await
        })
        .await
    }

    /// Search by separate include and exclude lists.
    pub async fn search_tag_by_list<S: AsRef<str>>(
        &self,
        sort: SortKey,
        order: Order,
        include: &[S],
        exclude: &[S],
    ) -> Result<Vec<Entry>> {
        let query = TagQuery::from_lists(include, exclude);
        self.search(&query, SearchOptions { sort, order, ..Default::default() }).await
    }

    pub async fn page(&self, options: SearchOptions) -> Result<Vec<Entry>> {
        self.entries.page(&self.with_default_deadline(options)).await
    }

    /// The stored bytes of an entry.
    pub async fn read_media(&self, id: EntryId) -> Result<Vec<u8>> {
        let entry = self.entries.get(id).await?.ok_or_raise(|| ErrorKind::NotFound("entry"))?;
        self.media.read(&entry.path).await.or_raise(|| ErrorKind::Storage)
    }

    /// Whether the media file of an entry is present with the size recorded
    /// at import.
    pub async fn verify(&self, id: EntryId) -> Result<bool> {
        let entry = self.entries.get(id).await?.ok_or_raise(|| ErrorKind::NotFound("entry"))?;
        if !self.media.exists(&entry.path).await.or_raise(|| ErrorKind::Storage)? {
            return Ok(false);
        }
        let size = self.media.stat(&entry.path).await.or_raise(|| ErrorKind::Storage)?;
        Ok(match self.entries.get_metadata(id).await? {
            Some(metadata) => metadata.file_size == size,
            None => true,
        })
    }

    fn with_default_deadline(&self, mut options: SearchOptions) -> SearchOptions {
        options.timeout = options.timeout.or(Some(self.timeout));
        options
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    pub async fn vacuum(&self) -> Result<()> {
        self.db.vacuum().await?;
        if let Some(thumbnails) = &self.thumbnails {
            thumbnails.vacuum().await?;
        }
        Ok(())
    }

    /// Checkpoint and close both databases.
    pub async fn close(&self) {
        self.db.close().await;
        if let Some(thumbnails) = &self.thumbnails {
            thumbnails.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::tests::{media, times};
    use crate::importer::MediaFile;
    use crate::thumbnail::{Jpegs, Size};
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    async fn archive() -> (TempDir, Archive) {
        let (dir, media) = media();
        let db = Database::connect_in_memory().await.unwrap();
        let thumbnails = ThumbnailDatabase::connect_in_memory().await.unwrap();
        let archive = Archive::new(db, Some(thumbnails), media, Duration::from_secs(5));
        (dir, archive)
    }

    fn file(content: &str) -> MediaFile {
        MediaFile::new(content.as_bytes().to_vec(), "png", times())
    }

    fn ids(entries: Vec<Entry>) -> BTreeSet<EntryId> {
        entries.into_iter().map(|e| e.id).collect()
    }

    #[tokio::test]
    async fn test_boolean_query_example() {
        let (_dir, archive) = archive().await;
        let one = archive.import(&file("1"), &["foo"]).await.unwrap().id;
        let two = archive.import(&file("2"), &["foo", "bar"]).await.unwrap().id;
        let three = archive.import(&file("3"), &["bar", "zap"]).await.unwrap().id;
        let four = archive.import(&file("4"), &["zap"]).await.unwrap().id;

        let search = |text: &'static str| {
            let archive = &archive;
            async move { ids(archive.search(&TagQuery::parse(text), SearchOptions::default()).await.unwrap()) }
        };
        assert_eq!(search("foo,bar").await, BTreeSet::from([two]));
        assert_eq!(search("-foo,bar").await, BTreeSet::from([three]));
        assert_eq!(search("-foo,-zap,bar").await, BTreeSet::new());
        assert_eq!(search("~foo,~zap").await, BTreeSet::from([one, two, three, four]));
        assert_eq!(search("bar,~foo,~nothing").await, BTreeSet::from([two]));
        assert_eq!(search("-bar").await, BTreeSet::from([one, four]));
        assert_eq!(search("unknown").await, BTreeSet::new());
        assert_eq!(search("foo,-unknown").await, BTreeSet::from([one, two]));

        let listed = archive
            .search_tag_by_list(SortKey::Imported, Order::Ascending, &["zap"], &["bar"])
            .await
            .unwrap();
        assert_eq!(ids(listed), BTreeSet::from([four]));
    }

    #[tokio::test]
    async fn test_aliases_in_queries() {
        let (_dir, archive) = archive().await;
        archive.tags().new_alias("kitty", "cat").await.unwrap();
        let id = archive.import(&file("cat"), &["kitty"]).await.unwrap().id;
        let found = archive.search(&TagQuery::parse("kitty"), SearchOptions::default()).await.unwrap();
        assert_eq!(ids(found), BTreeSet::from([id]));
        let found = archive.search(&TagQuery::parse("-kitty"), SearchOptions::default()).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_import_with_bad_tags_is_partial() {
        let (_dir, archive) = archive().await;
        let imported = archive.import(&file("partial"), &["good", "\n"]).await.unwrap();
        let err = imported.tagging.unwrap();
        assert!(matches!(&*err, ErrorKind::Validation(_)));
        assert!(archive.entries().exists(imported.id).await.unwrap());
        assert!(archive.tags().get_tags(imported.id).await.unwrap().is_empty());

        let err = archive.import(&file("partial"), &["good"]).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::DuplicateEntry));
    }

    #[tokio::test]
    async fn test_remove_cleans_up_everything() {
        let (dir, archive) = archive().await;
        let id = archive.import(&file("doomed"), &["only-here", "shared"]).await.unwrap().id;
        let other = archive.import(&file("kept"), &["shared"]).await.unwrap().id;
        let entry = archive.entries().get(id).await.unwrap().unwrap();
        let thumbnails = archive.thumbnails().unwrap();
        thumbnails.set_jpeg(id, &Jpegs { small: vec![1], medium: vec![2], large: vec![3] }).await.unwrap();
        assert!(archive.verify(id).await.unwrap());

        archive.remove(id).await.unwrap();
        assert!(!archive.entries().exists(id).await.unwrap());
        assert!(archive.entries().get_hashes(id).await.unwrap().is_none());
        assert_eq!(thumbnails.get_jpeg(id, Size::Small).await.unwrap(), None);
        assert!(!dir.path().join(&entry.path).exists());
        assert!(archive.tags().get_tag("only-here").await.unwrap().is_none());
        assert_eq!(archive.tags().tag_count("shared").await.unwrap(), 1);
        assert!(archive.entries().exists(other).await.unwrap());

        let err = archive.remove(id).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_remove_tolerates_missing_file() {
        let (_dir, archive) = archive().await;
        let id = archive.import(&file("vanished"), &[] as &[&str]).await.unwrap().id;
        let entry = archive.entries().get(id).await.unwrap().unwrap();
        archive.media().delete(&entry.path).await.unwrap();
        assert!(!archive.verify(id).await.unwrap());
        archive.remove(id).await.unwrap();
        assert!(!archive.entries().exists(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_media_and_page() {
        let (_dir, archive) = archive().await;
        let first = archive.import(&file("first"), &[] as &[&str]).await.unwrap().id;
        let second = archive.import(&file("second"), &[] as &[&str]).await.unwrap().id;
        assert_eq!(archive.read_media(first).await.unwrap(), b"first");
        let page = archive
            .page(SearchOptions { order: Order::Ascending, limit: Some(10), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(page.into_iter().map(|e| e.id).collect::<Vec<_>>(), vec![first, second]);
    }

    #[tokio::test]
    async fn test_open_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config { base_path: dir.path().join("moon"), ..Config::default() };
        let archive = Archive::open(&config).await.unwrap();
        let id = archive.import(&file("persisted"), &["kept"]).await.unwrap().id;
        assert!(archive.thumbnails().is_some());
        archive.vacuum().await.unwrap();
        archive.close().await;

        let archive = Archive::open(&config).await.unwrap();
        assert_eq!(archive.tags().search_tag("kept").await.unwrap(), vec![id]);
        assert_eq!(archive.read_media(id).await.unwrap(), b"persisted");
        archive.close().await;
        assert!(dir.path().join("moon/archive.sqlite3").is_file());
        assert!(dir.path().join("moon/media").is_dir());
    }

    #[tokio::test]
    async fn test_concurrent_tagged_imports() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config { base_path: dir.path().to_path_buf(), thumbnail_path: None, ..Config::default() };
        let archive = Arc::new(Archive::open(&config).await.unwrap());
        let mut tasks = tokio::task::JoinSet::new();
        for n in 0..20 {
            let archive = Arc::clone(&archive);
            tasks.spawn(async move {
                let file = file(&format!("upload {n}"));
                archive.import(&file, &["upload".to_string(), format!("batch{}", n % 2)]).await
            });
        }
        while let Some(result) = tasks.join_next().await {
            let imported = result.unwrap().unwrap();
            assert!(imported.tagging.is_none(), "tagging failed: {:?}", imported.tagging);
        }
        assert_eq!(archive.tags().tag_count("upload").await.unwrap(), 20);
        let batch = archive.search(&TagQuery::parse("upload,batch1"), SearchOptions::default()).await.unwrap();
        assert_eq!(batch.len(), 10);
        archive.close().await;
    }
}
