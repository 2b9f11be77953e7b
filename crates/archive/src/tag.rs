//! Tags, tag assignment and tag aliases.
//!
//! Tag text is case-sensitive but whitespace-normalized. Tags are created on
//! first use and deleted again once nothing is tagged with them. An alias is
//! an alternative spelling that resolves (one hop, never chained) to a base
//! tag; a text is either a base tag or an alias, never both.

use crate::Database;
use crate::error::{ErrorKind, Result, is_foreign_key_violation, is_unique_violation};
use crate::models::{EntryId, Tag, TagCount, TagCountRow, TagRow};
use crate::savepoint::Savepoint;
use exn::{OptionExt, ResultExt};
use regex::Regex;
use sqlx::pool::PoolConnection;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use std::collections::HashSet;
use std::sync::LazyLock;

static LINE_BREAKS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\n\t\r]+").unwrap());
static SPACES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r" {2,}").unwrap());
/// How many tags [`TagRepository::top_tags`] returns.
pub const TOP_TAGS: i64 = 50;

/// Collapse line breaks, tabs and repeated spaces into single spaces and trim
/// the ends.
///
/// ```
/// use moon_archive::tag::normalize;
/// assert_eq!(normalize("  big\n\tred   dog "), "big red dog");
/// ```
pub fn normalize(text: &str) -> String {
    let text = LINE_BREAKS.replace_all(text, " ");
    let text = text.trim_matches(|c| c == ' ' || c == '\t');
    SPACES.replace_all(text, " ").into_owned()
}

fn normalize_required(text: &str) -> Result<String> {
    let text = normalize(text);
    if text.is_empty() {
        exn::bail!(ErrorKind::Validation("tag must not be empty"));
    }
    Ok(text)
}

// =========================================================================
// Statements (single connection, composable inside savepoints)
// =========================================================================

pub(crate) async fn get_tag(conn: &mut SqliteConnection, text: &str) -> Result<Option<Tag>> {
    let row: Option<TagRow> = sqlx::query_as(include_str!("../queries/get_tag.sql"))
        .bind(text)
        .fetch_optional(conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(row.map(Tag::from))
}

pub(crate) async fn resolve_alias(conn: &mut SqliteConnection, alias: &str) -> Result<Option<Tag>> {
    let row: Option<TagRow> = sqlx::query_as(include_str!("../queries/resolve_alias.sql"))
        .bind(alias)
        .fetch_optional(conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(row.map(Tag::from))
}

/// Alias first, then base tag.
async fn find(conn: &mut SqliteConnection, text: &str) -> Result<Option<Tag>> {
    match resolve_alias(&mut *conn, text).await? {
        Some(base) => Ok(Some(base)),
        None => get_tag(conn, text).await,
    }
}

async fn create_or_fetch(conn: &mut SqliteConnection, text: &str) -> Result<Tag> {
    sqlx::query(include_str!("../queries/insert_tag.sql"))
        .bind(text)
        .execute(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    get_tag(conn, text).await?.ok_or_raise(|| ErrorKind::NotFound("tag"))
}

pub(crate) async fn get_tags(conn: &mut SqliteConnection, entry: EntryId) -> Result<Vec<Tag>> {
    let rows: Vec<TagRow> = sqlx::query_as(include_str!("../queries/get_tags_for_entry.sql"))
        .bind(entry)
        .fetch_all(conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(rows.into_iter().map(Tag::from).collect())
}

/// Map `text` (or the base tag it is an alias of) to `entry`. Assigning a
/// tag twice is not an error.
pub(crate) async fn assign(conn: &mut SqliteConnection, entry: EntryId, text: &str) -> Result<Tag> {
    let text = normalize_required(text)?;
    let tag = match resolve_alias(&mut *conn, &text).await? {
        Some(base) => base,
        None => create_or_fetch(&mut *conn, &text).await?,
    };
    let result = sqlx::query(include_str!("../queries/map_tag.sql"))
        .bind(entry)
        .bind(tag.id)
        .execute(conn)
        .await;
    match result {
        Err(e) if is_foreign_key_violation(&e) => Err(e).or_raise(|| ErrorKind::NotFound("entry")),
        other => other.map(|_| tag).or_raise(|| ErrorKind::Database),
    }
}

/// Assign every tag or none of them.
pub(crate) async fn assign_all<S: AsRef<str>>(conn: &mut SqliteConnection, entry: EntryId, texts: &[S]) -> Result<()> {
    let mut sp = Savepoint::begin(&mut *conn, "assigntags").await?;
    for text in texts {
        assign(&mut sp, entry, text.as_ref()).await?;
    }
    sp.release().await
}

/// Unmap one tag and delete it if nothing else uses it. Returns whether the
/// entry had the tag.
async fn unmap(conn: &mut SqliteConnection, entry: EntryId, tag: &Tag) -> Result<bool> {
    let mut sp = Savepoint::begin(&mut *conn, "removetag").await?;
    let unmapped = sqlx::query(include_str!("../queries/unmap_tag.sql"))
        .bind(entry)
        .bind(tag.id)
        .execute(&mut *sp)
        .await
        .or_raise(|| ErrorKind::Database)?
        .rows_affected();
    collect(&mut sp, tag).await?;
    sp.release().await?;
    Ok(unmapped > 0)
}

/// Delete `tag` when no entry is mapped to it and no alias points at it.
async fn collect(conn: &mut SqliteConnection, tag: &Tag) -> Result<()> {
    let collected = sqlx::query(include_str!("../queries/delete_tag_if_unused.sql"))
        .bind(tag.id)
        .execute(conn)
        .await
        .or_raise(|| ErrorKind::Database)?
        .rows_affected();
    if collected > 0 {
        tracing::info!(tag = %tag.text, "Deleted tag that is no longer in use");
    }
    Ok(())
}

pub(crate) async fn remove(conn: &mut SqliteConnection, entry: EntryId, text: &str) -> Result<bool> {
    let text = normalize_required(text)?;
    match find(&mut *conn, &text).await? {
        Some(tag) => unmap(conn, entry, &tag).await,
        None => Ok(false),
    }
}

pub(crate) async fn remove_all<S: AsRef<str>>(conn: &mut SqliteConnection, entry: EntryId, texts: &[S]) -> Result<()> {
    let mut sp = Savepoint::begin(&mut *conn, "removetags").await?;
    for text in texts {
        remove(&mut sp, entry, text.as_ref()).await?;
    }
    sp.release().await
}

/// Remove every tag from `entry`.
pub(crate) async fn clear(conn: &mut SqliteConnection, entry: EntryId) -> Result<()> {
    let mut sp = Savepoint::begin(&mut *conn, "removetags").await?;
    for tag in get_tags(&mut sp, entry).await? {
        unmap(&mut sp, entry, &tag).await?;
    }
    sp.release().await
}

/// Swap the tags of `entry` for `texts`. Tags present before and after stay
/// mapped, so they are never collected and keep their id.
pub(crate) async fn replace<S: AsRef<str>>(conn: &mut SqliteConnection, entry: EntryId, texts: &[S]) -> Result<()> {
    let mut sp = Savepoint::begin(&mut *conn, "replacetags").await?;
    let mut kept = HashSet::new();
    for text in texts {
        if let Some(tag) = find(&mut sp, &normalize_required(text.as_ref())?).await? {
            kept.insert(tag.id);
        }
    }
    for tag in get_tags(&mut sp, entry).await? {
        if !kept.contains(&tag.id) {
            unmap(&mut sp, entry, &tag).await?;
        }
    }
    assign_all(&mut sp, entry, texts).await?;
    sp.release().await
}

async fn new_alias(conn: &mut SqliteConnection, alias: &str, base: &str) -> Result<Tag> {
    let alias = normalize_required(alias)?;
    let base = normalize_required(base)?;
    if alias == base {
        exn::bail!(ErrorKind::Validation("alias and base tag must differ"));
    }
    let mut sp = Savepoint::begin(&mut *conn, "newalias").await?;
    if get_tag(&mut sp, &alias).await?.is_some() {
        exn::bail!(ErrorKind::Validation("alias is already a base tag"));
    }
    if resolve_alias(&mut sp, &base).await?.is_some() {
        exn::bail!(ErrorKind::Validation("base tag is itself an alias"));
    }
    let tag = create_or_fetch(&mut sp, &base).await?;
    let result = sqlx::query(include_str!("../queries/insert_alias.sql"))
        .bind(&alias)
        .bind(tag.id)
        .execute(&mut *sp)
        .await;
    match result {
        Ok(_) => {},
        Err(e) if is_unique_violation(&e) => return Err(e).or_raise(|| ErrorKind::Conflict("alias already exists")),
        Err(e) => return Err(e).or_raise(|| ErrorKind::Database),
    }
    sp.release().await?;
    tracing::debug!(alias = %alias, base = %tag.text, "Registered tag alias");
    Ok(tag)
}

/// Drop an alias, collecting its base tag if the alias was all that kept it.
async fn delete_alias(conn: &mut SqliteConnection, alias: &str) -> Result<bool> {
    let mut sp = Savepoint::begin(&mut *conn, "deletealias").await?;
    let Some(base) = resolve_alias(&mut sp, alias).await? else {
        return Ok(false);
    };
    sqlx::query(include_str!("../queries/delete_alias.sql"))
        .bind(alias)
        .execute(&mut *sp)
        .await
        .or_raise(|| ErrorKind::Database)?;
    collect(&mut sp, &base).await?;
    sp.release().await?;
    Ok(true)
}

// =========================================================================
// Repository
// =========================================================================

/// Repository for tags, tag assignments and aliases.
#[derive(Debug, Clone)]
pub struct TagRepository {
    pool: SqlitePool,
}
impl From<&Database> for TagRepository {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}
impl TagRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<PoolConnection<Sqlite>> {
        self.pool.acquire().await.or_raise(|| ErrorKind::Database)
    }

    // =========================================================================
    // Assignment
    // =========================================================================

    /// Tag an entry, resolving aliases to their base tag first. Returns the
    /// base tag that was mapped.
    pub async fn assign_tag(&self, entry: EntryId, text: &str) -> Result<Tag> {
        let mut conn = self.conn().await?;
        let mut sp = Savepoint::begin(&mut *conn, "assigntag").await?;
        let tag = assign(&mut sp, entry, text).await?;
        sp.release().await?;
        Ok(tag)
    }

    /// Tag an entry with every tag in `texts`, atomically: if any tag fails
    /// none of them are assigned.
    pub async fn assign_tags<S: AsRef<str>>(&self, entry: EntryId, texts: &[S]) -> Result<()> {
        assign_all(&mut *self.conn().await?, entry, texts).await
    }

    /// Untag an entry; deletes the tag when nothing else uses it. Returns
    /// whether the entry had the tag.
    pub async fn remove_tag(&self, entry: EntryId, text: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let mut sp = Savepoint::begin(&mut *conn, "removetags").await?;
        let removed = remove(&mut sp, entry, text).await?;
        sp.release().await?;
        Ok(removed)
    }

    pub async fn remove_tags<S: AsRef<str>>(&self, entry: EntryId, texts: &[S]) -> Result<()> {
        remove_all(&mut *self.conn().await?, entry, texts).await
    }

    /// Atomically swap every tag of an entry for `texts`.
    pub async fn replace_tags<S: AsRef<str>>(&self, entry: EntryId, texts: &[S]) -> Result<()> {
        replace(&mut *self.conn().await?, entry, texts).await
    }

    /// Base tags of an entry, sorted by text.
    pub async fn get_tags(&self, entry: EntryId) -> Result<Vec<Tag>> {
        get_tags(&mut *self.conn().await?, entry).await
    }

    /// Look up a base tag by its exact (normalized) text.
    pub async fn get_tag(&self, text: &str) -> Result<Option<Tag>> {
        get_tag(&mut *self.conn().await?, &normalize(text)).await
    }

    // =========================================================================
    // Aliases
    // =========================================================================

    /// Register `alias` as another spelling of `base`, creating `base` if it
    /// doesn't exist yet.
    pub async fn new_alias(&self, alias: &str, base: &str) -> Result<Tag> {
        new_alias(&mut *self.conn().await?, alias, base).await
    }

    /// The base tag `alias` points at, if it is an alias.
    pub async fn resolve_alias(&self, alias: &str) -> Result<Option<Tag>> {
        resolve_alias(&mut *self.conn().await?, &normalize(alias)).await
    }

    /// Remove an alias. The base tag goes with it when nothing is tagged with
    /// it and no other alias points at it.
    pub async fn delete_alias(&self, alias: &str) -> Result<bool> {
        delete_alias(&mut *self.conn().await?, &normalize(alias)).await
    }

    /// Every alias of a base tag.
    pub async fn aliases(&self, base: &Tag) -> Result<Vec<String>> {
        sqlx::query_scalar(include_str!("../queries/list_aliases.sql"))
            .bind(base.id)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    // =========================================================================
    // Counting & Listing
    // =========================================================================

    /// How many entries are tagged with `text` (or its base tag).
    pub async fn tag_count(&self, text: &str) -> Result<u64> {
        let mut conn = self.conn().await?;
        let Some(tag) = find(&mut conn, &normalize(text)).await? else {
            return Ok(0);
        };
        let row: Option<TagCountRow> = sqlx::query_as(include_str!("../queries/tag_count.sql"))
            .bind(&tag.text)
            .fetch_optional(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(row.map(TagCount::try_from).transpose()?.map_or(0, |c| c.count))
    }

    /// The most used tags among `entries`, most used first.
    pub async fn top_tags(&self, entries: &[EntryId]) -> Result<Vec<TagCount>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT tags.text, count(tag_map.archive_id) AS total FROM tags \
             INNER JOIN tag_map ON tag_map.tag_id = tags.tag_id WHERE tag_map.archive_id IN (",
        );
        let mut separated = qb.separated(", ");
        for id in entries {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
        qb.push(" GROUP BY tags.tag_id ORDER BY total DESC, tags.text ASC LIMIT ");
        qb.push_bind(TOP_TAGS);
        let rows: Vec<TagCountRow> =
            qb.build_query_as().fetch_all(&self.pool).await.or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(TagCount::try_from).collect()
    }

    /// Tag usage among entries with ids in `first..=last`.
    pub async fn tag_counts_by_range(
        &self,
        first: EntryId,
        last: EntryId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<TagCount>> {
        let rows: Vec<TagCountRow> = sqlx::query_as(include_str!("../queries/tag_counts_by_range.sql"))
            .bind(first)
            .bind(last)
            .bind(i64::from(limit))
            .bind(i64::from(offset))
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(TagCount::try_from).collect()
    }

    /// Every entry tagged with `text` (or its base tag), by id.
    pub async fn search_tag(&self, text: &str) -> Result<Vec<EntryId>> {
        let mut conn = self.conn().await?;
        let Some(tag) = find(&mut conn, &normalize(text)).await? else {
            return Ok(Vec::new());
        };
        sqlx::query_scalar(include_str!("../queries/search_tag.sql"))
            .bind(tag.id)
            .fetch_all(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)
    }
}
