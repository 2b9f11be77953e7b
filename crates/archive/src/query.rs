//! Boolean tag queries.
//!
//! A query is a list of tag tokens:
//!
//! | token  | meaning                                          |
//! |--------|--------------------------------------------------|
//! | `foo`  | entry must have `foo` (all bare tags, AND)       |
//! | `-foo` | entry must not have `foo` (any excluded, NOT)    |
//! | `~foo` | entry must have at least one of the `~` tags (OR) |
//!
//! Tokens are resolved to tag ids (aliases included) and turned into a
//! [`Plan`] of [`Clause`]s. The plan is then rendered into a single
//! parameterized statement; tag text never ends up in the SQL itself.

use crate::error::{ErrorKind, Result};
use crate::models::{Entry, EntryRow, Tag, TagId, TagRow};
use crate::tag::normalize;
use exn::ResultExt;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use std::collections::BTreeSet;
use std::time::Duration;

pub const EXCLUDE_MARKER: char = '-';
pub const ANY_MARKER: char = '~';
pub const SEPARATOR: char = ',';

/// Tag texts split into their three buckets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagQuery {
    all: Vec<String>,
    none: Vec<String>,
    any: Vec<String>,
}

impl TagQuery {
    /// Parse the comma separated text format, e.g. `"cat, -dog, ~red, ~blue"`.
    pub fn parse(text: &str) -> Self {
        Self::from_tokens(text.split(SEPARATOR))
    }

    /// Sort individual tokens into buckets by their marker. Tokens that are
    /// empty once normalized are dropped.
    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut query = Self::default();
        for token in tokens {
            let token = normalize(token.as_ref());
            if let Some(tag) = token.strip_prefix(EXCLUDE_MARKER) {
                push_normalized(&mut query.none, tag);
            } else if let Some(tag) = token.strip_prefix(ANY_MARKER) {
                push_normalized(&mut query.any, tag);
            } else {
                push_normalized(&mut query.all, &token);
            }
        }
        query
    }

    /// Plain include/exclude lists, no markers involved.
    pub fn from_lists<S: AsRef<str>>(include: &[S], exclude: &[S]) -> Self {
        let mut query = Self::default();
        include.iter().for_each(|t| push_normalized(&mut query.all, t.as_ref()));
        exclude.iter().for_each(|t| push_normalized(&mut query.none, t.as_ref()));
        query
    }

    pub fn all_of(&self) -> &[String] {
        &self.all
    }

    pub fn none_of(&self) -> &[String] {
        &self.none
    }

    pub fn any_of(&self) -> &[String] {
        &self.any
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty() && self.none.is_empty() && self.any.is_empty()
    }
}

fn push_normalized(bucket: &mut Vec<String>, tag: &str) {
    let tag = normalize(tag);
    if !tag.is_empty() && !bucket.contains(&tag) {
        bucket.push(tag);
    }
}

/// One condition over the tag map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Clause {
    /// Mapped to every one of these tags.
    AllOf(BTreeSet<TagId>),
    /// Mapped to none of these tags.
    NoneOf(BTreeSet<TagId>),
    /// Mapped to at least one of these tags.
    AnyOf(BTreeSet<TagId>),
}

/// A resolved query, ready to be rendered into SQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Resolution already proved that nothing can match (e.g. a required tag
    /// does not exist), so there is no need to ask the database.
    Nothing,
    /// Entries matching every clause. No clauses means every entry.
    Matching(Vec<Clause>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortKey {
    #[default]
    Imported,
    Created,
    Modified,
}

impl SortKey {
    fn column(self) -> &'static str {
        match self {
            Self::Imported => "t.date_imported",
            Self::Created => "t.date_created",
            Self::Modified => "t.date_modified",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Order {
    Ascending,
    #[default]
    Descending,
}

impl Order {
    fn keyword(self) -> &'static str {
        match self {
            Self::Ascending => "ASC",
            Self::Descending => "DESC",
        }
    }
}

/// Ordering, windowing and deadline of a listing or search.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchOptions {
    pub sort: SortKey,
    pub order: Order,
    pub limit: Option<u32>,
    pub offset: u32,
    /// Give up with [`ErrorKind::Timeout`] after this long.
    pub timeout: Option<Duration>,
}

/// Resolve the tags of `query` into a [`Plan`].
pub async fn plan(conn: &mut SqliteConnection, query: &TagQuery) -> Result<Plan> {
    let mut clauses = Vec::new();

    let mut all = BTreeSet::new();
    for text in query.all_of() {
        match resolve(&mut *conn, text).await? {
            Some(id) => all.insert(id),
            None => return Ok(Plan::Nothing),
        };
    }
    if !all.is_empty() {
        clauses.push(Clause::AllOf(all));
    }

    let mut none = BTreeSet::new();
    for text in query.none_of() {
        // Nothing can be tagged with a tag that doesn't exist.
        if let Some(id) = resolve(&mut *conn, text).await? {
            none.insert(id);
        }
    }
    if !none.is_empty() {
        clauses.push(Clause::NoneOf(none));
    }

    if !query.any_of().is_empty() {
        let mut any = BTreeSet::new();
        for text in query.any_of() {
            if let Some(id) = resolve(&mut *conn, text).await? {
                any.insert(id);
            }
        }
        if any.is_empty() {
            return Ok(Plan::Nothing);
        }
        clauses.push(Clause::AnyOf(any));
    }

    Ok(Plan::Matching(clauses))
}

async fn resolve(conn: &mut SqliteConnection, text: &str) -> Result<Option<TagId>> {
    let row: Option<TagRow> = sqlx::query_as(include_str!("../queries/resolve_tag.sql"))
        .bind(text)
        .fetch_optional(conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(row.map(|row| Tag::from(row).id))
}

/// Render the clauses into a statement selecting matching entries.
fn build(clauses: &[Clause], options: &SearchOptions) -> QueryBuilder<'static, Sqlite> {
    let mut qb = QueryBuilder::new(
        "SELECT a.id, a.path, a.extension FROM archive AS a \
         LEFT JOIN archive_timestamps AS t ON t.archive_id = a.id WHERE 1 = 1",
    );
    for clause in clauses {
        let (operator, ids) = match clause {
            Clause::AllOf(ids) | Clause::AnyOf(ids) => ("IN", ids),
            Clause::NoneOf(ids) => ("NOT IN", ids),
        };
        qb.push(format_args!(" AND a.id {operator} (SELECT archive_id FROM tag_map WHERE tag_id IN ("));
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
        if let Clause::AllOf(ids) = clause {
            // Matching every tag == matching as many distinct tags as asked for.
            qb.push(" GROUP BY archive_id HAVING count(DISTINCT tag_id) = ");
            qb.push_bind(ids.len() as i64);
        }
        qb.push(")");
    }
    let order = options.order.keyword();
    qb.push(format_args!(" ORDER BY {} {order}, a.id {order}", options.sort.column()));
    if options.limit.is_some() || options.offset > 0 {
        // SQLite only knows OFFSET as part of LIMIT; -1 means no limit.
        qb.push(" LIMIT ");
        qb.push_bind(options.limit.map_or(-1, i64::from));
        qb.push(" OFFSET ");
        qb.push_bind(i64::from(options.offset));
    }
    qb
}

/// Run a resolved plan.
pub async fn execute(conn: &mut SqliteConnection, plan: &Plan, options: &SearchOptions) -> Result<Vec<Entry>> {
    let clauses = match plan {
        Plan::Nothing => return Ok(Vec::new()),
        Plan::Matching(clauses) => clauses,
    };
    let mut qb = build(clauses, options);
    let rows: Vec<EntryRow> = qb.build_query_as().fetch_all(conn).await.or_raise(|| ErrorKind::Database)?;
    Ok(rows.into_iter().map(Entry::from).collect())
}

/// Resolve and run `query` on one connection.
pub async fn search(conn: &mut SqliteConnection, query: &TagQuery, options: &SearchOptions) -> Result<Vec<Entry>> {
    let plan = plan(&mut *conn, query).await?;
    execute(&mut *conn, &plan, options).await
}

/// Run `future`, giving up once `timeout` has passed.
pub(crate) async fn with_deadline<T>(timeout: Option<Duration>, future: impl Future<Output = Result<T>>) -> Result<T> {
    let Some(timeout) = timeout else {
        return future.await;
    };
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(elapsed) => {
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "Query exceeded its deadline");
            Err(elapsed).or_raise(|| ErrorKind::Timeout)
        },
    }
}
