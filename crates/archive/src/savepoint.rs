//! Named, nestable savepoints with rollback-on-drop.
//!
//! Every multi-statement mutation in the archive follows the same shape:
//!
//! ```no_run
//! # use moon_archive::{Savepoint, error::Result};
//! # async fn example(pool: &sqlx::SqlitePool) -> Result<()> {
//! let mut conn = pool.acquire().await.unwrap();
//! let mut sp = Savepoint::begin(&mut conn, "example").await?;
//! sqlx::query("DELETE FROM tags WHERE text = 'x'").execute(&mut *sp).await.unwrap();
//! // ... more statements; any early return rolls everything back ...
//! sp.release().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Drop cannot be async, so the guard sits on top of an `sqlx` transaction
//! (a `BEGIN`, or an anonymous savepoint when already nested) whose own drop
//! queues the rollback on the connection. The named savepoint is issued inside
//! it, which keeps `ROLLBACK TO` available for partial undo.
//!
//! The outermost savepoint starts with `BEGIN IMMEDIATE`. Most mutations read
//! before they write, and SQLite refuses to upgrade a read transaction while
//! another connection writes (without consulting the busy timeout). Taking
//! the write lock up front makes concurrent writers queue instead.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use regex::Regex;
use sqlx::{Connection, Sqlite, SqliteConnection, Transaction};
use std::ops::{Deref, DerefMut};
use std::sync::LazyLock;

static CLEAN_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9]{3,24}$").unwrap());

/// Savepoint names are spliced into SQL (they cannot be bound as
/// parameters), so only short alphanumeric identifiers are accepted.
pub fn is_clean(name: &str) -> bool {
    CLEAN_NAME.is_match(name)
}

/// An open savepoint. Rolled back when dropped unless [`release`](Self::release)d.
pub struct Savepoint<'c> {
    tx: Transaction<'c, Sqlite>,
    name: String,
}

impl<'c> Savepoint<'c> {
    /// Issue `SAVEPOINT name` on `conn`, which can be a plain connection or
    /// another savepoint's connection.
    pub async fn begin(conn: &'c mut SqliteConnection, name: &str) -> Result<Self> {
        if !is_clean(name) {
            exn::bail!(ErrorKind::Validation("savepoint name must be 3-24 alphanumeric characters"));
        }
        let mut tx = match Connection::is_in_transaction(&*conn) {
            true => Connection::begin(conn).await,
            false => Connection::begin_with(conn, "BEGIN IMMEDIATE").await,
        }
        .or_raise(|| ErrorKind::Database)?;
        sqlx::query(&format!("SAVEPOINT {name}")).execute(&mut *tx).await.or_raise(|| ErrorKind::Database)?;
        tracing::trace!(savepoint = name, "Opened savepoint");
        Ok(Self { tx, name: name.to_string() })
    }

    /// Open a child savepoint on the same connection.
    ///
    /// Dropping or rolling back `self` also discards everything the child
    /// released.
    pub async fn nest(&mut self, name: &str) -> Result<Savepoint<'_>> {
        Savepoint::begin(&mut *self.tx, name).await
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Undo everything since the savepoint was opened. The savepoint stays
    /// open and can still be released.
    pub async fn rollback(&mut self) -> Result<()> {
        sqlx::query(&format!("ROLLBACK TO {}", self.name))
            .execute(&mut *self.tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        tracing::trace!(savepoint = %self.name, "Rolled back savepoint");
        Ok(())
    }

    /// Commit everything since the savepoint was opened into the enclosing
    /// scope (or the database, when outermost).
    pub async fn release(mut self) -> Result<()> {
        sqlx::query(&format!("RELEASE {}", self.name))
            .execute(&mut *self.tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        self.tx.commit().await.or_raise(|| ErrorKind::Database)?;
        tracing::trace!(savepoint = %self.name, "Released savepoint");
        Ok(())
    }
}

impl Deref for Savepoint<'_> {
    type Target = SqliteConnection;
    fn deref(&self) -> &SqliteConnection {
        &self.tx
    }
}

impl DerefMut for Savepoint<'_> {
    fn deref_mut(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use rstest::rstest;

    async fn tag_count(conn: &mut SqliteConnection) -> i64 {
        sqlx::query_scalar("SELECT count(*) FROM tags").fetch_one(conn).await.unwrap()
    }

    async fn insert_tag(conn: &mut SqliteConnection, text: &str) {
        sqlx::query("INSERT INTO tags (text) VALUES (?1)").bind(text).execute(conn).await.unwrap();
    }

    #[rstest]
    #[case("import", true)]
    #[case("abc", true)]
    #[case("A1b2C3d4E5f6G7h8I9j0K1l2", true)]
    #[case("ab", false)]
    #[case("A1b2C3d4E5f6G7h8I9j0K1l2x", false)]
    #[case("drop table", false)]
    #[case("x; DELETE FROM tags", false)]
    #[case("tags_map", false)]
    #[case("", false)]
    fn test_is_clean(#[case] name: &str, #[case] expected: bool) {
        assert_eq!(is_clean(name), expected);
    }

    #[tokio::test]
    async fn test_dirty_name_is_rejected() {
        let db = Database::connect_in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let err = Savepoint::begin(&mut conn, "no").await.err().unwrap();
        assert!(matches!(&*err, ErrorKind::Validation(_)));
    }

    #[tokio::test]
    async fn test_release_commits() {
        let db = Database::connect_in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let mut sp = Savepoint::begin(&mut conn, "commit").await.unwrap();
        assert_eq!(sp.name(), "commit");
        insert_tag(&mut sp, "kept").await;
        sp.release().await.unwrap();
        assert!(!conn.is_in_transaction());
        drop(conn);
        let mut conn = db.pool().acquire().await.unwrap();
        assert_eq!(tag_count(&mut conn).await, 1);
    }

    #[tokio::test]
    async fn test_drop_rolls_back() {
        let db = Database::connect_in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        {
            let mut sp = Savepoint::begin(&mut conn, "dropped").await.unwrap();
            insert_tag(&mut sp, "lost").await;
        }
        assert_eq!(tag_count(&mut conn).await, 0);
    }

    #[tokio::test]
    async fn test_rollback_reopens() {
        let db = Database::connect_in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let mut sp = Savepoint::begin(&mut conn, "partial").await.unwrap();
        insert_tag(&mut sp, "undone").await;
        sp.rollback().await.unwrap();
        assert_eq!(tag_count(&mut sp).await, 0);
        insert_tag(&mut sp, "redone").await;
        sp.release().await.unwrap();
        let texts: Vec<String> = sqlx::query_scalar("SELECT text FROM tags").fetch_all(&mut *conn).await.unwrap();
        assert_eq!(texts, vec!["redone".to_string()]);
    }

    #[tokio::test]
    async fn test_outer_drop_discards_released_child() {
        let db = Database::connect_in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        {
            let mut outer = Savepoint::begin(&mut conn, "outer").await.unwrap();
            insert_tag(&mut outer, "outer").await;
            let mut inner = outer.nest("inner").await.unwrap();
            insert_tag(&mut inner, "inner").await;
            inner.release().await.unwrap();
            assert_eq!(tag_count(&mut outer).await, 2);
        }
        assert_eq!(tag_count(&mut conn).await, 0);
    }

    #[tokio::test]
    async fn test_child_drop_keeps_outer() {
        let db = Database::connect_in_memory().await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let mut outer = Savepoint::begin(&mut conn, "outer").await.unwrap();
        insert_tag(&mut outer, "outer").await;
        {
            let mut inner = outer.nest("inner").await.unwrap();
            insert_tag(&mut inner, "inner").await;
        }
        outer.release().await.unwrap();
        let texts: Vec<String> = sqlx::query_scalar("SELECT text FROM tags").fetch_all(&mut *conn).await.unwrap();
        assert_eq!(texts, vec!["outer".to_string()]);
    }

    #[tokio::test]
    async fn test_writers_that_read_first_queue_up() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::connect(dir.path().join("archive.sqlite3")).await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let mut first = Savepoint::begin(&mut conn, "first").await.unwrap();
        let seen = tag_count(&mut first).await;

        let pool = db.pool().clone();
        let second = tokio::spawn(async move {
            let mut conn = pool.acquire().await.unwrap();
            let mut sp = Savepoint::begin(&mut conn, "second").await?;
            let seen = tag_count(&mut sp).await;
            insert_tag(&mut sp, &format!("second{seen}")).await;
            sp.release().await
        });
        // Give the second writer time to start waiting for the lock.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        insert_tag(&mut first, &format!("first{seen}")).await;
        first.release().await.unwrap();
        second.await.unwrap().unwrap();

        let texts: Vec<String> =
            sqlx::query_scalar("SELECT text FROM tags ORDER BY tag_id").fetch_all(&mut *conn).await.unwrap();
        assert_eq!(texts, vec!["first0".to_string(), "second1".to_string()]);
        drop(conn);
        db.close().await;
    }
}
