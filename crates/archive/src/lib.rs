//! Content-addressed media archive and tag engine.
//!
//! Media is imported once per distinct content and stored under a path
//! derived from its MD5 digest. Entries are annotated with tags (and tag
//! aliases) and found again with a small boolean query language:
//!
//! - `cat, dog`: tagged with both,
//! - `cat, -dog`: tagged `cat` but not `dog`,
//! - `~cat, ~dog`: tagged with at least one of them.
//!
//! # Architecture
//! - [`Database`] is the SQLite pool; [`EntryRepository`] and
//!   [`TagRepository`] are created from it and share the pool.
//! - Every multi-statement change runs inside a [`Savepoint`], so it either
//!   applies completely or not at all.
//! - [`Archive`] ties the database, the optional [`ThumbnailDatabase`] and the
//!   media tree together and applies a default deadline to queries.

mod archive;
mod db;
mod entry;
pub mod error;
pub mod hash;
pub mod importer;
mod mime;
pub mod models;
pub mod query;
mod savepoint;
pub mod tag;
pub mod thumbnail;

pub use crate::archive::{Archive, Imported};
pub use crate::db::Database;
pub use crate::entry::EntryRepository;
pub use crate::importer::{FileTimes, Importer, MediaFile};
pub use crate::query::{Order, SearchOptions, SortKey, TagQuery};
pub use crate::savepoint::{Savepoint, is_clean};
pub use crate::tag::TagRepository;
pub use crate::thumbnail::ThumbnailDatabase;
