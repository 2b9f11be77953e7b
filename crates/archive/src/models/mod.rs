//! Domain models and the database rows they are converted from.

mod entry;
mod metadata;
mod tag;
mod timestamps;

pub use self::entry::Entry;
pub(crate) use self::entry::{EntryRow, HashesRow};
pub use self::metadata::{Metadata, Orientation};
pub(crate) use self::metadata::MetadataRow;
pub use self::tag::{Tag, TagCount};
pub(crate) use self::tag::{TagCountRow, TagRow};
pub use self::timestamps::{TimestampUpdate, Timestamps};
pub(crate) use self::timestamps::{TimestampRow, now_millis};

/// Surrogate key of an entry, assigned at import and never reused.
pub type EntryId = i64;
/// Surrogate key of a base tag.
pub type TagId = i64;
