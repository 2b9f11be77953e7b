use crate::error::Error;
use crate::hash::Hashes;
use crate::models::EntryId;
use std::path::PathBuf;

/// One imported media item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub id: EntryId,
    /// Location relative to the media root, derived from the MD5 hash.
    pub path: PathBuf,
    /// Lowercase, with a leading dot.
    pub extension: String,
}

#[derive(sqlx::FromRow)]
pub(crate) struct EntryRow {
    id: i64,
    path: String,
    extension: String,
}
impl From<EntryRow> for Entry {
    fn from(row: EntryRow) -> Self {
        Self {
            id: row.id,
            path: PathBuf::from(row.path),
            extension: row.extension,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct HashesRow {
    md5: Vec<u8>,
    sha1: Vec<u8>,
    sha256: Vec<u8>,
}
impl TryFrom<HashesRow> for Hashes {
    type Error = Error;
    fn try_from(row: HashesRow) -> Result<Self, Self::Error> {
        // The table has CHECK constraints on the lengths, so a failure here
        // means the file was edited behind our back.
        Hashes::from_slices(&row.md5, &row.sha1, &row.sha256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_from_row() {
        let row = EntryRow {
            id: 7,
            path: "5e/5eb63bbbe01eeed093cb22bb8f5acdc3.png".to_string(),
            extension: ".png".to_string(),
        };
        let entry = Entry::from(row);
        assert_eq!(entry.id, 7);
        assert_eq!(entry.path, PathBuf::from("5e/5eb63bbbe01eeed093cb22bb8f5acdc3.png"));
    }

    #[test]
    fn test_truncated_hash_row_is_rejected() {
        let row = HashesRow { md5: vec![0; 15], sha1: vec![0; 20], sha256: vec![0; 32] };
        assert!(Hashes::try_from(row).is_err());
    }
}
