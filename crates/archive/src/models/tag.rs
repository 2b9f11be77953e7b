use crate::error::{Error, ErrorKind};
use crate::models::TagId;
use exn::ResultExt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tag {
    pub id: TagId,
    pub text: String,
}

/// How many entries a tag is mapped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagCount {
    pub text: String,
    pub count: u64,
}

#[derive(sqlx::FromRow)]
pub(crate) struct TagRow {
    tag_id: i64,
    text: String,
}
impl From<TagRow> for Tag {
    fn from(row: TagRow) -> Self {
        Self { id: row.tag_id, text: row.text }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct TagCountRow {
    text: String,
    total: i64,
}
impl TryFrom<TagCountRow> for TagCount {
    type Error = Error;
    fn try_from(row: TagCountRow) -> Result<Self, Self::Error> {
        Ok(Self {
            text: row.text,
            count: u64::try_from(row.total).or_raise(|| ErrorKind::InvalidData("tag count"))?,
        })
    }
}
