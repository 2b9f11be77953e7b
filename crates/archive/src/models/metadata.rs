use crate::error::{Error, ErrorKind};
use exn::ResultExt;

/// Which way up a piece of visual media is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Orientation {
    #[default]
    Unknown,
    /// Not applicable (audio, documents).
    None,
    Landscape,
    Portrait,
    Square,
}

impl Orientation {
    pub fn from_dimensions(width: u32, height: u32) -> Self {
        match (width, height) {
            (0, _) | (_, 0) => Self::Unknown,
            (w, h) if w > h => Self::Landscape,
            (w, h) if w < h => Self::Portrait,
            _ => Self::Square,
        }
    }

    fn as_i64(self) -> i64 {
        match self {
            Self::Unknown => -1,
            Self::None => 0,
            Self::Landscape => 1,
            Self::Portrait => 2,
            Self::Square => 3,
        }
    }

    fn from_i64(value: i64) -> Self {
        match value {
            0 => Self::None,
            1 => Self::Landscape,
            2 => Self::Portrait,
            3 => Self::Square,
            _ => Self::Unknown,
        }
    }
}

/// Derived file information. Replaceable at any time; an entry is valid
/// without it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub file_size: u64,
    pub mime_type: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub orientation: Orientation,
}

impl Metadata {
    pub fn new(file_size: u64, mime_type: Option<String>) -> Self {
        Self {
            file_size,
            mime_type,
            width: None,
            height: None,
            orientation: Orientation::Unknown,
        }
    }

    /// Record pixel dimensions, deriving the orientation from them.
    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self.orientation = Orientation::from_dimensions(width, height);
        self
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct MetadataRow {
    pub(crate) file_size: i64,
    pub(crate) mime_type: Option<String>,
    pub(crate) width: Option<i64>,
    pub(crate) height: Option<i64>,
    pub(crate) orientation: i64,
}
impl TryFrom<&Metadata> for MetadataRow {
    type Error = Error;
    fn try_from(metadata: &Metadata) -> Result<Self, Self::Error> {
        Ok(Self {
            file_size: i64::try_from(metadata.file_size).or_raise(|| ErrorKind::InvalidData("file size"))?,
            mime_type: metadata.mime_type.clone(),
            width: metadata.width.map(i64::from),
            height: metadata.height.map(i64::from),
            orientation: metadata.orientation.as_i64(),
        })
    }
}
impl TryFrom<MetadataRow> for Metadata {
    type Error = Error;
    fn try_from(row: MetadataRow) -> Result<Self, Self::Error> {
        Ok(Self {
            file_size: u64::try_from(row.file_size).or_raise(|| ErrorKind::InvalidData("file size"))?,
            mime_type: row.mime_type,
            width: row.width.map(u32::try_from).transpose().or_raise(|| ErrorKind::InvalidData("width"))?,
            height: row.height.map(u32::try_from).transpose().or_raise(|| ErrorKind::InvalidData("height"))?,
            orientation: Orientation::from_i64(row.orientation),
        })
    }
}
