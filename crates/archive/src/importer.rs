//! The contract between the archive and whatever supplies new media.
//!
//! An uploader, a filesystem walker or a test fixture all look the same to
//! [`EntryRepository::import`](crate::EntryRepository::import): something
//! that knows its hashes, extension, timestamps and size, and can put its
//! bytes at a path it is told.

use crate::error::{ErrorKind, Result};
use crate::hash::Hashes;
use async_trait::async_trait;
use exn::ResultExt;
use moon_storage::BackendHandle;
use moon_storage::error::Result as StorageResult;
use std::path::Path;
use time::UtcDateTime;

/// How many leading bytes are offered for content sniffing.
pub const HEAD_LEN: usize = 512;

/// Timestamps an importer knows about its source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileTimes {
    pub created: UtcDateTime,
    pub modified: UtcDateTime,
}

#[async_trait]
pub trait Importer: Send + Sync {
    /// The digests of the content. Importers that were handed digests
    /// (rather than computing them) validate them with
    /// [`Hashes::from_slices`].
    fn hashes(&self) -> Result<Hashes>;

    /// Original file extension, with or without the leading dot.
    fn extension(&self) -> &str;

    fn timestamps(&self) -> FileTimes;

    fn file_size(&self) -> u64;

    /// The first bytes of the content, used to guess a MIME type when the
    /// extension is not recognised.
    fn head(&self) -> &[u8];

    /// Place the bytes at `path` inside `media`. Called exactly once per
    /// successful import.
    async fn store(&self, media: &BackendHandle, path: &Path) -> StorageResult<()>;
}

/// A file held in memory, ready for import.
#[derive(Debug, Clone)]
pub struct MediaFile {
    bytes: Vec<u8>,
    extension: String,
    times: FileTimes,
    hashes: Hashes,
}

impl MediaFile {
    pub fn new(bytes: Vec<u8>, extension: impl Into<String>, times: FileTimes) -> Self {
        let hashes = Hashes::digest(&bytes);
        Self { bytes, extension: extension.into(), times, hashes }
    }

    /// Read a file from the local filesystem, taking timestamps from its
    /// metadata. Platforms without a creation time fall back to the
    /// modification time.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await.or_raise(|| ErrorKind::Io)?;
        let modified: UtcDateTime = metadata.modified().or_raise(|| ErrorKind::Io)?.into();
        let created = metadata.created().map(UtcDateTime::from).unwrap_or(modified);
        let bytes = tokio::fs::read(path).await.or_raise(|| ErrorKind::Io)?;
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default().to_string();
        Ok(Self::new(bytes, extension, FileTimes { created, modified }))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[async_trait]
impl Importer for MediaFile {
    fn hashes(&self) -> Result<Hashes> {
        Ok(self.hashes)
    }

    fn extension(&self) -> &str {
        &self.extension
    }

    fn timestamps(&self) -> FileTimes {
        self.times
    }

    fn file_size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn head(&self) -> &[u8] {
        &self.bytes[..self.bytes.len().min(HEAD_LEN)]
    }

    async fn store(&self, media: &BackendHandle, path: &Path) -> StorageResult<()> {
        media.write(path, &self.bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("holiday.JPG");
        tokio::fs::write(&path, b"hello world").await.unwrap();
        let file = MediaFile::from_path(&path).await.unwrap();
        assert_eq!(file.extension(), "JPG");
        assert_eq!(file.file_size(), 11);
        assert_eq!(file.bytes(), b"hello world");
        assert_eq!(file.hashes().unwrap(), Hashes::digest(b"hello world"));
        assert!(file.timestamps().created <= UtcDateTime::now());
    }

    #[tokio::test]
    async fn test_from_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = MediaFile::from_path(dir.path().join("missing.png")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Io));
    }

    #[test]
    fn test_head_is_bounded() {
        let now = UtcDateTime::now();
        let times = FileTimes { created: now, modified: now };
        let file = MediaFile::new(vec![7; HEAD_LEN * 2], "bin", times);
        assert_eq!(file.head().len(), HEAD_LEN);
        let small = MediaFile::new(vec![7; 3], "bin", times);
        assert_eq!(small.head(), &[7, 7, 7]);
    }
}
