//! Storage backend trait and implementations.
//!
//! The archive only ever needs a handful of operations on the media tree:
//! place the bytes of a freshly imported file, hand them back out, and clean
//! up after a removal.

mod local;

pub use self::local::LocalBackend;
use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;

/// Unified interface for storage backends.
///
/// # Path Handling
/// All paths are relative to the storage root and must be validated using
/// [`validate_path`](crate::validate_path) before use. Implementations should
/// enforce this validation.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use moon_storage::{backend::StorageBackend, error::Result};
///
/// async fn size_of_media(backend: &dyn StorageBackend, path: &Path) -> Result<u64> {
///     if backend.exists(path).await? {
///         let data = backend.read(path).await?;
///         Ok(data.len() as u64)
///     } else {
///         Ok(0)
///     }
/// }
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Name of the configured backend, used for logging only.
    fn name(&self) -> &str;

    /// Check if a file exists.
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Read file contents.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the file
    /// does not exist.
    async fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Size of a file in bytes.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the file
    /// does not exist.
    async fn stat(&self, path: &Path) -> Result<u64>;

    /// Write file contents, creating or overwriting the file.
    ///
    /// Implementations should create parent directories as needed.
    async fn write(&self, path: &Path, data: &[u8]) -> Result<()>;

    /// Delete a file.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the file
    /// does not exist.
    async fn delete(&self, path: &Path) -> Result<()>;

    /// Remove a directory, but only when it holds nothing.
    ///
    /// Returns `Ok(true)` when the directory was removed and `Ok(false)` when
    /// it was not empty or did not exist in the first place.
    async fn remove_dir_if_empty(&self, path: &Path) -> Result<bool>;
}
