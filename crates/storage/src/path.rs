//! Path validation for the media tree.
//!
//! Entry paths come out of the database, so they are *probably* fine, but a
//! corrupted or hand-edited row must never be able to point a delete outside
//! of the media root.

use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// Validates a storage path and returns it normalized.
///
/// `..` is resolved lexically and rejected once it would climb above the
/// root. Null bytes, Windows prefixes and paths that normalize to nothing are
/// rejected with [`InvalidPath`](crate::error::ErrorKind::InvalidPath).
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use moon_storage::validate_path;
/// assert!(validate_path("d4/d41d8cd98f00b204e9800998ecf8427e.png").is_ok());
/// assert!(validate_path("d4/../d4/file.png").is_ok());
/// assert!(validate_path("../etc/passwd").is_err());
/// assert!(validate_path("d4/../../etc").is_err());
/// assert!(validate_path("a\0b").is_err());
/// assert_eq!(
///     validate_path("./d4//./file.png/").unwrap(),
///     Path::new("d4/file.png")
/// );
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(s) => {
                // Null bytes survive Path::components() on Unix but truncate
                // in the underlying syscalls.
                if s.as_encoded_bytes().contains(&0) {
                    exn::bail!(ErrorKind::InvalidPath(path.to_path_buf()));
                }
                components.push(s)
            },
            Component::CurDir | Component::RootDir => {},
            Component::Prefix(_) => exn::bail!(ErrorKind::InvalidPath(path.to_path_buf())),
            Component::ParentDir => {
                if components.pop().is_none() {
                    exn::bail!(ErrorKind::InvalidPath(path.to_path_buf()));
                }
            },
        }
    }
    match components.is_empty() {
        true => exn::bail!(ErrorKind::InvalidPath(path.to_path_buf())),
        false => Ok(components.into_iter().collect()),
    }
}
