//! Storage for the media file tree.
//!
//! The archive database only records *where* a file lives (a path relative to
//! the media root); this crate owns the bytes. All paths handed to a backend
//! are relative and validated so that nothing escapes the configured root.

pub mod backend;
pub mod error;
mod path;

pub use crate::backend::StorageBackend;
pub use crate::path::validate as validate_path;
use std::sync::Arc;

pub type BackendHandle = Arc<dyn StorageBackend + Send + Sync>;
