//! Configuration for the moon archive.
//!
//! Values are layered, later layers winning:
//! 1. built-in defaults,
//! 2. an optional configuration file (TOML, YAML or JSON, picked by extension),
//! 3. environment variables prefixed with `MOON_` (e.g. `MOON_MEDIA_PATH`).
//!
//! Relative paths are resolved against [`Config::base_path`], which defaults
//! to the platform data directory.

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "MOON_";
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory that relative paths below are resolved against.
    pub base_path: PathBuf,
    /// Root of the media file tree.
    pub media_path: PathBuf,
    /// Primary archive database file.
    pub archive_path: PathBuf,
    /// Thumbnail database file; thumbnails are disabled when unset.
    pub thumbnail_path: Option<PathBuf>,
    pub log_level: String,
    /// Deadline applied to interactive queries, in milliseconds.
    pub query_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        let base_path = ProjectDirs::from("", "", "moon")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            base_path,
            media_path: PathBuf::from("media/"),
            archive_path: PathBuf::from("archive.sqlite3"),
            thumbnail_path: Some(PathBuf::from("thumb.db")),
            log_level: "info".to_string(),
            query_timeout_ms: 500,
        }
    }
}

impl Config {
    /// Load configuration from defaults, an optional file, and the environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let config: Self = Self::figment(file)?.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        tracing::debug!(base = %config.base_path.display(), "Loaded configuration");
        Ok(config)
    }

    fn figment(file: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(file) = file {
            let extension = file.extension().and_then(|e| e.to_str()).unwrap_or_default().to_ascii_lowercase();
            if !matches!(extension.as_str(), "toml" | "yaml" | "yml" | "json") {
                exn::bail!(ErrorKind::Invalid("configuration file must be toml, yaml or json"));
            }
            // Figment silently skips missing files, but a path that was asked
            // for explicitly has to exist.
            if !file.is_file() {
                exn::bail!(ErrorKind::Load);
            }
            figment = match extension.as_str() {
                "toml" => figment.merge(Toml::file_exact(file)),
                "json" => figment.merge(Json::file_exact(file)),
                _ => figment.merge(Yaml::file_exact(file)),
            };
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX)))
    }

    fn validate(&self) -> Result<()> {
        if self.media_path.as_os_str().is_empty() {
            exn::bail!(ErrorKind::Invalid("media_path"));
        }
        if self.archive_path.as_os_str().is_empty() {
            exn::bail!(ErrorKind::Invalid("archive_path"));
        }
        if self.thumbnail_path.as_ref().is_some_and(|p| p.as_os_str().is_empty()) {
            exn::bail!(ErrorKind::Invalid("thumbnail_path"));
        }
        if !LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            exn::bail!(ErrorKind::Invalid("log_level"));
        }
        if self.query_timeout_ms == 0 {
            exn::bail!(ErrorKind::Invalid("query_timeout_ms"));
        }
        Ok(())
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match path.is_absolute() {
            true => path.to_path_buf(),
            false => self.base_path.join(path),
        }
    }

    pub fn media_dir(&self) -> PathBuf {
        self.resolve(&self.media_path)
    }

    pub fn archive_file(&self) -> PathBuf {
        self.resolve(&self.archive_path)
    }

    pub fn thumbnail_file(&self) -> Option<PathBuf> {
        self.thumbnail_path.as_deref().map(|p| self.resolve(p))
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use rstest::rstest;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.media_path, Path::new("media/"));
        assert_eq!(config.archive_path, Path::new("archive.sqlite3"));
        assert_eq!(config.thumbnail_path.as_deref(), Some(Path::new("thumb.db")));
        assert_eq!(config.query_timeout(), Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_relative_paths_resolve_against_base() {
        let config = Config {
            base_path: PathBuf::from("/srv/moon"),
            archive_path: PathBuf::from("/var/lib/archive.sqlite3"),
            ..Config::default()
        };
        assert_eq!(config.media_dir(), Path::new("/srv/moon/media"));
        assert_eq!(config.archive_file(), Path::new("/var/lib/archive.sqlite3"));
        assert_eq!(config.thumbnail_file().unwrap(), Path::new("/srv/moon/thumb.db"));
    }

    #[rstest]
    #[case("moon.toml", "media_path = \"library\"\nquery_timeout_ms = 50\n")]
    #[case("moon.yaml", "media_path: library\nquery_timeout_ms: 50\n")]
    #[case("moon.json", "{\"media_path\": \"library\", \"query_timeout_ms\": 50}")]
    fn test_load_file_formats(#[case] name: &str, #[case] contents: &str) {
        Jail::expect_with(|jail| {
            jail.create_file(name, contents)?;
            let config = Config::load(Some(Path::new(name))).map_err(|e| e.to_string())?;
            assert_eq!(config.media_path, Path::new("library"));
            assert_eq!(config.query_timeout_ms, 50);
            // Untouched values keep their defaults.
            assert_eq!(config.archive_path, Path::new("archive.sqlite3"));
            Ok(())
        });
    }

    #[test]
    fn test_environment_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("moon.toml", "log_level = \"debug\"\nquery_timeout_ms = 50\n")?;
            jail.set_env("MOON_QUERY_TIMEOUT_MS", "250");
            let config = Config::load(Some(Path::new("moon.toml"))).map_err(|e| e.to_string())?;
            assert_eq!(config.log_level, "debug");
            assert_eq!(config.query_timeout_ms, 250);
            Ok(())
        });
    }

    #[test]
    fn test_unknown_extension_is_rejected() {
        let err = Config::load(Some(Path::new("moon.ini"))).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Invalid(_)));
    }

    #[rstest]
    #[case("log_level = \"loud\"")]
    #[case("query_timeout_ms = 0")]
    #[case("media_path = \"\"")]
    fn test_invalid_values(#[case] contents: &str) {
        Jail::expect_with(|jail| {
            jail.create_file("moon.toml", contents)?;
            let err = Config::load(Some(Path::new("moon.toml"))).unwrap_err();
            assert!(matches!(&*err, ErrorKind::Invalid(_)));
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(Some(&dir.path().join("missing.toml"))).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Load));
    }
}
