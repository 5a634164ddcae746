//! Mount configuration (spec §6, §10): the merged view of CLI flags and an
//! optional TOML config file that the `fuse` binary hands to `studip-core`.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AuthError;

/// studip-fuse never implements a login flow itself (spec §1 out-of-scope).
/// This trait is the seam a caller plugs real credential handling into;
/// `StaticToken` below is the only implementation this crate ships.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<String, AuthError>;
}

/// The simplest possible provider: a token supplied once at startup, never
/// refreshed. Sufficient for the personal-access-token flows most Stud.IP
/// instances support.
pub struct StaticToken(pub String);

#[async_trait]
impl AuthProvider for StaticToken {
    async fn bearer_token(&self) -> Result<String, AuthError> {
        if self.0.is_empty() {
            return Err(AuthError("no access token configured".to_string()));
        }
        Ok(self.0.clone())
    }
}

/// On-disk config file format, merged with CLI flags (CLI wins on conflict).
/// Fields mirror `MountConfig` so either source alone is enough to mount.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub base_url: Option<String>,
    pub access_token: Option<String>,
    pub path_template: Option<String>,
    pub mountpoint: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub max_concurrent_requests: Option<usize>,
    pub generic_root_names: Option<Vec<String>>,
}

/// Fully resolved settings for one mount (spec §4.4, §4.5, §6).
#[derive(Debug, Clone)]
pub struct MountConfig {
    pub base_url: url::Url,
    pub access_token: String,
    pub path_template: String,
    pub mountpoint: PathBuf,
    pub cache_dir: PathBuf,
    pub max_concurrent_requests: usize,
    pub generic_root_names: std::collections::BTreeSet<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting '{0}' (set it via CLI flag or config file)")]
    Missing(&'static str),
    #[error("invalid base URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("failed to read config file {path}: {source}")]
    Read { path: PathBuf, #[source] source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    Parse { path: PathBuf, #[source] source: toml::de::Error },
}

impl ConfigFile {
    pub async fn load(path: &std::path::Path) -> Result<ConfigFile, ConfigError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }
}

pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 10;

impl MountConfig {
    /// Merges a parsed config file with CLI-overridable fields; CLI values
    /// (the `Some`s passed in here) always win (spec §10).
    #[allow(clippy::too_many_arguments)]
    pub fn merge(
        file: ConfigFile,
        base_url: Option<String>,
        access_token: Option<String>,
        path_template: Option<String>,
        mountpoint: Option<PathBuf>,
        cache_dir: Option<PathBuf>,
        max_concurrent_requests: Option<usize>,
    ) -> Result<MountConfig, ConfigError> {
        let base_url = base_url
            .or(file.base_url)
            .ok_or(ConfigError::Missing("base-url"))?;
        let base_url = url::Url::parse(&base_url)?;

        let access_token =
            access_token.or(file.access_token).ok_or(ConfigError::Missing("access-token"))?;

        let path_template = path_template
            .or(file.path_template)
            .unwrap_or_else(|| "{semester-lexical-short}/{course-abbrev}/{short-path}".to_string());

        let mountpoint = mountpoint.or(file.mountpoint).ok_or(ConfigError::Missing("mountpoint"))?;

        let cache_dir = cache_dir.or(file.cache_dir).unwrap_or_else(default_cache_dir);

        let max_concurrent_requests = max_concurrent_requests
            .or(file.max_concurrent_requests)
            .unwrap_or(DEFAULT_MAX_CONCURRENT_REQUESTS);

        let generic_root_names = file
            .generic_root_names
            .map(|names| names.into_iter().collect())
            .unwrap_or_else(crate::token::default_generic_roots);

        Ok(MountConfig {
            base_url,
            access_token,
            path_template,
            mountpoint,
            cache_dir,
            max_concurrent_requests,
            generic_root_names,
        })
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir().unwrap_or_else(std::env::temp_dir).join("studip-fuse")
}

/// Default location for the status log (spec §4.6): `<user-data-dir>/studip-status.txt`.
pub fn default_status_log_path() -> PathBuf {
    dirs::data_dir().unwrap_or_else(std::env::temp_dir).join("studip-status.txt")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_requires_base_url_and_mountpoint() {
        let file = ConfigFile::default();
        let err = MountConfig::merge(file, None, Some("tok".into()), None, None, None, None).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("base-url")));
    }

    #[test]
    fn merge_applies_defaults() {
        let file = ConfigFile::default();
        let config = MountConfig::merge(
            file,
            Some("https://studip.example.edu/".into()),
            Some("tok".into()),
            None,
            Some(PathBuf::from("/mnt/studip")),
            None,
            None,
        )
        .unwrap();
        assert_eq!(config.max_concurrent_requests, DEFAULT_MAX_CONCURRENT_REQUESTS);
        assert_eq!(config.path_template, "{semester-lexical-short}/{course-abbrev}/{short-path}");
    }

    #[test]
    fn cli_values_override_config_file() {
        let file = ConfigFile {
            base_url: Some("https://file.example.edu/".into()),
            max_concurrent_requests: Some(3),
            ..Default::default()
        };
        let config = MountConfig::merge(
            file,
            Some("https://cli.example.edu/".into()),
            Some("tok".into()),
            None,
            Some(PathBuf::from("/mnt/studip")),
            None,
            Some(20),
        )
        .unwrap();
        assert_eq!(config.base_url.as_str(), "https://cli.example.edu/");
        assert_eq!(config.max_concurrent_requests, 20);
    }
}
