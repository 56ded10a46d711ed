//! Configuration for cloudsync.
//!
//! Settings are layered with [`figment`], lowest precedence first:
//!
//! 1. Built-in defaults ([`Config::default()`]).
//! 2. A config file, TOML, YAML or JSON depending on its extension. Without
//!    an explicit path, `config.toml` in the platform config directory is
//!    used if it exists (see [`Config::default_path()`]).
//! 3. Environment variables prefixed with `CLOUDSYNC_`, nested with `__`
//!    (`CLOUDSYNC_REMOTE__KEY_ID` sets `remote.key_id`).
//! 4. Command-line [`Overrides`].
//!
//! The merged result is validated before it's handed out, so a [`Config`]
//! returned by [`Config::load()`] always has an absolute local root, an
//! `s3://` remote with a bucket, a non-zero interval and credentials.

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::{OptionExt, ResultExt};
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const APPLICATION: &str = "cloudsync";
pub const ENV_PREFIX: &str = "CLOUDSYNC_";
const DEFAULT_INTERVAL_SECS: u64 = 30;
const DEFAULT_REGION: &str = "us-east-1";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub local: LocalConfig,
    pub remote: RemoteConfig,
    pub sync: SyncConfig,
    pub identity: IdentityConfig,
}

/// The local replica.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Absolute path of the directory tree to keep in sync.
    pub root: PathBuf,
    /// Where locally deleted files are moved instead of being removed.
    /// Relative paths are resolved against `root`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trash: Option<PathBuf>,
}

/// The remote replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// `s3://bucket/optional/prefix`
    pub url: String,
    pub region: String,
    /// Custom endpoint for S3-compatible services.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_secret: Option<String>,
    /// Key prefix (relative to the remote root) that deleted objects are
    /// copied under before removal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trash_prefix: Option<String>,
}
impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            region: DEFAULT_REGION.to_string(),
            endpoint: None,
            key_id: None,
            key_secret: None,
            trash_prefix: None,
        }
    }
}

/// Behaviour of the sync loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds to sleep between cycles.
    pub interval_secs: u64,
    pub on_failure: OnFailure,
}
impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_INTERVAL_SECS,
            on_failure: OnFailure::default(),
        }
    }
}

/// What the executor does when an action fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnFailure {
    /// Stop the batch at the first failing action.
    #[default]
    Abort,
    /// Attempt every action and report all failures.
    Continue,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Pin the client identity instead of deriving it from a network
    /// interface.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// Values supplied on the command line; they win over every other source.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub local_root: Option<PathBuf>,
    pub remote_url: Option<String>,
    pub interval_secs: Option<u64>,
}

/// Bucket and key prefix parsed from [`RemoteConfig::url`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Location {
    pub bucket: String,
    pub prefix: Option<String>,
}

impl Config {
    /// `<platform config dir>/cloudsync/config.toml`, if the platform has a
    /// config directory at all.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", APPLICATION).map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load, merge and validate the configuration.
    ///
    /// An explicit `path` must exist; the default path is optional.
    pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<Self> {
        let config = Self::load_unvalidated(path, overrides)?;
        config.validate()?;
        tracing::debug!(root = %config.local.root.display(), remote = %config.remote.url, "configuration loaded");
        Ok(config)
    }

    /// Load and merge without [validating](Self::validate), for commands
    /// that only need part of the configuration.
    pub fn load_unvalidated(path: Option<&Path>, overrides: &Overrides) -> Result<Self> {
        Self::figment(path, overrides)?.extract().or_raise(|| ErrorKind::Load)
    }

    /// The merged provider stack, before extraction.
    pub fn figment(path: Option<&Path>, overrides: &Overrides) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        match path {
            Some(path) => {
                if !path.is_file() {
                    exn::bail!(ErrorKind::Invalid(format!("config file {} does not exist", path.display())));
                }
                figment = merge_file(figment, path)?;
            },
            None => {
                if let Some(default) = Self::default_path()
                    && default.is_file()
                {
                    tracing::debug!(path = %default.display(), "using default config file");
                    figment = merge_file(figment, &default)?;
                }
            },
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        if let Some(root) = &overrides.local_root {
            figment = figment.merge(Serialized::default("local.root", root));
        }
        if let Some(url) = &overrides.remote_url {
            figment = figment.merge(Serialized::default("remote.url", url));
        }
        if let Some(interval) = overrides.interval_secs {
            figment = figment.merge(Serialized::default("sync.interval_secs", interval));
        }
        Ok(figment)
    }

    /// Check every field, reporting all problems at once.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.local.root.as_os_str().is_empty() {
            problems.push("local.root is required".to_string());
        } else if !self.local.root.is_absolute() {
            problems.push(format!("local.root must be absolute, got {}", self.local.root.display()));
        }
        if self.remote.url.is_empty() {
            problems.push("remote.url is required".to_string());
        } else if let Err(e) = self.remote.location()
            && let ErrorKind::Invalid(message) = &*e
        {
            problems.push(message.clone());
        }
        if self.remote.key_id.as_deref().is_none_or(str::is_empty) {
            problems.push("remote.key_id is required".to_string());
        }
        if self.remote.key_secret.as_deref().is_none_or(str::is_empty) {
            problems.push("remote.key_secret is required".to_string());
        }
        if self.remote.trash_prefix.as_deref().is_some_and(|p| p.trim_matches('/').is_empty()) {
            problems.push("remote.trash_prefix must not be empty".to_string());
        }
        if self.sync.interval_secs == 0 {
            problems.push("sync.interval_secs must be greater than zero".to_string());
        }
        if self.identity.client_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            problems.push("identity.client_id must not be empty when set".to_string());
        }
        match problems.is_empty() {
            true => Ok(()),
            false => exn::bail!(ErrorKind::Invalid(problems.join("; "))),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.sync.interval_secs)
    }

    /// Absolute location of the local trash, if one is configured.
    pub fn local_trash(&self) -> Option<PathBuf> {
        self.local.trash.as_ref().map(|trash| self.local.root.join(trash))
    }
}

impl RemoteConfig {
    /// Parse [`url`](Self::url) into a bucket and optional key prefix.
    pub fn location(&self) -> Result<S3Location> {
        let url = Url::parse(&self.url)
            .or_raise(|| ErrorKind::Invalid(format!("remote.url `{}` is not a valid URL", self.url)))?;
        if url.scheme() != "s3" {
            exn::bail!(ErrorKind::Invalid(format!("remote.url must use the s3:// scheme, got `{}`", url.scheme())));
        }
        let bucket = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_raise(|| ErrorKind::Invalid(format!("remote.url `{}` has no bucket", self.url)))?;
        let prefix = url.path().trim_matches('/');
        Ok(S3Location {
            bucket: bucket.to_string(),
            prefix: (!prefix.is_empty()).then(|| prefix.to_string()),
        })
    }
}

fn merge_file(figment: Figment, path: &Path) -> Result<Figment> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") | None => Ok(figment.merge(Toml::file(path))),
        Some("yaml" | "yml") => Ok(figment.merge(Yaml::file(path))),
        Some("json") => Ok(figment.merge(Json::file(path))),
        Some(other) => exn::bail!(ErrorKind::Invalid(format!("unsupported config file extension `.{other}`"))),
    }
}
