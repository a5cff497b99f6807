//! Configuration loading and validation for the image cache.
//!
//! Values are layered, later sources overriding earlier ones:
//!
//! 1. built-in defaults,
//! 2. an optional config file (TOML, YAML or JSON, chosen by extension),
//! 3. `IMGCACHE_*` environment variables (e.g. `IMGCACHE_DRIVER=xattr`).

pub mod error;

use crate::error::{ErrorKind, Result};
use derive_more::Display;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Prefix of the environment variables read by [`Config::load()`].
pub const ENV_PREFIX: &str = "IMGCACHE_";

const GIB: u64 = 1024 * 1024 * 1024;

/// Which metadata store the cache uses.
#[derive(Clone, Copy, Debug, Default, Display, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Hit counts and access times in an SQLite file next to the images.
    #[default]
    #[display("sqlite")]
    Sqlite,
    /// Hit counts as extended attributes, times from the filesystem.
    #[display("xattr")]
    Xattr,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Cache root; must be absolute.
    pub dir: PathBuf,
    pub driver: DriverKind,
    /// File name of the SQLite database, created inside `dir`.
    pub sqlite_db: String,
    /// Size in bytes above which `prune` starts evicting images.
    pub max_size: u64,
    /// Seconds after which an incomplete write is considered stalled.
    pub stall_time: u64,
    /// Milliseconds an SQLite operation keeps retrying on a locked database.
    pub sql_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            driver: DriverKind::default(),
            sqlite_db: "cache.db".to_string(),
            max_size: 10 * GIB,
            stall_time: 86_400,
            sql_timeout_ms: 2_000,
        }
    }
}

fn default_dir() -> PathBuf {
    directories::ProjectDirs::from("org", "imgcache", "imgcache")
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join("imgcache"))
}

impl Config {
    /// Load configuration from defaults, an optional file and the environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let config: Self = Self::figment(file)?.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        tracing::debug!(?config, "Loaded configuration");
        Ok(config)
    }

    /// The layered provider behind [`load()`](Self::load), without validation.
    pub fn figment(file: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = file {
            // Figment treats a missing file as an empty one.
            if !path.is_file() {
                exn::bail!(ErrorKind::NotFound(path.to_path_buf()));
            }
            let extension = path.extension().and_then(|ext| ext.to_str()).map(str::to_ascii_lowercase);
            figment = match extension.as_deref() {
                Some("toml") => figment.merge(Toml::file(path)),
                Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
                Some("json") => figment.merge(Json::file(path)),
                _ => exn::bail!(ErrorKind::UnsupportedFormat(path.to_path_buf())),
            };
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX)))
    }

    /// Check the values that deserialize fine but can't be used.
    pub fn validate(&self) -> Result<()> {
        if !self.dir.is_absolute() {
            exn::bail!(ErrorKind::Invalid {
                key: "dir",
                reason: format!("{} is not an absolute path", self.dir.display()),
            });
        }
        let mut components = Path::new(&self.sqlite_db).components();
        if !matches!((components.next(), components.next()), (Some(Component::Normal(_)), None)) {
            exn::bail!(ErrorKind::Invalid {
                key: "sqlite_db",
                reason: format!("{:?} must be a plain file name", self.sqlite_db),
            });
        }
        if self.sql_timeout_ms == 0 {
            exn::bail!(ErrorKind::Invalid { key: "sql_timeout_ms", reason: "must be greater than zero".to_string() });
        }
        Ok(())
    }

    pub fn stall_time(&self) -> Duration {
        Duration::from_secs(self.stall_time)
    }

    pub fn sql_timeout(&self) -> Duration {
        Duration::from_millis(self.sql_timeout_ms)
    }

    /// Full path of the SQLite database file.
    pub fn sqlite_path(&self) -> PathBuf {
        self.dir.join(&self.sqlite_db)
    }
}
