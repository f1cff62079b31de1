//! Daemon configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `SPOOL_*` environment variables, then command-line flags (applied by the
//! CLI layer).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::spool::engine::DEFAULT_ENGINE;
use crate::spool::reader::ReadPolicy;
use crate::spool::recovery::OrphanPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoolConfig {
    /// Directory producers drop `<id>.json` requests into.
    pub request_dir: PathBuf,
    /// Directory responses are published to.
    pub response_dir: PathBuf,
    /// Pre-trained resource handed to the engine at startup.
    pub model_path: Option<PathBuf>,
    /// Engine name from the registry.
    pub engine: String,
    /// Sleep between scan cycles.
    #[serde(rename = "poll_interval_ms", with = "duration_ms")]
    pub poll_interval: Duration,
    /// Sleep after a failed scan cycle.
    #[serde(rename = "error_backoff_ms", with = "duration_ms")]
    pub error_backoff: Duration,
    /// Retry budget for claimed requests that are not readable yet.
    pub read: ReadPolicy,
    /// Age after which a claim marker is considered orphaned (0 = never).
    #[serde(rename = "stale_after_secs", with = "duration_secs")]
    pub stale_after: Duration,
    /// Minimum time between orphan sweeps.
    #[serde(rename = "sweep_interval_secs", with = "duration_secs")]
    pub sweep_interval: Duration,
    pub orphan_policy: OrphanPolicy,
    /// Wake early on request-directory change notifications.
    pub watch: bool,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        let base = default_spool_dir();
        Self {
            request_dir: base.join("requests"),
            response_dir: base.join("responses"),
            model_path: None,
            engine: DEFAULT_ENGINE.to_string(),
            poll_interval: Duration::from_millis(100),
            error_backoff: Duration::from_secs(1),
            read: ReadPolicy::default(),
            stale_after: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
            orphan_policy: OrphanPolicy::Requeue,
            watch: false,
        }
    }
}

impl SpoolConfig {
    /// Defaults, then `file` (or `$SPOOL_CONFIG`), then the environment.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let file = file
            .map(Path::to_path_buf)
            .or_else(|| dotenvy::var("SPOOL_CONFIG").ok().map(PathBuf::from));
        let mut cfg = match file {
            Some(path) => Self::from_toml_file(&path)?,
            None => Self::default(),
        };
        cfg.apply_env();
        Ok(cfg)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlay `SPOOL_*` environment variables. Unparseable values are
    /// reported and ignored.
    pub fn apply_env(&mut self) {
        if let Ok(path) = dotenvy::var("SPOOL_REQUEST_DIR") {
            self.request_dir = PathBuf::from(path);
        }
        if let Ok(path) = dotenvy::var("SPOOL_RESPONSE_DIR") {
            self.response_dir = PathBuf::from(path);
        }
        if let Ok(path) = dotenvy::var("SPOOL_MODEL_PATH") {
            self.model_path = Some(PathBuf::from(path));
        }
        if let Ok(name) = dotenvy::var("SPOOL_ENGINE") {
            self.engine = name;
        }
        if let Some(ms) = env_parse::<u64>("SPOOL_POLL_MS") {
            self.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("SPOOL_BACKOFF_MS") {
            self.error_backoff = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse::<u32>("SPOOL_READ_ATTEMPTS") {
            self.read.attempts = n;
        }
        if let Some(ms) = env_parse::<u64>("SPOOL_READ_RETRY_MS") {
            self.read.delay = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse::<u64>("SPOOL_STALE_AFTER_SECS") {
            self.stale_after = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("SPOOL_SWEEP_INTERVAL_SECS") {
            self.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(policy) = env_parse::<OrphanPolicy>("SPOOL_ORPHAN_POLICY") {
            self.orphan_policy = policy;
        }
        if let Ok(val) = dotenvy::var("SPOOL_WATCH") {
            self.watch = is_truthy(&val);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_dir == self.response_dir {
            return Err(ConfigError::Invalid(format!(
                "request and response directories must differ (both {})",
                self.request_dir.display()
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        if self.read.attempts == 0 {
            return Err(ConfigError::Invalid(
                "read attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the orphan sweep is enabled.
    pub fn sweeps_orphans(&self) -> bool {
        !self.stale_after.is_zero()
    }
}

/// Platform data directory for the spool, or a temp-dir fallback.
pub fn default_spool_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "inference-spool", "inference-spool")
        .map(|dirs| dirs.data_dir().join("spool"))
        .unwrap_or_else(|| std::env::temp_dir().join("inference-spool"))
}

/// `1`, `true`, `yes`, `on` (any case).
pub fn is_truthy(val: &str) -> bool {
    matches!(
        val.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_parse<T>(key: &str) -> Option<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let val = dotenvy::var(key).ok()?;
    match val.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(key, value = %val, error = %e, "ignoring invalid environment value");
            None
        }
    }
}

/// Serde adapter: `Duration` as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Serde adapter: `Duration` as integer seconds.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
