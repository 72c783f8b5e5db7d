use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;
use url::Url;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "pixcache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Bounds of the in-memory image cache.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct InMemoryCacheConfig {
    /// The maximum number of decoded images kept in memory.
    ///
    /// Defaults to `100`.
    pub max_count: usize,

    /// The share of `memory_ceiling` that decoded images may occupy.
    ///
    /// Defaults to `0.25`.
    pub size_budget_fraction: f64,

    /// The amount of memory (in bytes) the process may use.
    ///
    /// Defaults to `512 MiB (= 536_870_912)`.
    pub memory_ceiling: u64,
}

impl Default for InMemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_count: 100,
            size_budget_fraction: 0.25,
            memory_ceiling: 512 * 1024 * 1024,
        }
    }
}

impl InMemoryCacheConfig {
    fn validate(&self) -> Result<()> {
        if self.max_count == 0 {
            anyhow::bail!("caches.in_memory.max_count must be at least 1");
        }
        // also rejects NaN
        if !(self.size_budget_fraction > 0.0 && self.size_budget_fraction <= 1.0) {
            anyhow::bail!(
                "caches.in_memory.size_budget_fraction must be in (0, 1], got {}",
                self.size_budget_fraction
            );
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct CacheConfigs {
    /// Configuration of the in-memory image cache.
    pub in_memory: InMemoryCacheConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The root of the durable image store.
    ///
    /// Defaults to `pixcache` inside the platform cache directory.
    pub cache_dir: Option<PathBuf>,

    /// The image server images are fetched from, as `<source_url>/image?name=<key>`.
    ///
    /// There is no default, loading images from the network requires this to be set.
    pub source_url: Option<Url>,

    /// A local directory images are read from, as `<source_dir>/<key>`.
    ///
    /// Only used when no `source_url` is configured.
    pub source_dir: Option<PathBuf>,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Bounds of the caches.
    pub caches: CacheConfigs,

    /// The maximum number of images fetched concurrently.
    pub max_concurrent_fetches: usize,

    /// The timeout for establishing a connection to the image server.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The maximum time one image download may take, including reading the body.
    #[serde(with = "humantime_serde")]
    pub max_download_timeout: Duration,

    /// The maximum number of bytes a decoded image may allocate.
    ///
    /// Larger images fail to load as if the process ran out of memory. Defaults to the limit of
    /// the `image` crate.
    pub max_decoded_size: Option<u64>,
}

/// Default value for the "cache_dir" configuration.
fn default_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("pixcache"))
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: default_cache_dir(),
            source_url: None,
            source_dir: None,
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            caches: CacheConfigs::default(),
            max_concurrent_fetches: 3,
            connect_timeout: Duration::from_secs(5),
            max_download_timeout: Duration::from_secs(30),
            max_decoded_size: None,
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        let config: Self = serde_yaml::from_str(&config).context("failed to parse config YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the values deserialization cannot rule out.
    pub fn validate(&self) -> Result<()> {
        self.caches.in_memory.validate()?;
        if self.max_concurrent_fetches == 0 {
            anyhow::bail!("max_concurrent_fetches must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
