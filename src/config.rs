use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::confidence::{validate_threshold, DEFAULT_THRESHOLD};
use crate::error::{Result, TaggerError};

/// Worker count used when nothing more specific is configured.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Source of the settings the pipeline consults at run time.
///
/// Implement this to back thresholds and limits with your own settings
/// store. [`TaggerConfig`] implements it for static configuration.
pub trait ConfigProvider: Send + Sync {
    /// Per-provider (and optionally per-model) worker limits.
    fn concurrency_limits(&self) -> Result<ConcurrencyLimits>;

    /// Global threshold percentage. `None` means use the built-in default of 70.
    fn global_threshold(&self) -> Result<Option<i32>>;

    /// Per-tag threshold percentages keyed by tag.
    fn tag_overrides(&self) -> Result<BTreeMap<String, i32>>;

    /// Worker count when no concurrency limit matches.
    fn default_concurrency(&self) -> usize {
        DEFAULT_CONCURRENCY
    }
}

/// A concurrency limit for one provider, optionally narrowed to one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyLimit {
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    pub limit: usize,
}

/// Lookup table of concurrency limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConcurrencyLimits {
    pub entries: Vec<ConcurrencyLimit>,
}

impl ConcurrencyLimits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a limit (builder pattern). `model = None` applies to every model of the provider.
    pub fn with_limit(mut self, provider: &str, model: Option<&str>, limit: usize) -> Self {
        self.entries.push(ConcurrencyLimit {
            provider: provider.to_string(),
            model: model.map(str::to_string),
            limit,
        });
        self
    }

    /// Most specific limit for a provider/model pair: an exact model match
    /// beats a provider-wide entry.
    pub fn resolve(&self, provider: &str, model: Option<&str>) -> Option<usize> {
        let per_model = model.and_then(|m| {
            self.entries
                .iter()
                .find(|e| e.provider == provider && e.model.as_deref() == Some(m))
        });
        per_model
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|e| e.provider == provider && e.model.is_none())
            })
            .map(|e| e.limit)
    }
}

/// Configuration for the tagging pipeline.
///
/// Use [`TaggerConfig::builder()`] for ergonomic construction,
/// [`TaggerConfig::load()`] to read a TOML file, or
/// [`TaggerConfig::default()`] for sensible defaults (in-memory cache,
/// 24h TTL, 70% threshold, 3 workers).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaggerConfig {
    /// Path to the SQLite cache file. `None` = in-memory cache.
    pub cache_path: Option<PathBuf>,

    /// Cache time-to-live in seconds.
    pub cache_ttl_secs: u64,

    /// Global threshold percentage, `[0, 100]`.
    pub global_threshold: Option<i32>,

    /// Per-tag threshold percentages.
    pub tag_overrides: BTreeMap<String, i32>,

    /// Concurrency limits by provider/model.
    pub concurrency: ConcurrencyLimits,

    /// Worker count when no limit matches.
    pub default_concurrency: usize,
}

impl Default for TaggerConfig {
    fn default() -> Self {
        Self {
            cache_path: None,
            cache_ttl_secs: 24 * 60 * 60,
            global_threshold: Some(DEFAULT_THRESHOLD),
            tag_overrides: BTreeMap::new(),
            concurrency: ConcurrencyLimits::default(),
            default_concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl TaggerConfig {
    /// Start building a config with the builder pattern.
    pub fn builder() -> TaggerConfigBuilder {
        TaggerConfigBuilder::default()
    }

    /// Parse TOML and validate thresholds.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: TaggerConfig =
            toml::from_str(text).map_err(|e| TaggerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            TaggerError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject out-of-range thresholds.
    pub fn validate(&self) -> Result<()> {
        let thresholds = self
            .global_threshold
            .map(|g| ("global_threshold", g))
            .into_iter()
            .chain(self.tag_overrides.iter().map(|(t, p)| (t.as_str(), *p)));
        for (name, percent) in thresholds {
            let check = validate_threshold(percent);
            if !check.valid {
                return Err(TaggerError::Config(format!(
                    "{}: {}",
                    name,
                    check.message.unwrap_or_default()
                )));
            }
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Worker count for a provider/model when the caller gave none.
    pub fn concurrency_for(&self, provider: &str, model: Option<&str>) -> usize {
        self.concurrency
            .resolve(provider, model)
            .unwrap_or(self.default_concurrency)
    }
}

impl ConfigProvider for TaggerConfig {
    fn concurrency_limits(&self) -> Result<ConcurrencyLimits> {
        Ok(self.concurrency.clone())
    }

    fn global_threshold(&self) -> Result<Option<i32>> {
        Ok(self.global_threshold)
    }

    fn tag_overrides(&self) -> Result<BTreeMap<String, i32>> {
        Ok(self.tag_overrides.clone())
    }

    fn default_concurrency(&self) -> usize {
        self.default_concurrency
    }
}

/// Builder for [`TaggerConfig`].
#[derive(Default)]
pub struct TaggerConfigBuilder {
    config: TaggerConfig,
}

impl TaggerConfigBuilder {
    /// Set the SQLite cache path for persistence. Omit for in-memory.
    pub fn with_cache_path(mut self, path: PathBuf) -> Self {
        self.config.cache_path = Some(path);
        self
    }

    /// Set how long cached analyses stay valid.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache_ttl_secs = ttl.as_secs();
        self
    }

    /// Set the global threshold percentage.
    pub fn with_global_threshold(mut self, percent: i32) -> Self {
        self.config.global_threshold = Some(percent);
        self
    }

    /// Set a threshold override for one tag.
    pub fn with_tag_override(mut self, tag: impl Into<String>, percent: i32) -> Self {
        self.config.tag_overrides.insert(tag.into(), percent);
        self
    }

    /// Cap workers for a provider, or for one of its models.
    pub fn with_concurrency_limit(
        mut self,
        provider: &str,
        model: Option<&str>,
        limit: usize,
    ) -> Self {
        self.config.concurrency = self.config.concurrency.with_limit(provider, model, limit);
        self
    }

    /// Set the fallback worker count.
    pub fn with_default_concurrency(mut self, workers: usize) -> Self {
        self.config.default_concurrency = workers;
        self
    }

    /// Build the final [`TaggerConfig`].
    pub fn build(self) -> TaggerConfig {
        self.config
    }
}
