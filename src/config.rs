use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Upper bound on the selected working set.
pub const MAX_SELECTED: usize = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config syntax: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config field `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub query: String,
    pub amazon_domain: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub shipping_location: Option<String>,
    #[serde(default = "default_pages")]
    pub pages: u32,
    /// Seconds to wait between discovery pages.
    #[serde(default = "default_delay")]
    pub delay: f64,
    /// Provider-specific filters, passed through to discovery untouched.
    #[serde(default, deserialize_with = "scalar_map")]
    pub refinements: BTreeMap<String, String>,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub client_filters: ClientFilters,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub review_source: ReviewSource,
    #[serde(default)]
    pub reviews: ReviewSettings,
    #[serde(default)]
    pub timeouts: StageTimeouts,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientFilters {
    #[serde(default)]
    pub min_rating: Option<f64>,
    #[serde(default)]
    pub min_reviews: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    #[serde(default)]
    pub prefix: Option<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            prefix: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReviewSource {
    #[default]
    Apify,
    Rainforest,
    #[serde(alias = "bright_data")]
    BrightData,
}

impl ReviewSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewSource::Apify => "apify",
            ReviewSource::Rainforest => "rainforest",
            ReviewSource::BrightData => "brightdata",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewSettings {
    #[serde(default = "default_max_reviews")]
    pub max_reviews: u32,
    /// Page cap for paginated review sources.
    #[serde(default = "default_review_pages")]
    pub max_pages: u32,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_wait")]
    pub max_wait_secs: u64,
}

impl Default for ReviewSettings {
    fn default() -> Self {
        Self {
            max_reviews: default_max_reviews(),
            max_pages: default_review_pages(),
            poll_interval_secs: default_poll_interval(),
            max_wait_secs: default_max_wait(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchTimeouts {
    pub item_secs: u64,
    pub batch_secs: u64,
}

impl BatchTimeouts {
    pub fn item(&self) -> Duration {
        Duration::from_secs(self.item_secs)
    }

    pub fn batch(&self) -> Duration {
        Duration::from_secs(self.batch_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTimeouts {
    #[serde(default = "StageTimeouts::default_enrichment")]
    pub enrichment: BatchTimeouts,
    #[serde(default = "StageTimeouts::default_collection")]
    pub collection: BatchTimeouts,
    #[serde(default = "StageTimeouts::default_analysis")]
    pub analysis: BatchTimeouts,
}

impl StageTimeouts {
    fn default_enrichment() -> BatchTimeouts {
        BatchTimeouts {
            item_secs: 60,
            batch_secs: 300,
        }
    }

    // Review scrapers poll for up to twenty minutes per product.
    fn default_collection() -> BatchTimeouts {
        BatchTimeouts {
            item_secs: 1500,
            batch_secs: 3600,
        }
    }

    fn default_analysis() -> BatchTimeouts {
        BatchTimeouts {
            item_secs: 180,
            batch_secs: 600,
        }
    }
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            enrichment: Self::default_enrichment(),
            collection: Self::default_collection(),
            analysis: Self::default_analysis(),
        }
    }
}

fn default_pages() -> u32 {
    5
}

fn default_delay() -> f64 {
    1.0
}

fn default_limit() -> usize {
    MAX_SELECTED
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_max_reviews() -> u32 {
    100
}

fn default_review_pages() -> u32 {
    5
}

fn default_poll_interval() -> u64 {
    10
}

fn default_max_wait() -> u64 {
    1200
}

/// Accepts string, number and bool values so unquoted YAML ids such as
/// `p_n_prime_domestic: 6845356051` survive as their literal text.
fn scalar_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let raw = BTreeMap::<String, serde_yaml::Value>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(key, value)| {
            let text = match value {
                serde_yaml::Value::String(s) => s,
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::Bool(b) => b.to_string(),
                other => {
                    return Err(D::Error::custom(format!(
                        "refinement `{key}` must be a scalar, got {other:?}"
                    )));
                }
            };
            Ok((key, text))
        })
        .collect()
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let config: RunConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks only. Whether a refinement key means anything is
    /// for the search provider to decide.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.query.trim().is_empty() {
            return Err(ConfigError::invalid("query", "must not be empty"));
        }
        let domain = self.amazon_domain.trim();
        if domain.is_empty() || domain.contains(['/', ' ']) {
            return Err(ConfigError::invalid(
                "amazon_domain",
                format!("`{}` is not a marketplace host", self.amazon_domain),
            ));
        }
        if self.pages == 0 {
            return Err(ConfigError::invalid("pages", "must be at least 1"));
        }
        if !self.delay.is_finite() || self.delay < 0.0 {
            return Err(ConfigError::invalid("delay", "must be a non-negative number"));
        }
        if self.limit == 0 || self.limit > MAX_SELECTED {
            return Err(ConfigError::invalid(
                "limit",
                format!("must be between 1 and {MAX_SELECTED}"),
            ));
        }
        if let Some(min) = self.client_filters.min_rating
            && (!min.is_finite() || !(0.0..=5.0).contains(&min))
        {
            return Err(ConfigError::invalid(
                "client_filters.min_rating",
                "must be between 0 and 5",
            ));
        }
        if self.output.base_dir.as_os_str().is_empty() {
            return Err(ConfigError::invalid("output.base_dir", "must not be empty"));
        }
        if self.reviews.max_reviews == 0 {
            return Err(ConfigError::invalid("reviews.max_reviews", "must be at least 1"));
        }
        if self.reviews.max_pages == 0 {
            return Err(ConfigError::invalid("reviews.max_pages", "must be at least 1"));
        }
        if self.reviews.poll_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "reviews.poll_interval_secs",
                "must be at least 1",
            ));
        }
        for (field, timeouts) in [
            ("timeouts.enrichment", self.timeouts.enrichment),
            ("timeouts.collection", self.timeouts.collection),
            ("timeouts.analysis", self.timeouts.analysis),
        ] {
            if timeouts.item_secs == 0 || timeouts.batch_secs == 0 {
                return Err(ConfigError::invalid(field, "timeouts must be positive"));
            }
        }
        Ok(())
    }

    pub fn page_delay(&self) -> Duration {
        Duration::from_secs_f64(self.delay)
    }
}
