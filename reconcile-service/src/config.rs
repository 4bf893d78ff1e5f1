use std::{collections::BTreeMap, fs, path::PathBuf, time::Duration as StdDuration};

use serde::Deserialize;
use series_client::db::ident::{is_safe_ident, quote_table};
use time::Duration;
use time_tz::{timezones, Tz};

use crate::{
    grid::AmbiguousPolicy,
    interpolate::InterpolationSettings,
    normalize::ProviderProfile,
    pipeline::EngineSettings,
    reconcile::TierPriority,
    rollup::AggFn,
    sources::SourceConfig,
};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub uri: String,
    pub max_connections: u32,
}

fn default_lookback_days() -> i64 {
    7
}

fn default_settle_lag_hours() -> i64 {
    48
}

fn default_timezone() -> String {
    "Europe/Berlin".to_string()
}

fn default_max_gap_hours() -> u32 {
    6
}

/// Upper bounds keeping every configured duration far from `time` overflow.
const MAX_LOOKBACK_DAYS: i64 = 3650;
const MAX_SETTLE_LAG_HOURS: i64 = 24 * 366;
const MAX_GAP_HOURS: u32 = 24 * 31;
const MAX_TIME_SHIFT_HOURS: i64 = 24;

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,
    #[serde(default = "default_settle_lag_hours")]
    pub settle_lag_hours: i64,
    /// IANA zone used to resolve naive local provider timestamps.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub ambiguous_local_time: AmbiguousPolicy,
    #[serde(default)]
    pub tier_priority: TierPriority,
    #[serde(default = "default_max_gap_hours")]
    pub max_gap_hours: u32,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            lookback_days: default_lookback_days(),
            settle_lag_hours: default_settle_lag_hours(),
            timezone: default_timezone(),
            ambiguous_local_time: AmbiguousPolicy::default(),
            tier_priority: TierPriority::default(),
            max_gap_hours: default_max_gap_hours(),
        }
    }
}

impl RefreshConfig {
    pub fn lookback(&self) -> Duration {
        Duration::days(self.lookback_days)
    }

    pub fn settle_lag(&self) -> Duration {
        Duration::hours(self.settle_lag_hours)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    Postgres,
    /// Keeps rows in process memory; for dry runs.
    Memory,
}

fn default_table() -> String {
    "canonical_hourly".to_string()
}

fn default_batch_size() -> usize {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,
    #[serde(default = "default_table")]
    pub table: String,
    /// Metric columns of the canonical table.
    pub metrics: Vec<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default)]
    pub create_table: bool,
    #[serde(default)]
    pub failpoints: Vec<String>,
}

impl StoreConfig {
    pub fn retry_backoff(&self) -> StdDuration {
        StdDuration::from_millis(self.retry_backoff_ms)
    }
}

/// Where the entity dimension comes from: a CSV file or a database table.
#[derive(Debug, Clone, Deserialize)]
pub struct EntitiesConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub table: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(flatten)]
    pub profile: ProviderProfile,
    pub source: SourceConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RollupConfig {
    #[serde(default)]
    pub aggregations: BTreeMap<String, AggFn>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub refresh: RefreshConfig,
    pub store: StoreConfig,
    pub entities: EntitiesConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub rollup: RollupConfig,
    pub metrics: Option<MetricsConfig>,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        use std::env;

        let path = env::var("RECONCILE_CONFIG").unwrap_or_else(|_| "reconcile-config.toml".to_string());
        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let cfg: AppConfig = toml::from_str(contents)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        quote_table(&self.store.table).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if let Some(table) = &self.entities.table {
            quote_table(table).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        if self.entities.path.is_none() && self.entities.table.is_none() {
            return Err(ConfigError::Invalid("entities needs either path or table".to_string()));
        }

        if self.store.metrics.is_empty() {
            return Err(ConfigError::Invalid("store.metrics must not be empty".to_string()));
        }
        for m in &self.store.metrics {
            if !is_safe_ident(m) {
                return Err(ConfigError::Invalid(format!("metric name '{m}' is not a safe column name")));
            }
        }
        if self.store.batch_size == 0 {
            return Err(ConfigError::Invalid("store.batch_size must be positive".to_string()));
        }
        if self.store.kind == StoreKind::Postgres && self.database.is_none() {
            return Err(ConfigError::Invalid("postgres store needs a [database] section".to_string()));
        }

        if !(1..=MAX_LOOKBACK_DAYS).contains(&self.refresh.lookback_days) {
            return Err(ConfigError::Invalid(format!(
                "lookback_days must be between 1 and {MAX_LOOKBACK_DAYS}"
            )));
        }
        if !(0..=MAX_SETTLE_LAG_HOURS).contains(&self.refresh.settle_lag_hours) {
            return Err(ConfigError::Invalid(format!(
                "settle_lag_hours must be between 0 and {MAX_SETTLE_LAG_HOURS}"
            )));
        }
        if self.refresh.max_gap_hours > MAX_GAP_HOURS {
            return Err(ConfigError::Invalid(format!("max_gap_hours must be at most {MAX_GAP_HOURS}")));
        }
        self.zone()?;

        for p in &self.providers {
            let name = &p.profile.name;
            if !(-MAX_TIME_SHIFT_HOURS..=MAX_TIME_SHIFT_HOURS).contains(&p.profile.time_shift_hours) {
                return Err(ConfigError::Invalid(format!(
                    "provider '{name}': time_shift_hours must be within ±{MAX_TIME_SHIFT_HOURS}"
                )));
            }
            let produced = p.profile.metrics.values().chain(p.profile.derived.keys());
            for canonical in produced {
                if !self.store.metrics.contains(canonical) {
                    return Err(ConfigError::Invalid(format!(
                        "provider '{name}' maps to '{canonical}', which is not a store metric"
                    )));
                }
            }
        }
        for m in self.rollup.aggregations.keys() {
            if !self.store.metrics.contains(m) {
                return Err(ConfigError::Invalid(format!("rollup metric '{m}' is not a store metric")));
            }
        }
        Ok(())
    }

    pub fn zone(&self) -> Result<&'static Tz, ConfigError> {
        timezones::get_by_name(&self.refresh.timezone)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown time zone '{}'", self.refresh.timezone)))
    }

    pub fn engine_settings(&self) -> Result<EngineSettings, ConfigError> {
        Ok(EngineSettings {
            zone: self.zone()?,
            ambiguous: self.refresh.ambiguous_local_time,
            priority: self.refresh.tier_priority.clone(),
            interpolation: InterpolationSettings {
                max_gap_hours: self.refresh.max_gap_hours,
            },
            metrics: self.store.metrics.clone(),
            resample: self
                .providers
                .iter()
                .filter_map(|p| p.profile.resample.clone().map(|r| (p.profile.name.clone(), r)))
                .collect(),
        })
    }

    pub fn profiles(&self) -> Vec<ProviderProfile> {
        self.providers.iter().map(|p| p.profile.clone()).collect()
    }
}
