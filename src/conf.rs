use crate::utils::o11y::logging::as_error;

use config::{Config, Environment, File};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";
pub const ENV_PREFIX: &str = "MMSCAN";

/// Invalid values or inputs detected before any remote call is made.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("probability threshold {threshold} is never reached (map total is {total})")]
    UnreachableThreshold { threshold: f64, total: f64 },
    #[error("unrecognized sky map format: {0}")]
    UnrecognizedSkyMap(String),
    #[error("nside must be a power of 2, got {0}")]
    InvalidNside(u32),
    #[error("invalid sky map: {0}")]
    InvalidSkyMap(String),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

impl ConfigurationError {
    pub fn invalid(key: &str, reason: impl Into<String>) -> Self {
        ConfigurationError::InvalidValue {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum MmscanConfigError {
    #[error("failed to load config")]
    InvalidConfigError(#[from] config::ConfigError),
    #[error("could not find config file")]
    ConfigFileNotFound,
    #[error("environment variable expansion error")]
    EnvExpansionError(#[from] ExpandError),
    #[error("config failed validation")]
    Validation(#[from] ConfigurationError),
}

#[derive(thiserror::Error, Debug)]
pub enum ExpandError {
    #[error("Missing environment variable '{var_name}' for placeholder '{placeholder}'")]
    MissingVariable {
        var_name: String,
        placeholder: String,
    },
}

/// Loads environment variables from a .env file if it exists.
///
/// Looks in the current directory, then its parent. A missing file is not
/// an error since credentials may come from the system environment.
pub fn load_dotenv() {
    for candidate in [".env", "../.env"] {
        if Path::new(candidate).exists() {
            match dotenvy::from_path(candidate) {
                Ok(_) => info!("Loaded environment variables from {} file", candidate),
                Err(e) => warn!("Found {} file but failed to load it: {}", candidate, e),
            }
            return;
        }
    }
    debug!("No .env file found, using system environment variables only");
}

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    // the pattern is a literal, it always compiles
    Regex::new(r"\$\{([^}:]+)(?::-(.*?))?\}").unwrap()
});

/// Expands environment variable placeholders in a string.
/// Supports both ${VAR_NAME} and ${VAR_NAME:-default_value} syntax.
///
/// Examples:
/// - "${AMPEL_ARCHIVE_TOKEN}" -> reads from AMPEL_ARCHIVE_TOKEN env var
/// - "${AMPEL_ARCHIVE_TOKEN:-none}" -> falls back to "none"
pub fn expand_env_vars(input: &str) -> Result<String, ExpandError> {
    let mut result = input.to_string();
    let mut replacements: HashMap<String, String> = HashMap::new();

    for capture in PLACEHOLDER.captures_iter(input) {
        let full_match = &capture[0];
        let var_name = &capture[1];
        let default_value = capture.get(2).map(|m| m.as_str());

        if replacements.contains_key(full_match) {
            continue;
        }

        let env_value = match env::var(var_name) {
            Ok(value) => {
                debug!("Expanded environment variable: {} = [REDACTED]", var_name);
                value
            }
            Err(_) => match default_value {
                Some(default) => {
                    warn!(
                        "Environment variable {} not found, using default value",
                        var_name
                    );
                    default.to_string()
                }
                None => {
                    return Err(ExpandError::MissingVariable {
                        var_name: var_name.to_string(),
                        placeholder: full_match.to_string(),
                    })
                }
            },
        };

        result = result.replace(full_match, &env_value);
        replacements.insert(full_match.to_string(), env_value);
    }

    Ok(result)
}

/// Read a YAML config file with environment placeholders expanded.
#[instrument(err)]
pub fn load_raw_config(filepath: &str) -> Result<Config, MmscanConfigError> {
    let path = Path::new(filepath);

    if !path.exists() {
        return Err(MmscanConfigError::ConfigFileNotFound);
    }

    // Expand placeholders on the raw text, then hand the result to the
    // config crate through a temporary file so the format is still inferred
    // from the extension.
    let file_content =
        std::fs::read_to_string(filepath).map_err(|e| config::ConfigError::Foreign(Box::new(e)))?;
    let expanded_content = expand_env_vars(&file_content)?;

    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("yaml");
    let temp_file = tempfile::Builder::new()
        .suffix(&format!(".{}", extension))
        .tempfile()
        .map_err(|e| config::ConfigError::Foreign(Box::new(e)))?;
    std::fs::write(temp_file.path(), expanded_content)
        .map_err(|e| config::ConfigError::Foreign(Box::new(e)))?;

    let conf = Config::builder()
        .add_source(File::from(temp_file.path()))
        .build()?;

    Ok(conf)
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_calls")]
    pub calls: u32,
    #[serde(default = "default_rate_period_secs")]
    pub period_secs: f64,
}

fn default_rate_calls() -> u32 {
    10
}

fn default_rate_period_secs() -> f64 {
    1.0
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            calls: default_rate_calls(),
            period_secs: default_rate_period_secs(),
        }
    }
}

impl RateLimitConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(self.period_secs)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    #[serde(default = "default_max_elapsed_secs")]
    pub max_elapsed_secs: u64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_secs() -> u64 {
    60
}

fn default_max_elapsed_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
            max_elapsed_secs: default_max_elapsed_secs(),
            jitter: true,
        }
    }
}

/// Remote alert archive settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ArchiveConfig {
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_cone_chunk_size")]
    pub cone_chunk_size: usize,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_cone_chunk_size() -> usize {
    100
}

/// Catalog cross-match service settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CatalogConfig {
    pub base_url: String,
    #[serde(default = "default_search_radius_arcsec")]
    pub search_radius_arcsec: f64,
    /// Catalogs queried in order; the first match wins.
    #[serde(default = "default_catalogs")]
    pub catalogs: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_search_radius_arcsec() -> f64 {
    3.0
}

fn default_catalogs() -> Vec<String> {
    vec!["TNS".to_string()]
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ScanConfig {
    #[serde(default = "default_prob_threshold")]
    pub prob_threshold: f64,
    #[serde(default = "default_cone_nside")]
    pub cone_nside: u32,
    #[serde(default)]
    pub fast_query: bool,
    #[serde(default)]
    pub max_cones: Option<usize>,
    #[serde(default = "default_history_concurrency")]
    pub history_concurrency: usize,
    /// Length of the default search window after the event, in days.
    #[serde(default = "default_window_days")]
    pub window_days: f64,
}

fn default_prob_threshold() -> f64 {
    0.9
}

fn default_cone_nside() -> u32 {
    64
}

fn default_history_concurrency() -> usize {
    1
}

fn default_window_days() -> f64 {
    10.0
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            prob_threshold: default_prob_threshold(),
            cone_nside: default_cone_nside(),
            fast_query: false,
            max_cones: None,
            history_concurrency: default_history_concurrency(),
            window_days: default_window_days(),
        }
    }
}

impl ScanConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !(self.prob_threshold > 0.0 && self.prob_threshold <= 1.0) {
            return Err(ConfigurationError::invalid(
                "scan.prob_threshold",
                format!("must be in (0, 1], got {}", self.prob_threshold),
            ));
        }
        if self.cone_nside == 0 || !self.cone_nside.is_power_of_two() {
            return Err(ConfigurationError::InvalidNside(self.cone_nside));
        }
        if self.history_concurrency == 0 {
            return Err(ConfigurationError::invalid(
                "scan.history_concurrency",
                "must be at least 1",
            ));
        }
        if self.max_cones == Some(0) {
            return Err(ConfigurationError::invalid(
                "scan.max_cones",
                "must be at least 1 when set",
            ));
        }
        if !(self.window_days > 0.0) {
            return Err(ConfigurationError::invalid(
                "scan.window_days",
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Thresholds of the machine-classifier and contaminant veto stage.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClassifierConfig {
    pub min_ndet: i32,
    pub min_tspan: f64,
    pub max_tspan: f64,
    pub min_rb: f64,
    pub min_drb: f64,
    pub max_fwhm: f64,
    pub max_elong: f64,
    pub max_magdiff: f64,
    pub max_nbad: i32,
    /// Minimum distance to a known solar system object, in arcsec.
    pub min_dist_to_sso: f64,
    /// Minimum absolute galactic latitude, in degrees.
    pub min_gal_lat: f64,
    /// Radius of the PS1 star/galaxy veto, in arcsec.
    pub ps1_sgveto_rad: f64,
    /// Star/galaxy score above which a PS1 match counts as a star.
    pub ps1_sgveto_sgth: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        ClassifierConfig {
            min_ndet: 1,
            min_tspan: -1.0,
            max_tspan: 365.0,
            min_rb: 0.3,
            min_drb: 0.0,
            max_fwhm: 5.5,
            max_elong: 1.4,
            max_magdiff: 1.0,
            max_nbad: 2,
            min_dist_to_sso: 20.0,
            min_gal_lat: 0.0,
            ps1_sgveto_rad: 1.0,
            ps1_sgveto_sgth: 0.8,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FilterConfig {
    /// Minimum time between first and last detection, in days.
    #[serde(default = "default_min_detection_span_days")]
    pub min_detection_span_days: f64,
    #[serde(default)]
    pub classifier: ClassifierConfig,
}

fn default_min_detection_span_days() -> f64 {
    0.01
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            min_detection_span_days: default_min_detection_span_days(),
            classifier: ClassifierConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AppConfig {
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub catalog: Option<CatalogConfig>,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub filter: FilterConfig,
}

impl AppConfig {
    /// Load, expand, override from `MMSCAN__*` variables and validate.
    pub fn from_path(path: &str) -> Result<Self, MmscanConfigError> {
        let raw = load_raw_config(path)?;
        let config: AppConfig = Config::builder()
            .add_source(raw)
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()
            .inspect_err(as_error!("failed to deserialize config"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_default_path() -> Result<Self, MmscanConfigError> {
        Self::from_path(DEFAULT_CONFIG_PATH)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.scan.validate()?;
        if self.archive.base_url.trim().is_empty() {
            return Err(ConfigurationError::invalid(
                "archive.base_url",
                "must not be empty",
            ));
        }
        validate_rate_limit("archive.rate_limit", &self.archive.rate_limit)?;
        if let Some(catalog) = &self.catalog {
            validate_rate_limit("catalog.rate_limit", &catalog.rate_limit)?;
            if !(catalog.search_radius_arcsec > 0.0) {
                return Err(ConfigurationError::invalid(
                    "catalog.search_radius_arcsec",
                    "must be positive",
                ));
            }
        }
        if !(self.filter.min_detection_span_days >= 0.0) {
            return Err(ConfigurationError::invalid(
                "filter.min_detection_span_days",
                "must not be negative",
            ));
        }
        Ok(())
    }
}

fn validate_rate_limit(key: &str, rate_limit: &RateLimitConfig) -> Result<(), ConfigurationError> {
    if rate_limit.calls == 0 {
        return Err(ConfigurationError::invalid(key, "calls must be at least 1"));
    }
    if !(rate_limit.period_secs.is_finite() && rate_limit.period_secs > 0.0) {
        return Err(ConfigurationError::invalid(
            key,
            "period must be positive and finite",
        ));
    }
    Ok(())
}
