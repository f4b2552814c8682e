//! Process configuration, assembled once at entry and passed down.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::{
    DEFAULT_BLS_KEY, DEFAULT_JOIN_PERIOD, DEFAULT_JOIN_SERIES_ID, DEFAULT_MIRROR_PREFIX,
    DEFAULT_POPULATION_PREFIX,
};

pub const DEFAULT_BUCKET: &str = "popbls-local";
pub const DEFAULT_POPULATION_API_URL: &str = "https://honolulu-api.datausa.io/tesseract/data.jsonrecords?cube=acs_yg_total_population_1&drilldowns=Year,Nation&locale=en&measures=Population";
pub const DEFAULT_MIRROR_BASE_URL: &str = "https://download.bls.gov/pub/time.series/";
pub const DEFAULT_MIRROR_DATASET: &str = "pr";
/// Carries no contact address; override `HTTP_USER_AGENT` before mirroring.
pub const DEFAULT_USER_AGENT: &str = "popbls/0.1 (data pipeline)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Fs,
    S3,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(Self::Memory),
            "fs" | "local" | "file" => Ok(Self::Fs),
            "s3" => Ok(Self::S3),
            other => Err(format!("unknown store backend `{other}`")),
        }
    }
}

/// Which analytics passes a notification triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyticsMode {
    /// Recompute the three aggregations over the current datasets.
    Full,
    /// Schema-check the referenced snapshot and report its mean only.
    Validate,
    Both,
}

impl AnalyticsMode {
    pub fn runs_full(self) -> bool {
        matches!(self, Self::Full | Self::Both)
    }

    pub fn runs_validation(self) -> bool {
        matches!(self, Self::Validate | Self::Both)
    }
}

impl FromStr for AnalyticsMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "validate" | "validation" => Ok(Self::Validate),
            "both" => Ok(Self::Both),
            other => Err(format!("unknown analytics mode `{other}`")),
        }
    }
}

impl fmt::Display for AnalyticsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Full => "full",
            Self::Validate => "validate",
            Self::Both => "both",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// `None` means the variable was unset; required for the S3 backend.
    pub bucket: Option<String>,
    pub store_backend: StoreBackend,
    pub store_root: PathBuf,
    pub aws_region: Option<String>,
    pub aws_endpoint_url: Option<String>,
    pub population_prefix: String,
    pub population_api_url: String,
    pub mirror_prefix: String,
    pub mirror_base_url: String,
    pub mirror_dataset: String,
    pub mirror_sync_enabled: bool,
    pub bls_key: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_min_interval_ms: Option<u64>,
    pub scheduler_enabled: bool,
    pub ingest_cron: String,
    pub analytics_mode: AnalyticsMode,
    pub join_series_id: String,
    pub join_period: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source; unset or unparsable values fall
    /// back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let or = |name: &str, default: &str| var(name).unwrap_or_else(|| default.to_string());
        let flag = |name: &str, default: bool| {
            var(name)
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes" | "on"))
                .unwrap_or(default)
        };

        Self {
            bucket: var("BUCKET"),
            store_backend: var("STORE_BACKEND")
                .and_then(|v| v.parse().ok())
                .unwrap_or(StoreBackend::Fs),
            store_root: var("STORE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./store")),
            aws_region: var("AWS_REGION"),
            aws_endpoint_url: var("AWS_ENDPOINT_URL"),
            population_prefix: or("POP_PREFIX", DEFAULT_POPULATION_PREFIX),
            population_api_url: or("POPULATION_API_URL", DEFAULT_POPULATION_API_URL),
            mirror_prefix: or("BLS_PREFIX", DEFAULT_MIRROR_PREFIX),
            mirror_base_url: or("BLS_BASE_URL", DEFAULT_MIRROR_BASE_URL),
            mirror_dataset: or("BLS_DATASET", DEFAULT_MIRROR_DATASET),
            mirror_sync_enabled: flag("MIRROR_SYNC_ENABLED", false),
            bls_key: or("BLS_KEY", DEFAULT_BLS_KEY),
            user_agent: or("HTTP_USER_AGENT", DEFAULT_USER_AGENT),
            http_timeout_secs: var("HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            http_min_interval_ms: var("HTTP_MIN_INTERVAL_MS").and_then(|v| v.parse().ok()),
            scheduler_enabled: flag("SCHEDULER_ENABLED", false),
            ingest_cron: or("INGEST_CRON", "0 0 6 * * *"),
            analytics_mode: var("ANALYTICS_MODE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(AnalyticsMode::Both),
            join_series_id: or("JOIN_SERIES_ID", DEFAULT_JOIN_SERIES_ID),
            join_period: or("JOIN_PERIOD", DEFAULT_JOIN_PERIOD),
        }
    }

    pub fn bucket_name(&self) -> &str {
        self.bucket.as_deref().unwrap_or(DEFAULT_BUCKET)
    }

    /// Directory URL the mirror sync starts from, e.g. `.../time.series/pr/`.
    pub fn mirror_root_url(&self) -> String {
        let base = self.mirror_base_url.trim_end_matches('/');
        let dataset = self.mirror_dataset.trim_matches('/');
        if dataset.is_empty() {
            format!("{base}/")
        } else {
            format!("{base}/{dataset}/")
        }
    }

    /// Whether `user_agent` names a contact, such as an email address.
    pub fn user_agent_has_contact(&self) -> bool {
        self.user_agent.contains('@')
    }

    /// Base URL that remote relative paths (and so store keys) are computed from.
    pub fn mirror_path_base(&self) -> String {
        format!("{}/", self.mirror_base_url.trim_end_matches('/'))
    }
}
