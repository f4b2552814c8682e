//! Core domain model shared by the ingestion and analytics crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod config;

pub use config::{AnalyticsMode, PipelineConfig, StoreBackend};

pub const CRATE_NAME: &str = "popbls-core";

pub const DEFAULT_POPULATION_PREFIX: &str = "raw/datausa/population/";
pub const DEFAULT_MIRROR_PREFIX: &str = "bls-folder/";
pub const DEFAULT_BLS_KEY: &str = "bls-folder/pr/pr.data.0.Current";
pub const DEFAULT_JOIN_SERIES_ID: &str = "PRS30006032";
pub const DEFAULT_JOIN_PERIOD: &str = "Q01";

/// Inclusive year window used by the population statistics.
pub const POPULATION_STATS_YEARS: (i32, i32) = (2013, 2018);

/// Metadata for the latest version of an object in the content store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub key: String,
    /// Lowercase hex MD5 of the object bytes (the S3 ETag of a single-part upload).
    /// Backends that can only get it by reading the object leave it empty in
    /// `list` results; `head` and `put` always fill it.
    pub checksum: String,
    pub last_modified: DateTime<Utc>,
    pub size: u64,
    pub content_type: Option<String>,
}

/// Bucket + key reference carried by a store-write notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// One year of national population from the population API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopulationRecord {
    pub year: i32,
    pub population: i64,
    pub nation: Option<String>,
}

impl PopulationRecord {
    pub fn new(year: i32, population: i64) -> Self {
        Self {
            year,
            population,
            nation: None,
        }
    }
}

/// One observation row from the BLS time-series data file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlsRecord {
    pub series_id: String,
    pub year: i32,
    pub period: String,
    pub value: f64,
    pub footnote_codes: Option<String>,
}

impl BlsRecord {
    pub fn new(series_id: impl Into<String>, year: i32, period: impl Into<String>, value: f64) -> Self {
        Self {
            series_id: series_id.into(),
            year,
            period: period.into(),
            value,
            footnote_codes: None,
        }
    }
}

/// Join a store prefix and a relative name with exactly one `/` between them.
///
/// An empty prefix yields the name unchanged.
pub fn join_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

/// Normalize a prefix used for listing so it always ends in `/` (or is empty).
pub fn listing_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}
