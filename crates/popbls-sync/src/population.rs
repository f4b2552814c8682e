//! Population snapshot ingestion with content-hash deduplication.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use popbls_core::join_key;
use popbls_sources::PopulationSource;
use popbls_storage::{sha256_hex, ContentStore, CONTENT_TYPE_JSON};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PopulationUpload {
    pub key: String,
    pub content_hash: String,
    /// True when an object already existed at `key` and the upload was skipped.
    pub deduplicated: bool,
}

/// Recursively rebuild `value` with object keys in sorted order.
fn canonicalize(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::new();
            for (key, child) in entries {
                sorted.insert(key.clone(), canonicalize(child));
            }
            JsonValue::Object(sorted)
        }
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// SHA-256 over the compact, key-sorted serialization of `value`.
///
/// Independent of object field order and of the whitespace of the source text.
pub fn compute_hash(value: &JsonValue) -> String {
    let canonical = canonicalize(value).to_string();
    sha256_hex(canonical.as_bytes())
}

/// `{prefix}/ingestion_date={YYYY-MM-DD}/population_{hash}.json`
pub fn population_key(prefix: &str, ingestion_date: NaiveDate, content_hash: &str) -> String {
    join_key(
        prefix,
        &format!(
            "ingestion_date={}/population_{content_hash}.json",
            ingestion_date.format("%Y-%m-%d")
        ),
    )
}

/// Store `data` under its date/hash key unless that key already exists.
///
/// The key embeds the date, so identical content fetched on different days is
/// stored again under a new key.
pub async fn upload_population_json(
    store: &dyn ContentStore,
    prefix: &str,
    data: &JsonValue,
    ingestion_date: NaiveDate,
) -> Result<PopulationUpload> {
    let content_hash = compute_hash(data);
    let key = population_key(prefix, ingestion_date, &content_hash);

    if store
        .exists(&key)
        .await
        .with_context(|| format!("checking for existing snapshot {key}"))?
    {
        info!(%key, "duplicate population data detected; skipping upload");
        return Ok(PopulationUpload {
            key,
            content_hash,
            deduplicated: true,
        });
    }

    let body = serde_json::to_vec(data).context("serializing population payload")?;
    store
        .put(&key, body, Some(CONTENT_TYPE_JSON))
        .await
        .with_context(|| format!("uploading population snapshot {key}"))?;
    info!(bucket = store.bucket(), %key, "uploaded population data");

    Ok(PopulationUpload {
        key,
        content_hash,
        deduplicated: false,
    })
}

/// Fetches the current snapshot from a [`PopulationSource`] and stores it.
pub struct PopulationFetcher {
    store: Arc<dyn ContentStore>,
    source: Arc<dyn PopulationSource>,
    prefix: String,
}

impl PopulationFetcher {
    pub fn new(
        store: Arc<dyn ContentStore>,
        source: Arc<dyn PopulationSource>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            source,
            prefix: prefix.into(),
        }
    }

    pub async fn run(&self) -> Result<PopulationUpload> {
        self.run_for_date(Utc::now().date_naive()).await
    }

    pub async fn run_for_date(&self, ingestion_date: NaiveDate) -> Result<PopulationUpload> {
        let data = self
            .source
            .fetch()
            .await
            .context("fetching population data")?;
        upload_population_json(self.store.as_ref(), &self.prefix, &data, ingestion_date).await
    }
}
