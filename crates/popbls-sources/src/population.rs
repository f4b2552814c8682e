use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use popbls_core::PopulationRecord;
use popbls_storage::HttpFetcher;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::SourceError;

/// Where the current population snapshot comes from.
#[async_trait]
pub trait PopulationSource: Send + Sync {
    async fn fetch(&self) -> Result<JsonValue, SourceError>;
}

#[derive(Debug, Clone)]
pub struct HttpPopulationSource {
    http: Arc<HttpFetcher>,
    url: String,
}

impl HttpPopulationSource {
    pub fn new(http: Arc<HttpFetcher>, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl PopulationSource for HttpPopulationSource {
    async fn fetch(&self) -> Result<JsonValue, SourceError> {
        let resp = self.http.fetch_bytes("population-api", &self.url).await?;
        Ok(serde_json::from_slice(&resp.body)?)
    }
}

/// Fixed payload, for tests and fixture-driven runs.
#[derive(Debug, Clone)]
pub struct StaticPopulationSource {
    payload: JsonValue,
}

impl StaticPopulationSource {
    pub fn new(payload: JsonValue) -> Self {
        Self { payload }
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let payload = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self { payload })
    }
}

#[async_trait]
impl PopulationSource for StaticPopulationSource {
    async fn fetch(&self) -> Result<JsonValue, SourceError> {
        Ok(self.payload.clone())
    }
}

/// A `data` row that failed schema validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRow {
    pub index: usize,
    pub fields: Vec<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PopulationPayload {
    pub records: Vec<PopulationRecord>,
    pub rejected: Vec<RejectedRow>,
}

/// Parse `{"data": [{"Year": .., "Population": .., ...}, ...]}`.
///
/// Rows missing `Year` or `Population` (or holding non-numeric values) are
/// collected in `rejected` instead of failing the whole payload.
pub fn parse_population_payload(bytes: &[u8]) -> Result<PopulationPayload, SourceError> {
    let value: JsonValue = serde_json::from_slice(bytes)?;
    let rows = value
        .get("data")
        .and_then(JsonValue::as_array)
        .ok_or(SourceError::MissingData)?;

    let mut payload = PopulationPayload::default();
    for (index, row) in rows.iter().enumerate() {
        let Some(obj) = row.as_object() else {
            payload.rejected.push(RejectedRow {
                index,
                fields: Vec::new(),
                reason: "row is not an object".to_string(),
            });
            continue;
        };
        let fields = obj.keys().cloned().collect::<Vec<_>>();

        let year = obj.get("Year").map(json_integer);
        let population = obj.get("Population").map(json_integer);
        match (year, population) {
            (Some(Some(year)), Some(Some(population))) => {
                let Ok(year) = i32::try_from(year) else {
                    payload.rejected.push(RejectedRow {
                        index,
                        fields,
                        reason: format!("year {year} out of range"),
                    });
                    continue;
                };
                payload.records.push(PopulationRecord {
                    year,
                    population,
                    nation: obj.get("Nation").and_then(JsonValue::as_str).map(str::to_string),
                });
            }
            (None, _) | (_, None) => payload.rejected.push(RejectedRow {
                index,
                fields,
                reason: "missing Year or Population".to_string(),
            }),
            _ => payload.rejected.push(RejectedRow {
                index,
                fields,
                reason: "non-numeric Year or Population".to_string(),
            }),
        }
    }
    Ok(payload)
}

fn json_integer(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.round() as i64)),
        JsonValue::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.round() as i64))
        }
        _ => None,
    }
}
