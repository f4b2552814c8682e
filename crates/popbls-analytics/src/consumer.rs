//! Analytics consumer: drains store-write notifications, validates the
//! referenced objects, and recomputes the aggregations over current data.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use popbls_core::{
    listing_prefix, AnalyticsMode, BlsRecord, ObjectInfo, ObjectRef, PipelineConfig,
    POPULATION_STATS_YEARS,
};
use popbls_sources::{parse_bls_table, parse_population_payload, PopulationPayload, SourceError};
use popbls_storage::{ContentStore, StoreError};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::notification::extract_object_refs;
use crate::queue::{parse_queue_event, QueueConsumer, QueueMessage};
use crate::stats::{
    best_year_per_series, join_series_population, mean_population, population_stats,
    AnalyticsReport,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyticsSettings {
    pub population_prefix: String,
    pub bls_key: String,
    pub join_series_id: String,
    pub join_period: String,
    pub mode: AnalyticsMode,
    pub stats_years: (i32, i32),
    /// Deliveries after which a failing message is dropped instead of requeued.
    pub max_receive_count: u32,
}

impl From<&PipelineConfig> for AnalyticsSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            population_prefix: config.population_prefix.clone(),
            bls_key: config.bls_key.clone(),
            join_series_id: config.join_series_id.clone(),
            join_period: config.join_period.clone(),
            mode: config.analytics_mode,
            stats_years: POPULATION_STATS_YEARS,
            max_receive_count: 3,
        }
    }
}

impl Default for AnalyticsSettings {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

/// Result of the lightweight per-object validation pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ValidationOutcome {
    Validated {
        object: ObjectRef,
        valid_records: usize,
        rejected_records: usize,
        mean_population: Option<f64>,
    },
    Skipped {
        object: ObjectRef,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageOutcome {
    pub message_id: String,
    pub objects: Vec<ObjectRef>,
    pub validations: Vec<ValidationOutcome>,
    pub report: Option<AnalyticsReport>,
    /// Full-pass failure recorded alongside completed validations (`both` mode).
    pub full_error: Option<String>,
    /// Set when the message body could not be decoded.
    pub skipped: Option<String>,
}

impl MessageOutcome {
    fn empty(message_id: &str) -> Self {
        Self {
            message_id: message_id.to_string(),
            objects: Vec::new(),
            validations: Vec::new(),
            report: None,
            full_error: None,
            skipped: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub processed: Vec<MessageOutcome>,
    /// Ids of messages whose processing errored; the transport should redeliver them.
    pub failed_message_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DrainSummary {
    pub received: usize,
    pub acked: usize,
    pub requeued: usize,
    pub dropped: usize,
    pub reports: Vec<AnalyticsReport>,
}

pub struct AnalyticsConsumer {
    store: Arc<dyn ContentStore>,
    settings: AnalyticsSettings,
}

impl AnalyticsConsumer {
    pub fn new(store: Arc<dyn ContentStore>, settings: AnalyticsSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &AnalyticsSettings {
        &self.settings
    }

    /// Newest object under the population prefix, parsed.
    ///
    /// Equal timestamps resolve to the later object in listing order.
    pub async fn load_latest_population(&self) -> Result<(ObjectInfo, PopulationPayload)> {
        let prefix = listing_prefix(&self.settings.population_prefix);
        let objects = self
            .store
            .list(&prefix)
            .await
            .with_context(|| format!("listing population prefix {prefix}"))?;
        let latest = objects
            .into_iter()
            .max_by_key(|info| info.last_modified)
            .ok_or_else(|| anyhow!("no population snapshots under {prefix}"))?;

        let bytes = self
            .store
            .get(&latest.key)
            .await
            .with_context(|| format!("reading population snapshot {}", latest.key))?;
        let payload = parse_population_payload(&bytes)
            .with_context(|| format!("parsing population snapshot {}", latest.key))?;
        for rejected in &payload.rejected {
            warn!(
                key = %latest.key,
                index = rejected.index,
                fields = ?rejected.fields,
                reason = %rejected.reason,
                "discarding population record"
            );
        }
        Ok((latest, payload))
    }

    pub async fn load_bls(&self) -> Result<Vec<BlsRecord>> {
        let key = &self.settings.bls_key;
        let bytes = self
            .store
            .get(key)
            .await
            .with_context(|| format!("reading bls dataset {key}"))?;
        let table = parse_bls_table(&bytes).with_context(|| format!("parsing bls dataset {key}"))?;
        if table.skipped_lines > 0 {
            warn!(%key, skipped = table.skipped_lines, "bls dataset had malformed rows");
        }
        Ok(table.records)
    }

    /// Recompute all three aggregations over the current datasets.
    pub async fn run_full(&self) -> Result<AnalyticsReport> {
        let (population_info, population) = self.load_latest_population().await?;
        let bls = self.load_bls().await?;

        let report = AnalyticsReport {
            population_key: population_info.key,
            population_stats: population_stats(&population.records, self.settings.stats_years),
            best_years: best_year_per_series(&bls),
            joined: join_series_population(
                &bls,
                &population.records,
                &self.settings.join_series_id,
                &self.settings.join_period,
            ),
        };
        log_report(&report);
        Ok(report)
    }

    /// Validation pass over one referenced object.
    ///
    /// Only store failures are errors; bad content is reported as a skip.
    pub async fn validate_object(&self, object: &ObjectRef) -> Result<ValidationOutcome> {
        let skipped = |reason: String| -> Result<ValidationOutcome> {
            warn!(%object, %reason, "skipping object");
            Ok(ValidationOutcome::Skipped {
                object: object.clone(),
                reason,
            })
        };

        if object.bucket != self.store.bucket() {
            return skipped(format!(
                "event bucket {} does not match store bucket {}",
                object.bucket,
                self.store.bucket()
            ));
        }

        let bytes = match self.store.get(&object.key).await {
            Ok(bytes) => bytes,
            Err(StoreError::NotFound(_)) => return skipped("object no longer exists".to_string()),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {object}"));
            }
        };

        let payload = match parse_population_payload(&bytes) {
            Ok(payload) => payload,
            Err(SourceError::MissingData) => return skipped("no `data` array".to_string()),
            Err(err) => return skipped(format!("unreadable payload: {err}")),
        };
        if payload.records.is_empty() && payload.rejected.is_empty() {
            return skipped("empty `data` array".to_string());
        }

        for rejected in &payload.rejected {
            warn!(
                %object,
                index = rejected.index,
                fields = ?rejected.fields,
                reason = %rejected.reason,
                "discarding record"
            );
        }
        let mean = mean_population(&payload.records, self.settings.stats_years);
        info!(
            %object,
            valid = payload.records.len(),
            rejected = payload.rejected.len(),
            mean = ?mean,
            "validated population object"
        );
        Ok(ValidationOutcome::Validated {
            object: object.clone(),
            valid_records: payload.records.len(),
            rejected_records: payload.rejected.len(),
            mean_population: mean,
        })
    }

    /// Process one queued notification.
    ///
    /// A body that cannot be decoded is skipped, not failed, since
    /// redelivering it cannot succeed. In `both` mode a failed full pass is
    /// recorded on the outcome and the validations still stand; in `full`
    /// mode it fails the message.
    pub async fn handle_message(&self, message: &QueueMessage) -> Result<MessageOutcome> {
        let span = info_span!("analytics_message", message_id = %message.id);
        async {
            let mut outcome = MessageOutcome::empty(&message.id);
            let objects = match extract_object_refs(&message.body) {
                Ok(objects) => objects,
                Err(err) => {
                    warn!(error = %err, "skipping malformed notification");
                    outcome.skipped = Some(err.to_string());
                    return Ok(outcome);
                }
            };
            if objects.is_empty() {
                debug!("notification references no objects");
                return Ok(outcome);
            }

            if self.settings.mode.runs_validation() {
                for object in &objects {
                    outcome.validations.push(self.validate_object(object).await?);
                }
            }
            outcome.objects = objects;
            if self.settings.mode.runs_full() {
                match self.run_full().await {
                    Ok(report) => outcome.report = Some(report),
                    Err(err) if self.settings.mode == AnalyticsMode::Full => return Err(err),
                    Err(err) => {
                        warn!(error = %format!("{err:#}"), "full analytics pass failed");
                        outcome.full_error = Some(format!("{err:#}"));
                    }
                }
            }
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    /// Process every message, reporting failures per message instead of
    /// aborting the batch.
    pub async fn handle_batch(&self, messages: &[QueueMessage]) -> BatchOutcome {
        let mut batch = BatchOutcome::default();
        for message in messages {
            match self.handle_message(message).await {
                Ok(outcome) => batch.processed.push(outcome),
                Err(err) => {
                    error!(message_id = %message.id, error = %format!("{err:#}"), "analytics failed");
                    batch.failed_message_ids.push(message.id.clone());
                }
            }
        }
        batch
    }

    /// Process a queue-delivered event document. A document that is not a
    /// queue event is handled as a single message body.
    pub async fn handle_queue_event(&self, event: &str) -> BatchOutcome {
        let messages = match parse_queue_event(event) {
            Ok(messages) => messages,
            Err(err) => {
                debug!(error = %err, "not a queue event; treating input as one message");
                vec![QueueMessage::new(event)]
            }
        };
        self.handle_batch(&messages).await
    }

    /// Poll `queue` until empty, acking processed messages and requeueing
    /// failed ones until they reach `max_receive_count` deliveries.
    pub async fn drain(&self, queue: &dyn QueueConsumer, batch_size: u32) -> Result<DrainSummary> {
        let mut summary = DrainSummary::default();
        loop {
            let messages = queue.poll_batch(batch_size).await.context("polling queue")?;
            if messages.is_empty() {
                break;
            }
            summary.received += messages.len();

            for message in messages {
                match self.handle_message(&message).await {
                    Ok(outcome) => {
                        queue.ack(&message.receipt_handle).await.context("acking message")?;
                        summary.acked += 1;
                        summary.reports.extend(outcome.report);
                    }
                    Err(err) if message.attempt_count >= self.settings.max_receive_count => {
                        error!(
                            message_id = %message.id,
                            attempts = message.attempt_count,
                            error = %format!("{err:#}"),
                            "dropping message after repeated failures"
                        );
                        queue.ack(&message.receipt_handle).await.context("acking message")?;
                        summary.dropped += 1;
                    }
                    Err(err) => {
                        warn!(
                            message_id = %message.id,
                            attempts = message.attempt_count,
                            error = %format!("{err:#}"),
                            "analytics failed; requeueing"
                        );
                        queue.nack(&message.receipt_handle).await.context("requeueing message")?;
                        summary.requeued += 1;
                    }
                }
            }
        }
        Ok(summary)
    }
}

fn log_report(report: &AnalyticsReport) {
    let stats = &report.population_stats;
    info!(
        population_key = %report.population_key,
        from_year = stats.from_year,
        to_year = stats.to_year,
        count = stats.count,
        mean = ?stats.mean,
        stddev = ?stats.stddev,
        "population statistics"
    );
    info!(series = report.best_years.len(), "best year per series computed");
    for best in &report.best_years {
        debug!(series_id = %best.series_id, year = best.year, value = best.value, "best year");
    }
    for row in &report.joined {
        info!(
            series_id = %row.series_id,
            year = row.year,
            period = %row.period,
            value = row.value,
            population = row.population,
            "joined row"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::{object_created_event, wrap_in_notification};
    use crate::queue::{InProcessQueue, NotificationSink};
    use popbls_storage::MemoryContentStore;

    const POP_A: &str = "raw/datausa/population/ingestion_date=2026-01-01/population_a.json";
    const POP_B: &str = "raw/datausa/population/ingestion_date=2026-01-02/population_b.json";
    const BLS: &str = "series_id        \tyear\tperiod\t       value\tfootnote_codes\n\
                       PRS30006032      \t2013\tQ01\t  10\t\n\
                       PRS30006032      \t2014\tQ01\t  12\t\n\
                       PRS30006032      \t2014\tQ02\t  30\t\n";

    async fn seeded_store() -> Arc<MemoryContentStore> {
        let store = Arc::new(MemoryContentStore::new("bucket"));
        store
            .put(POP_A, br#"{"data":[{"Year":2013,"Population":1}]}"#.to_vec(), None)
            .await
            .expect("seed a");
        store
            .put(
                POP_B,
                br#"{"data":[{"Year":2013,"Population":316},{"Year":2014,"Population":319},{"Year":2018,"Population":327},{"Year":2015}]}"#
                    .to_vec(),
                None,
            )
            .await
            .expect("seed b");
        store
            .put("bls-folder/pr/pr.data.0.Current", BLS.as_bytes().to_vec(), None)
            .await
            .expect("seed bls");
        store
    }

    fn notification(bucket: &str, key: &str) -> QueueMessage {
        let event = object_created_event(bucket, key, 1, "etag");
        QueueMessage::new(wrap_in_notification(&event, "sns-1").to_string())
    }

    #[tokio::test]
    async fn full_run_uses_newest_population_snapshot() {
        let consumer = AnalyticsConsumer::new(seeded_store().await, AnalyticsSettings::default());
        let report = consumer.run_full().await.expect("report");

        assert_eq!(report.population_key, POP_B);
        assert_eq!(report.population_stats.count, 3);
        let mean = report.population_stats.mean.expect("mean");
        assert!((mean - 320.67).abs() < 0.01);
        assert_eq!(report.best_years.len(), 1);
        assert_eq!(report.best_years[0].year, 2014);
        let joined: Vec<_> = report
            .joined
            .iter()
            .map(|r| (r.year, r.value, r.population))
            .collect();
        assert_eq!(joined, vec![(2013, 10.0, 316), (2014, 12.0, 319)]);
    }

    #[tokio::test]
    async fn validation_discards_incomplete_records() {
        let consumer = AnalyticsConsumer::new(seeded_store().await, AnalyticsSettings::default());
        let outcome = consumer
            .validate_object(&ObjectRef {
                bucket: "bucket".into(),
                key: POP_B.into(),
            })
            .await
            .expect("validate");
        match outcome {
            ValidationOutcome::Validated {
                valid_records,
                rejected_records,
                mean_population,
                ..
            } => {
                assert_eq!(valid_records, 3);
                assert_eq!(rejected_records, 1);
                assert!((mean_population.expect("mean") - 320.67).abs() < 0.01);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn validation_skips_foreign_buckets_and_empty_payloads() {
        let store = seeded_store().await;
        store
            .put("raw/datausa/population/empty.json", br#"{"data":[]}"#.to_vec(), None)
            .await
            .expect("seed");
        let consumer = AnalyticsConsumer::new(store, AnalyticsSettings::default());

        for object in [
            ObjectRef {
                bucket: "other".into(),
                key: POP_B.into(),
            },
            ObjectRef {
                bucket: "bucket".into(),
                key: "raw/datausa/population/empty.json".into(),
            },
            ObjectRef {
                bucket: "bucket".into(),
                key: "raw/datausa/population/missing.json".into(),
            },
        ] {
            let outcome = consumer.validate_object(&object).await.expect("validate");
            assert!(matches!(outcome, ValidationOutcome::Skipped { .. }), "{object}");
        }
    }

    #[tokio::test]
    async fn malformed_notification_is_skipped_not_failed() {
        let consumer = AnalyticsConsumer::new(seeded_store().await, AnalyticsSettings::default());
        let batch = consumer
            .handle_batch(&[
                QueueMessage::new("{not json"),
                notification("bucket", POP_B),
            ])
            .await;
        assert!(batch.failed_message_ids.is_empty());
        assert_eq!(batch.processed.len(), 2);
        assert!(batch.processed[0].skipped.is_some());
        assert!(batch.processed[1].report.is_some());
        assert_eq!(batch.processed[1].validations.len(), 1);
    }

    #[tokio::test]
    async fn validate_mode_skips_full_aggregation() {
        let settings = AnalyticsSettings {
            mode: AnalyticsMode::Validate,
            ..AnalyticsSettings::default()
        };
        let consumer = AnalyticsConsumer::new(seeded_store().await, settings);
        let outcome = consumer
            .handle_message(&notification("bucket", POP_B))
            .await
            .expect("handle");
        assert!(outcome.report.is_none());
        assert_eq!(outcome.validations.len(), 1);
    }

    #[tokio::test]
    async fn both_mode_keeps_validations_when_bls_dataset_is_missing() {
        let store = Arc::new(MemoryContentStore::new("bucket"));
        store
            .put(
                POP_B,
                br#"{"data":[{"Year":2013,"Population":316},{"Year":2014,"Population":319}]}"#
                    .to_vec(),
                None,
            )
            .await
            .expect("seed");
        let consumer = AnalyticsConsumer::new(store, AnalyticsSettings::default());
        assert_eq!(consumer.settings().mode, AnalyticsMode::Both);

        let batch = consumer.handle_batch(&[notification("bucket", POP_B)]).await;
        assert!(batch.failed_message_ids.is_empty());
        assert_eq!(batch.processed.len(), 1);

        let outcome = &batch.processed[0];
        assert!(outcome.report.is_none());
        assert!(outcome
            .full_error
            .as_deref()
            .is_some_and(|err| err.contains("bls-folder/pr/pr.data.0.Current")));
        assert!(matches!(
            outcome.validations.as_slice(),
            [ValidationOutcome::Validated { valid_records: 2, .. }]
        ));

        let queue = InProcessQueue::new();
        queue
            .publish(notification("bucket", POP_B).body)
            .await
            .expect("publish");
        let summary = consumer.drain(&queue, 10).await.expect("drain");
        assert_eq!(summary.acked, 1);
        assert_eq!(summary.requeued, 0);
    }

    #[tokio::test]
    async fn queue_event_document_is_split_into_messages() {
        let consumer = AnalyticsConsumer::new(seeded_store().await, AnalyticsSettings::default());
        let inner = notification("bucket", POP_B).body;
        let event = serde_json::json!({
            "Records": [{"messageId": "m-1", "receiptHandle": "r-1", "body": inner}]
        })
        .to_string();
        let batch = consumer.handle_queue_event(&event).await;
        assert_eq!(batch.processed.len(), 1);
        assert_eq!(batch.processed[0].message_id, "m-1");
    }

    #[tokio::test]
    async fn drain_acks_successes_and_drops_repeated_failures() {
        // No BLS dataset: full runs fail on every delivery.
        let store = Arc::new(MemoryContentStore::new("bucket"));
        store
            .put(POP_A, br#"{"data":[{"Year":2013,"Population":1}]}"#.to_vec(), None)
            .await
            .expect("seed");
        let settings = AnalyticsSettings {
            mode: AnalyticsMode::Full,
            ..AnalyticsSettings::default()
        };
        let consumer = AnalyticsConsumer::new(store, settings);

        let queue = InProcessQueue::new();
        queue
            .publish(notification("bucket", POP_A).body)
            .await
            .expect("publish");
        queue
            .publish(r#"{"Event":"s3:TestEvent"}"#.to_string())
            .await
            .expect("publish");

        let summary = consumer.drain(&queue, 10).await.expect("drain");
        assert_eq!(summary.acked, 1);
        assert_eq!(summary.requeued, 2);
        assert_eq!(summary.dropped, 1);
        assert_eq!(summary.received, 4);
        assert_eq!(queue.ready_len().await, 0);
        assert_eq!(queue.in_flight_len().await, 0);
    }
}
