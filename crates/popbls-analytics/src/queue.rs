//! Queue abstraction between the store-write relay and the analytics consumer.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("message parse error: {0}")]
    Parse(String),
    #[error("acknowledge error: {0}")]
    Ack(String),
    #[error("publish error: {0}")]
    Publish(String),
}

/// A raw message received from a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: String,
    /// Raw message body (JSON string).
    pub body: String,
    /// Handle for ack/nack.
    pub receipt_handle: String,
    pub timestamp: DateTime<Utc>,
    /// Number of times this message has been received.
    pub attempt_count: u32,
}

impl QueueMessage {
    pub fn new(body: impl Into<String>) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            receipt_handle: id.clone(),
            id,
            body: body.into(),
            timestamp: Utc::now(),
            attempt_count: 0,
        }
    }
}

/// Consumer side of a queue. Delivery is at-least-once with no ordering
/// guarantee across messages.
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Take up to `max_messages` messages. Empty when nothing is waiting.
    async fn poll_batch(&self, max_messages: u32) -> Result<Vec<QueueMessage>, QueueError>;

    /// Processing succeeded; remove the message.
    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError>;

    /// Processing failed; make the message available again.
    async fn nack(&self, receipt_handle: &str) -> Result<(), QueueError>;
}

/// Producer side: where store-write notifications are published.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, body: String) -> Result<(), QueueError>;
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<QueueMessage>,
    in_flight: HashMap<String, QueueMessage>,
}

/// In-process queue used for local runs and tests.
///
/// Polled messages move to an in-flight set until acked (dropped) or nacked
/// (requeued at the back). Each delivery bumps `attempt_count`.
#[derive(Default)]
pub struct InProcessQueue {
    state: Mutex<QueueState>,
}

impl InProcessQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, message: QueueMessage) {
        self.state.lock().await.ready.push_back(message);
    }

    /// Messages waiting to be polled.
    pub async fn ready_len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    pub async fn in_flight_len(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }
}

#[async_trait]
impl QueueConsumer for InProcessQueue {
    async fn poll_batch(&self, max_messages: u32) -> Result<Vec<QueueMessage>, QueueError> {
        let mut state = self.state.lock().await;
        let take = (max_messages as usize).min(state.ready.len());
        let mut batch = Vec::with_capacity(take);
        for _ in 0..take {
            let Some(mut message) = state.ready.pop_front() else {
                break;
            };
            message.attempt_count += 1;
            message.receipt_handle = Uuid::new_v4().to_string();
            state
                .in_flight
                .insert(message.receipt_handle.clone(), message.clone());
            batch.push(message);
        }
        Ok(batch)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.state
            .lock()
            .await
            .in_flight
            .remove(receipt_handle)
            .map(|_| ())
            .ok_or_else(|| QueueError::Ack(format!("unknown receipt handle {receipt_handle}")))
    }

    async fn nack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let message = state
            .in_flight
            .remove(receipt_handle)
            .ok_or_else(|| QueueError::Ack(format!("unknown receipt handle {receipt_handle}")))?;
        state.ready.push_back(message);
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for InProcessQueue {
    async fn publish(&self, body: String) -> Result<(), QueueError> {
        self.push(QueueMessage::new(body)).await;
        Ok(())
    }
}

/// Split a queue-delivered event (`{"Records":[{"messageId","receiptHandle","body"}]}`)
/// into messages.
///
/// Records without a string `body` are dropped; the rest still parse.
pub fn parse_queue_event(event: &str) -> Result<Vec<QueueMessage>, QueueError> {
    let value: JsonValue =
        serde_json::from_str(event).map_err(|err| QueueError::Parse(err.to_string()))?;
    let records = value
        .get("Records")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| QueueError::Parse("event has no `Records` array".to_string()))?;

    let mut messages = Vec::with_capacity(records.len());
    for (index, record) in records.iter().enumerate() {
        let Some(body) = record.get("body").and_then(JsonValue::as_str) else {
            tracing::warn!(index, "queue record has no body; dropping");
            continue;
        };
        let mut message = QueueMessage::new(body);
        if let Some(id) = record.get("messageId").and_then(JsonValue::as_str) {
            message.id = id.to_string();
        }
        if let Some(handle) = record.get("receiptHandle").and_then(JsonValue::as_str) {
            message.receipt_handle = handle.to_string();
        }
        message.attempt_count = record
            .pointer("/attributes/ApproximateReceiveCount")
            .and_then(JsonValue::as_str)
            .and_then(|count| count.parse().ok())
            .unwrap_or(1);
        messages.push(message);
    }
    Ok(messages)
}
