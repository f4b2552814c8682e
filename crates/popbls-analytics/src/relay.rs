//! Store decorator that turns object writes into queued notifications.

use std::sync::Arc;

use async_trait::async_trait;
use popbls_core::ObjectInfo;
use popbls_storage::{ContentStore, StoreError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::notification::{object_created_event, wrap_in_notification};
use crate::queue::NotificationSink;

/// Wraps a [`ContentStore`]; every successful `put` under `prefix` publishes
/// an enveloped object-created event to `sink`.
///
/// Publishing is best-effort. A failed publish is logged and the `put` still
/// succeeds, matching a store whose notifications are delivered out of band.
pub struct NotifyingStore {
    inner: Arc<dyn ContentStore>,
    sink: Arc<dyn NotificationSink>,
    prefix: String,
}

impl NotifyingStore {
    pub fn new(
        inner: Arc<dyn ContentStore>,
        sink: Arc<dyn NotificationSink>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            sink,
            prefix: prefix.into(),
        }
    }

    pub fn inner(&self) -> &Arc<dyn ContentStore> {
        &self.inner
    }
}

#[async_trait]
impl ContentStore for NotifyingStore {
    fn bucket(&self) -> &str {
        self.inner.bucket()
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StoreError> {
        self.inner.list(prefix).await
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, StoreError> {
        self.inner.head(key).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.inner.get(key).await
    }

    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<ObjectInfo, StoreError> {
        let info = self.inner.put(key, bytes, content_type).await?;
        if key.starts_with(&self.prefix) {
            let event = object_created_event(self.bucket(), &info.key, info.size, &info.checksum);
            let body = wrap_in_notification(&event, &Uuid::new_v4().to_string()).to_string();
            match self.sink.publish(body).await {
                Ok(()) => debug!(%key, "published object-created notification"),
                Err(err) => warn!(%key, error = %err, "failed to publish notification"),
            }
        }
        Ok(info)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }
}
