use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use popbls_core::ObjectInfo;
use tokio::sync::Mutex;

use crate::{md5_hex, validate_key, ContentStore, StoreError};

#[derive(Debug, Clone)]
struct MemoryObject {
    bytes: Vec<u8>,
    info: ObjectInfo,
}

#[derive(Debug, Default)]
struct MemoryState {
    objects: BTreeMap<String, MemoryObject>,
    last_stamp: Option<DateTime<Utc>>,
}

/// In-process store used by tests and the local end-to-end pipeline.
///
/// Every write gets a strictly increasing `last_modified`, so "latest object"
/// lookups stay deterministic even when writes land within the same clock tick.
#[derive(Debug)]
pub struct MemoryContentStore {
    bucket: String,
    state: Mutex<MemoryState>,
}

impl MemoryContentStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.objects.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn keys(&self) -> Vec<String> {
        self.state.lock().await.objects.keys().cloned().collect()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, obj)| obj.info.clone())
            .collect())
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.objects.get(key).map(|obj| obj.info.clone()))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let state = self.state.lock().await;
        state
            .objects
            .get(key)
            .map(|obj| obj.bytes.clone())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<ObjectInfo, StoreError> {
        validate_key(key)?;
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let stamp = match state.last_stamp {
            Some(prev) if now <= prev => prev + Duration::microseconds(1),
            _ => now,
        };
        state.last_stamp = Some(stamp);

        let info = ObjectInfo {
            key: key.to_string(),
            checksum: md5_hex(&bytes),
            last_modified: stamp,
            size: bytes.len() as u64,
            content_type: content_type.map(str::to_string),
        };
        state.objects.insert(
            key.to_string(),
            MemoryObject {
                bytes,
                info: info.clone(),
            },
        );
        Ok(info)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.state.lock().await.objects.remove(key);
        Ok(())
    }
}
