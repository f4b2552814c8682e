use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{
    Attribute, AttributeValue, Attributes, ObjectMeta, ObjectStore, PutOptions, PutPayload,
};
use popbls_core::ObjectInfo;
use tracing::info;

use crate::{md5_hex, validate_key, ContentStore, StoreError};

#[derive(Debug, Clone, Default)]
pub struct S3StoreConfig {
    pub bucket: String,
    pub region: Option<String>,
    /// Custom endpoint (MinIO, LocalStack). Scheme is added when missing.
    pub endpoint_url: Option<String>,
}

/// S3-backed store built on `object_store`.
///
/// Credentials come from the standard AWS environment variables.
pub struct S3ContentStore {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl S3ContentStore {
    pub fn new(config: &S3StoreConfig) -> Result<Self, StoreError> {
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(&config.bucket);

        if let Some(region) = &config.region {
            builder = builder.with_region(region);
        }

        if let Some(endpoint) = config.endpoint_url.as_deref().filter(|e| !e.is_empty()) {
            let endpoint_url = if endpoint.starts_with("http://") || endpoint.starts_with("https://")
            {
                endpoint.to_string()
            } else {
                format!("https://{endpoint}")
            };
            builder = builder
                .with_allow_http(endpoint_url.starts_with("http://"))
                .with_endpoint(endpoint_url);
        }

        let store = builder.build()?;
        info!(bucket = %config.bucket, "content store: s3 backend");
        Ok(Self {
            store: Arc::new(store),
            bucket: config.bucket.clone(),
        })
    }

    /// Wrap an already-built object store (used for alternative providers).
    pub fn from_object_store(bucket: impl Into<String>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }
}

fn meta_to_info(meta: ObjectMeta) -> ObjectInfo {
    let checksum = meta
        .e_tag
        .as_deref()
        .map(|tag| tag.trim_matches('"').to_ascii_lowercase())
        .unwrap_or_default();
    ObjectInfo {
        key: meta.location.to_string(),
        checksum,
        last_modified: meta.last_modified,
        size: meta.size as u64,
        content_type: None,
    }
}

#[async_trait]
impl ContentStore for S3ContentStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StoreError> {
        // object_store lists whole path segments; start from the last complete
        // segment and filter by plain string prefix below.
        let dir = prefix.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
        let path = ObjectPath::from(dir);
        let listing_root = if dir.trim_matches('/').is_empty() {
            None
        } else {
            Some(&path)
        };

        let mut out = Vec::new();
        let mut stream = self.store.list(listing_root);
        while let Some(meta) = stream.try_next().await? {
            let info = meta_to_info(meta);
            if info.key.starts_with(prefix) {
                out.push(info);
            }
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, StoreError> {
        match self.store.head(&ObjectPath::from(key)).await {
            Ok(meta) => Ok(Some(meta_to_info(meta))),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let result = match self.store.get(&ObjectPath::from(key)).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(StoreError::NotFound(key.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        Ok(result.bytes().await?.to_vec())
    }

    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<ObjectInfo, StoreError> {
        validate_key(key)?;
        let mut attributes = Attributes::new();
        if let Some(content_type) = content_type {
            attributes.insert(
                Attribute::ContentType,
                AttributeValue::from(content_type.to_string()),
            );
        }
        let opts = PutOptions {
            attributes,
            ..Default::default()
        };

        let checksum = md5_hex(&bytes);
        let size = bytes.len() as u64;
        self.store
            .put_opts(&ObjectPath::from(key), PutPayload::from(bytes), opts)
            .await?;

        Ok(ObjectInfo {
            key: key.to_string(),
            checksum,
            last_modified: Utc::now(),
            size,
            content_type: content_type.map(str::to_string),
        })
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match self.store.delete(&ObjectPath::from(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
