use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use popbls_core::ObjectInfo;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::{md5_hex, validate_key, ContentStore, StoreError};

const TEMP_SUFFIX: &str = ".tmp";

/// Directory-backed store: each key is a file below `root`.
///
/// Writes go to a temp file next to the target and are renamed into place, so
/// readers never observe a partially written object. Content types are not
/// persisted by this backend. `list` reads metadata only and leaves checksums
/// empty; `head` hashes the file.
#[derive(Debug, Clone)]
pub struct FsContentStore {
    bucket: String,
    root: PathBuf,
}

impl FsContentStore {
    pub fn new(bucket: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            bucket: bucket.into(),
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts = rel
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?;
        Some(parts.join("/"))
    }

    fn info_from_metadata(
        key: String,
        metadata: &std::fs::Metadata,
    ) -> Result<ObjectInfo, StoreError> {
        let last_modified: DateTime<Utc> = metadata.modified()?.into();
        Ok(ObjectInfo {
            key,
            checksum: String::new(),
            last_modified,
            size: metadata.len(),
            content_type: None,
        })
    }

    async fn hashed_info(&self, key: String, path: &Path) -> Result<ObjectInfo, StoreError> {
        let metadata = fs::metadata(path).await?;
        let bytes = fs::read(path).await?;
        Ok(ObjectInfo {
            checksum: md5_hex(&bytes),
            ..Self::info_from_metadata(key, &metadata)?
        })
    }
}

fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.') && n.ends_with(TEMP_SUFFIX))
        .unwrap_or(false)
}

#[async_trait]
impl ContentStore for FsContentStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StoreError> {
        let mut out = Vec::new();
        if !fs::try_exists(&self.root).await? {
            return Ok(out);
        }

        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if !file_type.is_file() || is_temp_file(&path) {
                    continue;
                }
                let Some(key) = self.key_for(&path) else {
                    continue;
                };
                if key.starts_with(prefix) {
                    let metadata = entry.metadata().await?;
                    out.push(Self::info_from_metadata(key, &metadata)?);
                }
            }
        }

        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, StoreError> {
        let path = self.path_for(key)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(self.hashed_info(key.to_string(), &path).await?)),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<ObjectInfo, StoreError> {
        let absolute_path = self.path_for(key)?;
        let Some(parent) = absolute_path.parent() else {
            return Err(StoreError::InvalidKey(key.to_string()));
        };
        fs::create_dir_all(parent).await?;

        let temp_path = parent.join(format!(".{}.{}{TEMP_SUFFIX}", Uuid::new_v4(), bytes.len()));
        let write_result: anyhow::Result<()> = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await
                .with_context(|| format!("opening temp object file {}", temp_path.display()))?;
            file.write_all(&bytes)
                .await
                .with_context(|| format!("writing temp object file {}", temp_path.display()))?;
            file.flush()
                .await
                .with_context(|| format!("flushing temp object file {}", temp_path.display()))?;
            drop(file);
            fs::rename(&temp_path, &absolute_path).await.with_context(|| {
                format!(
                    "renaming temp object {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            })?;
            Ok(())
        }
        .await;

        if let Err(err) = write_result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Io(std::io::Error::other(format!("{err:#}"))));
        }

        let metadata = fs::metadata(&absolute_path).await?;
        Ok(ObjectInfo {
            checksum: md5_hex(&bytes),
            content_type: content_type.map(str::to_string),
            ..Self::info_from_metadata(key.to_string(), &metadata)?
        })
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
