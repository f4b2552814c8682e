//! Remote mirror sync: make a store prefix byte-identical to a remote file tree.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use popbls_core::{join_key, listing_prefix, PipelineConfig};
use popbls_sources::RemoteTree;
use popbls_storage::{md5_hex, ContentStore};
use serde::Serialize;
use tracing::{debug, info, warn};
use url::Url;

/// Where to mirror from and to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorTarget {
    /// Directory URL the crawl starts from.
    pub root_url: String,
    /// URL prefix stripped from leaf URLs to get their relative path.
    pub path_base: String,
    /// Store prefix the relative paths are placed under.
    pub prefix: String,
}

impl MirrorTarget {
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        Self {
            root_url: config.mirror_root_url(),
            path_base: config.mirror_path_base(),
            prefix: config.mirror_prefix.clone(),
        }
        .canonical()
    }

    /// The same target with both URLs printed the way [`Url`] prints them
    /// (lowercase host, default port dropped), which is the form directory
    /// listings report their links in.
    pub fn canonical(&self) -> Result<Self> {
        Ok(Self {
            root_url: canonical_url(&self.root_url)?,
            path_base: canonical_url(&self.path_base)?,
            prefix: self.prefix.clone(),
        })
    }
}

fn canonical_url(raw: &str) -> Result<String> {
    let url = Url::parse(raw).with_context(|| format!("invalid mirror url {raw}"))?;
    Ok(url.to_string())
}

/// A file discovered in the remote tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub relative_path: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub discovered: usize,
    pub uploaded: usize,
    pub unchanged: usize,
    pub deleted: usize,
    /// Store keys mirrored in this pass (the sync manifest), sorted.
    pub keys: Vec<String>,
    pub deleted_keys: Vec<String>,
}

/// Mirrors a [`RemoteTree`] into a [`ContentStore`] prefix.
///
/// Not safe to run concurrently against the same prefix: stale cleanup from
/// one pass can delete objects another pass just uploaded.
pub struct MirrorSyncer {
    store: Arc<dyn ContentStore>,
    tree: Arc<dyn RemoteTree>,
}

impl MirrorSyncer {
    pub fn new(store: Arc<dyn ContentStore>, tree: Arc<dyn RemoteTree>) -> Self {
        Self { store, tree }
    }

    /// Depth-first walk of the remote tree; every leaf is returned exactly once.
    ///
    /// A walk that finds no files below the root is an error, so a
    /// misconfigured root can never look like an empty remote tree.
    pub async fn discover(&self, target: &MirrorTarget) -> Result<Vec<RemoteFile>> {
        let target = target.canonical()?;
        if !target.root_url.starts_with(&target.path_base) {
            bail!(
                "mirror root {} is not below path base {}",
                target.root_url,
                target.path_base
            );
        }

        let mut visited_dirs = HashSet::new();
        let mut seen_files = HashSet::new();
        let mut pending = vec![target.root_url.clone()];
        let mut files = Vec::new();
        let mut listed = 0usize;

        while let Some(dir_url) = pending.pop() {
            let Ok(dir_key) = canonical_url(&dir_url) else {
                continue;
            };
            if !visited_dirs.insert(dir_key) {
                continue;
            }
            let entries = self
                .tree
                .list(&dir_url)
                .await
                .with_context(|| format!("listing remote directory {dir_url}"))?;
            debug!(dir = %dir_url, entries = entries.len(), "listed remote directory");
            listed += entries.len();

            let mut subdirs = Vec::new();
            for entry in entries {
                let Ok(canonical) = canonical_url(&entry.url) else {
                    warn!(url = %entry.url, "skipping unparsable remote url");
                    continue;
                };
                if !canonical.starts_with(&target.root_url) {
                    continue;
                }
                if entry.is_directory {
                    subdirs.push(entry.url);
                    continue;
                }
                if !seen_files.insert(canonical.clone()) {
                    continue;
                }
                let relative_path = canonical
                    .strip_prefix(&target.path_base)
                    .unwrap_or(&canonical)
                    .to_string();
                files.push(RemoteFile {
                    relative_path,
                    url: entry.url,
                });
            }
            // Reverse so the first listed subdirectory is walked first.
            pending.extend(subdirs.into_iter().rev());
        }

        if files.is_empty() {
            if listed > 0 {
                bail!(
                    "remote listing returned {listed} entries but none are below {}",
                    target.root_url
                );
            }
            bail!("remote tree below {} has no files", target.root_url);
        }
        Ok(files)
    }

    pub async fn sync(&self, target: &MirrorTarget) -> Result<SyncReport> {
        if target.prefix.trim_matches('/').is_empty() {
            bail!("refusing to mirror into an empty store prefix");
        }

        let files = self.discover(target).await?;
        let mut report = SyncReport {
            discovered: files.len(),
            ..Default::default()
        };
        let mut keep_keys = BTreeSet::new();

        for file in &files {
            let key = join_key(&target.prefix, &file.relative_path);
            keep_keys.insert(key.clone());

            let bytes = self
                .tree
                .fetch(&file.url)
                .await
                .with_context(|| format!("fetching remote file {}", file.url))?;
            let checksum = md5_hex(&bytes);

            let existing = match self.store.head(&key).await {
                Ok(existing) => existing,
                Err(err) => {
                    warn!(%key, error = %err, "checksum lookup failed; treating as new");
                    None
                }
            };
            if existing.is_some_and(|info| info.checksum == checksum) {
                report.unchanged += 1;
                continue;
            }

            self.store
                .put(&key, bytes, None)
                .await
                .with_context(|| format!("uploading {key}"))?;
            debug!(%key, %checksum, "uploaded mirror file");
            report.uploaded += 1;
        }

        let existing = self
            .store
            .list(&listing_prefix(&target.prefix))
            .await
            .with_context(|| format!("listing store prefix {}", target.prefix))?;
        for info in existing {
            if keep_keys.contains(&info.key) {
                continue;
            }
            self.store
                .delete(&info.key)
                .await
                .with_context(|| format!("deleting stale key {}", info.key))?;
            report.deleted_keys.push(info.key);
        }
        report.deleted = report.deleted_keys.len();
        report.keys = keep_keys.into_iter().collect();

        info!(
            discovered = report.discovered,
            uploaded = report.uploaded,
            unchanged = report.unchanged,
            deleted = report.deleted,
            prefix = %target.prefix,
            "mirror sync complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use popbls_sources::{parse_directory_listing, MemoryRemoteTree, RemoteEntry, SourceError};
    use popbls_storage::MemoryContentStore;

    const BASE: &str = "https://files.example/pub/time.series/";
    const ROOT: &str = "https://files.example/pub/time.series/pr/";

    fn target() -> MirrorTarget {
        MirrorTarget {
            root_url: ROOT.to_string(),
            path_base: BASE.to_string(),
            prefix: "bls-folder/".to_string(),
        }
    }

    async fn remote() -> Arc<MemoryRemoteTree> {
        let tree = MemoryRemoteTree::new();
        tree.insert(format!("{ROOT}pr.series"), b"series v1".to_vec()).await;
        tree.insert(format!("{ROOT}pr.data.0.Current"), b"data v1".to_vec()).await;
        tree.insert(format!("{ROOT}archive/pr.old"), b"old".to_vec()).await;
        Arc::new(tree)
    }

    #[tokio::test]
    async fn sync_mirrors_remote_paths_exactly() {
        let store = Arc::new(MemoryContentStore::new("bucket"));
        store
            .put("bls-folder/pr/gone.txt", b"stale".to_vec(), None)
            .await
            .expect("seed stale");
        store
            .put("raw/datausa/population/keep.json", b"{}".to_vec(), None)
            .await
            .expect("seed unrelated");

        let syncer = MirrorSyncer::new(store.clone(), remote().await);
        let report = syncer.sync(&target()).await.expect("sync");

        assert_eq!(report.discovered, 3);
        assert_eq!(report.uploaded, 3);
        assert_eq!(report.deleted_keys, vec!["bls-folder/pr/gone.txt".to_string()]);

        let mirrored: Vec<_> = store
            .list("bls-folder/")
            .await
            .expect("list")
            .into_iter()
            .map(|o| o.key)
            .collect();
        assert_eq!(
            mirrored,
            vec![
                "bls-folder/pr/archive/pr.old",
                "bls-folder/pr/pr.data.0.Current",
                "bls-folder/pr/pr.series",
            ]
        );
        assert_eq!(mirrored, report.keys);
        assert!(store.exists("raw/datausa/population/keep.json").await.expect("exists"));
    }

    #[tokio::test]
    async fn second_sync_of_unchanged_tree_is_a_no_op() {
        let store = Arc::new(MemoryContentStore::new("bucket"));
        let syncer = MirrorSyncer::new(store.clone(), remote().await);

        syncer.sync(&target()).await.expect("first sync");
        let second = syncer.sync(&target()).await.expect("second sync");

        assert_eq!(second.uploaded, 0);
        assert_eq!(second.deleted, 0);
        assert_eq!(second.unchanged, 3);
    }

    #[tokio::test]
    async fn changed_and_removed_remote_files_are_propagated() {
        let store = Arc::new(MemoryContentStore::new("bucket"));
        let tree = remote().await;
        let syncer = MirrorSyncer::new(store.clone(), tree.clone());
        syncer.sync(&target()).await.expect("first sync");

        tree.insert(format!("{ROOT}pr.series"), b"series v2".to_vec()).await;
        tree.remove(&format!("{ROOT}archive/pr.old")).await;
        let report = syncer.sync(&target()).await.expect("second sync");

        assert_eq!(report.uploaded, 1);
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.deleted_keys, vec!["bls-folder/pr/archive/pr.old".to_string()]);
        assert_eq!(
            store.get("bls-folder/pr/pr.series").await.expect("get"),
            b"series v2".to_vec()
        );
    }

    struct CyclicTree;

    #[async_trait::async_trait]
    impl RemoteTree for CyclicTree {
        async fn list(&self, url: &str) -> Result<Vec<RemoteEntry>, SourceError> {
            Ok(vec![
                RemoteEntry {
                    name: "self".into(),
                    url: url.to_string(),
                    is_directory: true,
                },
                RemoteEntry {
                    name: "up".into(),
                    url: BASE.to_string(),
                    is_directory: true,
                },
                RemoteEntry {
                    name: "f".into(),
                    url: format!("{ROOT}f"),
                    is_directory: false,
                },
            ])
        }

        async fn fetch(&self, _url: &str) -> Result<Vec<u8>, SourceError> {
            Ok(b"f".to_vec())
        }
    }

    #[tokio::test]
    async fn discovery_visits_each_directory_and_leaf_once() {
        let store = Arc::new(MemoryContentStore::new("bucket"));
        let syncer = MirrorSyncer::new(store, Arc::new(CyclicTree));
        let files = syncer.discover(&target()).await.expect("discover");
        assert_eq!(
            files,
            vec![RemoteFile {
                relative_path: "pr/f".into(),
                url: format!("{ROOT}f"),
            }]
        );
    }

    struct FailingTree;

    #[async_trait::async_trait]
    impl RemoteTree for FailingTree {
        async fn list(&self, _url: &str) -> Result<Vec<RemoteEntry>, SourceError> {
            Err(SourceError::Message("connection reset".into()))
        }

        async fn fetch(&self, url: &str) -> Result<Vec<u8>, SourceError> {
            Err(SourceError::NotFound(url.to_string()))
        }
    }

    #[tokio::test]
    async fn listing_failure_aborts_without_deleting() {
        let store = Arc::new(MemoryContentStore::new("bucket"));
        store
            .put("bls-folder/pr/pr.series", b"keep".to_vec(), None)
            .await
            .expect("seed");
        let syncer = MirrorSyncer::new(store.clone(), Arc::new(FailingTree));

        assert!(syncer.sync(&target()).await.is_err());
        assert!(store.exists("bls-folder/pr/pr.series").await.expect("exists"));
    }

    const PR_LISTING: &str = r#"<html><body><pre>
<a href="/pub/time.series/">[To Parent Directory]</a><br>
<a href="/pub/time.series/pr/pr.data.0.Current">pr.data.0.Current</a><br>
<a href="/pub/time.series/pr/pr.series">pr.series</a><br>
</pre></body></html>"#;

    /// Serves `PR_LISTING` for every directory, like an HTML index would.
    struct IndexPageTree;

    #[async_trait::async_trait]
    impl RemoteTree for IndexPageTree {
        async fn list(&self, url: &str) -> Result<Vec<RemoteEntry>, SourceError> {
            parse_directory_listing(PR_LISTING, url)
        }

        async fn fetch(&self, _url: &str) -> Result<Vec<u8>, SourceError> {
            Ok(b"current".to_vec())
        }
    }

    #[tokio::test]
    async fn mixed_case_host_and_default_port_still_match_listing_links() {
        let store = Arc::new(MemoryContentStore::new("bucket"));
        for key in ["bls-folder/pr/pr.series", "bls-folder/pr/pr.data.0.Current"] {
            store.put(key, b"current".to_vec(), None).await.expect("seed");
        }
        let target = MirrorTarget {
            root_url: "https://Download.BLS.gov/pub/time.series/pr/".into(),
            path_base: "https://Download.BLS.gov:443/pub/time.series/".into(),
            prefix: "bls-folder/".into(),
        };

        let syncer = MirrorSyncer::new(store.clone(), Arc::new(IndexPageTree));
        let report = syncer.sync(&target).await.expect("sync");

        assert_eq!(report.discovered, 2);
        assert_eq!(report.unchanged, 2);
        assert!(report.deleted_keys.is_empty());
        assert_eq!(
            report.keys,
            vec!["bls-folder/pr/pr.data.0.Current", "bls-folder/pr/pr.series"]
        );
        assert!(store.exists("bls-folder/pr/pr.series").await.expect("exists"));
    }

    struct OffRootTree;

    #[async_trait::async_trait]
    impl RemoteTree for OffRootTree {
        async fn list(&self, _url: &str) -> Result<Vec<RemoteEntry>, SourceError> {
            Ok(vec![RemoteEntry {
                name: "pr.series".into(),
                url: "https://elsewhere.example/pr/pr.series".into(),
                is_directory: false,
            }])
        }

        async fn fetch(&self, url: &str) -> Result<Vec<u8>, SourceError> {
            Err(SourceError::NotFound(url.to_string()))
        }
    }

    #[tokio::test]
    async fn listing_with_nothing_below_root_aborts_without_deleting() {
        let store = Arc::new(MemoryContentStore::new("bucket"));
        store
            .put("bls-folder/pr/pr.series", b"keep".to_vec(), None)
            .await
            .expect("seed");

        let syncer = MirrorSyncer::new(store.clone(), Arc::new(OffRootTree));
        let err = syncer.sync(&target()).await.expect_err("must abort");
        assert!(format!("{err:#}").contains("none are below"), "{err:#}");
        assert!(store.exists("bls-folder/pr/pr.series").await.expect("exists"));

        let empty = MirrorSyncer::new(store.clone(), Arc::new(MemoryRemoteTree::new()));
        assert!(empty.sync(&target()).await.is_err());
        assert!(store.exists("bls-folder/pr/pr.series").await.expect("exists"));
    }

    #[test]
    fn target_from_config_is_canonical() {
        let config = PipelineConfig {
            mirror_base_url: "HTTPS://Download.BLS.gov:443/pub/time.series".into(),
            ..PipelineConfig::default()
        };
        let target = MirrorTarget::from_config(&config).expect("target");
        assert_eq!(target.root_url, "https://download.bls.gov/pub/time.series/pr/");
        assert_eq!(target.path_base, "https://download.bls.gov/pub/time.series/");
    }

    #[tokio::test]
    async fn empty_prefix_is_refused() {
        let store = Arc::new(MemoryContentStore::new("bucket"));
        let syncer = MirrorSyncer::new(store, remote().await);
        let mut target = target();
        target.prefix = "/".into();
        assert!(syncer.sync(&target).await.is_err());
    }
}
