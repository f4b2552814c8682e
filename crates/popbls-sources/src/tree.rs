use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use popbls_storage::HttpFetcher;
use scraper::{Html, Selector};
use serde::Serialize;
use tokio::sync::RwLock;
use url::Url;

use crate::SourceError;

/// One child of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteEntry {
    pub name: String,
    pub url: String,
    pub is_directory: bool,
}

/// A browsable remote file tree (e.g. an HTTP directory index).
#[async_trait]
pub trait RemoteTree: Send + Sync {
    /// Direct children of the directory at `url` (which ends in `/`).
    async fn list(&self, url: &str) -> Result<Vec<RemoteEntry>, SourceError>;

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, SourceError>;
}

/// Extract the children of `page_url` from an HTML directory index.
///
/// Only links that resolve strictly below `page_url` are kept; parent links,
/// self links, sort links (`?C=N;O=D`) and links to other hosts are dropped.
pub fn parse_directory_listing(html: &str, page_url: &str) -> Result<Vec<RemoteEntry>, SourceError> {
    let base = Url::parse(page_url).map_err(|e| SourceError::InvalidUrl {
        url: page_url.to_string(),
        reason: e.to_string(),
    })?;
    let selector = Selector::parse("a[href]").map_err(|e| SourceError::Message(e.to_string()))?;
    let document = Html::parse_document(html);

    let mut seen = std::collections::HashSet::new();
    let mut entries = Vec::new();
    for link in document.select(&selector) {
        let Some(href) = link.value().attr("href").map(str::trim) else {
            continue;
        };
        if href.is_empty() || href.starts_with('?') || href.starts_with('#') || href == "./" || href == "../" {
            continue;
        }
        let Ok(mut resolved) = base.join(href) else {
            continue;
        };
        resolved.set_fragment(None);
        if resolved.query().is_some()
            || resolved.scheme() != base.scheme()
            || resolved.host_str() != base.host_str()
            || resolved.port_or_known_default() != base.port_or_known_default()
        {
            continue;
        }
        let path = resolved.path();
        if !path.starts_with(base.path()) || path == base.path() {
            continue;
        }

        let is_directory = path.ends_with('/');
        let name = path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        let url = resolved.to_string();
        if name.is_empty() || !seen.insert(url.clone()) {
            continue;
        }
        entries.push(RemoteEntry {
            name,
            url,
            is_directory,
        });
    }
    Ok(entries)
}

/// Directory-index crawler over plain HTTP.
#[derive(Debug, Clone)]
pub struct HttpDirectoryTree {
    http: Arc<HttpFetcher>,
}

impl HttpDirectoryTree {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl RemoteTree for HttpDirectoryTree {
    async fn list(&self, url: &str) -> Result<Vec<RemoteEntry>, SourceError> {
        let page = self.http.fetch_bytes("mirror-list", url).await?;
        let html = String::from_utf8_lossy(&page.body);
        parse_directory_listing(&html, url)
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, SourceError> {
        Ok(self.http.fetch_bytes("mirror-fetch", url).await?.body)
    }
}

/// Remote tree held in memory, keyed by absolute file URL.
///
/// Directories are implied by file URLs. Used by tests and by fixture-driven
/// local runs (see [`MemoryRemoteTree::from_dir`]).
#[derive(Debug, Default)]
pub struct MemoryRemoteTree {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryRemoteTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror a local directory as if it were served below `base_url`.
    pub fn from_dir(base_url: &str, dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        let base_url = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };

        let mut files = BTreeMap::new();
        let mut pending = vec![dir.to_path_buf()];
        while let Some(current) = pending.pop() {
            for entry in std::fs::read_dir(&current)
                .with_context(|| format!("reading fixture dir {}", current.display()))?
            {
                let path = entry?.path();
                if path.is_dir() {
                    pending.push(path);
                    continue;
                }
                let rel = path
                    .strip_prefix(dir)
                    .with_context(|| format!("relativizing {}", path.display()))?
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                let bytes = std::fs::read(&path)
                    .with_context(|| format!("reading fixture file {}", path.display()))?;
                files.insert(format!("{base_url}{rel}"), bytes);
            }
        }

        Ok(Self {
            files: RwLock::new(files),
        })
    }

    pub async fn insert(&self, url: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.files.write().await.insert(url.into(), bytes.into());
    }

    pub async fn remove(&self, url: &str) {
        self.files.write().await.remove(url);
    }
}

#[async_trait]
impl RemoteTree for MemoryRemoteTree {
    async fn list(&self, url: &str) -> Result<Vec<RemoteEntry>, SourceError> {
        let files = self.files.read().await;
        let mut entries: BTreeMap<String, RemoteEntry> = BTreeMap::new();
        for file_url in files.keys() {
            let Some(rest) = file_url.strip_prefix(url) else {
                continue;
            };
            let entry = match rest.split_once('/') {
                Some((dir, _)) => RemoteEntry {
                    name: dir.to_string(),
                    url: format!("{url}{dir}/"),
                    is_directory: true,
                },
                None => RemoteEntry {
                    name: rest.to_string(),
                    url: file_url.clone(),
                    is_directory: false,
                },
            };
            entries.entry(entry.url.clone()).or_insert(entry);
        }
        Ok(entries.into_values().collect())
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, SourceError> {
        self.files
            .read()
            .await
            .get(url)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(url.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLS_INDEX: &str = r#"<html><head><title>download.bls.gov - /pub/time.series/pr/</title></head><body><H1>download.bls.gov - /pub/time.series/pr/</H1><hr>
<pre><A HREF="/pub/time.series/">[To Parent Directory]</A><br><br>
 3/29/2024  8:30 AM        18014 <A HREF="/pub/time.series/pr/pr.class">pr.class</A><br>
 3/29/2024  8:30 AM      1528066 <A HREF="/pub/time.series/pr/pr.data.0.Current">pr.data.0.Current</A><br>
 3/29/2024  8:30 AM        &lt;dir&gt; <A HREF="/pub/time.series/pr/archive/">archive</A><br>
<A HREF="?C=N;O=D">Name</A> <A HREF="https://elsewhere.example/pr/x">offsite</A>
</pre><hr></body></html>"#;

    #[test]
    fn directory_listing_keeps_only_children() {
        let entries =
            parse_directory_listing(BLS_INDEX, "https://download.bls.gov/pub/time.series/pr/")
                .expect("parse listing");

        assert_eq!(
            entries,
            vec![
                RemoteEntry {
                    name: "pr.class".into(),
                    url: "https://download.bls.gov/pub/time.series/pr/pr.class".into(),
                    is_directory: false,
                },
                RemoteEntry {
                    name: "pr.data.0.Current".into(),
                    url: "https://download.bls.gov/pub/time.series/pr/pr.data.0.Current".into(),
                    is_directory: false,
                },
                RemoteEntry {
                    name: "archive".into(),
                    url: "https://download.bls.gov/pub/time.series/pr/archive/".into(),
                    is_directory: true,
                },
            ]
        );
    }

    #[test]
    fn relative_hrefs_resolve_against_page() {
        let html = r#"<a href="../">up</a><a href="./">self</a><a href="sub/">sub</a><a href="f.txt">f</a>"#;
        let entries = parse_directory_listing(html, "http://files.local/root/").expect("parse");
        let urls: Vec<_> = entries.iter().map(|e| e.url.as_str()).collect();
        assert_eq!(urls, vec!["http://files.local/root/sub/", "http://files.local/root/f.txt"]);
    }

    #[tokio::test]
    async fn memory_tree_derives_directories_from_file_urls() {
        let tree = MemoryRemoteTree::new();
        tree.insert("http://h/pr/a.txt", b"a".to_vec()).await;
        tree.insert("http://h/pr/sub/b.txt", b"b".to_vec()).await;
        tree.insert("http://h/pr/sub/c.txt", b"c".to_vec()).await;

        let root = tree.list("http://h/pr/").await.expect("list");
        assert_eq!(root.len(), 2);
        assert!(root.iter().any(|e| e.is_directory && e.url == "http://h/pr/sub/"));
        assert!(root.iter().any(|e| !e.is_directory && e.name == "a.txt"));

        let sub = tree.list("http://h/pr/sub/").await.expect("list sub");
        assert_eq!(sub.len(), 2);
        assert_eq!(tree.fetch("http://h/pr/sub/b.txt").await.expect("fetch"), b"b".to_vec());
        assert!(matches!(
            tree.fetch("http://h/pr/missing").await,
            Err(SourceError::NotFound(_))
        ));
    }

    #[test]
    fn memory_tree_loads_fixture_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("pr")).expect("mkdir");
        std::fs::write(dir.path().join("pr/pr.series"), b"series").expect("write");

        let tree = MemoryRemoteTree::from_dir("http://h/base", dir.path()).expect("load");
        let files = tree.files.try_read().expect("unlocked");
        assert!(files.contains_key("http://h/base/pr/pr.series"));
    }
}
