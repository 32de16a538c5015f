//! Download cache for remote images.
//!
//! Maps a source URL to a file in the cache directory, downloading on the
//! first request and answering from a persisted index afterwards.
//!
//! ```text
//! <cache>/entries     # JSON index: URL -> local path
//! <cache>/<random>    # downloaded files
//! ```
//!
//! The index is loaded lazily on first use and rewritten with a
//! write-then-rename after every new entry, so readers never see a torn
//! file. Access from several processes at once is not coordinated: two
//! processes missing on the same URL both download it and the last index
//! write wins.

use crate::error::{CoreError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use url::Url;

/// Name of the index file inside the cache directory.
pub const INDEX_FILE: &str = "entries";

type Index = BTreeMap<String, PathBuf>;

/// Retrieves the content behind a URL into a local file.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Write the resource at `url` to `dest`, returning the byte count.
    ///
    /// `dest` already exists and may be overwritten.
    async fn fetch(&self, url: &Url, dest: &Path) -> Result<u64>;
}

/// Fetcher for `http`, `https` and `file` URLs.
#[derive(Debug, Clone, Default)]
pub struct UrlFetcher {
    client: reqwest::Client,
}

impl UrlFetcher {
    /// Create a fetcher with a default HTTP client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fetcher using a preconfigured HTTP client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn fetch_http(&self, url: &Url, dest: &Path) -> Result<u64> {
        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| CoreError::download(url.as_str(), e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CoreError::download(url.as_str(), format!("HTTP {}", status)));
        }

        let failed = |e: &dyn std::fmt::Display| CoreError::download(url.as_str(), e);
        let mut file = tokio::fs::File::create(dest).await.map_err(|e| failed(&e))?;
        let mut stream = resp.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| failed(&e))?;
            file.write_all(&chunk).await.map_err(|e| failed(&e))?;
            written += chunk.len() as u64;
        }
        file.sync_all().await.map_err(|e| failed(&e))?;
        Ok(written)
    }
}

#[async_trait]
impl Fetcher for UrlFetcher {
    async fn fetch(&self, url: &Url, dest: &Path) -> Result<u64> {
        match url.scheme() {
            "http" | "https" => self.fetch_http(url, dest).await,
            "file" => {
                let src = url
                    .to_file_path()
                    .map_err(|_| CoreError::download(url.as_str(), "not a local file path"))?;
                tokio::fs::copy(&src, dest)
                    .await
                    .map_err(|e| CoreError::download(url.as_str(), e))
            }
            other => Err(CoreError::download(
                url.as_str(),
                format!("unsupported scheme {:?}", other),
            )),
        }
    }
}

/// URL-to-file memoization backed by a directory.
pub struct ResourceCache {
    dir: PathBuf,
    fetcher: Arc<dyn Fetcher>,
    index: Mutex<Option<Index>>,
}

impl ResourceCache {
    /// Create a cache in `dir` using [`UrlFetcher`].
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_fetcher(dir, Arc::new(UrlFetcher::new()))
    }

    /// Create a cache in `dir` using a custom fetcher.
    pub fn with_fetcher(dir: impl Into<PathBuf>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            dir: dir.into(),
            fetcher,
            index: Mutex::new(None),
        }
    }

    /// The cache directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Return a local path holding the content of `url`.
    ///
    /// A URL already in the index is answered without any I/O beyond the
    /// first index load; the cached file is not re-checked. On a miss the
    /// resource is downloaded into a fresh file and the index is rewritten
    /// before the path is returned. A failed download leaves neither a
    /// file nor an index entry behind.
    pub async fn resolve(&self, url: &str) -> Result<PathBuf> {
        let mut guard = self.index.lock().await;
        if guard.is_none() {
            let loaded = self.read_index().await?;
            tracing::trace!(entries = loaded.len(), "Loaded cache index");
            *guard = Some(loaded);
        }
        let index = guard.get_or_insert_with(Index::new);

        if let Some(path) = index.get(url) {
            tracing::debug!(url, path = %path.display(), "Cache hit");
            return Ok(path.clone());
        }

        tracing::debug!(url, "Cache miss, downloading");
        let parsed = Url::parse(url).map_err(|e| CoreError::download(url, e))?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let start = std::time::Instant::now();
        let temp = tempfile::Builder::new()
            .prefix("")
            .tempfile_in(&self.dir)?
            .into_temp_path();
        let size = self.fetcher.fetch(&parsed, &temp).await?;
        let path = temp.keep().map_err(|e| e.error)?;

        index.insert(url.to_string(), path.clone());
        if let Err(e) = self.write_index(index).await {
            index.remove(url);
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e);
        }

        tracing::info!(
            url,
            path = %path.display(),
            bytes = size,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Cached resource"
        );
        Ok(path)
    }

    /// Snapshot of the index.
    pub async fn entries(&self) -> Result<BTreeMap<String, PathBuf>> {
        let guard = self.index.lock().await;
        match guard.as_ref() {
            Some(index) => Ok(index.clone()),
            None => self.read_index().await,
        }
    }

    async fn read_index(&self) -> Result<Index> {
        match tokio::fs::read(self.dir.join(INDEX_FILE)).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Index::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_index(&self, index: &Index) -> Result<()> {
        let data = serde_json::to_vec_pretty(index)?;
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut tmp = tempfile::Builder::new()
                .prefix(".entries-")
                .tempfile_in(&dir)?;
            tmp.write_all(&data)?;
            tmp.as_file().sync_all()?;
            tmp.persist(dir.join(INDEX_FILE)).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(std::io::Error::other)??;
        Ok(())
    }
}

impl std::fmt::Debug for ResourceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCache")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}
