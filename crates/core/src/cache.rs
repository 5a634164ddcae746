//! Content cache (spec §4.5): a content-addressed on-disk blob store with
//! an in-memory "at-most-once fetch" guard so that two readers opening the
//! same file concurrently trigger exactly one download.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::crawler::{Crawler, RemoteSource};
use crate::entity::File;
use crate::error::CacheError;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheMeta {
    file_id: String,
    content_hash: String,
    size: u64,
    fetched_at: chrono::DateTime<Utc>,
}

/// Where a file's bytes currently stand, surfaced via the
/// `studip-fuse.contents-status` xattr (spec §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentStatus {
    Unknown,
    Pending,
    Available,
    Failed,
    Unavailable,
}

impl ContentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentStatus::Unknown => "unknown",
            ContentStatus::Pending => "pending",
            ContentStatus::Available => "available",
            ContentStatus::Failed => "failed",
            ContentStatus::Unavailable => "unavailable",
        }
    }
}

/// Sharded two-level hash prefix directory layout, spec §4.5:
/// `<cache>/files/<aa>/<bb>/<file-id>_<hash>/<file-name>`.
fn blob_dir(cache_root: &Path, file: &File) -> PathBuf {
    let hash = file.content_hash.url_safe();
    let mut hasher = DefaultHasher::new();
    file.id.hash(&mut hasher);
    hash.hash(&mut hasher);
    let digest = hasher.finish();
    let aa = format!("{:02x}", digest & 0xff);
    let bb = format!("{:02x}", (digest >> 8) & 0xff);
    cache_root
        .join("files")
        .join(aa)
        .join(bb)
        .join(format!("{}_{}", file.id, hash))
}

fn meta_path(dir: &Path) -> PathBuf {
    dir.join(".meta.json")
}

fn part_path(dir: &Path, file_name: &str) -> PathBuf {
    dir.join(format!("{file_name}.part"))
}

/// One slot in the inflight map: other callers await this broadcast to
/// learn the outcome instead of issuing their own download (spec §4.5
/// "at-most-once fetch").
#[derive(Clone)]
struct InflightSlot {
    done: broadcast::Sender<Result<(), CacheErrorKind>>,
}

/// `CacheError` isn't `Clone` through its `CrawlError::Auth` variant chain in
/// a way that's cheap to broadcast repeatedly, so the inflight channel
/// carries a small owned summary instead and the original error is logged
/// once at the point of failure.
#[derive(Debug, Clone)]
enum CacheErrorKind {
    Io,
    Crawl,
}

pub struct ContentCache<S: RemoteSource> {
    root: PathBuf,
    crawler: Arc<Crawler<S>>,
    inflight: DashMap<(String, String), InflightSlot>,
}

impl<S: RemoteSource> ContentCache<S> {
    pub fn new(root: PathBuf, crawler: Arc<Crawler<S>>) -> Self {
        ContentCache { root, crawler, inflight: DashMap::new() }
    }

    /// Removes any `.part` files left behind by a previous run that was
    /// killed mid-download (spec §9 Open Question: the inflight map is
    /// memory-only, so a sweep at startup is what reclaims these).
    pub async fn sweep_orphaned_parts(&self) -> Result<usize, CacheError> {
        let mut removed = 0;
        let files_root = self.root.join("files");
        if !files_root.exists() {
            return Ok(0);
        }
        let mut level1 = tokio::fs::read_dir(&files_root).await?;
        while let Some(l1) = level1.next_entry().await? {
            if !l1.file_type().await?.is_dir() {
                continue;
            }
            let mut level2 = tokio::fs::read_dir(l1.path()).await?;
            while let Some(l2) = level2.next_entry().await? {
                if !l2.file_type().await?.is_dir() {
                    continue;
                }
                let mut blobs = tokio::fs::read_dir(l2.path()).await?;
                while let Some(blob) = blobs.next_entry().await? {
                    let mut entries = tokio::fs::read_dir(blob.path()).await?;
                    while let Some(entry) = entries.next_entry().await? {
                        let path = entry.path();
                        if path.extension().map(|e| e == "part").unwrap_or(false) {
                            warn!(path = %path.display(), "removing orphaned partial download");
                            tokio::fs::remove_file(&path).await?;
                            removed += 1;
                        }
                    }
                }
            }
        }
        Ok(removed)
    }

    pub fn status(&self, file: &File) -> ContentStatus {
        let dir = blob_dir(&self.root, file);
        let key = (file.id.clone(), file.content_hash.url_safe());
        if self.inflight.contains_key(&key) {
            return ContentStatus::Pending;
        }
        if meta_path(&dir).exists() {
            ContentStatus::Available
        } else {
            ContentStatus::Unknown
        }
    }

    /// Ensures the file's bytes are on disk, fetching them at most once even
    /// under concurrent calls for the same `(file-id, content-hash)`, and
    /// returns the local path to the materialized file.
    pub async fn ensure_local(&self, file: &File) -> Result<PathBuf, CacheError> {
        let dir = blob_dir(&self.root, file);
        let final_path = dir.join(&file.name);
        if meta_path(&dir).exists() && final_path.exists() {
            return Ok(final_path);
        }

        let key = (file.id.clone(), file.content_hash.url_safe());

        loop {
            if let Some(slot) = self.inflight.get(&key) {
                let mut rx = slot.done.subscribe();
                drop(slot);
                match rx.recv().await {
                    Ok(Ok(())) => return Ok(final_path),
                    Ok(Err(_)) | Err(broadcast::error::RecvError::Closed) => {
                        return Err(CacheError::Io("download failed in a concurrent caller".into()));
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }

            let (tx, _rx) = broadcast::channel(1);
            let slot = InflightSlot { done: tx.clone() };
            if self.inflight.insert(key.clone(), slot).is_some() {
                // Lost the race to install the slot; loop back and subscribe.
                continue;
            }

            let result = self.download_to_disk(file, &dir, &final_path).await;
            self.inflight.remove(&key);
            let _ = tx.send(match &result {
                Ok(()) => Ok(()),
                Err(CacheError::Io(_)) => Err(CacheErrorKind::Io),
                Err(CacheError::Crawl(_)) => Err(CacheErrorKind::Crawl),
            });
            return result.map(|()| final_path);
        }
    }

    async fn download_to_disk(
        &self,
        file: &File,
        dir: &Path,
        final_path: &Path,
    ) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(dir).await?;
        let part = part_path(dir, &file.name);
        let mut stream = self.crawler.download(file).await.map_err(CacheError::Crawl)?;

        let write_result: Result<(), CacheError> = async {
            let mut out = tokio::fs::File::create(&part).await?;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(CacheError::Crawl)?;
                out.write_all(&chunk).await?;
            }
            out.flush().await?;
            Ok(())
        }
        .await;
        if let Err(e) = write_result {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(e);
        }

        tokio::fs::rename(&part, final_path).await?;

        let meta = CacheMeta {
            file_id: file.id.clone(),
            content_hash: file.content_hash.url_safe(),
            size: file.size,
            fetched_at: Utc::now(),
        };
        let meta_json = serde_json::to_vec_pretty(&meta).map_err(|e| CacheError::Io(e.to_string()))?;
        tokio::fs::write(meta_path(dir), meta_json).await?;

        info!(file_id = %file.id, path = %final_path.display(), "cached file contents");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::fake::FakeRemoteSource;
    use crate::entity::ContentHash;
    use std::collections::HashMap;

    fn sample_file(id: &str, bytes: &[u8]) -> File {
        File {
            id: id.to_string(),
            name: "notes.pdf".to_string(),
            description: String::new(),
            size: bytes.len() as u64,
            mime_type: "application/pdf".to_string(),
            storage: "disk".to_string(),
            terms: String::new(),
            downloads: 0,
            content_hash: ContentHash::from_size_mtime(bytes.len() as u64, Utc::now()),
            download_url: String::new(),
            folder_id: "f1".to_string(),
        }
    }

    #[tokio::test]
    async fn ensure_local_downloads_once_and_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let file = sample_file("file1", b"hello world");
        let mut file_bytes = HashMap::new();
        file_bytes.insert(file.id.clone(), b"hello world".to_vec());
        let fake = FakeRemoteSource { file_bytes, ..Default::default() };
        let crawler = Arc::new(Crawler::new(fake, 4));
        let cache = ContentCache::new(tmp.path().to_path_buf(), crawler.clone());

        let path1 = cache.ensure_local(&file).await.unwrap();
        assert!(path1.exists());
        assert_eq!(tokio::fs::read(&path1).await.unwrap(), b"hello world");

        let path2 = cache.ensure_local(&file).await.unwrap();
        assert_eq!(path1, path2);
        assert_eq!(*crawler.inner.call_counts.lock().unwrap().get("download:file1").unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_ensure_local_calls_fetch_at_most_once() {
        let tmp = tempfile::tempdir().unwrap();
        let file = sample_file("file2", b"some bytes");
        let mut file_bytes = HashMap::new();
        file_bytes.insert(file.id.clone(), b"some bytes".to_vec());
        let fake = FakeRemoteSource { file_bytes, ..Default::default() };
        let crawler = Arc::new(Crawler::new(fake, 4));
        let cache = Arc::new(ContentCache::new(tmp.path().to_path_buf(), crawler.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let file = file.clone();
            handles.push(tokio::spawn(async move { cache.ensure_local(&file).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(*crawler.inner.call_counts.lock().unwrap().get("download:file2").unwrap(), 1);
    }

    #[tokio::test]
    async fn sweep_removes_orphaned_part_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("files").join("aa").join("bb").join("file3_hash");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("notes.pdf.part"), b"partial").await.unwrap();

        let fake = FakeRemoteSource::default();
        let crawler = Arc::new(Crawler::new(fake, 4));
        let cache = ContentCache::new(tmp.path().to_path_buf(), crawler);

        let removed = cache.sweep_orphaned_parts().await.unwrap();
        assert_eq!(removed, 1);
        assert!(!dir.join("notes.pdf.part").exists());
    }
}
