//! REST adapter (spec §4.4): bounded-concurrency fan-out over the remote
//! course/file API behind a small trait, so the resolver and content cache
//! never see `reqwest` directly.

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::BoxStream;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, warn};

use crate::entity::{Course, File, Folder, Semester};
use crate::error::CrawlError;

pub type ByteStream = BoxStream<'static, Result<bytes::Bytes, CrawlError>>;

/// Endpoint discovery document (spec §4.4, §6): the full set of absolute
/// URLs the crawler resolves once at startup and refuses to guess at
/// afterwards. `discovery_url` is the document these are themselves
/// discovered from and also doubles as the startup reachability probe
/// target (spec §6).
#[derive(Debug, Clone, Default)]
pub struct Endpoints {
    pub discovery_url: Option<url::Url>,
    pub user_url: Option<url::Url>,
    pub settings_url: Option<url::Url>,
    pub folder_types_url: Option<url::Url>,
    pub course_types_url: Option<url::Url>,
    pub semesters_url: Option<url::Url>,
    pub courses_url: Option<url::Url>,
    pub top_folder_url: Option<url::Url>,
    pub folder_url: Option<url::Url>,
    pub file_url: Option<url::Url>,
    pub download_url: Option<url::Url>,
}

impl Endpoints {
    pub fn require(&self, name: &str, url: &Option<url::Url>) -> Result<url::Url, CrawlError> {
        url.clone().ok_or_else(|| CrawlError::EndpointMissing(name.to_string()))
    }
}

/// Everything the resolver needs to pull from the remote course management
/// system. One real implementation (`HttpRemoteSource`); tests substitute an
/// in-memory fake.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn list_semesters(&self) -> Result<Vec<Semester>, CrawlError>;
    async fn list_courses(&self, semester_id: &str) -> Result<Vec<Course>, CrawlError>;
    async fn top_folder(&self, course_id: &str) -> Result<Folder, CrawlError>;
    async fn list_folder(&self, folder_id: &str) -> Result<(Vec<Folder>, Vec<File>), CrawlError>;
    async fn download(&self, file: &File) -> Result<ByteStream, CrawlError>;
}

/// One in-flight upstream call, keyed the same way as the cache it feeds:
/// a second caller for the same key subscribes here instead of issuing its
/// own request (spec §4.4, mirroring `ContentCache`'s inflight map).
async fn memoized<K, V, Fut>(
    cache: &DashMap<K, Arc<V>>,
    inflight: &DashMap<K, broadcast::Sender<Result<Arc<V>, CrawlError>>>,
    key: K,
    fetch: impl FnOnce() -> Fut,
) -> Result<Arc<V>, CrawlError>
where
    K: Eq + Hash + Clone,
    V: Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<V, CrawlError>>,
{
    if let Some(cached) = cache.get(&key) {
        return Ok(cached.clone());
    }

    loop {
        if let Some(sender) = inflight.get(&key) {
            let mut rx = sender.subscribe();
            drop(sender);
            match rx.recv().await {
                Ok(result) => return result,
                Err(broadcast::error::RecvError::Closed) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }

        let (tx, _rx) = broadcast::channel(1);
        if inflight.insert(key.clone(), tx.clone()).is_some() {
            continue;
        }

        let result = fetch().await.map(Arc::new);
        if let Ok(value) = &result {
            cache.insert(key.clone(), value.clone());
        }
        inflight.remove(&key);
        let _ = tx.send(result.clone());
        return result;
    }
}

/// Wraps any `RemoteSource` with bounded fan-out (spec §4.4 "no more than K
/// requests in flight") and per-request memoization so that two concurrent
/// `readdir`s on the same folder trigger exactly one upstream call, whether
/// that call is already cached or merely already in flight.
pub struct Crawler<S: RemoteSource> {
    inner: S,
    limiter: Arc<Semaphore>,
    semesters_cache: DashMap<(), Arc<Vec<Semester>>>,
    semesters_inflight: DashMap<(), broadcast::Sender<Result<Arc<Vec<Semester>>, CrawlError>>>,
    courses_cache: DashMap<String, Arc<Vec<Course>>>,
    courses_inflight: DashMap<String, broadcast::Sender<Result<Arc<Vec<Course>>, CrawlError>>>,
    top_folder_cache: DashMap<String, Arc<Folder>>,
    top_folder_inflight: DashMap<String, broadcast::Sender<Result<Arc<Folder>, CrawlError>>>,
    folder_cache: DashMap<String, Arc<(Vec<Folder>, Vec<File>)>>,
    folder_inflight: DashMap<String, broadcast::Sender<Result<Arc<(Vec<Folder>, Vec<File>)>, CrawlError>>>,
}

const RETRY_DELAY: Duration = Duration::from_secs(1);

impl<S: RemoteSource> Crawler<S> {
    pub fn new(inner: S, max_concurrent_requests: usize) -> Self {
        Crawler {
            inner,
            limiter: Arc::new(Semaphore::new(max_concurrent_requests.max(1))),
            semesters_cache: DashMap::new(),
            semesters_inflight: DashMap::new(),
            courses_cache: DashMap::new(),
            courses_inflight: DashMap::new(),
            top_folder_cache: DashMap::new(),
            top_folder_inflight: DashMap::new(),
            folder_cache: DashMap::new(),
            folder_inflight: DashMap::new(),
        }
    }

    /// Runs `f` under the concurrency permit, retrying exactly once after a
    /// fixed delay if the first attempt timed out (spec §4.4, §7: only
    /// `Timeout` on an idempotent GET is retried, and only once).
    async fn throttled<T, F, Fut>(&self, f: F) -> Result<T, CrawlError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, CrawlError>>,
    {
        let _permit = self
            .limiter
            .acquire()
            .await
            .expect("semaphore is never closed while the crawler is alive");
        match f().await {
            Err(CrawlError::Timeout) => {
                warn!("request timed out, retrying once after {:?}", RETRY_DELAY);
                tokio::time::sleep(RETRY_DELAY).await;
                f().await
            }
            other => other,
        }
    }

    pub async fn list_semesters(&self) -> Result<Arc<Vec<Semester>>, CrawlError> {
        memoized(&self.semesters_cache, &self.semesters_inflight, (), || {
            self.throttled(|| self.inner.list_semesters())
        })
        .await
    }

    pub async fn list_courses(&self, semester_id: &str) -> Result<Arc<Vec<Course>>, CrawlError> {
        memoized(&self.courses_cache, &self.courses_inflight, semester_id.to_string(), || {
            self.throttled(|| self.inner.list_courses(semester_id))
        })
        .await
    }

    pub async fn top_folder(&self, course_id: &str) -> Result<Arc<Folder>, CrawlError> {
        memoized(&self.top_folder_cache, &self.top_folder_inflight, course_id.to_string(), || {
            self.throttled(|| self.inner.top_folder(course_id))
        })
        .await
    }

    pub async fn list_folder(
        &self,
        folder_id: &str,
    ) -> Result<Arc<(Vec<Folder>, Vec<File>)>, CrawlError> {
        memoized(&self.folder_cache, &self.folder_inflight, folder_id.to_string(), || {
            self.throttled(|| self.inner.list_folder(folder_id))
        })
        .await
    }

    /// Downloads are never cached here — the content cache (spec §4.5) owns
    /// that decision, keyed by content hash rather than request identity.
    pub async fn download(&self, file: &File) -> Result<ByteStream, CrawlError> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .expect("semaphore is never closed while the crawler is alive");
        debug!(file_id = %file.id, "starting download");
        self.inner.download(file).await
    }
}

/// HTTP implementation against the real remote service.
pub struct HttpRemoteSource {
    client: reqwest::Client,
    endpoints: Endpoints,
}

impl HttpRemoteSource {
    pub fn new(client: reqwest::Client, endpoints: Endpoints) -> Self {
        HttpRemoteSource { client, endpoints }
    }

    fn map_status(status: reqwest::StatusCode) -> CrawlError {
        CrawlError::HttpStatus(status.as_u16())
    }

    fn map_transport(err: reqwest::Error) -> CrawlError {
        if err.is_timeout() {
            CrawlError::Timeout
        } else {
            CrawlError::Protocol(err.to_string())
        }
    }
}

#[async_trait]
impl RemoteSource for HttpRemoteSource {
    async fn list_semesters(&self) -> Result<Vec<Semester>, CrawlError> {
        let url = self.endpoints.require("semesters", &self.endpoints.semesters_url)?;
        let resp = self.client.get(url).send().await.map_err(Self::map_transport)?;
        if !resp.status().is_success() {
            return Err(Self::map_status(resp.status()));
        }
        resp.json().await.map_err(|e| CrawlError::Parse(e.to_string()))
    }

    async fn list_courses(&self, semester_id: &str) -> Result<Vec<Course>, CrawlError> {
        let mut url = self.endpoints.require("courses", &self.endpoints.courses_url)?;
        url.query_pairs_mut().append_pair("semester", semester_id);
        let resp = self.client.get(url).send().await.map_err(Self::map_transport)?;
        if !resp.status().is_success() {
            return Err(Self::map_status(resp.status()));
        }
        resp.json().await.map_err(|e| CrawlError::Parse(e.to_string()))
    }

    async fn top_folder(&self, course_id: &str) -> Result<Folder, CrawlError> {
        let mut url = self.endpoints.require("top_folder", &self.endpoints.top_folder_url)?;
        url.query_pairs_mut().append_pair("course", course_id);
        let resp = self.client.get(url).send().await.map_err(Self::map_transport)?;
        if !resp.status().is_success() {
            return Err(Self::map_status(resp.status()));
        }
        resp.json().await.map_err(|e| CrawlError::Parse(e.to_string()))
    }

    async fn list_folder(&self, folder_id: &str) -> Result<(Vec<Folder>, Vec<File>), CrawlError> {
        let mut url = self.endpoints.require("folder", &self.endpoints.folder_url)?;
        url.query_pairs_mut().append_pair("id", folder_id);
        let resp = self.client.get(url).send().await.map_err(Self::map_transport)?;
        if !resp.status().is_success() {
            return Err(Self::map_status(resp.status()));
        }
        #[derive(serde::Deserialize)]
        struct FolderListing {
            folders: Vec<Folder>,
            files: Vec<File>,
        }
        let listing: FolderListing = resp.json().await.map_err(|e| CrawlError::Parse(e.to_string()))?;
        Ok((listing.folders, listing.files))
    }

    async fn download(&self, file: &File) -> Result<ByteStream, CrawlError> {
        use futures_util::StreamExt;

        let resp = self
            .client
            .get(&file.download_url)
            .send()
            .await
            .map_err(Self::map_transport)?;
        if !resp.status().is_success() {
            return Err(Self::map_status(resp.status()));
        }
        let stream = resp.bytes_stream().map(|chunk| chunk.map_err(Self::map_transport));
        Ok(Box::pin(stream))
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Deterministic in-memory `RemoteSource` for tests: scripted responses,
    /// no network. `call_counts` lets tests assert at-most-once fetch.
    #[derive(Default)]
    pub struct FakeRemoteSource {
        pub semesters: Vec<Semester>,
        pub courses: HashMap<String, Vec<Course>>,
        pub top_folders: HashMap<String, Folder>,
        pub folders: HashMap<String, (Vec<Folder>, Vec<File>)>,
        pub file_bytes: HashMap<String, Vec<u8>>,
        pub call_counts: Mutex<HashMap<String, u32>>,
        pub fail_once: Mutex<std::collections::HashSet<String>>,
    }

    impl FakeRemoteSource {
        fn record(&self, key: &str) {
            *self.call_counts.lock().unwrap().entry(key.to_string()).or_insert(0) += 1;
        }

        fn should_fail(&self, key: &str) -> bool {
            self.fail_once.lock().unwrap().remove(key)
        }
    }

    #[async_trait]
    impl RemoteSource for FakeRemoteSource {
        async fn list_semesters(&self) -> Result<Vec<Semester>, CrawlError> {
            self.record("list_semesters");
            if self.should_fail("list_semesters") {
                return Err(CrawlError::Timeout);
            }
            Ok(self.semesters.clone())
        }

        async fn list_courses(&self, semester_id: &str) -> Result<Vec<Course>, CrawlError> {
            self.record(&format!("list_courses:{semester_id}"));
            if self.should_fail(&format!("list_courses:{semester_id}")) {
                return Err(CrawlError::Timeout);
            }
            Ok(self.courses.get(semester_id).cloned().unwrap_or_default())
        }

        async fn top_folder(&self, course_id: &str) -> Result<Folder, CrawlError> {
            self.record(&format!("top_folder:{course_id}"));
            self.top_folders
                .get(course_id)
                .cloned()
                .ok_or_else(|| CrawlError::Protocol(format!("no top folder for {course_id}")))
        }

        async fn list_folder(&self, folder_id: &str) -> Result<(Vec<Folder>, Vec<File>), CrawlError> {
            self.record(&format!("list_folder:{folder_id}"));
            if self.should_fail(&format!("list_folder:{folder_id}")) {
                return Err(CrawlError::Timeout);
            }
            Ok(self.folders.get(folder_id).cloned().unwrap_or_default())
        }

        async fn download(&self, file: &File) -> Result<ByteStream, CrawlError> {
            use futures_util::stream;
            self.record(&format!("download:{}", file.id));
            let bytes = self
                .file_bytes
                .get(&file.id)
                .cloned()
                .ok_or_else(|| CrawlError::Protocol(format!("no bytes for {}", file.id)))?;
            Ok(Box::pin(stream::once(async move { Ok(bytes::Bytes::from(bytes)) })))
        }
    }

    #[tokio::test]
    async fn retries_once_on_timeout_then_succeeds() {
        let fake = FakeRemoteSource {
            semesters: vec![Semester {
                id: "s1".into(),
                title: "WS 18/19".into(),
                begin: chrono::Utc::now(),
                end: chrono::Utc::now(),
            }],
            ..Default::default()
        };
        fake.fail_once.lock().unwrap().insert("list_semesters".to_string());
        let crawler = Crawler::new(fake, 4);
        let result = crawler.list_semesters().await.unwrap();
        assert_eq!(result.len(), 1);
    }

    #[tokio::test]
    async fn second_fetch_of_a_cached_folder_does_not_reach_the_remote() {
        let mut folders = HashMap::new();
        folders.insert("f1".to_string(), (vec![], vec![]));
        let fake = FakeRemoteSource { folders, ..Default::default() };
        let crawler = Crawler::new(fake, 4);

        crawler.list_folder("f1").await.unwrap();
        crawler.list_folder("f1").await.unwrap();
        assert_eq!(*crawler.inner.call_counts.lock().unwrap().get("list_folder:f1").unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_misses_on_the_same_folder_coalesce_into_one_fetch() {
        let mut folders = HashMap::new();
        folders.insert("f1".to_string(), (vec![], vec![]));
        let fake = FakeRemoteSource { folders, ..Default::default() };
        let crawler = Arc::new(Crawler::new(fake, 4));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let crawler = crawler.clone();
            handles.push(tokio::spawn(async move { crawler.list_folder("f1").await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(*crawler.inner.call_counts.lock().unwrap().get("list_folder:f1").unwrap(), 1);
    }

    #[tokio::test]
    async fn bounded_concurrency_never_exceeds_the_limit() {
        let fake = FakeRemoteSource::default();
        let crawler = Arc::new(Crawler::new(fake, 2));
        assert_eq!(crawler.limiter.available_permits(), 2);
    }
}
