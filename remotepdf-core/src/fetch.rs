//! Fetch-or-cache pipeline.
//!
//! Every call to [`FetchPipeline::fetch`] spawns one task that walks the
//! state machine `CheckingCache -> Downloading* -> Publishing -> Ready` (or
//! straight to `Ready` on a cache hit) and reports each transition over a
//! channel. `Ready` and `Failed` are terminal: nothing is sent after them.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace, warn};
use url::Url;

use crate::cache::{CacheKey, DocumentCacheStore};
use crate::config::DEFAULT_ASSUMED_DOWNLOAD_SIZE;
use crate::transport::{ProbeOutcome, Transport, TransportError};

/// Ceiling for progress of downloads of unknown size.
const UNKNOWN_SIZE_CEILING: f32 = 0.99;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetchError {
    #[error("download of {url} failed: {message}")]
    Network { url: String, message: String },
    #[error("failed to write {}: {message}", .path.display())]
    Io { path: PathBuf, message: String },
    #[error("fetch of {url} stopped before reporting an outcome")]
    Aborted { url: String },
}

impl FetchError {
    fn network(url: &Url, err: TransportError) -> Self {
        FetchError::Network {
            url: url.to_string(),
            message: err.to_string(),
        }
    }

    fn io(path: &Path, err: impl std::fmt::Display) -> Self {
        FetchError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FetchState {
    Idle,
    CheckingCache,
    Downloading { written: u64, expected: Option<u64> },
    Publishing,
    Ready { path: PathBuf },
    Failed { error: FetchError },
}

impl FetchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FetchState::Ready { .. } | FetchState::Failed { .. })
    }

    /// Completion fraction in `[0, 1]` for states that carry progress.
    ///
    /// Without an advertised length the fraction is measured against
    /// `assumed_size` and never reaches 1.0 until the download completes.
    pub fn progress(&self, assumed_size: u64) -> Option<f32> {
        match self {
            FetchState::Downloading { written, expected } => {
                let fraction = match expected.filter(|&len| len > 0) {
                    Some(len) => (*written as f64 / len as f64).min(1.0) as f32,
                    None => {
                        let fraction = *written as f64 / assumed_size.max(1) as f64;
                        (fraction as f32).min(UNKNOWN_SIZE_CEILING)
                    }
                };
                Some(fraction)
            }
            FetchState::Publishing | FetchState::Ready { .. } => Some(1.0),
            _ => None,
        }
    }
}

/// Receiving end of a single fetch.
pub struct FetchHandle {
    url: Url,
    rx: mpsc::UnboundedReceiver<FetchState>,
    state: FetchState,
    assumed_size: u64,
}

impl FetchHandle {
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Last observed state; `Idle` until the first transition arrives.
    pub fn state(&self) -> &FetchState {
        &self.state
    }

    pub fn progress(&self) -> Option<f32> {
        self.state.progress(self.assumed_size)
    }

    /// Waits for the next transition. Returns `None` once a terminal state
    /// has been observed.
    pub async fn next_state(&mut self) -> Option<FetchState> {
        if self.state.is_terminal() {
            return None;
        }
        let next = self.rx.recv().await?;
        self.state = next.clone();
        Some(next)
    }

    pub async fn finish(mut self) -> Result<PathBuf, FetchError> {
        while self.next_state().await.is_some() {}
        match self.state {
            FetchState::Ready { path } => Ok(path),
            FetchState::Failed { error } => Err(error),
            _ => Err(FetchError::Aborted {
                url: self.url.to_string(),
            }),
        }
    }
}

struct EventSink {
    tx: mpsc::UnboundedSender<FetchState>,
}

impl EventSink {
    fn emit(&self, state: FetchState) {
        trace!(?state, "fetch transition");
        // A consumer that stopped listening does not stop the fetch.
        let _ = self.tx.send(state);
    }
}

#[derive(Clone)]
pub struct FetchPipeline {
    store: DocumentCacheStore,
    transport: Arc<dyn Transport>,
    assumed_size: u64,
}

impl FetchPipeline {
    pub fn new(store: DocumentCacheStore, transport: Arc<dyn Transport>) -> Self {
        Self {
            store,
            transport,
            assumed_size: DEFAULT_ASSUMED_DOWNLOAD_SIZE,
        }
    }

    pub fn with_assumed_size(mut self, assumed_size: u64) -> Self {
        self.assumed_size = assumed_size.max(1);
        self
    }

    pub fn store(&self) -> &DocumentCacheStore {
        &self.store
    }

    pub async fn probe(&self, url: &Url) -> ProbeOutcome {
        self.transport.probe(url).await
    }

    /// Starts fetching `url` on the tokio runtime and returns the handle
    /// that receives its transitions.
    pub fn fetch(&self, url: Url) -> FetchHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let pipeline = self.clone();
        let task_url = url.clone();
        tokio::spawn(async move { pipeline.run(task_url, EventSink { tx }).await });
        FetchHandle {
            url,
            rx,
            state: FetchState::Idle,
            assumed_size: self.assumed_size,
        }
    }

    #[instrument(skip_all, fields(url = %url))]
    async fn run(self, url: Url, events: EventSink) {
        let terminal = match self.drive(&url, &events).await {
            Ok(path) => {
                info!(path = %path.display(), "document ready");
                FetchState::Ready { path }
            }
            Err(error) => {
                warn!(%error, "fetch failed");
                FetchState::Failed { error }
            }
        };
        events.emit(terminal);
    }

    async fn drive(&self, url: &Url, events: &EventSink) -> Result<PathBuf, FetchError> {
        let key = CacheKey::encode(url);
        events.emit(FetchState::CheckingCache);
        if let Some(path) = self.store.lookup(&key) {
            debug!(key = %key, "serving cached document");
            return Ok(path);
        }

        let staged = self.download(url, events).await?;

        events.emit(FetchState::Publishing);
        let store = self.store.clone();
        let destination = store.path_for(&key);
        let published = tokio::task::spawn_blocking(move || store.persist(staged, &key)).await;

        match published {
            Ok(Ok(path)) => Ok(path),
            Ok(Err(err)) => Err(FetchError::io(&destination, err)),
            Err(err) => Err(FetchError::io(&destination, err)),
        }
    }

    /// Streams the body into a staging file. The file is deleted if any
    /// step fails, since it is dropped with the error.
    async fn download(&self, url: &Url, events: &EventSink) -> Result<NamedTempFile, FetchError> {
        let mut staged = self
            .store
            .staging_file()
            .map_err(|err| FetchError::io(self.store.root(), err))?;

        let mut body = self
            .transport
            .start(url)
            .await
            .map_err(|err| FetchError::network(url, err))?;
        let expected = body.expected_len();
        let mut written = 0u64;
        events.emit(FetchState::Downloading { written, expected });

        while let Some(chunk) = body
            .next_chunk()
            .await
            .map_err(|err| FetchError::network(url, err))?
        {
            staged
                .write_all(&chunk)
                .map_err(|err| FetchError::io(staged.path(), err))?;
            written += chunk.len() as u64;
            events.emit(FetchState::Downloading { written, expected });
        }
        staged
            .flush()
            .map_err(|err| FetchError::io(staged.path(), err))?;

        debug!(written, ?expected, "download complete");
        Ok(staged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use tempfile::tempdir;

    use crate::transport::DownloadBody;

    #[derive(Clone)]
    enum Script {
        Serve {
            chunks: Vec<&'static [u8]>,
            advertise: bool,
        },
        Status(u16),
        BreakAfter(Vec<&'static [u8]>),
    }

    struct ScriptedTransport {
        script: Script,
        starts: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script,
                starts: AtomicUsize::new(0),
            })
        }

        fn starts(&self) -> usize {
            self.starts.load(Ordering::SeqCst)
        }
    }

    struct ScriptedBody {
        chunks: VecDeque<Result<Bytes, TransportError>>,
        expected: Option<u64>,
    }

    #[async_trait]
    impl DownloadBody for ScriptedBody {
        fn expected_len(&self) -> Option<u64> {
            self.expected
        }

        async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
            self.chunks.pop_front().transpose()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn start(&self, _url: &Url) -> Result<Box<dyn DownloadBody>, TransportError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            let body = match &self.script {
                Script::Serve { chunks, advertise } => {
                    let total: usize = chunks.iter().map(|c| c.len()).sum();
                    ScriptedBody {
                        chunks: chunks.iter().map(|c| Ok(Bytes::from_static(*c))).collect(),
                        expected: advertise.then_some(total as u64),
                    }
                }
                Script::Status(status) => {
                    return Err(TransportError::Status { status: *status });
                }
                Script::BreakAfter(chunks) => {
                    let mut queue: VecDeque<_> =
                        chunks.iter().map(|c| Ok(Bytes::from_static(*c))).collect();
                    queue.push_back(Err(TransportError::Interrupted(
                        "connection reset by peer".to_string(),
                    )));
                    ScriptedBody {
                        chunks: queue,
                        expected: None,
                    }
                }
            };
            Ok(Box::new(body))
        }

        async fn probe(&self, _url: &Url) -> ProbeOutcome {
            ProbeOutcome::Pdf
        }
    }

    fn doc_url() -> Url {
        Url::parse("https://example.com/doc.pdf").unwrap()
    }

    fn pipeline(store: &DocumentCacheStore, transport: Arc<ScriptedTransport>) -> FetchPipeline {
        FetchPipeline::new(store.clone(), transport)
    }

    async fn collect(mut handle: FetchHandle) -> Vec<FetchState> {
        let mut states = Vec::new();
        while let Some(state) = handle.next_state().await {
            states.push(state);
        }
        states
    }

    fn serve_pdf(advertise: bool) -> Script {
        Script::Serve {
            chunks: vec![&b"%PDF-1.7\n"[..], &b"1 0 obj\n"[..], &b"%%EOF"[..]],
            advertise,
        }
    }

    #[tokio::test]
    async fn cache_miss_downloads_publishes_and_reports_each_step() {
        let dir = tempdir().unwrap();
        let store = DocumentCacheStore::open(dir.path().to_path_buf()).unwrap();
        let transport = ScriptedTransport::new(serve_pdf(true));

        let states = collect(pipeline(&store, transport.clone()).fetch(doc_url())).await;

        let expected_path = dir.path().join(CacheKey::encode(&doc_url()).as_str());
        assert_eq!(
            states,
            vec![
                FetchState::CheckingCache,
                FetchState::Downloading {
                    written: 0,
                    expected: Some(22)
                },
                FetchState::Downloading {
                    written: 9,
                    expected: Some(22)
                },
                FetchState::Downloading {
                    written: 17,
                    expected: Some(22)
                },
                FetchState::Downloading {
                    written: 22,
                    expected: Some(22)
                },
                FetchState::Publishing,
                FetchState::Ready {
                    path: expected_path.clone()
                },
            ]
        );
        assert_eq!(
            fs::read(&expected_path).unwrap(),
            b"%PDF-1.7\n1 0 obj\n%%EOF"
        );
        assert_eq!(transport.starts(), 1);
        // Only the published artifact remains; staging files are gone.
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn second_fetch_is_served_from_cache_without_progress() {
        let dir = tempdir().unwrap();
        let store = DocumentCacheStore::open(dir.path().to_path_buf()).unwrap();
        let transport = ScriptedTransport::new(serve_pdf(true));
        let pipeline = pipeline(&store, transport.clone());

        let first = pipeline.fetch(doc_url()).finish().await.unwrap();
        let states = collect(pipeline.fetch(doc_url())).await;

        assert_eq!(
            states,
            vec![
                FetchState::CheckingCache,
                FetchState::Ready {
                    path: first.clone()
                }
            ]
        );
        assert_eq!(transport.starts(), 1);
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_completes_before_terminal_state() {
        let dir = tempdir().unwrap();
        let store = DocumentCacheStore::open(dir.path().to_path_buf()).unwrap();
        let transport = ScriptedTransport::new(serve_pdf(true));

        let mut handle = pipeline(&store, transport).fetch(doc_url());
        let mut fractions = Vec::new();
        while let Some(state) = handle.next_state().await {
            if state.is_terminal() {
                break;
            }
            if let Some(fraction) = handle.progress() {
                fractions.push(fraction);
            }
        }

        assert!(fractions.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(fractions.first().copied(), Some(0.0));
        assert_eq!(fractions.last().copied(), Some(1.0));
    }

    #[tokio::test]
    async fn unknown_length_progress_saturates_below_completion() {
        let dir = tempdir().unwrap();
        let store = DocumentCacheStore::open(dir.path().to_path_buf()).unwrap();
        let transport = ScriptedTransport::new(serve_pdf(false));

        let mut handle = pipeline(&store, transport)
            .with_assumed_size(10)
            .fetch(doc_url());
        let mut fractions = Vec::new();
        while let Some(state) = handle.next_state().await {
            if matches!(state, FetchState::Downloading { .. }) {
                fractions.push(handle.progress().unwrap());
            }
        }

        assert!(fractions.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(fractions.iter().all(|&f| f < 1.0));
        assert!(matches!(handle.state(), FetchState::Ready { .. }));
        assert_eq!(handle.progress(), Some(1.0));
    }

    #[tokio::test]
    async fn error_status_fails_without_creating_an_entry() {
        let dir = tempdir().unwrap();
        let store = DocumentCacheStore::open(dir.path().to_path_buf()).unwrap();
        let transport = ScriptedTransport::new(Script::Status(404));

        let states = collect(pipeline(&store, transport).fetch(doc_url())).await;

        assert_eq!(states.len(), 2);
        assert_eq!(states[0], FetchState::CheckingCache);
        match &states[1] {
            FetchState::Failed {
                error: FetchError::Network { url, message },
            } => {
                assert_eq!(url, "https://example.com/doc.pdf");
                assert!(message.contains("404"));
            }
            other => panic!("unexpected state: {:?}", other),
        }
        assert!(store.lookup(&CacheKey::encode(&doc_url())).is_none());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn interrupted_body_discards_partial_download_and_allows_retry() {
        let dir = tempdir().unwrap();
        let store = DocumentCacheStore::open(dir.path().to_path_buf()).unwrap();
        let broken = ScriptedTransport::new(Script::BreakAfter(vec![&b"%PDF-1.7\n"[..]]));

        let states = collect(pipeline(&store, broken).fetch(doc_url())).await;
        assert!(matches!(
            states.last(),
            Some(FetchState::Failed {
                error: FetchError::Network { .. }
            })
        ));
        assert!(!states.contains(&FetchState::Publishing));
        assert!(store.lookup(&CacheKey::encode(&doc_url())).is_none());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);

        let healthy = ScriptedTransport::new(serve_pdf(true));
        let states = collect(pipeline(&store, healthy.clone()).fetch(doc_url())).await;
        assert!(states
            .iter()
            .any(|state| matches!(state, FetchState::Downloading { .. })));
        assert!(matches!(states.last(), Some(FetchState::Ready { .. })));
        assert_eq!(healthy.starts(), 1);
    }

    #[tokio::test]
    async fn publish_failure_is_reported_as_io_error() {
        let dir = tempdir().unwrap();
        let store = DocumentCacheStore::open(dir.path().to_path_buf()).unwrap();
        let key = CacheKey::encode(&doc_url());
        // A non-empty directory squatting on the entry path cannot be replaced.
        let squatter = store.path_for(&key);
        fs::create_dir_all(squatter.join("occupied")).unwrap();

        let transport = ScriptedTransport::new(serve_pdf(true));
        let result = pipeline(&store, transport).fetch(doc_url()).finish().await;

        match result {
            Err(FetchError::Io { path, .. }) => assert_eq!(path, squatter),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn unwritable_staging_area_is_reported_as_io_error() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("cache");
        let store = DocumentCacheStore::open(root.clone()).unwrap();
        // The cache root turns into a plain file, so nothing can be staged in it.
        fs::remove_dir(&root).unwrap();
        fs::write(&root, b"not a directory").unwrap();

        let transport = ScriptedTransport::new(serve_pdf(true));
        let states = collect(pipeline(&store, transport.clone()).fetch(doc_url())).await;

        assert_eq!(states.len(), 2);
        assert_eq!(states[0], FetchState::CheckingCache);
        match &states[1] {
            FetchState::Failed {
                error: FetchError::Io { path, .. },
            } => assert_eq!(path, &root),
            other => panic!("unexpected state: {:?}", other),
        }
        assert_eq!(transport.starts(), 0);
        assert!(store.lookup(&CacheKey::encode(&doc_url())).is_none());
        assert_eq!(fs::read(&root).unwrap(), b"not a directory");
    }

    #[tokio::test]
    async fn dropped_handle_does_not_cancel_download() {
        let dir = tempdir().unwrap();
        let store = DocumentCacheStore::open(dir.path().to_path_buf()).unwrap();
        let transport = ScriptedTransport::new(serve_pdf(false));
        let pipeline = pipeline(&store, transport.clone());

        drop(pipeline.fetch(doc_url()));
        let key = CacheKey::encode(&doc_url());
        for _ in 0..200 {
            if store.lookup(&key).is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        assert!(store.lookup(&key).is_some());
        assert_eq!(transport.starts(), 1);
    }

    #[test]
    fn fetch_state_serializes_with_state_tag() {
        let json = serde_json::to_string(&FetchState::Downloading {
            written: 5,
            expected: None,
        })
        .unwrap();
        assert_eq!(json, r#"{"state":"downloading","written":5,"expected":null}"#);

        let failed = serde_json::to_value(FetchState::Failed {
            error: FetchError::Network {
                url: "https://example.com/doc.pdf".to_string(),
                message: "timed out".to_string(),
            },
        })
        .unwrap();
        assert_eq!(failed["state"], "failed");
        assert_eq!(failed["error"]["kind"], "network");
    }
}
