pub mod cache;
pub mod config;
pub mod document;
pub mod fetch;
pub mod search;
pub mod transport;
pub mod viewer;

pub use cache::{CacheKey, DocumentCacheStore, StoreError};
pub use config::{ConfigError, ViewerConfig, DEFAULT_ASSUMED_DOWNLOAD_SIZE};
pub use document::{
    document_id_for_path, DocumentBackend, DocumentId, DocumentInfo, DocumentInstance,
    DocumentMetadata, DocumentProvider, NormalizedRect, PageHit, RenderImage, RenderRequest,
    ViewState,
};
pub use fetch::{FetchError, FetchHandle, FetchPipeline, FetchState};
pub use search::{
    find_case_insensitive, search, Direction, MatchLocation, SearchError, SearchHighlights,
    SearchSession, SearchSummary,
};
pub use transport::{DownloadBody, HttpTransport, ProbeOutcome, Transport, TransportError};
pub use viewer::{Command, ViewerController, ViewerEvent};
