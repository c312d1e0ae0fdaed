use std::path::PathBuf;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{debug, instrument};
use url::Url;

use crate::cache::CacheKey;
use crate::document::{DocumentId, DocumentInstance, DocumentProvider};
use crate::fetch::{FetchHandle, FetchPipeline};
use crate::search::{self, Direction, SearchError};
use crate::transport::ProbeOutcome;

const MIN_SCALE: f32 = 0.25;
const MAX_SCALE: f32 = 4.0;

#[derive(Debug, Clone)]
pub enum Command {
    NextPage { count: usize },
    PrevPage { count: usize },
    GotoPage { page: usize },
    ScaleBy { factor: f32 },
    ToggleDarkMode,
    Search { query: String },
    SearchNext { count: usize },
    SearchPrev { count: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerEvent {
    DocumentOpened(DocumentId),
    RedrawNeeded(DocumentId),
    SearchUpdated(DocumentId),
}

/// Owns the open document and routes fetches, searches and page movement.
pub struct ViewerController {
    pipeline: FetchPipeline,
    document: Option<DocumentInstance>,
    events: Mutex<Vec<ViewerEvent>>,
    render_cache_capacity: usize,
}

impl ViewerController {
    pub fn new(pipeline: FetchPipeline, render_cache_capacity: usize) -> Self {
        Self {
            pipeline,
            document: None,
            events: Mutex::new(Vec::new()),
            render_cache_capacity,
        }
    }

    pub fn drain_events(&self) -> Vec<ViewerEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn active(&self) -> Option<&DocumentInstance> {
        self.document.as_ref()
    }

    pub fn fetch_document(&self, url: Url) -> FetchHandle {
        self.pipeline.fetch(url)
    }

    /// Local path of `url` when it is already cached. Never touches the
    /// network.
    pub fn cached_path(&self, url: &Url) -> Option<PathBuf> {
        self.pipeline.store().lookup(&CacheKey::encode(url))
    }

    pub async fn probe(&self, url: &Url) -> ProbeOutcome {
        self.pipeline.probe(url).await
    }

    /// Loads `path` and makes it the active document with a fresh view and
    /// no search session.
    #[instrument(skip(self, provider))]
    pub async fn open_with<P: DocumentProvider + ?Sized>(
        &mut self,
        provider: &P,
        path: PathBuf,
    ) -> Result<()> {
        let backend = provider.open(&path).await?;
        let doc = DocumentInstance::new(backend, self.render_cache_capacity);
        let id = doc.info.id;
        debug!(pages = doc.info.page_count, "document opened");
        self.document = Some(doc);
        self.events.lock().push(ViewerEvent::DocumentOpened(id));
        Ok(())
    }

    pub fn apply(&mut self, command: Command) -> Result<()> {
        let Some(doc) = self.document.as_mut() else {
            return Ok(());
        };
        let id = doc.info.id;
        let last_page = doc.info.page_count.saturating_sub(1);

        match command {
            Command::NextPage { count } => {
                let next = doc.state.current_page.saturating_add(count).min(last_page);
                self.move_to(next);
            }
            Command::PrevPage { count } => {
                let next = doc.state.current_page.saturating_sub(count);
                self.move_to(next);
            }
            Command::GotoPage { page } => {
                self.move_to(page.min(last_page));
            }
            Command::ScaleBy { factor } => {
                let scale = (doc.state.scale * factor).clamp(MIN_SCALE, MAX_SCALE);
                if (doc.state.scale - scale).abs() > f32::EPSILON {
                    doc.state.scale = scale;
                    self.events.lock().push(ViewerEvent::RedrawNeeded(id));
                }
            }
            Command::ToggleDarkMode => {
                doc.state.dark_mode = !doc.state.dark_mode;
                self.events.lock().push(ViewerEvent::RedrawNeeded(id));
            }
            Command::Search { query } => {
                doc.search = search::search(doc.backend.as_ref(), &query)?;
                self.events.lock().push(ViewerEvent::SearchUpdated(id));
                self.go_to_selection();
            }
            Command::SearchNext { count } => self.step_search(Direction::Next, count)?,
            Command::SearchPrev { count } => self.step_search(Direction::Previous, count)?,
        }
        Ok(())
    }

    fn step_search(&mut self, direction: Direction, count: usize) -> Result<()> {
        let Some(doc) = self.document.as_mut() else {
            return Ok(());
        };
        match doc.search.advance(direction, count.max(1)) {
            Ok(_) => {}
            Err(SearchError::EmptySession) => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        self.events
            .lock()
            .push(ViewerEvent::SearchUpdated(doc.info.id));
        self.go_to_selection();
        Ok(())
    }

    /// Moves to the page of the selected match, redrawing even when the page
    /// stays the same since the emphasised highlight moved.
    fn go_to_selection(&mut self) {
        let Some(doc) = self.document.as_mut() else {
            return;
        };
        let Ok(selected) = doc.search.current() else {
            return;
        };
        doc.state.current_page = selected.page_index;
        self.events
            .lock()
            .push(ViewerEvent::RedrawNeeded(doc.info.id));
    }

    fn move_to(&mut self, page: usize) {
        let Some(doc) = self.document.as_mut() else {
            return;
        };
        if page != doc.state.current_page {
            doc.state.current_page = page;
            self.events
                .lock()
                .push(ViewerEvent::RedrawNeeded(doc.info.id));
        }
    }
}
