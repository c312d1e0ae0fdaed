use std::collections::HashMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::search::{find_case_insensitive, SearchSession};

pub type DocumentId = Uuid;

static DOCUMENT_NAMESPACE: Lazy<Uuid> =
    Lazy::new(|| Uuid::new_v5(&Uuid::NAMESPACE_URL, b"remotepdf:document"));

pub fn document_id_for_path(path: &Path) -> DocumentId {
    let resolved = path
        .canonicalize()
        .or_else(|_| {
            if path.is_absolute() {
                Ok(path.to_path_buf())
            } else {
                std::env::current_dir().map(|cwd| cwd.join(path))
            }
        })
        .unwrap_or_else(|_| path.to_path_buf());
    let rendered = resolved.to_string_lossy();
    Uuid::new_v5(&*DOCUMENT_NAMESPACE, rendered.as_bytes())
}

#[derive(Debug, Clone, Default)]
pub struct DocumentMetadata {
    pub title: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DocumentInfo {
    pub id: DocumentId,
    pub path: PathBuf,
    pub page_count: usize,
    pub metadata: DocumentMetadata,
}

#[derive(Debug, Clone, Copy)]
pub struct RenderRequest {
    pub page_index: usize,
    pub scale: f32,
    pub dark_mode: bool,
}

impl Default for RenderRequest {
    fn default() -> Self {
        Self {
            page_index: 0,
            scale: 1.0,
            dark_mode: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// Rectangle in page space, each edge expressed as a fraction of the page
/// width or height with the origin at the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NormalizedRect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl NormalizedRect {
    pub fn clamp(self) -> Self {
        let left = self.left.min(self.right).clamp(0.0, 1.0);
        let right = self.left.max(self.right).clamp(0.0, 1.0);
        let top = self.top.min(self.bottom).clamp(0.0, 1.0);
        let bottom = self.top.max(self.bottom).clamp(0.0, 1.0);
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.right > self.left && self.bottom > self.top
    }
}

/// One occurrence of a query on a single page, in whatever addressing the
/// backend can provide.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PageHit {
    pub span: Option<Range<usize>>,
    pub rects: Vec<NormalizedRect>,
}

pub trait DocumentBackend: Send + Sync {
    fn info(&self) -> &DocumentInfo;
    fn render_page(&self, request: RenderRequest) -> Result<RenderImage>;
    fn page_text(&self, page_index: usize) -> Result<String>;

    /// Case-insensitive occurrences of `query` on one page, in reading order.
    ///
    /// Backends with a native text search should override this to report
    /// highlight rectangles; the fallback only knows text offsets.
    fn search_page(&self, page_index: usize, query: &str) -> Result<Vec<PageHit>> {
        let text = self.page_text(page_index)?;
        Ok(find_case_insensitive(&text, query)
            .into_iter()
            .map(|span| PageHit {
                span: Some(span),
                rects: Vec::new(),
            })
            .collect())
    }
}

#[async_trait::async_trait]
pub trait DocumentProvider: Send + Sync {
    async fn open(&self, path: &Path) -> Result<Arc<dyn DocumentBackend>>;
}

#[derive(Debug, Clone, Copy)]
pub struct ViewState {
    pub current_page: usize,
    pub scale: f32,
    pub dark_mode: bool,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            current_page: 0,
            scale: 1.0,
            dark_mode: false,
        }
    }
}

pub struct DocumentInstance {
    pub info: DocumentInfo,
    pub backend: Arc<dyn DocumentBackend>,
    pub state: ViewState,
    pub search: SearchSession,
    render_cache: Mutex<HashMap<RenderKey, RenderImage>>,
    render_cache_capacity: usize,
}

impl DocumentInstance {
    pub fn new(backend: Arc<dyn DocumentBackend>, render_cache_capacity: usize) -> Self {
        Self {
            info: backend.info().clone(),
            backend,
            state: ViewState::default(),
            search: SearchSession::default(),
            render_cache: Mutex::new(HashMap::new()),
            render_cache_capacity: render_cache_capacity.max(1),
        }
    }

    pub fn render(&self) -> Result<RenderImage> {
        self.render_with_scale(self.state.scale)
    }

    pub fn render_with_scale(&self, scale: f32) -> Result<RenderImage> {
        self.render_page_internal(
            self.state.current_page,
            scale,
            self.state.dark_mode,
            self.state.current_page,
        )
    }

    pub fn prefetch_neighbors(&self, range: usize, scale: f32) -> Result<()> {
        let current_page = self.state.current_page;
        let dark_mode = self.state.dark_mode;
        let mut last_error = None;

        for offset in 1..=range {
            let neighbors = [current_page.checked_sub(offset), current_page.checked_add(offset)];
            for page in neighbors.into_iter().flatten() {
                if page >= self.info.page_count {
                    continue;
                }
                if let Err(err) = self.render_page_internal(page, scale, dark_mode, current_page) {
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn cached_pages(&self) -> usize {
        self.render_cache.lock().len()
    }

    fn render_page_internal(
        &self,
        page_index: usize,
        scale: f32,
        dark_mode: bool,
        reference_page: usize,
    ) -> Result<RenderImage> {
        if page_index >= self.info.page_count {
            return Err(anyhow!("page {} out of range", page_index));
        }

        let key = RenderKey::new(page_index, scale, dark_mode);
        if let Some(image) = self.render_cache.lock().get(&key).cloned() {
            return Ok(image);
        }

        let image = self.backend.render_page(RenderRequest {
            page_index,
            scale,
            dark_mode,
        })?;
        self.store_cached_render(key, &image, reference_page);
        Ok(image)
    }

    fn store_cached_render(&self, key: RenderKey, image: &RenderImage, reference_page: usize) {
        let mut cache = self.render_cache.lock();
        cache.insert(key, image.clone());

        if cache.len() > self.render_cache_capacity {
            let mut keys: Vec<_> = cache.keys().copied().collect();
            keys.sort_by_key(|k| k.distance(reference_page));
            for stale in keys.into_iter().skip(self.render_cache_capacity) {
                cache.remove(&stale);
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
struct RenderKey {
    page_index: usize,
    scale_milli: u32,
    dark_mode: bool,
}

impl RenderKey {
    fn new(page_index: usize, scale: f32, dark_mode: bool) -> Self {
        Self {
            page_index,
            scale_milli: quantize_scale(scale),
            dark_mode,
        }
    }

    fn distance(&self, reference_page: usize) -> usize {
        self.page_index.abs_diff(reference_page)
    }
}

fn quantize_scale(scale: f32) -> u32 {
    let scaled = (scale * 1000.0).round();
    if !scaled.is_finite() || scaled <= 0.0 {
        1
    } else if scaled > u32::MAX as f32 {
        u32::MAX
    } else {
        scaled as u32
    }
}
