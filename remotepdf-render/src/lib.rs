use std::convert::TryFrom;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use pdfium_render::prelude::*;
use remotepdf_core::{
    document_id_for_path, DocumentBackend, DocumentInfo, DocumentMetadata, DocumentProvider,
    NormalizedRect, PageHit, RenderImage, RenderRequest,
};
use tracing::{debug, instrument, warn};

/// Runtime override for the Pdfium shared library location.
pub const PDFIUM_LIBRARY_ENV: &str = "REMOTEPDF_PDFIUM_LIBRARY_PATH";

pub struct PdfiumRenderFactory {
    pdfium: Arc<Pdfium>,
}

impl PdfiumRenderFactory {
    pub fn new() -> Result<Self> {
        let pdfium = match bind_pdfium_from_env() {
            Some(pdfium) => pdfium,
            None => bind_pdfium_default()?,
        };
        Ok(Self {
            pdfium: Arc::new(pdfium),
        })
    }
}

#[async_trait]
impl DocumentProvider for PdfiumRenderFactory {
    async fn open(&self, path: &Path) -> Result<Arc<dyn DocumentBackend>> {
        let absolute = path
            .canonicalize()
            .with_context(|| format!("failed to resolve path for {:?}", path))?;
        let info = build_document_info(&self.pdfium, &absolute)?;
        debug!(pages = info.page_count, path = %absolute.display(), "pdf loaded");
        Ok(Arc::new(PdfiumDocument::new(
            Arc::clone(&self.pdfium),
            absolute,
            info,
        )))
    }
}

struct PdfiumDocument {
    // Declared first so it drops before the bindings it borrows from.
    document: Mutex<Option<PdfDocument<'static>>>,
    last_render: Mutex<Option<RenderCacheEntry>>,
    info: DocumentInfo,
    path: PathBuf,
    pdfium: Arc<Pdfium>,
}

struct RenderCacheEntry {
    request: RenderRequest,
    image: RenderImage,
}

impl RenderCacheEntry {
    fn matches(&self, request: &RenderRequest) -> bool {
        self.request.page_index == request.page_index
            && (self.request.scale - request.scale).abs() < f32::EPSILON
            && self.request.dark_mode == request.dark_mode
    }
}

impl PdfiumDocument {
    fn new(pdfium: Arc<Pdfium>, path: PathBuf, info: DocumentInfo) -> Self {
        Self {
            document: Mutex::new(None),
            last_render: Mutex::new(None),
            info,
            path,
            pdfium,
        }
    }

    fn open_document(&self) -> Result<PdfDocument<'static>> {
        let document = self
            .pdfium
            .load_pdf_from_file(&self.path, None)
            .with_context(|| format!("failed to open {:?}", self.path))?;
        // SAFETY: the document borrows the bindings owned by `self.pdfium`. It
        // lives in `self.document`, which is declared before `pdfium` and so is
        // dropped first; the Arc keeps the bindings alive until then.
        let document = unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };
        Ok(document)
    }

    fn with_document<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PdfDocument<'static>) -> Result<R>,
    {
        let mut guard = self.document.lock();
        let document = match guard.take() {
            Some(document) => document,
            None => self.open_document()?,
        };
        let result = f(&document);
        *guard = Some(document);
        result
    }

    fn with_page<R, F>(&self, page_index: usize, f: F) -> Result<R>
    where
        F: FnOnce(&PdfPage<'_>) -> Result<R>,
    {
        self.with_document(|document| {
            let index: PdfPageIndex = page_index
                .try_into()
                .map_err(|_| anyhow!("page {} is out of supported range", page_index))?;
            let page = document
                .pages()
                .get(index)
                .with_context(|| format!("page {} out of range", page_index))?;
            f(&page)
        })
    }

    fn render_internal(&self, page: &PdfPage<'_>, request: &RenderRequest) -> Result<RenderImage> {
        let config = PdfRenderConfig::new().scale_page_by_factor(request.scale.max(0.1));
        let bitmap = page
            .render_with_config(&config)
            .with_context(|| format!("failed to render page {}", request.page_index))?;
        let mut pixels = bitmap.as_image().to_rgba8().into_raw();

        if request.dark_mode {
            invert_pixels(&mut pixels);
        }

        Ok(RenderImage {
            width: u32::try_from(bitmap.width()).unwrap_or_default(),
            height: u32::try_from(bitmap.height()).unwrap_or_default(),
            pixels,
        })
    }
}

impl DocumentBackend for PdfiumDocument {
    fn info(&self) -> &DocumentInfo {
        &self.info
    }

    #[instrument(skip(self))]
    fn render_page(&self, request: RenderRequest) -> Result<RenderImage> {
        if let Some(entry) = self.last_render.lock().as_ref() {
            if entry.matches(&request) {
                return Ok(entry.image.clone());
            }
        }

        let image = self.with_page(request.page_index, |page| {
            self.render_internal(page, &request)
        })?;

        *self.last_render.lock() = Some(RenderCacheEntry {
            request,
            image: image.clone(),
        });
        Ok(image)
    }

    fn page_text(&self, page_index: usize) -> Result<String> {
        self.with_page(page_index, |page| {
            let text = page
                .text()
                .with_context(|| format!("failed to extract text for page {}", page_index))?;
            Ok(text.all())
        })
    }

    /// Uses Pdfium's own text search so every hit carries highlight
    /// rectangles; case is ignored.
    #[instrument(skip(self))]
    fn search_page(&self, page_index: usize, query: &str) -> Result<Vec<PageHit>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        self.with_page(page_index, |page| {
            let page_width = page.width().value;
            let page_height = page.height().value;
            if page_width <= 0.0 || page_height <= 0.0 {
                warn!(page = page_index, "page has no usable size, skipping search");
                return Ok(Vec::new());
            }

            let text = page
                .text()
                .with_context(|| format!("failed to extract text for page {}", page_index))?;
            let options = PdfSearchOptions::new().match_case(false);
            let search = text
                .search(query, &options)
                .with_context(|| format!("failed to perform search on page {}", page_index))?;

            let mut hits = Vec::new();
            while let Some(segments) = search.find_next() {
                let rects = segments
                    .iter()
                    .map(|segment| {
                        let bounds = segment.bounds();
                        normalize_bounds(
                            [
                                bounds.left().value,
                                bounds.top().value,
                                bounds.right().value,
                                bounds.bottom().value,
                            ],
                            page_width,
                            page_height,
                        )
                    })
                    .filter(NormalizedRect::is_valid)
                    .collect();
                hits.push(PageHit { span: None, rects });
            }
            Ok(hits)
        })
    }
}

/// Converts PDF user-space edges (origin bottom-left) into top-left based
/// fractions of the page.
fn normalize_bounds(
    [left, top, right, bottom]: [f32; 4],
    page_width: f32,
    page_height: f32,
) -> NormalizedRect {
    NormalizedRect {
        left: left / page_width,
        top: 1.0 - top / page_height,
        right: right / page_width,
        bottom: 1.0 - bottom / page_height,
    }
    .clamp()
}

fn build_document_info(pdfium: &Pdfium, path: &Path) -> Result<DocumentInfo> {
    let document = pdfium
        .load_pdf_from_file(path, None)
        .with_context(|| format!("failed to open {:?}", path))?;
    let page_count = usize::try_from(document.pages().len()).unwrap_or_default();
    let metadata = document.metadata();

    let title = metadata
        .get(PdfDocumentMetadataTagType::Title)
        .map(|t| t.value().to_owned());

    Ok(DocumentInfo {
        id: document_id_for_path(path),
        path: path.to_path_buf(),
        page_count,
        metadata: DocumentMetadata { title },
    })
}

fn invert_pixels(pixels: &mut [u8]) {
    for chunk in pixels.chunks_exact_mut(4) {
        chunk[0] = 255 - chunk[0];
        chunk[1] = 255 - chunk[1];
        chunk[2] = 255 - chunk[2];
    }
}

fn bind_pdfium_from_env() -> Option<Pdfium> {
    let path = std::env::var(PDFIUM_LIBRARY_ENV).ok()?;
    if path.is_empty() {
        return None;
    }
    match Pdfium::bind_to_library(&path) {
        Ok(bindings) => Some(Pdfium::new(bindings)),
        Err(err) => {
            warn!("failed to load Pdfium from {}={}: {}", PDFIUM_LIBRARY_ENV, path, err);
            None
        }
    }
}

fn bind_pdfium_default() -> Result<Pdfium> {
    let mut errors = Vec::new();

    let cwd_path = Pdfium::pdfium_platform_library_name_at_path("./");
    match Pdfium::bind_to_library(&cwd_path) {
        Ok(bindings) => return Ok(Pdfium::new(bindings)),
        Err(err) => errors.push(format!("{}: {}", cwd_path.display(), err)),
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("system: {err}"));
            Err(anyhow!(
                "failed to bind to a pdfium library; set {} or install it ({})",
                PDFIUM_LIBRARY_ENV,
                errors.join(", ")
            ))
        }
    }
}
