use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use crossterm::cursor;
use crossterm::event;
use crossterm::terminal::{self, Clear, ClearType};
use directories::ProjectDirs;
use remotepdf_core::{
    Command, DocumentCacheStore, DocumentInfo, DocumentInstance, FetchPipeline, HttpTransport,
    NormalizedRect, ProbeOutcome, RenderImage, SearchHighlights, ViewerConfig, ViewerController,
};
use remotepdf_render::PdfiumRenderFactory;
use remotepdf_tty::{
    write_status_line, DrawParams, EventMapper, KittyRenderer, ProgressLine, UiEvent,
};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};
use url::Url;

#[derive(Debug, Parser)]
#[command(
    name = "remotepdf",
    version,
    about = "Fetch a PDF by URL into a local cache and view it in a kitty terminal"
)]
struct Args {
    /// Configuration file (TOML)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Directory holding cached documents
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Skip the HEAD request that checks the URL serves a PDF
    #[arg(long)]
    no_probe: bool,

    /// Fetch into the cache, print the local path and exit
    #[arg(long)]
    fetch_only: bool,

    /// With --fetch-only, print every fetch state as a JSON line
    #[arg(long, requires = "fetch_only")]
    json: bool,

    /// Search for this text once the document is open
    #[arg(
        short = 's',
        long = "search",
        value_name = "TEXT",
        conflicts_with = "fetch_only"
    )]
    search: Option<String>,

    /// Address of the document
    url: Url,
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> anyhow::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, cursor::Show);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "remotepdf", "remotepdf")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| project_dirs.config_dir().join("config.toml"));
    let config = ViewerConfig::load(&config_path)?;
    let cache_root = args
        .cache_dir
        .clone()
        .or_else(|| config.cache_dir.clone())
        .unwrap_or_else(|| project_dirs.cache_dir().join("documents"));

    let store = DocumentCacheStore::open(cache_root.clone())
        .with_context(|| format!("failed to open cache directory {:?}", cache_root))?;
    let transport = HttpTransport::new(&config).context("failed to build HTTP client")?;
    let pipeline = FetchPipeline::new(store, Arc::new(transport))
        .with_assumed_size(config.assumed_download_size);
    let mut controller = ViewerController::new(pipeline, config.render_cache_capacity);

    if controller.cached_path(&args.url).is_some() {
        info!(url = %args.url, "serving cached copy without contacting the server");
    } else if config.probe_before_fetch && !args.no_probe {
        match controller.probe(&args.url).await {
            ProbeOutcome::Pdf => {}
            ProbeOutcome::NotPdf { content_type } => bail!(
                "{} does not look like a PDF (content type: {})",
                args.url,
                content_type.as_deref().unwrap_or("unknown")
            ),
            ProbeOutcome::Unreachable { message } => {
                bail!("{} is not reachable: {}", args.url, message)
            }
        }
    }

    let path = fetch(&controller, &args).await?;
    if args.fetch_only {
        if !args.json {
            println!("{}", path.display());
        }
        return Ok(());
    }

    let provider = PdfiumRenderFactory::new()?;
    controller
        .open_with(&provider, path.clone())
        .await
        .with_context(|| format!("failed to open {:?}", path))?;
    if let Some(query) = args.search.clone() {
        controller.apply(Command::Search { query })?;
    }

    run_viewer(&mut controller)
}

/// Drives one fetch to completion, reporting progress on stderr or as JSON
/// lines on stdout.
async fn fetch(controller: &ViewerController, args: &Args) -> Result<PathBuf> {
    let mut handle = controller.fetch_document(args.url.clone());
    let progress_line = ProgressLine::default();
    let mut stderr = io::stderr();

    while let Some(state) = handle.next_state().await {
        if args.json {
            println!("{}", serde_json::to_string(&state)?);
        } else {
            progress_line.draw(&mut stderr, &state, handle.progress())?;
        }
    }
    if !args.json {
        writeln!(stderr)?;
    }

    let path = handle.finish().await?;
    info!(url = %args.url, path = %path.display(), "document available");
    Ok(path)
}

fn run_viewer(controller: &mut ViewerController) -> Result<()> {
    let _raw = RawModeGuard::new()?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, cursor::Hide)?;
    let mut renderer = KittyRenderer::new(stdout);
    let mut event_mapper = EventMapper::new();
    let mut dirty = true;

    renderer.clear_all()?;
    controller.drain_events();

    loop {
        if dirty {
            let pending = event_mapper.pending_input();
            redraw(&mut renderer, controller, pending.as_deref())?;
            dirty = false;
        }

        if event::poll(Duration::from_millis(100))? {
            let ui_event = event_mapper.map_event(event::read()?);
            match handle_event(ui_event, controller)? {
                LoopAction::ContinueRedraw => dirty = true,
                LoopAction::Continue => {}
                LoopAction::Quit => break,
            }
            if !dirty {
                let pending = event_mapper.pending_input();
                let base = controller.active().map(format_document_status);
                if let Some(status) = combine_status(base, pending.as_deref()) {
                    draw_status_line(&mut renderer, &status)?;
                }
            }
        }
    }

    renderer.clear_all()?;
    Ok(())
}

enum LoopAction {
    Continue,
    ContinueRedraw,
    Quit,
}

fn handle_event(event: UiEvent, controller: &mut ViewerController) -> Result<LoopAction> {
    let command = match event {
        UiEvent::Quit => return Ok(LoopAction::Quit),
        UiEvent::SearchSubmit { query } => Command::Search { query },
        UiEvent::SearchCancel => Command::Search {
            query: String::new(),
        },
        UiEvent::Command(command) => command,
        UiEvent::BeginSearch | UiEvent::SearchQueryChanged { .. } | UiEvent::None => {
            return Ok(LoopAction::Continue)
        }
    };

    controller.apply(command)?;
    if controller.drain_events().is_empty() {
        Ok(LoopAction::Continue)
    } else {
        Ok(LoopAction::ContinueRedraw)
    }
}

fn redraw(
    renderer: &mut KittyRenderer<io::Stdout>,
    controller: &ViewerController,
    pending_input: Option<&str>,
) -> Result<()> {
    let Some(doc) = controller.active() else {
        return Ok(());
    };

    let window = terminal::window_size()?;
    let total_cols = u32::from(window.columns).max(1);
    let total_rows = u32::from(window.rows).max(1);
    let pixel_width = u32::from(window.width);
    let pixel_height = u32::from(window.height);
    let image_rows_available = total_rows.saturating_sub(1).max(1);

    let margin_cols = total_cols.min(2);
    let margin_rows = image_rows_available.min(2);
    let available_cols = total_cols.saturating_sub(margin_cols).max(1);
    let available_rows = image_rows_available.saturating_sub(margin_rows).max(1);

    let zoom = doc.state.scale;
    let mut render_scale = zoom;
    let mut image = doc.render_with_scale(render_scale)?;

    // Re-render sharper when the page would be upscaled by the terminal.
    if pixel_width > 0 && pixel_height > 0 && image.width > 0 && image.height > 0 {
        let cell_width = pixel_width as f32 / total_cols as f32;
        let cell_height = pixel_height as f32 / total_rows as f32;
        let width_ratio = cell_width * available_cols as f32 / image.width as f32;
        let height_ratio = cell_height * available_rows as f32 / image.height as f32;
        let scale_ratio = width_ratio.min(height_ratio);
        if scale_ratio.is_finite() && scale_ratio > 1.05 {
            render_scale = (zoom * scale_ratio).min(8.0);
            image = doc.render_with_scale(render_scale)?;
        }
    }

    let mut crop = None;
    if zoom > 1.0 {
        let (width, height) = (
            ((image.width as f32 / zoom).round() as u32).clamp(1, image.width.max(1)),
            ((image.height as f32 / zoom).round() as u32).clamp(1, image.height.max(1)),
        );
        if width < image.width || height < image.height {
            let region = CropRegion {
                offset_x: (image.width - width) / 2,
                offset_y: (image.height - height) / 2,
                width,
                height,
            };
            crop = Some(region);
        }
    }

    let geometry = HighlightGeometry {
        base_width: image.width,
        base_height: image.height,
        crop,
    };
    let mut display_image = match crop {
        Some(region) => crop_render_image(&image, region),
        None => image,
    };
    apply_search_highlights(
        &mut display_image,
        &doc.search.highlights_for_page(doc.state.current_page),
        &geometry,
    );

    let scale_for_cells = zoom.max(1.0);
    let (draw_cols, draw_rows) = compute_scaled_dimensions(
        &display_image,
        display_image.width as f32 * scale_for_cells,
        display_image.height as f32 * scale_for_cells,
        (available_cols, available_rows),
        (total_cols, total_rows),
        (pixel_width, pixel_height),
    );
    let start_col = total_cols.saturating_sub(draw_cols) / 2;
    let start_row = image_rows_available.saturating_sub(draw_rows) / 2;

    renderer.begin_sync_update()?;
    crossterm::execute!(
        renderer.writer(),
        Clear(ClearType::All),
        cursor::MoveTo(start_col as u16, start_row as u16)
    )?;
    renderer.draw(&display_image, DrawParams::clamped(draw_cols, draw_rows))?;
    if let Some(status) = combine_status(Some(format_document_status(doc)), pending_input) {
        draw_status_line(renderer, &status)?;
    }
    renderer.end_sync_update()?;

    if let Err(err) = doc.prefetch_neighbors(1, render_scale) {
        warn!(
            ?err,
            page = doc.state.current_page,
            "failed to prefetch neighboring pages"
        );
    }

    Ok(())
}

fn combine_status(base: Option<String>, pending_input: Option<&str>) -> Option<String> {
    match (base, pending_input.filter(|s| !s.is_empty())) {
        (Some(mut base), Some(pending)) => {
            base.push_str(" | ");
            base.push_str(pending);
            Some(base)
        }
        (Some(base), None) => Some(base),
        (None, Some(pending)) => Some(pending.to_string()),
        (None, None) => None,
    }
}

fn draw_status_line(renderer: &mut KittyRenderer<io::Stdout>, status: &str) -> Result<()> {
    let window = terminal::window_size()?;
    let status_row = u32::from(window.rows).max(1).saturating_sub(1);
    let writer = renderer.writer();
    crossterm::execute!(
        writer,
        cursor::MoveTo(0, status_row as u16),
        Clear(ClearType::CurrentLine)
    )?;
    write_status_line(writer, status)?;
    Ok(())
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "remotepdf.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}

/// Number of terminal cells the image should cover, keeping its aspect
/// ratio and staying inside the available area.
fn compute_scaled_dimensions(
    image: &RenderImage,
    effective_pixel_width: f32,
    effective_pixel_height: f32,
    (available_cols, available_rows): (u32, u32),
    (total_cols, total_rows): (u32, u32),
    (pixel_width, pixel_height): (u32, u32),
) -> (u32, u32) {
    let mut draw_cols = available_cols.max(1);
    let mut draw_rows = available_rows.max(1);

    if image.width == 0 || image.height == 0 {
        return (draw_cols, draw_rows);
    }

    if pixel_width > 0
        && pixel_height > 0
        && effective_pixel_width.is_finite()
        && effective_pixel_height.is_finite()
        && effective_pixel_width > 0.0
        && effective_pixel_height > 0.0
    {
        let cell_width = pixel_width as f32 / total_cols.max(1) as f32;
        let cell_height = pixel_height as f32 / total_rows.max(1) as f32;
        let cols = (effective_pixel_width / cell_width).round().max(1.0);
        let rows = (effective_pixel_height / cell_height).round().max(1.0);
        // Shrink both axes by the same factor so the page is not distorted.
        let shrink = (available_cols as f32 / cols)
            .min(available_rows as f32 / rows)
            .min(1.0);
        draw_cols = (cols * shrink).round() as u32;
        draw_rows = (rows * shrink).round() as u32;
    } else {
        let ratio = image.width as f32 / image.height as f32;
        let mut cols = available_cols as f32;
        let mut rows = (cols / ratio).round().max(1.0);
        if rows > available_rows as f32 {
            rows = available_rows as f32;
            cols = (rows * ratio).round().max(1.0);
        }
        draw_cols = cols as u32;
        draw_rows = rows as u32;
    }

    (
        draw_cols.clamp(1, available_cols.max(1)),
        draw_rows.clamp(1, available_rows.max(1)),
    )
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct CropRegion {
    offset_x: u32,
    offset_y: u32,
    width: u32,
    height: u32,
}

fn crop_render_image(image: &RenderImage, region: CropRegion) -> RenderImage {
    let width = region.width.min(image.width).max(1);
    let height = region.height.min(image.height).max(1);
    let origin_x = region.offset_x.min(image.width.saturating_sub(width));
    let origin_y = region.offset_y.min(image.height.saturating_sub(height));

    let stride = image.width as usize * 4;
    let mut pixels = Vec::with_capacity(width as usize * height as usize * 4);
    for row in 0..height {
        let start = (origin_y + row) as usize * stride + origin_x as usize * 4;
        pixels.extend_from_slice(&image.pixels[start..start + width as usize * 4]);
    }

    RenderImage {
        width,
        height,
        pixels,
    }
}

/// Maps normalized page rectangles onto the pixels actually displayed.
struct HighlightGeometry {
    base_width: u32,
    base_height: u32,
    crop: Option<CropRegion>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct PixelRect {
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
}

const MATCH_COLOR: [u8; 3] = [255, 235, 0];
const CURRENT_MATCH_COLOR: [u8; 3] = [255, 170, 0];

fn apply_search_highlights(
    image: &mut RenderImage,
    highlights: &SearchHighlights,
    geom: &HighlightGeometry,
) {
    if image.width == 0 || image.height == 0 || highlights.is_empty() {
        return;
    }

    for rect in highlights.others.iter().filter_map(|r| normalized_to_pixel_rect(*r, geom)) {
        fill_rect(image, rect, MATCH_COLOR, 0.3);
    }
    for rect in highlights.current.iter().filter_map(|r| normalized_to_pixel_rect(*r, geom)) {
        fill_rect(image, rect, CURRENT_MATCH_COLOR, 0.45);
    }
}

fn normalized_to_pixel_rect(rect: NormalizedRect, geom: &HighlightGeometry) -> Option<PixelRect> {
    let width_f = geom.base_width as f32;
    let height_f = geom.base_height as f32;
    if width_f <= 0.0 || height_f <= 0.0 {
        return None;
    }

    let max_x = geom.base_width as i64;
    let max_y = geom.base_height as i64;
    let mut x0 = ((rect.left * width_f).floor() as i64).clamp(0, max_x);
    let mut x1 = ((rect.right * width_f).ceil() as i64).clamp(0, max_x);
    let mut y0 = ((rect.top * height_f).floor() as i64).clamp(0, max_y);
    let mut y1 = ((rect.bottom * height_f).ceil() as i64).clamp(0, max_y);

    if let Some(crop) = &geom.crop {
        let (cw, ch) = (crop.width as i64, crop.height as i64);
        x0 = (x0 - crop.offset_x as i64).clamp(0, cw);
        x1 = (x1 - crop.offset_x as i64).clamp(0, cw);
        y0 = (y0 - crop.offset_y as i64).clamp(0, ch);
        y1 = (y1 - crop.offset_y as i64).clamp(0, ch);
    }

    if x1 <= x0 || y1 <= y0 {
        return None;
    }

    Some(PixelRect {
        x0: x0 as u32,
        y0: y0 as u32,
        x1: x1 as u32,
        y1: y1 as u32,
    })
}

fn fill_rect(image: &mut RenderImage, rect: PixelRect, color: [u8; 3], alpha: f32) {
    let width = image.width as usize;
    let x1 = rect.x1.min(image.width);
    let y1 = rect.y1.min(image.height);
    let x0 = rect.x0.min(x1);
    let y0 = rect.y0.min(y1);

    for y in y0..y1 {
        let row_start = y as usize * width * 4;
        for x in x0..x1 {
            let idx = row_start + x as usize * 4;
            blend_pixel(&mut image.pixels[idx..idx + 4], color, alpha);
        }
    }
}

fn blend_pixel(pixel: &mut [u8], color: [u8; 3], alpha: f32) {
    let alpha = alpha.clamp(0.0, 1.0);
    let inv = 1.0 - alpha;
    for (channel, target) in pixel.iter_mut().zip(color) {
        *channel = (*channel as f32 * inv + target as f32 * alpha)
            .round()
            .clamp(0.0, 255.0) as u8;
    }
}

fn document_name(path: &Path) -> &str {
    path.file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("<unknown>")
}

/// Embedded title when the document has a usable one, file name otherwise.
fn document_label(info: &DocumentInfo) -> &str {
    info.metadata
        .title
        .as_deref()
        .map(str::trim)
        .filter(|title| !title.is_empty())
        .unwrap_or_else(|| document_name(&info.path))
}

fn format_document_status(doc: &DocumentInstance) -> String {
    let zoom_percent = doc.state.scale * 100.0;
    let zoom_display = if zoom_percent.is_finite() {
        format!("{:.0}%", zoom_percent)
    } else {
        "—".to_string()
    };

    let mut status = format!(
        "{} — page {}/{} — {}",
        document_label(&doc.info),
        doc.state.current_page + 1,
        doc.info.page_count,
        zoom_display
    );
    if doc.state.dark_mode {
        status.push_str(" — dark");
    }

    if let Some(summary) = doc.search.summary() {
        status.push_str(" — /");
        status.push_str(&summary.query);
        match summary.current_index {
            Some(index) if summary.total > 0 => {
                status.push_str(&format!(" ({}/{})", index + 1, summary.total))
            }
            _ => status.push_str(" (no matches)"),
        }
    }

    status
}
