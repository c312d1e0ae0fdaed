use std::io::{self, Write};

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crossterm::{
    cursor,
    event::{Event, KeyCode, KeyEvent, KeyModifiers},
    terminal::{Clear, ClearType},
};
use png::{BitDepth, ColorType, Encoder};
use remotepdf_core::{Command, FetchState, RenderImage};

/// Largest base64 payload sent in a single kitty graphics escape.
const KITTY_CHUNK_LEN: usize = 4096;

pub struct KittyRenderer<W: Write> {
    writer: W,
    image_id: u32,
    placement_id: u32,
}

pub struct DrawParams {
    pub columns: u32,
    pub rows: u32,
}

impl DrawParams {
    pub fn clamped(columns: u32, rows: u32) -> Self {
        Self {
            columns: columns.max(1),
            rows: rows.max(1),
        }
    }
}

impl<W: Write> KittyRenderer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            image_id: 1,
            placement_id: 1,
        }
    }

    pub fn writer(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Transmits `image` as PNG and places it at the cursor, replacing the
    /// previous placement.
    pub fn draw(&mut self, image: &RenderImage, params: DrawParams) -> Result<()> {
        let mut buffer = Vec::new();
        let mut encoder = Encoder::new(&mut buffer, image.width, image.height);
        encoder.set_color(ColorType::Rgba);
        encoder.set_depth(BitDepth::Eight);
        let mut writer = encoder.write_header()?;
        writer.write_image_data(&image.pixels)?;
        writer.finish()?;

        let encoded = BASE64.encode(&buffer);
        let mut chunks = encoded.as_bytes().chunks(KITTY_CHUNK_LEN).peekable();
        let mut first = true;

        while let Some(chunk) = chunks.next() {
            let more = u8::from(chunks.peek().is_some());
            if first {
                write!(
                    self.writer,
                    "\u{1b}_Ga=T,f=100,C=1,q=2,i={},p={},c={},r={},s={},v={},z=-1,m={}",
                    self.image_id,
                    self.placement_id,
                    params.columns,
                    params.rows,
                    image.width,
                    image.height,
                    more
                )?;
                first = false;
            } else {
                write!(self.writer, "\u{1b}_Gm={},q=2", more)?;
            }
            if !chunk.is_empty() {
                self.writer.write_all(b";")?;
                self.writer.write_all(chunk)?;
            }
            write!(self.writer, "\u{1b}\\")?;
        }

        self.writer.flush()?;
        Ok(())
    }

    pub fn begin_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026h")?;
        Ok(())
    }

    /// Ends a synchronized update; the terminal paints everything buffered
    /// since `begin_sync_update` at once.
    pub fn end_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026l")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn clear_all(&mut self) -> Result<()> {
        crossterm::execute!(
            &mut self.writer,
            Clear(ClearType::All),
            cursor::MoveTo(0, 0)
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum UiEvent {
    Command(Command),
    BeginSearch,
    SearchQueryChanged { query: String },
    SearchSubmit { query: String },
    SearchCancel,
    Quit,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    #[default]
    Normal,
    Search,
}

/// Turns key presses into viewer commands, keeping a numeric count prefix
/// and the search prompt buffer between events.
#[derive(Debug, Default)]
pub struct EventMapper {
    pending_count: Option<usize>,
    pending_digits: String,
    mode: InputMode,
    search_buffer: String,
}

impl EventMapper {
    pub const ZOOM_STEP: f32 = 1.1;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mode(&mut self, mode: InputMode) {
        if self.mode != mode {
            self.reset_count();
            self.search_buffer.clear();
            self.mode = mode;
        }
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn map_event(&mut self, event: Event) -> UiEvent {
        match self.mode {
            InputMode::Normal => self.map_event_normal(event),
            InputMode::Search => self.map_event_search(event),
        }
    }

    fn map_event_normal(&mut self, event: Event) -> UiEvent {
        let Event::Key(KeyEvent {
            code, modifiers, ..
        }) = event
        else {
            return UiEvent::None;
        };

        match (code, modifiers) {
            (KeyCode::Char(c), KeyModifiers::NONE) if c.is_ascii_digit() => {
                if let Some(digit) = c.to_digit(10) {
                    self.push_digit(digit as usize);
                }
                UiEvent::None
            }
            (KeyCode::Char('j'), KeyModifiers::NONE) | (KeyCode::Down, KeyModifiers::NONE) => {
                let count = self.take_count();
                UiEvent::Command(Command::NextPage { count })
            }
            (KeyCode::Char('k'), KeyModifiers::NONE) | (KeyCode::Up, KeyModifiers::NONE) => {
                let count = self.take_count();
                UiEvent::Command(Command::PrevPage { count })
            }
            (KeyCode::Char('g'), KeyModifiers::NONE) | (KeyCode::Home, _) => {
                self.reset_count();
                UiEvent::Command(Command::GotoPage { page: 0 })
            }
            (KeyCode::Char('G'), _) | (KeyCode::End, _) => {
                self.reset_count();
                UiEvent::Command(Command::GotoPage { page: usize::MAX })
            }
            (KeyCode::Char('+'), _) => {
                self.reset_count();
                UiEvent::Command(Command::ScaleBy {
                    factor: Self::ZOOM_STEP,
                })
            }
            (KeyCode::Char('-'), _) => {
                self.reset_count();
                UiEvent::Command(Command::ScaleBy {
                    factor: 1.0 / Self::ZOOM_STEP,
                })
            }
            (KeyCode::Char('d'), KeyModifiers::NONE) => {
                self.reset_count();
                UiEvent::Command(Command::ToggleDarkMode)
            }
            (KeyCode::Char('/'), _) => {
                self.set_mode(InputMode::Search);
                UiEvent::BeginSearch
            }
            (KeyCode::Char('n'), KeyModifiers::NONE) => {
                let count = self.take_count();
                UiEvent::Command(Command::SearchNext { count })
            }
            (KeyCode::Char('N'), modifiers)
                if modifiers.is_empty() || modifiers == KeyModifiers::SHIFT =>
            {
                let count = self.take_count();
                UiEvent::Command(Command::SearchPrev { count })
            }
            (KeyCode::Char('q'), _) => {
                self.reset_count();
                UiEvent::Quit
            }
            (KeyCode::Char('c'), modifiers) if modifiers.contains(KeyModifiers::CONTROL) => {
                UiEvent::Quit
            }
            _ => {
                self.reset_count();
                UiEvent::None
            }
        }
    }

    fn map_event_search(&mut self, event: Event) -> UiEvent {
        let Event::Key(KeyEvent {
            code, modifiers, ..
        }) = event
        else {
            return UiEvent::None;
        };

        match (code, modifiers) {
            (KeyCode::Esc, _) => {
                self.set_mode(InputMode::Normal);
                UiEvent::SearchCancel
            }
            (KeyCode::Enter, _) => {
                let query = std::mem::take(&mut self.search_buffer);
                self.set_mode(InputMode::Normal);
                UiEvent::SearchSubmit { query }
            }
            (KeyCode::Backspace, _) => {
                self.search_buffer.pop();
                UiEvent::SearchQueryChanged {
                    query: self.search_buffer.clone(),
                }
            }
            (KeyCode::Char(c), mods) if mods.is_empty() || mods == KeyModifiers::SHIFT => {
                self.search_buffer.push(c);
                UiEvent::SearchQueryChanged {
                    query: self.search_buffer.clone(),
                }
            }
            _ => UiEvent::None,
        }
    }

    fn push_digit(&mut self, digit: usize) {
        let current = self.pending_count.unwrap_or(0);
        self.pending_count = Some(current.saturating_mul(10).saturating_add(digit));
        if let Some(c) = char::from_digit(digit as u32, 10) {
            self.pending_digits.push(c);
        }
    }

    fn take_count(&mut self) -> usize {
        let count = self
            .pending_count
            .take()
            .filter(|&count| count > 0)
            .unwrap_or(1);
        self.pending_digits.clear();
        count
    }

    fn reset_count(&mut self) {
        self.pending_count = None;
        self.pending_digits.clear();
    }

    /// Text to echo next to the status line: the search prompt or the
    /// count typed so far.
    pub fn pending_input(&self) -> Option<String> {
        match self.mode {
            InputMode::Search => Some(format!("/{}", self.search_buffer)),
            InputMode::Normal if !self.pending_digits.is_empty() => {
                Some(self.pending_digits.clone())
            }
            InputMode::Normal => None,
        }
    }
}

pub fn write_status_line<W: Write>(writer: &mut W, label: &str) -> io::Result<()> {
    write!(writer, "{}", label)?;
    writer.flush()
}

/// Single-line rendering of fetch progress for a terminal.
#[derive(Debug, Clone, Copy)]
pub struct ProgressLine {
    bar_width: usize,
}

impl Default for ProgressLine {
    fn default() -> Self {
        Self { bar_width: 30 }
    }
}

impl ProgressLine {
    pub fn new(bar_width: usize) -> Self {
        Self {
            bar_width: bar_width.max(1),
        }
    }

    pub fn format(&self, state: &FetchState, progress: Option<f32>) -> String {
        match state {
            FetchState::Idle => "waiting".to_string(),
            FetchState::CheckingCache => "checking cache".to_string(),
            FetchState::Downloading { written, expected } => {
                let fraction = progress.unwrap_or(0.0);
                let sizes = match expected {
                    Some(total) => format!("{} / {}", format_bytes(*written), format_bytes(*total)),
                    None => format_bytes(*written),
                };
                format!(
                    "downloading {} {:>3.0}% {}",
                    self.bar(fraction),
                    fraction * 100.0,
                    sizes
                )
            }
            FetchState::Publishing => format!("saving {} 100%", self.bar(1.0)),
            FetchState::Ready { path } => format!("ready: {}", path.display()),
            FetchState::Failed { error } => format!("failed: {}", error),
        }
    }

    /// Rewrites the current terminal line with the formatted state.
    pub fn draw<W: Write>(
        &self,
        writer: &mut W,
        state: &FetchState,
        progress: Option<f32>,
    ) -> Result<()> {
        crossterm::queue!(
            writer,
            cursor::MoveToColumn(0),
            Clear(ClearType::CurrentLine)
        )?;
        write_status_line(writer, &self.format(state, progress))?;
        Ok(())
    }

    fn bar(&self, fraction: f32) -> String {
        let filled = ((fraction.clamp(0.0, 1.0) * self.bar_width as f32).round() as usize)
            .min(self.bar_width);
        format!(
            "[{}{}]",
            "#".repeat(filled),
            "-".repeat(self.bar_width - filled)
        )
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}
