use std::ops::Range;

use tracing::{debug, instrument};

use crate::document::{DocumentBackend, NormalizedRect};

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("search session has no matches")]
    EmptySession,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Next,
    Previous,
}

/// A single occurrence of the query inside the document.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchLocation {
    pub page_index: usize,
    /// Position of this occurrence among the matches on the same page.
    pub ordinal: usize,
    /// Byte range into the page text, when the backend reports one.
    pub span: Option<Range<usize>>,
    pub rects: Vec<NormalizedRect>,
    pub highlighted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SearchHighlights {
    pub current: Vec<NormalizedRect>,
    pub others: Vec<NormalizedRect>,
}

impl SearchHighlights {
    pub fn is_empty(&self) -> bool {
        self.current.is_empty() && self.others.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchSummary {
    pub query: String,
    pub total: usize,
    pub current_index: Option<usize>,
}

/// Result set of the most recent query plus the selection cursor.
///
/// The cursor is `Some` exactly when there is at least one match and always
/// points inside the match list.
#[derive(Debug, Clone, Default)]
pub struct SearchSession {
    query: String,
    matches: Vec<MatchLocation>,
    cursor: Option<usize>,
}

impl SearchSession {
    pub fn new(query: impl Into<String>, mut matches: Vec<MatchLocation>) -> Self {
        for location in &mut matches {
            location.highlighted = true;
        }
        let cursor = if matches.is_empty() { None } else { Some(0) };
        Self {
            query: query.into(),
            matches,
            cursor,
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn matches(&self) -> &[MatchLocation] {
        &self.matches
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    pub fn current(&self) -> Result<&MatchLocation, SearchError> {
        self.cursor
            .and_then(|index| self.matches.get(index))
            .ok_or(SearchError::EmptySession)
    }

    /// Moves to the following match, staying put on the last one.
    pub fn select_next(&mut self) -> Result<&MatchLocation, SearchError> {
        self.advance(Direction::Next, 1)
    }

    /// Moves to the preceding match, staying put on the first one.
    pub fn select_previous(&mut self) -> Result<&MatchLocation, SearchError> {
        self.advance(Direction::Previous, 1)
    }

    pub fn advance(&mut self, direction: Direction, count: usize) -> Result<&MatchLocation, SearchError> {
        let cursor = self.cursor.ok_or(SearchError::EmptySession)?;
        let last = self.matches.len() - 1;
        let next = match direction {
            Direction::Next => cursor.saturating_add(count).min(last),
            Direction::Previous => cursor.saturating_sub(count),
        };
        self.cursor = Some(next);
        Ok(&self.matches[next])
    }

    pub fn highlights_for_page(&self, page_index: usize) -> SearchHighlights {
        let mut highlights = SearchHighlights::default();
        for (index, location) in self.matches.iter().enumerate() {
            if location.page_index != page_index || !location.highlighted {
                continue;
            }
            if Some(index) == self.cursor {
                highlights.current.extend(location.rects.iter().copied());
            } else {
                highlights.others.extend(location.rects.iter().copied());
            }
        }
        highlights
    }

    pub fn summary(&self) -> Option<SearchSummary> {
        if self.query.is_empty() {
            return None;
        }
        Some(SearchSummary {
            query: self.query.clone(),
            total: self.matches.len(),
            current_index: self.cursor,
        })
    }
}

/// Runs `text` against every page of `document` in reading order.
///
/// Blank queries produce an empty session without touching the document.
#[instrument(skip(document), fields(pages = document.info().page_count))]
pub fn search(document: &dyn DocumentBackend, text: &str) -> Result<SearchSession, SearchError> {
    if text.trim().is_empty() {
        return Ok(SearchSession::default());
    }

    let mut matches = Vec::new();
    for page_index in 0..document.info().page_count {
        let hits = document.search_page(page_index, text)?;
        matches.extend(hits.into_iter().enumerate().map(|(ordinal, hit)| MatchLocation {
            page_index,
            ordinal,
            span: hit.span,
            rects: hit.rects,
            highlighted: true,
        }));
    }

    debug!(total = matches.len(), "search finished");
    Ok(SearchSession::new(text, matches))
}

/// Non-overlapping, case-insensitive occurrences of `needle` in `haystack`,
/// as byte ranges into `haystack`.
pub fn find_case_insensitive(haystack: &str, needle: &str) -> Vec<Range<usize>> {
    let needle: Vec<char> = needle.chars().flat_map(char::to_lowercase).collect();
    if needle.is_empty() {
        return Vec::new();
    }

    // Lowercasing may expand a char, so remember where each folded char
    // came from in `haystack`.
    let mut folded = Vec::with_capacity(haystack.len());
    let mut origin = Vec::with_capacity(haystack.len());
    for (offset, ch) in haystack.char_indices() {
        for lower in ch.to_lowercase() {
            folded.push(lower);
            origin.push(offset);
        }
    }

    let mut ranges = Vec::new();
    let mut start = 0;
    while start + needle.len() <= folded.len() {
        if folded[start..start + needle.len()] == needle[..] {
            let last = origin[start + needle.len() - 1];
            let end = last + haystack[last..].chars().next().map_or(0, char::len_utf8);
            ranges.push(origin[start]..end);
            start += needle.len();
        } else {
            start += 1;
        }
    }
    ranges
}
