//! Document model seen by the sync engine.
//!
//! `DocumentView` is the capability the engine and the outbound side need
//! from an editor surface. `RichDocument` is the in-memory implementation
//! used by the headless editor and by tests:
//! - a sequence of styled characters
//! - an anchor/position cursor (selection when they differ)
//! - a typing format applied to the next typed character
//!
//! Positions count characters and are always clamped to the document length.

use crate::format::{CharFormat, FormatAttr};
use crate::markup;
use std::ops::Range;

/// One character with its format.
#[derive(Debug, Clone, PartialEq)]
pub struct StyledChar {
    pub ch: char,
    pub format: CharFormat,
}

impl StyledChar {
    pub fn new(ch: char, format: CharFormat) -> Self {
        Self { ch, format }
    }
}

/// Editing capability required by the sync engine.
pub trait DocumentView {
    /// Whole document as markup.
    fn markup(&self) -> String;

    /// Replace the whole document with parsed markup. Cursor moves to start.
    fn set_markup(&mut self, markup: &str);

    fn cursor(&self) -> usize;

    /// Move the cursor, clearing any selection.
    fn set_cursor(&mut self, pos: usize);

    /// Select `start..end`; the cursor ends up at `end`.
    fn select(&mut self, start: usize, end: usize);

    fn select_all(&mut self);

    /// Insert one character with an explicit format, replacing the selection.
    fn insert_styled(&mut self, ch: char, format: CharFormat);

    /// Insert plain text with the typing format, replacing the selection.
    fn insert_text(&mut self, text: &str);

    /// Insert rich markup, replacing the selection.
    fn insert_markup(&mut self, markup: &str);

    /// Remove the selection, or the character before the cursor.
    fn delete_backward(&mut self);

    /// Remove the selection, or the character after the cursor.
    fn delete_forward(&mut self);

    /// Merge `attr` onto the selection, or onto the word under the cursor when
    /// nothing is selected. The typing format always receives it.
    fn merge_format_on_word_or_selection(&mut self, attr: &FormatAttr);

    /// Format the next typed character would get.
    fn format_at_cursor(&self) -> CharFormat;

    /// Merge `attr` into the typing format only.
    fn merge_typing_format(&mut self, attr: &FormatAttr);
}

/// In-memory rich-text document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RichDocument {
    chars: Vec<StyledChar>,
    anchor: usize,
    position: usize,
    typing: CharFormat,
}

impl RichDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_markup(markup: &str) -> Self {
        let mut doc = Self::new();
        doc.set_markup(markup);
        doc
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    pub fn chars(&self) -> &[StyledChar] {
        &self.chars
    }

    pub fn plain_text(&self) -> String {
        self.chars.iter().map(|c| c.ch).collect()
    }

    /// Active selection, if the anchor and cursor differ.
    pub fn selection(&self) -> Option<Range<usize>> {
        if self.anchor == self.position {
            None
        } else {
            Some(self.anchor.min(self.position)..self.anchor.max(self.position))
        }
    }

    /// Range of the word touching `pos`, if any.
    pub fn word_at(&self, pos: usize) -> Option<Range<usize>> {
        let pos = pos.min(self.chars.len());
        let mut start = pos;
        while start > 0 && is_word_char(self.chars[start - 1].ch) {
            start -= 1;
        }
        let mut end = pos;
        while end < self.chars.len() && is_word_char(self.chars[end].ch) {
            end += 1;
        }
        (start < end).then_some(start..end)
    }

    fn clamp(&self, pos: usize) -> usize {
        pos.min(self.chars.len())
    }

    fn collapse_to(&mut self, pos: usize) {
        self.anchor = pos;
        self.position = pos;
    }

    /// Pick up the format left of the cursor, as an editor does on cursor moves.
    fn refresh_typing(&mut self) {
        if self.position > 0 {
            self.typing = self.chars[self.position - 1].format.clone();
        }
    }

    /// Remove the selected characters. Returns false when nothing was selected.
    fn remove_selection(&mut self) -> bool {
        let Some(range) = self.selection() else {
            return false;
        };
        let start = range.start;
        self.chars.drain(range);
        self.collapse_to(start);
        true
    }

    fn splice_at_cursor(&mut self, inserted: Vec<StyledChar>) {
        self.remove_selection();
        let at = self.position;
        let count = inserted.len();
        self.chars.splice(at..at, inserted);
        self.collapse_to(at + count);
        self.refresh_typing();
    }
}

fn is_word_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_'
}

impl DocumentView for RichDocument {
    fn markup(&self) -> String {
        markup::render(&self.chars)
    }

    fn set_markup(&mut self, markup: &str) {
        self.chars = markup::parse(markup);
        self.collapse_to(0);
        self.typing = self
            .chars
            .first()
            .map(|c| c.format.clone())
            .unwrap_or_default();
    }

    fn cursor(&self) -> usize {
        self.position
    }

    fn set_cursor(&mut self, pos: usize) {
        let pos = self.clamp(pos);
        self.collapse_to(pos);
        self.refresh_typing();
    }

    fn select(&mut self, start: usize, end: usize) {
        self.anchor = self.clamp(start);
        self.position = self.clamp(end);
        self.refresh_typing();
    }

    fn select_all(&mut self) {
        self.anchor = 0;
        self.position = self.chars.len();
        self.refresh_typing();
    }

    fn insert_styled(&mut self, ch: char, format: CharFormat) {
        self.splice_at_cursor(vec![StyledChar::new(ch, format)]);
    }

    fn insert_text(&mut self, text: &str) {
        let format = self.typing.clone();
        let inserted = text
            .chars()
            .map(|ch| StyledChar::new(ch, format.clone()))
            .collect();
        self.splice_at_cursor(inserted);
    }

    fn insert_markup(&mut self, markup: &str) {
        self.splice_at_cursor(markup::parse(markup));
    }

    fn delete_backward(&mut self) {
        if !self.remove_selection() && self.position > 0 {
            self.chars.remove(self.position - 1);
            let pos = self.position - 1;
            self.collapse_to(pos);
        }
        self.refresh_typing();
    }

    fn delete_forward(&mut self) {
        if !self.remove_selection() && self.position < self.chars.len() {
            self.chars.remove(self.position);
        }
        self.refresh_typing();
    }

    fn merge_format_on_word_or_selection(&mut self, attr: &FormatAttr) {
        let target = self.selection().or_else(|| self.word_at(self.position));
        if let Some(range) = target {
            for c in &mut self.chars[range] {
                c.format.apply(attr);
            }
        }
        self.typing.apply(attr);
    }

    fn format_at_cursor(&self) -> CharFormat {
        self.typing.clone()
    }

    fn merge_typing_format(&mut self, attr: &FormatAttr) {
        self.typing.apply(attr);
    }
}
