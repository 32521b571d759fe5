//! Character formatting shared by the document model and the wire events.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_FAMILY: &str = "Sans Serif";
pub const DEFAULT_POINTS: f32 = 12.0;
pub const DEFAULT_COLOR: &str = "#000000";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FontParseError {
    #[error("Font descriptor needs 5 comma-separated fields: {0:?}")]
    MissingFields(String),
    #[error("Invalid point size: {0:?}")]
    InvalidSize(String),
    #[error("Invalid flag (expected 0 or 1): {0:?}")]
    InvalidFlag(String),
}

/// Font attributes of one character.
///
/// Textual form (used on the wire as the "font descriptor"):
/// `family,points,bold,italic,underline` with `0`/`1` flags. The family is
/// everything before the last four fields, so it may contain commas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FontDescriptor {
    pub family: String,
    pub points: f32,
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
}

impl Default for FontDescriptor {
    fn default() -> Self {
        Self {
            family: DEFAULT_FAMILY.to_string(),
            points: DEFAULT_POINTS,
            bold: false,
            italic: false,
            underline: false,
        }
    }
}

impl Display for FontDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{}",
            self.family,
            self.points,
            u8::from(self.bold),
            u8::from(self.italic),
            u8::from(self.underline)
        )
    }
}

impl FromStr for FontDescriptor {
    type Err = FontParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.rsplitn(5, ',');
        let (Some(underline), Some(italic), Some(bold), Some(points), Some(family)) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            return Err(FontParseError::MissingFields(s.to_string()));
        };

        let points: f32 = points
            .trim()
            .parse()
            .map_err(|_| FontParseError::InvalidSize(points.to_string()))?;
        if !points.is_finite() || points <= 0.0 {
            return Err(FontParseError::InvalidSize(points.to_string()));
        }

        Ok(Self {
            family: family.to_string(),
            points,
            bold: parse_flag(bold)?,
            italic: parse_flag(italic)?,
            underline: parse_flag(underline)?,
        })
    }
}

fn parse_flag(s: &str) -> Result<bool, FontParseError> {
    match s.trim() {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(FontParseError::InvalidFlag(other.to_string())),
    }
}

/// Full format of one character.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharFormat {
    pub font: FontDescriptor,
    /// `#rrggbb`, lowercase.
    pub color: String,
}

impl Default for CharFormat {
    fn default() -> Self {
        Self {
            font: FontDescriptor::default(),
            color: DEFAULT_COLOR.to_string(),
        }
    }
}

impl CharFormat {
    /// Merge a single attribute into this format.
    pub fn apply(&mut self, attr: &FormatAttr) {
        match attr {
            FormatAttr::Toggle(FormatKind::Bold, on) => self.font.bold = *on,
            FormatAttr::Toggle(FormatKind::Italic, on) => self.font.italic = *on,
            FormatAttr::Toggle(FormatKind::Underline, on) => self.font.underline = *on,
            FormatAttr::Family(family) => self.font.family = family.clone(),
            FormatAttr::Size(points) => self.font.points = *points,
            FormatAttr::Color(color) => self.color = normalize_color(color),
        }
    }
}

/// Toggleable font flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormatKind {
    Bold,
    Underline,
    Italic,
}

/// One attribute to merge onto a selection or word.
#[derive(Debug, Clone, PartialEq)]
pub enum FormatAttr {
    Toggle(FormatKind, bool),
    Family(String),
    Size(f32),
    Color(String),
}

/// Lowercase a color and make sure it carries its `#`.
pub fn normalize_color(color: &str) -> String {
    let color = color.trim().to_ascii_lowercase();
    if color.len() == 6 && color.chars().all(|c| c.is_ascii_hexdigit()) {
        format!("#{color}")
    } else {
        color
    }
}

/// Format under the cursor at one peer, used once to prime a joining
/// instance's toolbar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolbarSnapshot {
    pub bold: bool,
    pub underline: bool,
    pub italic: bool,
    pub size_points: f32,
    pub font_descriptor: String,
    pub color_hex: String,
    pub cursor_pos: usize,
}

impl ToolbarSnapshot {
    pub fn from_format(format: &CharFormat, cursor_pos: usize) -> Self {
        Self {
            bold: format.font.bold,
            underline: format.font.underline,
            italic: format.font.italic,
            size_points: format.font.points,
            font_descriptor: format.font.to_string(),
            color_hex: format.color.clone(),
            cursor_pos,
        }
    }
}
