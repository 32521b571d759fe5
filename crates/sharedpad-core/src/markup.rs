//! Rich-text markup: an HTML subset used for snapshots, shared-buffer
//! transfer and rich paste.
//!
//! Parsing goes through `scraper` (html5ever), so entities, unclosed tags and
//! other real-world clipboard HTML are handled. Recognized:
//! - `b`/`strong`, `i`/`em`, `u`/`ins`
//! - `font` with `color` and `face`
//! - any element's `style` (`color`, `font-family`, `font-size: Npt`,
//!   `font-weight`, `font-style`, `text-decoration`)
//! - `br` (newline), `p`/`div` (block break)
//!
//! Text is taken verbatim (pre-wrap): whitespace is never collapsed.
//! Rendering emits one `<span style>` per run of identical non-default
//! formatting, so `parse(&render(chars)) == chars` for every document
//! without NUL characters. HTML has no way to carry NUL; the parser drops it.

use crate::document::StyledChar;
use crate::format::{CharFormat, DEFAULT_COLOR, DEFAULT_FAMILY, DEFAULT_POINTS, normalize_color};
use scraper::{ElementRef, Html, Node};

/// Elements whose content is never part of the document text.
const SKIPPED_ELEMENTS: &[&str] = &["head", "style", "script", "title"];

/// Parse markup into styled characters, starting from the default format.
pub fn parse(markup: &str) -> Vec<StyledChar> {
    parse_with_base(markup, &CharFormat::default())
}

/// Parse markup, using `base` for text without explicit formatting.
pub fn parse_with_base(markup: &str, base: &CharFormat) -> Vec<StyledChar> {
    let html = Html::parse_fragment(markup);
    let mut out = Vec::new();
    walk(html.root_element(), base, &mut out);
    out
}

fn walk(element: ElementRef<'_>, format: &CharFormat, out: &mut Vec<StyledChar>) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => push_text(text, format, out),
            Node::Element(el) => {
                let name = el.name();
                if name == "br" {
                    out.push(StyledChar::new('\n', format.clone()));
                    continue;
                }
                if SKIPPED_ELEMENTS.contains(&name) {
                    continue;
                }
                if matches!(name, "p" | "div") && out.last().is_some_and(|c| c.ch != '\n') {
                    out.push(StyledChar::new('\n', format.clone()));
                }
                if let Some(child_el) = ElementRef::wrap(child) {
                    let child_format = element_format(name, child_el, format);
                    walk(child_el, &child_format, out);
                }
            }
            _ => {}
        }
    }
}

fn push_text(text: &str, format: &CharFormat, out: &mut Vec<StyledChar>) {
    out.extend(text.chars().map(|ch| StyledChar::new(ch, format.clone())));
}

/// Format in effect inside `element`, derived from its parent's.
fn element_format(name: &str, element: ElementRef<'_>, parent: &CharFormat) -> CharFormat {
    let mut format = parent.clone();
    match name {
        "b" | "strong" => format.font.bold = true,
        "i" | "em" => format.font.italic = true,
        "u" | "ins" => format.font.underline = true,
        "font" => {
            if let Some(color) = element.value().attr("color") {
                format.color = normalize_color(color);
            }
            if let Some(face) = element.value().attr("face") {
                format.font.family = unquote(face).to_string();
            }
        }
        _ => {}
    }
    if let Some(style) = element.value().attr("style") {
        apply_style(style, &mut format);
    }
    format
}

fn apply_style(style: &str, format: &mut CharFormat) {
    for declaration in style.split(';') {
        let Some((property, value)) = declaration.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match property.trim().to_ascii_lowercase().as_str() {
            "color" => format.color = normalize_color(value),
            "font-family" => format.font.family = unquote(value).to_string(),
            "font-size" => {
                if let Some(points) = value
                    .strip_suffix("pt")
                    .and_then(|n| n.trim().parse::<f32>().ok())
                    .filter(|p| p.is_finite() && *p > 0.0)
                {
                    format.font.points = points;
                }
            }
            "font-weight" => {
                format.font.bold = match value {
                    "bold" | "bolder" => true,
                    "normal" | "lighter" => false,
                    n => n.parse::<u16>().map(|w| w >= 600).unwrap_or(format.font.bold),
                }
            }
            "font-style" => format.font.italic = matches!(value, "italic" | "oblique"),
            "text-decoration" | "text-decoration-line" => {
                format.font.underline = value.split_whitespace().any(|v| v == "underline")
            }
            _ => {}
        }
    }
}

fn unquote(value: &str) -> &str {
    value.trim().trim_matches(|c| c == '\'' || c == '"')
}

/// Render styled characters as markup.
pub fn render(chars: &[StyledChar]) -> String {
    let mut out = String::new();
    let mut start = 0;
    while start < chars.len() {
        let format = &chars[start].format;
        let end = chars[start..]
            .iter()
            .position(|c| &c.format != format)
            .map_or(chars.len(), |offset| start + offset);

        let style = style_attribute(format);
        if !style.is_empty() {
            out.push_str("<span style=\"");
            out.push_str(&style);
            out.push_str("\">");
        }
        for c in &chars[start..end] {
            push_escaped(c.ch, &mut out);
        }
        if !style.is_empty() {
            out.push_str("</span>");
        }
        start = end;
    }
    out
}

/// CSS declarations for everything that differs from the default format.
fn style_attribute(format: &CharFormat) -> String {
    let mut parts = Vec::new();
    if format.font.family != DEFAULT_FAMILY {
        parts.push(format!("font-family:'{}';", escape_attr(&format.font.family)));
    }
    if format.font.points != DEFAULT_POINTS {
        parts.push(format!("font-size:{}pt;", format.font.points));
    }
    if format.font.bold {
        parts.push("font-weight:700;".to_string());
    }
    if format.font.italic {
        parts.push("font-style:italic;".to_string());
    }
    if format.font.underline {
        parts.push("text-decoration:underline;".to_string());
    }
    if format.color != DEFAULT_COLOR {
        parts.push(format!("color:{};", escape_attr(&format.color)));
    }
    parts.join(" ")
}

fn push_escaped(ch: char, out: &mut String) {
    match ch {
        '\n' => out.push_str("<br />"),
        // A literal CR would be folded into a newline by the parser
        '\r' => out.push_str("&#13;"),
        '&' => out.push_str("&amp;"),
        '<' => out.push_str("&lt;"),
        '>' => out.push_str("&gt;"),
        '"' => out.push_str("&quot;"),
        c => out.push(c),
    }
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('\'', "")
        .replace(';', "")
}

/// Plain text of a markup string.
pub fn to_plain_text(markup: &str) -> String {
    parse(markup).into_iter().map(|c| c.ch).collect()
}
