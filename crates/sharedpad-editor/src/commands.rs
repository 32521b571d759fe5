//! Line-oriented command surface for the headless editor.
//!
//! Plain lines type their characters at the cursor. Lines starting with `:`
//! are commands:
//!
//! ```text
//! :newline | :tab              type a line break / tab
//! :cursor N                    move the cursor
//! :select A B | :selectall     change the selection
//! :backspace [N] | :delete [N] delete around the cursor
//! :bold|:italic|:underline on|off
//! :font NAME | :size PTS | :color #RRGGBB
//! :paste TEXT | :paste-html MARKUP
//! :resync | :show | :quit
//! ```

use sharedpad_core::FormatKind;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("Unknown command :{0}")]
    Unknown(String),

    #[error(":{command} needs {expected}")]
    MissingArgument {
        command: &'static str,
        expected: &'static str,
    },

    #[error("Invalid argument for :{command}: {value:?}")]
    InvalidArgument { command: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, CommandError>;

/// Largest repeat count accepted by `:backspace` and `:delete`.
pub const MAX_REPEAT: usize = 10_000;

/// Clipboard content offered to a paste. Rich content wins over plain.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Clipboard {
    pub html: Option<String>,
    pub text: Option<String>,
}

/// One user action on the local document.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalEdit {
    /// Type each character with the current typing format.
    Type(String),
    MoveCursor(usize),
    Select { start: usize, end: usize },
    SelectAll,
    Backspace(usize),
    Delete(usize),
    Toggle(FormatKind, bool),
    Family(String),
    Size(f32),
    Color(String),
    Paste(Clipboard),
    /// Push the whole document to every peer.
    Resync,
}

/// A parsed input line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Edit(LocalEdit),
    Show,
    Quit,
}

/// Parse one input line. Empty lines produce nothing.
pub fn parse_line(line: &str) -> Result<Option<Command>> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Ok(None);
    }
    let Some(command) = line.strip_prefix(':') else {
        return Ok(Some(Command::Edit(LocalEdit::Type(line.to_string()))));
    };

    let (name, rest) = match command.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (command, ""),
    };

    let edit = match name {
        "newline" => LocalEdit::Type("\n".into()),
        "tab" => LocalEdit::Type("\t".into()),
        "cursor" => LocalEdit::MoveCursor(parse_number("cursor", rest)?),
        "select" => {
            let mut args = rest.split_whitespace();
            let (Some(start), Some(end)) = (args.next(), args.next()) else {
                return Err(CommandError::MissingArgument {
                    command: "select",
                    expected: "a start and an end position",
                });
            };
            LocalEdit::Select {
                start: parse_number("select", start)?,
                end: parse_number("select", end)?,
            }
        }
        "selectall" => LocalEdit::SelectAll,
        "backspace" => LocalEdit::Backspace(parse_count("backspace", rest)?),
        "delete" => LocalEdit::Delete(parse_count("delete", rest)?),
        "bold" => LocalEdit::Toggle(FormatKind::Bold, parse_switch("bold", rest)?),
        "italic" => LocalEdit::Toggle(FormatKind::Italic, parse_switch("italic", rest)?),
        "underline" => LocalEdit::Toggle(FormatKind::Underline, parse_switch("underline", rest)?),
        "font" => LocalEdit::Family(required("font", "a family name", rest)?.to_string()),
        "size" => {
            let points: f32 = required("size", "a point size", rest)?
                .parse()
                .map_err(|_| invalid("size", rest))?;
            if !points.is_finite() || points <= 0.0 {
                return Err(invalid("size", rest));
            }
            LocalEdit::Size(points)
        }
        "color" => LocalEdit::Color(parse_color(required("color", "#RRGGBB", rest)?)?),
        "paste" => LocalEdit::Paste(Clipboard {
            html: None,
            text: Some(required("paste", "text", rest)?.to_string()),
        }),
        "paste-html" => LocalEdit::Paste(Clipboard {
            html: Some(required("paste-html", "markup", rest)?.to_string()),
            text: None,
        }),
        "resync" => LocalEdit::Resync,
        "show" => return Ok(Some(Command::Show)),
        "quit" | "q" => return Ok(Some(Command::Quit)),
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(Some(Command::Edit(edit)))
}

fn invalid(command: &'static str, value: &str) -> CommandError {
    CommandError::InvalidArgument {
        command,
        value: value.to_string(),
    }
}

fn required<'a>(command: &'static str, expected: &'static str, rest: &'a str) -> Result<&'a str> {
    if rest.is_empty() {
        Err(CommandError::MissingArgument { command, expected })
    } else {
        Ok(rest)
    }
}

fn parse_number(command: &'static str, value: &str) -> Result<usize> {
    required(command, "a position", value)?
        .parse()
        .map_err(|_| invalid(command, value))
}

/// Optional repeat count, defaulting to one.
fn parse_count(command: &'static str, value: &str) -> Result<usize> {
    if value.is_empty() {
        return Ok(1);
    }
    match value.parse() {
        Ok(count) if count <= MAX_REPEAT => Ok(count),
        _ => Err(invalid(command, value)),
    }
}

fn parse_switch(command: &'static str, value: &str) -> Result<bool> {
    match required(command, "on or off", value)? {
        "on" | "1" | "true" => Ok(true),
        "off" | "0" | "false" => Ok(false),
        other => Err(invalid(command, other)),
    }
}

/// Accept `#RRGGBB` or `RRGGBB`.
fn parse_color(value: &str) -> Result<String> {
    let hex = value.strip_prefix('#').unwrap_or(value);
    if hex.len() == 6 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(format!("#{}", hex.to_ascii_lowercase()))
    } else {
        Err(invalid("color", value))
    }
}
