//! sharedpad-editor: headless editor instance for sharedpad sessions.
//!
//! Joins a session on the message bus, copies the document from a running
//! peer, then keeps every instance in the session in sync by replaying
//! local edits on all of them.

pub mod commands;
pub mod config;
pub mod session;

pub use commands::{Clipboard, Command, CommandError, LocalEdit, MAX_REPEAT, parse_line};
pub use config::{Config, DEFAULT_BUS_URL};
pub use session::{
    DocumentState, Session, SessionCommand, SessionCommands, SessionError, SessionHandle,
    SessionSettings,
};
