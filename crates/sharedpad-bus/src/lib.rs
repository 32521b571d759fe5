//! sharedpad-bus library: the message bus broker and its client.
//!
//! The broker routes names, signals and method calls between editor
//! instances over WebSocket. `WsBusConnection` is the `BusConnection`
//! instances use to reach it.

pub mod client;
pub mod connection;
pub mod message;
pub mod server;

// Re-export key types for convenience
pub use client::{ClientError, WsBusConnection};
pub use connection::{ClientConnection, ConnectionEvent};
pub use message::{Frame, MAX_FRAME_SIZE};
pub use server::Broker;

/// Address the broker listens on, and instances connect to, by default.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7878";
