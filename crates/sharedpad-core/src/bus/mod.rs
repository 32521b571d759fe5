//! Message bus abstraction.
//!
//! An instance talks to its peers only through a [`BusConnection`]:
//! - well-known names and objects it exports
//! - signals it emits on, or receives from, a session interface
//! - direct method calls to a named peer, answered with a single value
//!
//! Implementations:
//! - [`LocalBus`]: in-process broker (tests, single-process embedding)
//! - `sharedpad_bus::WsBusConnection`: client for the broker process
//!
//! Inbound traffic is delivered as [`BusEvent`]s on the unbounded receiver
//! returned next to the connection.

mod local;

pub use local::{LocalBus, LocalConnection};

use async_trait::async_trait;
use futures::channel::{mpsc, oneshot};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BusError {
    #[error("Name already owned by another connection: {name}")]
    NameTaken { name: String },

    #[error("Object path already registered: {path}")]
    ObjectPathInUse { path: String },

    #[error("No connection owns the name {name}")]
    ServiceUnknown { name: String },

    #[error("No object at {path} implementing {interface}")]
    UnknownObject { path: String, interface: String },

    #[error("No method {member} on {interface}")]
    UnknownMethod { interface: String, member: String },

    #[error("Message types must be registered before any traffic")]
    TypesNotRegistered,

    #[error("Wire version mismatch: bus speaks {expected}, connection registered {actual}")]
    WireVersionMismatch { expected: u32, actual: u32 },

    #[error("Peer did not reply")]
    NoReply,

    #[error("Invalid arguments: {reason}")]
    InvalidArgs { reason: String },

    #[error("Bus connection closed")]
    Disconnected,
}

pub type Result<T> = std::result::Result<T, BusError>;

/// A broadcast on an interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    /// Unique name of the emitting connection. Filled in by the bus.
    pub sender: String,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub body: Vec<u8>,
}

impl Signal {
    pub fn new(
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            sender: String::new(),
            path: path.into(),
            interface: interface.into(),
            member: member.into(),
            body,
        }
    }
}

/// A direct call addressed to one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodCall {
    /// Unique name of the caller. Filled in by the bus.
    pub sender: String,
    /// Unique or well-known name of the callee.
    pub destination: String,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub body: Vec<u8>,
}

impl MethodCall {
    pub fn new(
        destination: impl Into<String>,
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            sender: String::new(),
            destination: destination.into(),
            path: path.into(),
            interface: interface.into(),
            member: member.into(),
            body,
        }
    }
}

/// Reply slot for one inbound method call.
///
/// Dropping it without answering makes the caller fail with
/// [`BusError::NoReply`].
#[derive(Debug)]
pub struct Responder(oneshot::Sender<Result<Vec<u8>>>);

impl Responder {
    pub fn channel() -> (Self, oneshot::Receiver<Result<Vec<u8>>>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    /// Answer the call. Returns false if the caller is gone.
    pub fn send(self, result: Result<Vec<u8>>) -> bool {
        self.0.send(result).is_ok()
    }
}

/// Traffic delivered to a connection.
#[derive(Debug)]
pub enum BusEvent {
    Signal(Signal),
    MethodCall { call: MethodCall, reply: Responder },
}

pub type InboundSender = mpsc::UnboundedSender<BusEvent>;
pub type InboundEvents = mpsc::UnboundedReceiver<BusEvent>;

/// One connection to the message bus.
#[async_trait]
pub trait BusConnection: Send + Sync {
    /// Name the bus assigned to this connection (`:1.<n>`).
    fn unique_name(&self) -> &str;

    /// Register the payload wire shape. Must precede every other operation.
    async fn register_types(&self, wire_version: u32) -> Result<()>;

    /// Export an object at `path` implementing `interface`.
    async fn register_object(&self, path: &str, interface: &str) -> Result<()>;

    /// Claim a well-known name.
    async fn request_name(&self, name: &str) -> Result<()>;

    /// Every name currently on the bus, unique and well-known.
    async fn list_names(&self) -> Result<Vec<String>>;

    /// Receive every signal emitted on `interface`, including our own.
    async fn subscribe(&self, interface: &str) -> Result<()>;

    /// Fire-and-forget broadcast.
    async fn emit(&self, signal: Signal) -> Result<()>;

    /// Call a method and wait for its single return value.
    async fn call(&self, call: MethodCall) -> Result<Vec<u8>>;
}
