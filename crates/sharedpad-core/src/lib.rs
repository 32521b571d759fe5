//! sharedpad-core: Shared Rust library for keeping rich-text editor
//! instances in sync over a message bus.
//!
//! This crate provides the core functionality for:
//! - Deriving session addresses and registering on the bus
//! - The edit event envelope and its wire codec
//! - Applying peer events to a document while suppressing self-echo
//! - Bootstrapping a late joiner through a shared-memory segment
//! - `BusConnection` abstraction with an in-process `LocalBus`
//!
//! It is runtime-agnostic: transports and event loops live in the crates
//! that embed it.

pub mod address;
pub mod bootstrap;
pub mod bus;
pub mod document;
pub mod emitter;
pub mod engine;
pub mod envelope;
pub mod events;
pub mod format;
pub mod identity;
pub mod markup;
pub mod registration;
pub mod shared_buffer;

pub use address::SessionAddress;
pub use bootstrap::{BootstrapError, BootstrapOutcome, apply_outcome, bootstrap, discover_peer};
pub use bus::{
    BusConnection, BusError, BusEvent, InboundEvents, LocalBus, LocalConnection, MethodCall,
    Responder, Signal,
};
pub use document::{DocumentView, RichDocument, StyledChar};
pub use emitter::{EmitError, Emitter, Operation};
pub use engine::{Dispatch, EngineError, SyncEngine};
pub use envelope::{CodecError, EditEnvelope, EditEvent, WIRE_VERSION};
pub use events::{EventBus, SessionEvent, Subscription};
pub use format::{CharFormat, FontDescriptor, FormatAttr, FormatKind, ToolbarSnapshot};
pub use identity::{IdentityError, InstanceId};
pub use registration::{BusHandle, RegistrationError, register};
pub use shared_buffer::{BufferState, SharedBufferError, SharedDocumentBuffer};
