//! Outbound emission: broadcasts to the session and direct calls to a peer.

use crate::address::SessionAddress;
use crate::bus::{BusConnection, BusError, MethodCall, Signal};
use crate::envelope::{CodecError, EditEnvelope, EditEvent, decode_value};
use crate::identity::InstanceId;
use crate::registration::BusHandle;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum EmitError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

pub type Result<T> = std::result::Result<T, EmitError>;

/// Direct-call operations every instance exports next to the event handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Render the document into the shared segment. Replies `bool`.
    SerializeToSharedBuffer,
    /// Detach from the shared segment. Replies `bool`.
    ReleaseSharedBuffer,
    /// Format under the cursor. Replies `ToolbarSnapshot`.
    GetFormatSnapshot,
}

impl Operation {
    pub fn member(&self) -> &'static str {
        match self {
            Self::SerializeToSharedBuffer => "serializeToSharedBuffer",
            Self::ReleaseSharedBuffer => "releaseSharedBuffer",
            Self::GetFormatSnapshot => "getFormatSnapshot",
        }
    }

    pub fn from_member(member: &str) -> Option<Self> {
        match member {
            "serializeToSharedBuffer" => Some(Self::SerializeToSharedBuffer),
            "releaseSharedBuffer" => Some(Self::ReleaseSharedBuffer),
            "getFormatSnapshot" => Some(Self::GetFormatSnapshot),
            _ => None,
        }
    }
}

/// Sends this instance's traffic, stamped with its identity.
pub struct Emitter<C: BusConnection> {
    handle: BusHandle<C>,
    identity: InstanceId,
}

impl<C: BusConnection> Clone for Emitter<C> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            identity: self.identity.clone(),
        }
    }
}

impl<C: BusConnection> Emitter<C> {
    pub fn new(handle: BusHandle<C>, identity: InstanceId) -> Self {
        Self { handle, identity }
    }

    pub fn identity(&self) -> &InstanceId {
        &self.identity
    }

    pub fn address(&self) -> &SessionAddress {
        self.handle.address()
    }

    /// Broadcast `event` to every instance in the session, ourselves included.
    ///
    /// Fire-and-forget. Isolated instances have nobody to tell, so this is a
    /// no-op for them.
    pub async fn broadcast(&self, event: EditEvent) -> Result<()> {
        let address = self.handle.address();
        let Some(interface) = &address.peer_interface else {
            return Ok(());
        };

        let envelope = EditEnvelope::new(self.identity.clone(), event);
        let body = envelope.encode()?;
        debug!("Broadcasting {} ({} bytes)", envelope.member(), body.len());

        self.handle
            .connection()
            .emit(Signal::new(&address.object_path, interface, envelope.member(), body))
            .await?;
        Ok(())
    }

    /// Call `operation` on `peer` and decode its single return value.
    pub async fn request<T: DeserializeOwned>(&self, peer: &str, operation: Operation) -> Result<T> {
        debug!("Requesting {} from {}", operation.member(), peer);
        let reply = self.call(peer, operation.member(), Vec::new()).await?;
        Ok(decode_value(operation.member(), &reply)?)
    }

    /// Deliver `event` to one peer as a direct call instead of a broadcast.
    /// Replies whether the peer applied it.
    pub async fn deliver(&self, peer: &str, event: EditEvent) -> Result<bool> {
        let envelope = EditEnvelope::new(self.identity.clone(), event);
        let body = envelope.encode()?;
        let reply = self.call(peer, envelope.member(), body).await?;
        Ok(decode_value(envelope.member(), &reply)?)
    }

    /// Every name currently advertised on the bus.
    pub async fn list_names(&self) -> Result<Vec<String>> {
        Ok(self.handle.connection().list_names().await?)
    }

    async fn call(&self, peer: &str, member: &str, body: Vec<u8>) -> Result<Vec<u8>> {
        let address = self.handle.address();
        let call = MethodCall::new(peer, &address.object_path, &address.interface_name, member, body);
        Ok(self.handle.connection().call(call).await?)
    }
}
