//! Bootstrap transfer: a late joiner copies a peer's document once at startup.
//!
//! Sequence, requester side:
//! 1. discover a peer among the advertised names
//! 2. `serializeToSharedBuffer` on the peer
//! 3. attach to the shared segment, copy the markup out, detach
//! 4. `releaseSharedBuffer` on the peer
//! 5. `getFormatSnapshot` on the peer
//!
//! The peer is released even when reading fails, so its segment never
//! outlives the handshake. The caller applies the outcome with
//! [`apply_outcome`] and surfaces the toolbar part to its UI.

use crate::address::SessionAddress;
use crate::bus::BusConnection;
use crate::document::DocumentView;
use crate::emitter::{EmitError, Emitter, Operation};
use crate::format::{FormatAttr, ToolbarSnapshot};
use crate::shared_buffer::{SharedBufferError, SharedDocumentBuffer};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("Peer {peer} could not serialize its document")]
    Refused { peer: String },

    #[error("Bootstrap call failed: {0}")]
    Emit(#[from] EmitError),

    #[error("Bootstrap segment unreadable: {0}")]
    Buffer(#[from] SharedBufferError),
}

pub type Result<T> = std::result::Result<T, BootstrapError>;

/// Everything a joiner takes from its peer.
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapOutcome {
    /// Service name of the peer the snapshot came from.
    pub peer: String,
    pub markup: String,
    pub toolbar: ToolbarSnapshot,
}

/// First advertised name in our session that is not us.
///
/// Pure over a snapshot of names; isolated addresses never match anything.
pub fn discover_peer(names: &[String], address: &SessionAddress) -> Option<String> {
    let prefix = address.discovery_prefix()?;
    names
        .iter()
        .find(|name| name.starts_with(&prefix) && **name != address.service_name)
        .cloned()
}

/// Run the bootstrap handshake. `Ok(None)` when there is nobody to copy from.
pub async fn bootstrap<C: BusConnection>(
    emitter: &Emitter<C>,
    reader: &mut SharedDocumentBuffer,
) -> Result<Option<BootstrapOutcome>> {
    let address = emitter.address();
    if address.is_isolated() {
        return Ok(None);
    }

    let names = emitter.list_names().await?;
    let Some(peer) = discover_peer(&names, address) else {
        info!("No peer in {}, starting empty", address.interface_name);
        return Ok(None);
    };
    info!("Bootstrapping from {}", peer);

    let serialized: bool = emitter
        .request(&peer, Operation::SerializeToSharedBuffer)
        .await?;
    if !serialized {
        return Err(BootstrapError::Refused { peer });
    }

    let read = read_segment(reader);

    let released: bool = emitter.request(&peer, Operation::ReleaseSharedBuffer).await?;
    if !released {
        warn!("Peer {} had nothing to release", peer);
    }
    let markup = read?;

    let toolbar: ToolbarSnapshot = emitter.request(&peer, Operation::GetFormatSnapshot).await?;
    debug!(
        "Bootstrapped {} bytes of markup, cursor {}",
        markup.len(),
        toolbar.cursor_pos
    );

    Ok(Some(BootstrapOutcome {
        peer,
        markup,
        toolbar,
    }))
}

fn read_segment(reader: &mut SharedDocumentBuffer) -> std::result::Result<String, SharedBufferError> {
    reader.attach()?;
    let markup = reader.read();
    reader.detach();
    markup
}

/// Load the peer's content, put the cursor where the peer had it and take
/// its color as the typing color. Existing characters keep their format.
pub fn apply_outcome<D: DocumentView>(document: &mut D, outcome: &BootstrapOutcome) {
    document.set_markup(&outcome.markup);
    document.set_cursor(outcome.toolbar.cursor_pos);
    document.merge_typing_format(&FormatAttr::Color(outcome.toolbar.color_hex.clone()));
}
