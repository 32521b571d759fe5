//! Bus registration: claim everything an instance needs before any traffic.
//!
//! Order matters:
//! 1. register the envelope wire shape (the bus refuses traffic before it)
//! 2. export the document object under the session interface
//! 3. claim the unique service name, which makes us discoverable
//! 4. subscribe to the peer interface (not when isolated)
//! 5. confirm the service name resolves back to us
//!
//! Any failure is fatal to the caller; there is no retry.

use crate::address::SessionAddress;
use crate::bus::{BusConnection, BusError};
use crate::envelope::WIRE_VERSION;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("Failed to register message types: {0}")]
    Types(#[source] BusError),

    #[error("Failed to register object {path}: {source}")]
    Object {
        path: String,
        #[source]
        source: BusError,
    },

    #[error("Failed to claim service name {name}: {source}")]
    Name {
        name: String,
        #[source]
        source: BusError,
    },

    #[error("Failed to subscribe to {interface}: {source}")]
    Subscribe {
        interface: String,
        #[source]
        source: BusError,
    },

    #[error("Service name {name} is not visible on the bus")]
    NotVisible { name: String },

    #[error("Failed to list bus names: {0}")]
    List(#[source] BusError),
}

pub type Result<T> = std::result::Result<T, RegistrationError>;

/// A registered connection plus the address it was registered under.
pub struct BusHandle<C: BusConnection> {
    connection: Arc<C>,
    address: SessionAddress,
}

impl<C: BusConnection> Clone for BusHandle<C> {
    fn clone(&self) -> Self {
        Self {
            connection: Arc::clone(&self.connection),
            address: self.address.clone(),
        }
    }
}

impl<C: BusConnection> BusHandle<C> {
    pub fn connection(&self) -> &Arc<C> {
        &self.connection
    }

    pub fn address(&self) -> &SessionAddress {
        &self.address
    }
}

/// Register `connection` under `address`.
pub async fn register<C: BusConnection>(
    connection: Arc<C>,
    address: &SessionAddress,
) -> Result<BusHandle<C>> {
    connection
        .register_types(WIRE_VERSION)
        .await
        .map_err(RegistrationError::Types)?;

    connection
        .register_object(&address.object_path, &address.interface_name)
        .await
        .map_err(|source| RegistrationError::Object {
            path: address.object_path.clone(),
            source,
        })?;

    connection
        .request_name(&address.service_name)
        .await
        .map_err(|source| RegistrationError::Name {
            name: address.service_name.clone(),
            source,
        })?;

    if let Some(interface) = &address.peer_interface {
        connection
            .subscribe(interface)
            .await
            .map_err(|source| RegistrationError::Subscribe {
                interface: interface.clone(),
                source,
            })?;
        debug!("Subscribed to {}", interface);
    }

    let names = connection
        .list_names()
        .await
        .map_err(RegistrationError::List)?;
    if !names.contains(&address.service_name) {
        return Err(RegistrationError::NotVisible {
            name: address.service_name.clone(),
        });
    }

    info!(
        "Registered {} as {} ({})",
        connection.unique_name(),
        address.service_name,
        if address.is_isolated() { "isolated" } else { "shared" }
    );

    Ok(BusHandle {
        connection,
        address: address.clone(),
    })
}
