//! The seam between the peripheral engine and a BLE adapter stack.
//!
//! Outbound radio operations go through [`Transport`]. Inbound events (connections, reads,
//! writes, subscriptions) are delivered by the adapter calling the matching `on_*` methods of
//! [`crate::peripheral::Peripheral`].

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Opaque connection handle, unique for the lifetime of a peripheral.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize)]
pub struct ClientId(pub(crate) u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no usable bluetooth adapter: {0}")]
    AdapterUnavailable(String),
    #[error("{0} is no longer connected")]
    ClientGone(ClientId),
    #[error("transport failure: {0}")]
    Io(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn advertise(&self, name: &str, service_uuids: &[Uuid]) -> Result<(), TransportError>;
    async fn stop_advertising(&self) -> Result<(), TransportError>;
    async fn notify(
        &self,
        client: ClientId,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<(), TransportError>;
    /// Asks the stack to tear down a link; the engine has already dropped the client.
    async fn disconnect(&self, client: ClientId) -> Result<(), TransportError>;
}
