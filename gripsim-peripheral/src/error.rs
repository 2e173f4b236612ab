use thiserror::Error;
use uuid::Uuid;

use gripsim_domain::{control::CommandError, gatt::GattError};

use crate::{
    config::ConfigError,
    transport::{ClientId, TransportError},
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    #[error("capacity of {max} concurrent clients reached")]
    CapacityExceeded { max: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("{0} is not connected")]
    UnknownClient(ClientId),
    #[error("characteristic {0} does not support notifications")]
    NotNotifiable(Uuid),
    #[error("no characteristic with uuid {0}")]
    UnknownCharacteristic(Uuid),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("peripheral is not accepting connections")]
    NotAdvertising,
    #[error("capacity of {max} concurrent clients reached")]
    CapacityExceeded { max: usize },
}

impl From<TrackerError> for ConnectError {
    fn from(error: TrackerError) -> ConnectError {
        match error {
            TrackerError::CapacityExceeded { max } => ConnectError::CapacityExceeded { max },
        }
    }
}

/// Failure of a client read or write routed through the GATT tree.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccessError {
    #[error("GATT server is not running")]
    NotRunning,
    #[error(transparent)]
    Gatt(#[from] GattError),
    #[error(transparent)]
    Command(#[from] CommandError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),
    #[error("another start is still waiting on the adapter")]
    StartInProgress,
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error(transparent)]
    Transport(TransportError),
}

impl From<TransportError> for OrchestratorError {
    fn from(error: TransportError) -> OrchestratorError {
        match error {
            TransportError::AdapterUnavailable(reason) => {
                OrchestratorError::AdapterUnavailable(reason)
            }
            other => OrchestratorError::Transport(other),
        }
    }
}
