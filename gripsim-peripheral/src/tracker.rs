//! Connected clients and their per-characteristic subscriptions.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, trace};
use uuid::Uuid;

use gripsim_domain::gatt::{GattError, GattRegistry, Operation};

use crate::{
    error::{SubscriptionError, TrackerError},
    transport::ClientId,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectedClient {
    pub id: ClientId,
    pub address: String,
    pub connected_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Connected {
    pub client: ClientId,
    /// The tracker went from zero to one client.
    pub first: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Disconnected {
    pub client: ConnectedClient,
    /// The tracker went from one to zero clients.
    pub last: bool,
    pub dropped_subscriptions: Vec<Uuid>,
}

pub struct ConnectionTracker {
    registry: Arc<GattRegistry>,
    max_clients: usize,
    next_id: u64,
    clients: BTreeMap<ClientId, ConnectedClient>,
    subscriptions: HashMap<Uuid, BTreeSet<ClientId>>,
}

impl ConnectionTracker {
    pub fn new(registry: Arc<GattRegistry>, max_clients: usize) -> ConnectionTracker {
        ConnectionTracker {
            registry,
            max_clients,
            next_id: 1,
            clients: BTreeMap::new(),
            subscriptions: HashMap::new(),
        }
    }

    /// Applies to future connections only.
    pub fn set_capacity(&mut self, max_clients: usize) {
        self.max_clients = max_clients;
    }

    pub fn on_connect(
        &mut self,
        address: &str,
        connected_at: DateTime<Utc>,
    ) -> Result<Connected, TrackerError> {
        if self.clients.len() >= self.max_clients {
            debug!("[Tracker] Rejecting {address}: {} clients connected", self.clients.len());
            return Err(TrackerError::CapacityExceeded {
                max: self.max_clients,
            });
        }
        let id = ClientId(self.next_id);
        self.next_id += 1;
        let first = self.clients.is_empty();
        self.clients.insert(
            id,
            ConnectedClient {
                id,
                address: address.to_string(),
                connected_at,
            },
        );
        trace!("[Tracker] {id} connected from {address}");
        Ok(Connected { client: id, first })
    }

    /// Removes the client and every subscription it held. `None` if it was already gone.
    pub fn on_disconnect(&mut self, client: ClientId) -> Option<Disconnected> {
        let removed = self.clients.remove(&client)?;
        let mut dropped_subscriptions = Vec::new();
        self.subscriptions.retain(|characteristic, subscribers| {
            if subscribers.remove(&client) {
                dropped_subscriptions.push(*characteristic);
            }
            !subscribers.is_empty()
        });
        dropped_subscriptions.sort();
        trace!(
            "[Tracker] {client} disconnected, dropped {} subscriptions",
            dropped_subscriptions.len()
        );
        Some(Disconnected {
            client: removed,
            last: self.clients.is_empty(),
            dropped_subscriptions,
        })
    }

    pub fn subscribe(&mut self, client: ClientId, characteristic: Uuid) -> Result<(), SubscriptionError> {
        if !self.clients.contains_key(&client) {
            return Err(SubscriptionError::UnknownClient(client));
        }
        self.registry
            .authorize(characteristic, Operation::Subscribe)
            .map_err(|error| match error {
                GattError::CapabilityDenied { uuid, .. } => SubscriptionError::NotNotifiable(uuid),
                _ => SubscriptionError::UnknownCharacteristic(characteristic),
            })?;
        if self
            .subscriptions
            .entry(characteristic)
            .or_default()
            .insert(client)
        {
            trace!("[Tracker] {client} subscribed to {characteristic}");
        }
        Ok(())
    }

    /// Returns whether a subscription was removed.
    pub fn unsubscribe(&mut self, client: ClientId, characteristic: Uuid) -> bool {
        let Some(subscribers) = self.subscriptions.get_mut(&characteristic) else {
            return false;
        };
        let removed = subscribers.remove(&client);
        if subscribers.is_empty() {
            self.subscriptions.remove(&characteristic);
        }
        removed
    }

    pub fn is_subscribed(&self, client: ClientId, characteristic: Uuid) -> bool {
        self.subscriptions
            .get(&characteristic)
            .is_some_and(|subscribers| subscribers.contains(&client))
    }

    /// Snapshot of the clients currently subscribed to `characteristic`.
    pub fn active_subscribers(&self, characteristic: Uuid) -> BTreeSet<ClientId> {
        self.subscriptions
            .get(&characteristic)
            .cloned()
            .unwrap_or_default()
    }

    pub fn client(&self, client: ClientId) -> Option<&ConnectedClient> {
        self.clients.get(&client)
    }

    pub fn clients(&self) -> impl Iterator<Item = &ConnectedClient> {
        self.clients.values()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Drops every client and subscription, returning the clients that were connected.
    pub fn clear(&mut self) -> Vec<ConnectedClient> {
        self.subscriptions.clear();
        std::mem::take(&mut self.clients).into_values().collect()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    use gripsim_domain::tree::{
        CONTROL_CHARACTERISTIC_UUID, DEVICE_INFO_CHARACTERISTIC_UUID,
        GRIP_DATA_CHARACTERISTIC_UUID, support_frame_registry,
    };

    use crate::error::{SubscriptionError, TrackerError};

    use super::ConnectionTracker;

    fn tracker(max_clients: usize) -> ConnectionTracker {
        ConnectionTracker::new(Arc::new(support_frame_registry().unwrap()), max_clients)
    }

    #[test]
    fn connect_reports_first_client() {
        let mut tracker = tracker(2);
        let at = Utc.timestamp_opt(0, 0).unwrap();
        let a = tracker.on_connect("AA:BB:CC:DD:EE:01", at).unwrap();
        let b = tracker.on_connect("AA:BB:CC:DD:EE:02", at).unwrap();
        assert!(a.first);
        assert!(!b.first);
        assert_ne!(a.client, b.client);
        assert_eq!(tracker.len(), 2);
        assert_eq!(
            tracker.client(a.client).unwrap().address,
            "AA:BB:CC:DD:EE:01"
        );
    }

    #[test]
    fn capacity_is_enforced() {
        let mut tracker = tracker(1);
        let at = Utc.timestamp_opt(0, 0).unwrap();
        tracker.on_connect("AA:BB:CC:DD:EE:01", at).unwrap();
        assert_eq!(
            tracker.on_connect("AA:BB:CC:DD:EE:02", at),
            Err(TrackerError::CapacityExceeded { max: 1 })
        );
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn ids_are_not_reused() {
        let mut tracker = tracker(1);
        let at = Utc.timestamp_opt(0, 0).unwrap();
        let a = tracker.on_connect("AA:BB:CC:DD:EE:01", at).unwrap();
        tracker.on_disconnect(a.client);
        let b = tracker.on_connect("AA:BB:CC:DD:EE:01", at).unwrap();
        assert_ne!(a.client, b.client);
    }

    #[test]
    fn subscribe_validates_client_and_characteristic() {
        let mut tracker = tracker(2);
        let at = Utc.timestamp_opt(0, 0).unwrap();
        let client = tracker.on_connect("AA:BB:CC:DD:EE:01", at).unwrap().client;

        assert_eq!(
            tracker.subscribe(client, CONTROL_CHARACTERISTIC_UUID),
            Err(SubscriptionError::NotNotifiable(CONTROL_CHARACTERISTIC_UUID))
        );
        assert_eq!(
            tracker.subscribe(client, DEVICE_INFO_CHARACTERISTIC_UUID),
            Err(SubscriptionError::NotNotifiable(
                DEVICE_INFO_CHARACTERISTIC_UUID
            ))
        );
        let unknown = Uuid::from_u128(42);
        assert_eq!(
            tracker.subscribe(client, unknown),
            Err(SubscriptionError::UnknownCharacteristic(unknown))
        );

        tracker.on_disconnect(client);
        assert_eq!(
            tracker.subscribe(client, GRIP_DATA_CHARACTERISTIC_UUID),
            Err(SubscriptionError::UnknownClient(client))
        );
        assert!(tracker.active_subscribers(GRIP_DATA_CHARACTERISTIC_UUID).is_empty());
    }

    #[test]
    fn subscribe_is_idempotent() {
        let mut tracker = tracker(2);
        let at = Utc.timestamp_opt(0, 0).unwrap();
        let client = tracker.on_connect("AA:BB:CC:DD:EE:01", at).unwrap().client;
        tracker.subscribe(client, GRIP_DATA_CHARACTERISTIC_UUID).unwrap();
        tracker.subscribe(client, GRIP_DATA_CHARACTERISTIC_UUID).unwrap();
        assert_eq!(
            tracker
                .active_subscribers(GRIP_DATA_CHARACTERISTIC_UUID)
                .into_iter()
                .collect::<Vec<_>>(),
            vec![client]
        );
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let mut tracker = tracker(2);
        let at = Utc.timestamp_opt(0, 0).unwrap();
        let client = tracker.on_connect("AA:BB:CC:DD:EE:01", at).unwrap().client;
        tracker.subscribe(client, GRIP_DATA_CHARACTERISTIC_UUID).unwrap();
        assert!(tracker.unsubscribe(client, GRIP_DATA_CHARACTERISTIC_UUID));
        assert!(!tracker.unsubscribe(client, GRIP_DATA_CHARACTERISTIC_UUID));
        assert!(!tracker.is_subscribed(client, GRIP_DATA_CHARACTERISTIC_UUID));
    }

    #[test]
    fn disconnect_drops_subscriptions() {
        let mut tracker = tracker(2);
        let at = Utc.timestamp_opt(0, 0).unwrap();
        let a = tracker.on_connect("AA:BB:CC:DD:EE:01", at).unwrap().client;
        let b = tracker.on_connect("AA:BB:CC:DD:EE:02", at).unwrap().client;
        tracker.subscribe(a, GRIP_DATA_CHARACTERISTIC_UUID).unwrap();
        tracker.subscribe(b, GRIP_DATA_CHARACTERISTIC_UUID).unwrap();

        let gone = tracker.on_disconnect(a).unwrap();
        assert!(!gone.last);
        assert_eq!(gone.dropped_subscriptions, vec![GRIP_DATA_CHARACTERISTIC_UUID]);
        assert!(!tracker.is_subscribed(a, GRIP_DATA_CHARACTERISTIC_UUID));
        assert!(tracker.is_subscribed(b, GRIP_DATA_CHARACTERISTIC_UUID));

        let gone = tracker.on_disconnect(b).unwrap();
        assert!(gone.last);
        assert!(tracker.on_disconnect(b).is_none());
        assert!(tracker.active_subscribers(GRIP_DATA_CHARACTERISTIC_UUID).is_empty());
    }

    #[test]
    fn clear_returns_connected_clients() {
        let mut tracker = tracker(2);
        let at = Utc.timestamp_opt(0, 0).unwrap();
        let a = tracker.on_connect("AA:BB:CC:DD:EE:01", at).unwrap().client;
        tracker.subscribe(a, GRIP_DATA_CHARACTERISTIC_UUID).unwrap();
        let cleared = tracker.clear();
        assert_eq!(cleared.len(), 1);
        assert!(tracker.is_empty());
        assert!(tracker.active_subscribers(GRIP_DATA_CHARACTERISTIC_UUID).is_empty());
    }
}
