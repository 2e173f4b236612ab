//! In-process transport and centrals for tests and the demo binary.
//!
//! [`SimTransport`] records every outbound radio call. Deliveries can be held back, delayed or
//! failed per client to exercise backpressure and forced-disconnect handling.

use std::{
    collections::HashSet,
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::watch, time};
use tracing::trace;
use uuid::Uuid;

use crate::{
    error::{AccessError, ConnectError, SubscriptionError},
    lock,
    peripheral::Peripheral,
    transport::{ClientId, Transport, TransportError},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub client: ClientId,
    pub characteristic: Uuid,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
struct Radio {
    adapter_available: bool,
    advertising: bool,
    advertised_name: Option<String>,
    advertised_services: Vec<Uuid>,
    advertise_calls: usize,
    stop_advertising_calls: usize,
    delivery_delay: Option<Duration>,
    failing: HashSet<ClientId>,
    notifications: Vec<Notification>,
    disconnect_requests: Vec<ClientId>,
}

pub struct SimTransport {
    radio: Mutex<Radio>,
    /// `true` while deliveries may proceed.
    gate: watch::Sender<bool>,
    /// Bumped on every recorded event so waiters can re-check.
    changes: watch::Sender<u64>,
}

impl Default for SimTransport {
    fn default() -> SimTransport {
        SimTransport::new()
    }
}

impl SimTransport {
    pub fn new() -> SimTransport {
        SimTransport {
            radio: Mutex::new(Radio {
                adapter_available: true,
                advertising: false,
                advertised_name: None,
                advertised_services: Vec::new(),
                advertise_calls: 0,
                stop_advertising_calls: 0,
                delivery_delay: None,
                failing: HashSet::new(),
                notifications: Vec::new(),
                disconnect_requests: Vec::new(),
            }),
            gate: watch::Sender::new(true),
            changes: watch::Sender::new(0),
        }
    }

    pub fn without_adapter() -> SimTransport {
        let transport = SimTransport::new();
        transport.set_adapter_available(false);
        transport
    }

    pub fn set_adapter_available(&self, available: bool) {
        lock(&self.radio).adapter_available = available;
    }

    pub fn set_delivery_delay(&self, delay: Option<Duration>) {
        lock(&self.radio).delivery_delay = delay;
    }

    /// Blocks every `notify` call until [`SimTransport::release_deliveries`].
    pub fn hold_deliveries(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_deliveries(&self) {
        self.gate.send_replace(true);
    }

    /// Makes every future notification to `client` fail with [`TransportError::ClientGone`].
    pub fn fail_client(&self, client: ClientId) {
        lock(&self.radio).failing.insert(client);
    }

    pub fn is_advertising(&self) -> bool {
        lock(&self.radio).advertising
    }

    pub fn advertised_name(&self) -> Option<String> {
        lock(&self.radio).advertised_name.clone()
    }

    pub fn advertised_services(&self) -> Vec<Uuid> {
        lock(&self.radio).advertised_services.clone()
    }

    pub fn advertise_calls(&self) -> usize {
        lock(&self.radio).advertise_calls
    }

    pub fn stop_advertising_calls(&self) -> usize {
        lock(&self.radio).stop_advertising_calls
    }

    pub fn notifications(&self) -> Vec<Notification> {
        lock(&self.radio).notifications.clone()
    }

    pub fn notifications_for(&self, client: ClientId) -> Vec<Notification> {
        lock(&self.radio)
            .notifications
            .iter()
            .filter(|notification| notification.client == client)
            .cloned()
            .collect()
    }

    pub fn disconnect_requests(&self) -> Vec<ClientId> {
        lock(&self.radio).disconnect_requests.clone()
    }

    /// Returns `false` if fewer than `count` notifications were recorded before `timeout`.
    pub async fn wait_for_notifications(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |radio| radio.notifications.len() >= count)
            .await
    }

    pub async fn wait_for_disconnect_requests(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |radio| radio.disconnect_requests.len() >= count)
            .await
    }

    pub async fn wait_for_advertising(&self, advertising: bool, timeout: Duration) -> bool {
        self.wait_until(timeout, |radio| radio.advertising == advertising)
            .await
    }

    async fn wait_until(&self, timeout: Duration, done: impl Fn(&Radio) -> bool) -> bool {
        let mut changes = self.changes.subscribe();
        time::timeout(timeout, async {
            loop {
                if done(&*lock(&self.radio)) {
                    return;
                }
                if changes.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .is_ok()
    }

    fn record(&self, event: impl FnOnce(&mut Radio)) {
        event(&mut *lock(&self.radio));
        self.changes.send_modify(|version| *version += 1);
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn advertise(&self, name: &str, service_uuids: &[Uuid]) -> Result<(), TransportError> {
        if !lock(&self.radio).adapter_available {
            return Err(TransportError::AdapterUnavailable(
                "simulated adapter switched off".to_string(),
            ));
        }
        trace!("[SimTransport] Advertising {name}");
        self.record(|radio| {
            radio.advertising = true;
            radio.advertised_name = Some(name.to_string());
            radio.advertised_services = service_uuids.to_vec();
            radio.advertise_calls += 1;
        });
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), TransportError> {
        self.record(|radio| {
            radio.advertising = false;
            radio.stop_advertising_calls += 1;
        });
        Ok(())
    }

    async fn notify(
        &self,
        client: ClientId,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let delay = lock(&self.radio).delivery_delay;
        if let Some(delay) = delay {
            time::sleep(delay).await;
        }
        let mut gate = self.gate.subscribe();
        gate.wait_for(|open| *open)
            .await
            .map_err(|error| TransportError::Io(error.to_string()))?;

        if lock(&self.radio).failing.contains(&client) {
            return Err(TransportError::ClientGone(client));
        }
        self.record(|radio| {
            radio.notifications.push(Notification {
                client,
                characteristic,
                payload: payload.to_vec(),
            })
        });
        Ok(())
    }

    async fn disconnect(&self, client: ClientId) -> Result<(), TransportError> {
        self.record(|radio| radio.disconnect_requests.push(client));
        Ok(())
    }
}

/// A client device driving a [`Peripheral`] through its transport callbacks.
pub struct SimCentral {
    peripheral: Peripheral,
    id: ClientId,
    address: String,
}

impl SimCentral {
    pub async fn connect(peripheral: &Peripheral, address: &str) -> Result<SimCentral, ConnectError> {
        let id = peripheral.on_connect(address).await?;
        Ok(SimCentral {
            peripheral: peripheral.clone(),
            id,
            address: address.to_string(),
        })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn subscribe(&self, characteristic: Uuid) -> Result<(), SubscriptionError> {
        self.peripheral.subscribe(self.id, characteristic)
    }

    pub fn unsubscribe(&self, characteristic: Uuid) {
        self.peripheral.unsubscribe(self.id, characteristic)
    }

    pub fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, AccessError> {
        self.peripheral.on_read(characteristic)
    }

    pub fn write(&self, characteristic: Uuid, payload: &[u8]) -> Result<(), AccessError> {
        self.peripheral.on_write(characteristic, payload)
    }

    pub async fn disconnect(self) {
        self.peripheral.on_disconnect(self.id).await
    }
}
