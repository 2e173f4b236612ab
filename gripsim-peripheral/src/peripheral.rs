//! The peripheral orchestrator.
//!
//! All bookkeeping (tracker, advertising machine, generator) is synchronous and guarded by
//! short-lived mutexes that are never held across an `.await`. Only calls into the
//! [`Transport`] suspend. Transport callbacks and control calls are therefore serialized on
//! the tracker: once `on_disconnect` has returned, no later tick can see that client.

use std::sync::{
    Arc, Mutex, Weak,
    atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::{runtime::Handle, sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use gripsim_domain::{
    control::ControlCommand,
    gatt::{GattError, GattRegistry, Operation},
    generator::{Generator, ScorePolicy, WeightedMeanScore},
    mode::SimulationMode,
    reading::GripReading,
    tree::{
        CONTROL_CHARACTERISTIC_UUID, DEVICE_INFO_CHARACTERISTIC_UUID, DeviceInfo,
        GRIP_DATA_CHARACTERISTIC_UUID, support_frame_registry,
    },
};

use crate::{
    advertising::{AdvertisingMachine, AdvertisingState, RadioAction},
    config::PeripheralConfig,
    error::{AccessError, ConnectError, OrchestratorError, SubscriptionError},
    lock,
    scheduler::{DeliveryObserver, NotificationScheduler, Offer, spawn_ticker},
    tracker::{ConnectedClient, ConnectionTracker},
    transport::{ClientId, Transport, TransportError},
};

/// Snapshot returned by [`Peripheral::status`].
#[derive(Clone, Debug, Serialize)]
pub struct PeripheralStatus {
    pub advertising_state: AdvertisingState,
    pub connected_clients: usize,
    pub clients: Vec<ConnectedClient>,
    pub current_reading: GripReading,
    pub mode: SimulationMode,
    pub generation_paused: bool,
    pub notifications_sent: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub device_name: Option<String>,
}

/// Outcome of one scheduler tick.
#[derive(Clone, Debug, Default)]
pub struct TickReport {
    /// The reading pushed this tick, `None` when idle or generation is paused.
    pub reading: Option<Arc<GripReading>>,
    pub dispatched: usize,
    pub coalesced: usize,
}

#[derive(Clone)]
pub struct Peripheral {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    registry: Arc<GattRegistry>,
    device_info: DeviceInfo,
    state: Mutex<State>,
    control: Mutex<Control>,
    reading: watch::Sender<Arc<GripReading>>,
    scheduler: NotificationScheduler,
    /// Serializes radio calls made on behalf of advertising transitions.
    radio: tokio::sync::Mutex<()>,
    notifications_sent: AtomicU64,
    next_session: AtomicU64,
}

struct State {
    tracker: ConnectionTracker,
    session: Option<Session>,
}

/// One start..stop lifetime.
struct Session {
    id: u64,
    config: PeripheralConfig,
    advertising: AdvertisingMachine,
    started_at: DateTime<Utc>,
    ticker: Option<JoinHandle<()>>,
}

struct Control {
    mode: SimulationMode,
    paused: bool,
    /// Sent on the next tick in place of a generated reading.
    injected: Option<Arc<GripReading>>,
    generator: Generator<Arc<dyn ScorePolicy>>,
}

impl Peripheral {
    /// A peripheral exposing the support-frame GATT tree.
    pub fn new(transport: Arc<dyn Transport>) -> Result<Peripheral, GattError> {
        Ok(Peripheral::with_registry(transport, support_frame_registry()?))
    }

    pub fn with_registry(transport: Arc<dyn Transport>, registry: GattRegistry) -> Peripheral {
        let registry = Arc::new(registry);
        let policy: Arc<dyn ScorePolicy> = Arc::new(WeightedMeanScore);
        let inner = Arc::new_cyclic(|inner: &Weak<Inner>| {
            let observer = Arc::new(SessionObserver {
                inner: inner.clone(),
            });
            Inner {
                scheduler: NotificationScheduler::new(transport.clone(), observer),
                transport,
                registry: registry.clone(),
                device_info: DeviceInfo::default(),
                state: Mutex::new(State {
                    tracker: ConnectionTracker::new(
                        registry,
                        PeripheralConfig::default().max_clients,
                    ),
                    session: None,
                }),
                control: Mutex::new(Control {
                    mode: SimulationMode::default(),
                    paused: false,
                    injected: None,
                    generator: Generator::from_seed(None, policy),
                }),
                reading: watch::Sender::new(Arc::new(GripReading::initial(Utc::now()))),
                radio: tokio::sync::Mutex::new(()),
                notifications_sent: AtomicU64::new(0),
                next_session: AtomicU64::new(1),
            }
        });
        Peripheral { inner }
    }

    pub fn set_score_policy(&self, policy: Arc<dyn ScorePolicy>) {
        lock(&self.inner.control).generator.set_policy(policy);
    }

    pub fn registry(&self) -> &GattRegistry {
        &self.inner.registry
    }

    /// Begins advertising and schedules notifications. A no-op while already running.
    ///
    /// Fails with [`OrchestratorError::StartInProgress`] while another call is still waiting on
    /// the adapter, since that call may yet fail.
    pub async fn start(&self, config: PeripheralConfig) -> Result<(), OrchestratorError> {
        config.validate()?;

        let session_id = {
            let mut state = lock(&self.inner.state);
            if let Some(session) = &state.session {
                if session.ticker.is_none() {
                    return Err(OrchestratorError::StartInProgress);
                }
                debug!("[Peripheral] Already started");
                return Ok(());
            }
            let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
            state.tracker.set_capacity(config.max_clients);
            state.session = Some(Session {
                id,
                config: config.clone(),
                advertising: AdvertisingMachine::new(config.advertise_while_connected),
                started_at: Utc::now(),
                ticker: None,
            });
            id
        };

        let advertised = {
            let _radio = self.inner.radio.lock().await;
            self.inner
                .transport
                .advertise(&config.device_name, &self.inner.registry.service_uuids())
                .await
        };
        if let Err(error) = advertised {
            let mut state = lock(&self.inner.state);
            if state
                .session
                .as_ref()
                .is_some_and(|session| session.id == session_id)
            {
                state.session = None;
            }
            warn!("[Peripheral] Failed to start advertising: {error}");
            return Err(error.into());
        }

        let committed = {
            let mut state = lock(&self.inner.state);
            let clients = state.tracker.len();
            match state.session.as_mut() {
                Some(session) if session.id == session_id => {
                    session.advertising.advertising_started(clients);
                    session.ticker = Some(self.spawn_ticker(session_id, config.notify_interval));
                    true
                }
                _ => false,
            }
        };
        if !committed {
            debug!("[Peripheral] Stopped while starting, withdrawing advertisement");
            self.withdraw_advertisement().await;
            return Ok(());
        }

        {
            let mut control = lock(&self.inner.control);
            control.paused = false;
            if let Some(mode) = config.initial_mode {
                control.mode = mode;
            }
            if config.seed.is_some() {
                control.generator.reseed(config.seed);
            }
        }
        info!(
            "[Peripheral] Advertising as {} every {}",
            config.device_name,
            humantime::format_duration(config.notify_interval)
        );
        Ok(())
    }

    /// Returns to `Idle` immediately and never waits on the radio.
    ///
    /// Clients and subscriptions are dropped at once so nothing further is scheduled. Tearing
    /// down the advertisement and the links is handed to the transport in the background.
    pub fn stop(&self) {
        let (session, clients) = {
            let mut state = lock(&self.inner.state);
            let Some(mut session) = state.session.take() else {
                return;
            };
            session.advertising.stop();
            self.inner.scheduler.clear();
            (session, state.tracker.clear())
        };
        if let Some(ticker) = session.ticker {
            ticker.abort();
        }
        lock(&self.inner.control).injected = None;
        info!(
            "[Peripheral] Stopped with {} client(s) connected",
            clients.len()
        );

        let Ok(runtime) = Handle::try_current() else {
            warn!("[Peripheral] No runtime available, radio teardown skipped");
            return;
        };
        let inner = self.inner.clone();
        runtime.spawn(async move {
            let peripheral = Peripheral { inner };
            peripheral.withdraw_advertisement().await;
            let transport = &peripheral.inner.transport;
            let results = join_all(clients.iter().map(|client| transport.disconnect(client.id))).await;
            for (client, result) in clients.iter().zip(results) {
                if let Err(error) = result {
                    debug!("[Peripheral] Disconnecting {} failed: {error}", client.id);
                }
            }
        });
    }

    pub fn status(&self) -> PeripheralStatus {
        let (advertising_state, clients, started_at, device_name) = {
            let state = lock(&self.inner.state);
            let session = state.session.as_ref();
            (
                session.map_or(AdvertisingState::Idle, |session| session.advertising.state()),
                state.tracker.clients().cloned().collect::<Vec<_>>(),
                session.map(|session| session.started_at),
                session.map(|session| session.config.device_name.clone()),
            )
        };
        let (mode, generation_paused) = {
            let control = lock(&self.inner.control);
            (control.mode, control.paused)
        };
        PeripheralStatus {
            advertising_state,
            connected_clients: clients.len(),
            clients,
            current_reading: (*self.current_reading()).clone(),
            mode,
            generation_paused,
            notifications_sent: self.inner.notifications_sent.load(Ordering::Relaxed),
            started_at,
            device_name,
        }
    }

    pub fn advertising_state(&self) -> AdvertisingState {
        lock(&self.inner.state)
            .session
            .as_ref()
            .map_or(AdvertisingState::Idle, |session| session.advertising.state())
    }

    pub fn current_reading(&self) -> Arc<GripReading> {
        self.inner.reading.borrow().clone()
    }

    /// Observes every newly published reading.
    pub fn readings(&self) -> watch::Receiver<Arc<GripReading>> {
        self.inner.reading.subscribe()
    }

    /// Takes effect on the next tick.
    pub fn set_mode(&self, mode: SimulationMode) {
        let previous = std::mem::replace(&mut lock(&self.inner.control).mode, mode);
        if previous != mode {
            info!("[Peripheral] Mode {previous} -> {mode}");
        }
    }

    pub fn mode(&self) -> SimulationMode {
        lock(&self.inner.control).mode
    }

    /// Pausing keeps the last reading readable but stops notifications.
    pub fn set_generation_paused(&self, paused: bool) {
        lock(&self.inner.control).paused = paused;
        debug!("[Peripheral] Generation paused: {paused}");
    }

    /// Publishes `reading` at once and sends it on the next tick instead of a generated one.
    pub fn inject_reading(&self, reading: GripReading) {
        let reading = Arc::new(reading);
        let mut control = lock(&self.inner.control);
        control.injected = Some(reading.clone());
        self.inner.reading.send_replace(reading);
    }

    /// Runs one grip-data notification round immediately. Must be called from within a tokio
    /// runtime.
    pub fn tick(&self) -> TickReport {
        self.tick_session(None).unwrap_or_default()
    }

    pub async fn on_connect(&self, address: &str) -> Result<ClientId, ConnectError> {
        let (client, action, session_id) = {
            let mut state = lock(&self.inner.state);
            let State { tracker, session } = &mut *state;
            let session = match session {
                Some(session) if session.advertising.state() != AdvertisingState::Idle => session,
                _ => return Err(ConnectError::NotAdvertising),
            };
            let connected = tracker.on_connect(address, Utc::now())?;
            let action = session.advertising.client_connected(tracker.len());
            (connected.client, action, session.id)
        };
        info!("[Peripheral] {client} connected from {address}");
        if let Some(action) = action {
            self.apply_radio(action, session_id).await;
        }
        Ok(client)
    }

    /// Idempotent; unknown clients are ignored.
    pub async fn on_disconnect(&self, client: ClientId) {
        self.drop_client(client).await;
    }

    pub fn subscribe(&self, client: ClientId, characteristic: Uuid) -> Result<(), SubscriptionError> {
        lock(&self.inner.state)
            .tracker
            .subscribe(client, characteristic)?;
        debug!("[Peripheral] {client} subscribed to {characteristic}");
        Ok(())
    }

    pub fn unsubscribe(&self, client: ClientId, characteristic: Uuid) {
        let mut state = lock(&self.inner.state);
        if state.tracker.unsubscribe(client, characteristic) {
            self.inner.scheduler.discard_pending(client, characteristic);
            debug!("[Peripheral] {client} unsubscribed from {characteristic}");
        }
    }

    pub fn on_read(&self, characteristic: Uuid) -> Result<Vec<u8>, AccessError> {
        self.ensure_running()?;
        self.inner
            .registry
            .authorize(characteristic, Operation::Read)?;
        let value = if characteristic == GRIP_DATA_CHARACTERISTIC_UUID {
            self.current_reading().to_payload()
        } else if characteristic == DEVICE_INFO_CHARACTERISTIC_UUID {
            self.inner.device_info.to_string().into_bytes()
        } else {
            Vec::new()
        };
        Ok(value)
    }

    pub fn on_write(&self, characteristic: Uuid, payload: &[u8]) -> Result<(), AccessError> {
        self.ensure_running()?;
        self.inner
            .registry
            .authorize(characteristic, Operation::Write)?;
        if characteristic == CONTROL_CHARACTERISTIC_UUID {
            let command = ControlCommand::from_payload(payload)?;
            debug!("[Peripheral] Control command {command:?}");
            self.apply_command(command);
        }
        Ok(())
    }

    fn apply_command(&self, command: ControlCommand) {
        match command {
            ControlCommand::Start => self.set_generation_paused(false),
            ControlCommand::Stop => self.set_generation_paused(true),
            ControlCommand::Mode(mode) => self.set_mode(mode),
            ControlCommand::Data(reading) => self.inject_reading(reading),
        }
    }

    fn ensure_running(&self) -> Result<(), AccessError> {
        match self.advertising_state() {
            AdvertisingState::Idle => Err(AccessError::NotRunning),
            _ => Ok(()),
        }
    }

    /// Pushes the next reading to grip-data subscribers only; other notifiable characteristics
    /// are never pushed. `None` if there is no running session, or it is not `expected`.
    fn tick_session(&self, expected: Option<u64>) -> Option<TickReport> {
        let current = lock(&self.inner.state)
            .session
            .as_ref()
            .filter(|session| session.advertising.state() != AdvertisingState::Idle)
            .map(|session| session.id)?;
        if expected.is_some_and(|expected| expected != current) {
            return None;
        }

        let Some(reading) = self.next_reading() else {
            return Some(TickReport::default());
        };
        let payload: Arc<[u8]> = Arc::from(reading.to_payload());

        let mut report = TickReport {
            reading: Some(reading),
            ..TickReport::default()
        };
        let state = lock(&self.inner.state);
        if state.session.as_ref().map(|session| session.id) != Some(current) {
            return None;
        }
        for client in state.tracker.active_subscribers(GRIP_DATA_CHARACTERISTIC_UUID) {
            match self
                .inner
                .scheduler
                .offer(client, GRIP_DATA_CHARACTERISTIC_UUID, payload.clone())
            {
                Offer::Dispatched => report.dispatched += 1,
                Offer::Coalesced => report.coalesced += 1,
            }
        }
        Some(report)
    }

    fn next_reading(&self) -> Option<Arc<GripReading>> {
        let mut control = lock(&self.inner.control);
        if let Some(injected) = control.injected.take() {
            return Some(injected);
        }
        if control.paused {
            return None;
        }
        let mode = control.mode;
        let reading = Arc::new(control.generator.tick(mode));
        self.inner.reading.send_replace(reading.clone());
        Some(reading)
    }

    fn spawn_ticker(&self, session_id: u64, period: std::time::Duration) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        spawn_ticker(period, move || {
            inner.upgrade().is_some_and(|inner| {
                Peripheral { inner }
                    .tick_session(Some(session_id))
                    .is_some()
            })
        })
    }

    /// Returns whether `client` was still connected.
    async fn drop_client(&self, client: ClientId) -> bool {
        let action = {
            let mut state = lock(&self.inner.state);
            let Some(gone) = state.tracker.on_disconnect(client) else {
                return false;
            };
            self.inner.scheduler.forget_client(client);
            debug!(
                "[Peripheral] {client} dropped {} subscription(s)",
                gone.dropped_subscriptions.len()
            );
            let remaining = state.tracker.len();
            state.session.as_mut().and_then(|session| {
                session
                    .advertising
                    .client_disconnected(remaining)
                    .map(|action| (action, session.id))
            })
        };
        info!("[Peripheral] {client} disconnected");
        if let Some((action, session_id)) = action {
            self.apply_radio(action, session_id).await;
        }
        true
    }

    /// Applies a radio action unless a later transition has already superseded it.
    async fn apply_radio(&self, action: RadioAction, session_id: u64) {
        let _radio = self.inner.radio.lock().await;
        let device_name = {
            let state = lock(&self.inner.state);
            let Some(session) = state
                .session
                .as_ref()
                .filter(|session| session.id == session_id)
            else {
                return;
            };
            let expected = match action {
                RadioAction::Suspend => AdvertisingState::Connected,
                RadioAction::Resume => AdvertisingState::Advertising,
            };
            if session.advertising.state() != expected {
                debug!("[Peripheral] Skipping superseded {action:?}");
                return;
            }
            session.config.device_name.clone()
        };
        let result = match action {
            RadioAction::Suspend => self.inner.transport.stop_advertising().await,
            RadioAction::Resume => {
                self.inner
                    .transport
                    .advertise(&device_name, &self.inner.registry.service_uuids())
                    .await
            }
        };
        if let Err(error) = result {
            warn!("[Peripheral] Radio {action:?} failed: {error}");
        }
    }

    /// Stops broadcasting unless a newer session has started meanwhile.
    async fn withdraw_advertisement(&self) {
        let _radio = self.inner.radio.lock().await;
        if lock(&self.inner.state).session.is_some() {
            return;
        }
        if let Err(error) = self.inner.transport.stop_advertising().await {
            debug!("[Peripheral] Stopping advertisement failed: {error}");
        }
    }
}

/// Routes delivery outcomes back into the owning peripheral.
struct SessionObserver {
    inner: Weak<Inner>,
}

#[async_trait]
impl DeliveryObserver for SessionObserver {
    fn delivered(&self, _client: ClientId, _characteristic: Uuid) {
        if let Some(inner) = self.inner.upgrade() {
            inner.notifications_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn delivery_failed(&self, client: ClientId, _characteristic: Uuid, error: TransportError) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let peripheral = Peripheral { inner };
        if peripheral.drop_client(client).await {
            warn!("[Peripheral] Forcing disconnect of {client} after failed delivery: {error}");
            if let Err(error) = peripheral.inner.transport.disconnect(client).await {
                debug!("[Peripheral] Disconnecting {client} failed: {error}");
            }
        }
    }
}
