//! Notification delivery with latest-value-wins backpressure.
//!
//! Every `(client, characteristic)` pair owns at most one delivery task. While a send is in
//! flight, newer payloads overwrite a single pending slot instead of queueing, so a slow client
//! always ends up with the most recent value and memory stays bounded.

use std::{
    collections::{HashMap, hash_map::Entry},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{trace, warn};
use uuid::Uuid;

use crate::{
    lock,
    transport::{ClientId, Transport, TransportError},
};

/// Receives delivery outcomes from the scheduler's tasks.
#[async_trait]
pub trait DeliveryObserver: Send + Sync {
    fn delivered(&self, client: ClientId, characteristic: Uuid);
    /// The slot has already been dropped; nothing is retried.
    async fn delivery_failed(&self, client: ClientId, characteristic: Uuid, error: TransportError);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Offer {
    /// A delivery task was started for this payload.
    Dispatched,
    /// A send was still in flight; the payload replaced whatever was pending.
    Coalesced,
}

type SlotKey = (ClientId, Uuid);

struct Slot {
    generation: u64,
    pending: Option<Arc<[u8]>>,
}

#[derive(Default)]
struct Slots {
    next_generation: u64,
    in_flight: HashMap<SlotKey, Slot>,
}

#[derive(Clone)]
pub struct NotificationScheduler {
    transport: Arc<dyn Transport>,
    observer: Arc<dyn DeliveryObserver>,
    slots: Arc<Mutex<Slots>>,
}

impl NotificationScheduler {
    pub fn new(
        transport: Arc<dyn Transport>,
        observer: Arc<dyn DeliveryObserver>,
    ) -> NotificationScheduler {
        NotificationScheduler {
            transport,
            observer,
            slots: Arc::default(),
        }
    }

    /// Must be called from within a tokio runtime.
    pub fn offer(&self, client: ClientId, characteristic: Uuid, payload: Arc<[u8]>) -> Offer {
        let key = (client, characteristic);
        let mut slots = lock(&self.slots);
        let Slots {
            next_generation,
            in_flight,
        } = &mut *slots;
        match in_flight.entry(key) {
            Entry::Occupied(mut slot) => {
                trace!("[Scheduler] {client}/{characteristic} busy, coalescing");
                slot.get_mut().pending = Some(payload);
                Offer::Coalesced
            }
            Entry::Vacant(slot) => {
                let generation = *next_generation;
                *next_generation += 1;
                slot.insert(Slot {
                    generation,
                    pending: None,
                });
                tokio::spawn(deliver(self.clone(), key, generation, payload));
                Offer::Dispatched
            }
        }
    }

    /// Drops pending payloads for `client`; sends already in flight complete but are not followed up.
    pub fn forget_client(&self, client: ClientId) {
        lock(&self.slots)
            .in_flight
            .retain(|(owner, _), _| *owner != client);
    }

    /// Drops the pending payload for one pair. A send already in flight keeps its slot, so a
    /// later offer for the pair coalesces behind it instead of starting a second task.
    pub fn discard_pending(&self, client: ClientId, characteristic: Uuid) {
        if let Some(slot) = lock(&self.slots).in_flight.get_mut(&(client, characteristic)) {
            slot.pending = None;
        }
    }

    pub fn clear(&self) {
        lock(&self.slots).in_flight.clear();
    }

    /// Number of pairs with a send in flight.
    pub fn in_flight(&self) -> usize {
        lock(&self.slots).in_flight.len()
    }

    /// Takes the next payload for `key`, or retires the slot when nothing is pending.
    fn next_payload(&self, key: SlotKey, generation: u64) -> Option<Arc<[u8]>> {
        let mut slots = lock(&self.slots);
        let Entry::Occupied(mut slot) = slots.in_flight.entry(key) else {
            return None;
        };
        if slot.get().generation != generation {
            return None;
        }
        let next = slot.get_mut().pending.take();
        if next.is_none() {
            slot.remove();
        }
        next
    }

    fn retire(&self, key: SlotKey, generation: u64) {
        let mut slots = lock(&self.slots);
        if slots
            .in_flight
            .get(&key)
            .is_some_and(|slot| slot.generation == generation)
        {
            slots.in_flight.remove(&key);
        }
    }
}

async fn deliver(
    scheduler: NotificationScheduler,
    key: SlotKey,
    generation: u64,
    mut payload: Arc<[u8]>,
) {
    let (client, characteristic) = key;
    loop {
        match scheduler
            .transport
            .notify(client, characteristic, &payload)
            .await
        {
            Ok(()) => scheduler.observer.delivered(client, characteristic),
            Err(error) => {
                scheduler.retire(key, generation);
                warn!("[Scheduler] Delivery to {client}/{characteristic} failed: {error}");
                scheduler
                    .observer
                    .delivery_failed(client, characteristic, error)
                    .await;
                return;
            }
        }
        match scheduler.next_payload(key, generation) {
            Some(next) => payload = next,
            None => return,
        }
    }
}

/// Calls `on_tick` every `period`, starting one period from now, until it returns `false`.
pub fn spawn_ticker<F>(period: Duration, on_tick: F) -> JoinHandle<()>
where
    F: Fn() -> bool + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticks = time::interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            if !on_tick() {
                trace!("[Scheduler] Ticker finished");
                return;
            }
        }
    })
}

#[cfg(test)]
mod test {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
    use uuid::Uuid;

    use gripsim_domain::tree::GRIP_DATA_CHARACTERISTIC_UUID;

    use crate::{
        sim::SimTransport,
        transport::{ClientId, TransportError},
    };

    use super::{DeliveryObserver, NotificationScheduler, Offer, spawn_ticker};

    #[derive(Debug, PartialEq, Eq)]
    enum Outcome {
        Delivered(ClientId, Uuid),
        Failed(ClientId, Uuid),
    }

    struct Recorder(UnboundedSender<Outcome>);

    #[async_trait]
    impl DeliveryObserver for Recorder {
        fn delivered(&self, client: ClientId, characteristic: Uuid) {
            let _ = self.0.send(Outcome::Delivered(client, characteristic));
        }

        async fn delivery_failed(
            &self,
            client: ClientId,
            characteristic: Uuid,
            _error: TransportError,
        ) {
            let _ = self.0.send(Outcome::Failed(client, characteristic));
        }
    }

    fn scheduler() -> (
        Arc<SimTransport>,
        NotificationScheduler,
        UnboundedReceiver<Outcome>,
    ) {
        let transport = Arc::new(SimTransport::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = NotificationScheduler::new(transport.clone(), Arc::new(Recorder(tx)));
        (transport, scheduler, rx)
    }

    fn payload(text: &str) -> Arc<[u8]> {
        Arc::from(text.as_bytes())
    }

    const GRIP: Uuid = GRIP_DATA_CHARACTERISTIC_UUID;

    #[tokio::test]
    async fn single_offer_is_delivered() {
        let (transport, scheduler, mut outcomes) = scheduler();
        let client = ClientId(1);

        assert_eq!(scheduler.offer(client, GRIP, payload("one")), Offer::Dispatched);
        assert_eq!(outcomes.recv().await, Some(Outcome::Delivered(client, GRIP)));

        let sent = transport.notifications();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].client, client);
        assert_eq!(sent[0].payload, b"one".to_vec());
    }

    #[tokio::test]
    async fn busy_pair_keeps_only_latest_value() {
        let (transport, scheduler, mut outcomes) = scheduler();
        let client = ClientId(1);
        transport.hold_deliveries();

        assert_eq!(scheduler.offer(client, GRIP, payload("one")), Offer::Dispatched);
        assert_eq!(scheduler.offer(client, GRIP, payload("two")), Offer::Coalesced);
        assert_eq!(scheduler.offer(client, GRIP, payload("three")), Offer::Coalesced);
        assert_eq!(scheduler.in_flight(), 1);

        transport.release_deliveries();
        assert_eq!(outcomes.recv().await, Some(Outcome::Delivered(client, GRIP)));
        assert_eq!(outcomes.recv().await, Some(Outcome::Delivered(client, GRIP)));

        let payloads: Vec<Vec<u8>> = transport
            .notifications()
            .into_iter()
            .map(|notification| notification.payload)
            .collect();
        assert_eq!(payloads, vec![b"one".to_vec(), b"three".to_vec()]);
    }

    #[tokio::test]
    async fn pairs_do_not_block_each_other() {
        let (transport, scheduler, _outcomes) = scheduler();
        transport.hold_deliveries();
        assert_eq!(scheduler.offer(ClientId(1), GRIP, payload("a")), Offer::Dispatched);
        assert_eq!(scheduler.offer(ClientId(2), GRIP, payload("b")), Offer::Dispatched);
        assert_eq!(scheduler.in_flight(), 2);
        transport.release_deliveries();
        assert!(transport.wait_for_notifications(2, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn forgotten_client_drops_pending_value() {
        let (transport, scheduler, mut outcomes) = scheduler();
        let client = ClientId(1);
        transport.hold_deliveries();

        scheduler.offer(client, GRIP, payload("one"));
        scheduler.offer(client, GRIP, payload("two"));
        scheduler.forget_client(client);
        assert_eq!(scheduler.in_flight(), 0);

        transport.release_deliveries();
        assert_eq!(outcomes.recv().await, Some(Outcome::Delivered(client, GRIP)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.notifications().len(), 1);
    }

    #[tokio::test]
    async fn discarded_pair_stays_single_flight() {
        let (transport, scheduler, mut outcomes) = scheduler();
        let client = ClientId(1);
        transport.hold_deliveries();

        assert_eq!(scheduler.offer(client, GRIP, payload("one")), Offer::Dispatched);
        scheduler.offer(client, GRIP, payload("two"));
        scheduler.discard_pending(client, GRIP);
        assert_eq!(scheduler.in_flight(), 1);
        assert_eq!(scheduler.offer(client, GRIP, payload("three")), Offer::Coalesced);

        transport.release_deliveries();
        assert_eq!(outcomes.recv().await, Some(Outcome::Delivered(client, GRIP)));
        assert_eq!(outcomes.recv().await, Some(Outcome::Delivered(client, GRIP)));
        let payloads: Vec<Vec<u8>> = transport
            .notifications()
            .into_iter()
            .map(|notification| notification.payload)
            .collect();
        assert_eq!(payloads, vec![b"one".to_vec(), b"three".to_vec()]);
    }

    #[tokio::test]
    async fn discarding_idle_pair_is_a_no_op() {
        let (_transport, scheduler, _outcomes) = scheduler();
        scheduler.discard_pending(ClientId(1), GRIP);
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[tokio::test]
    async fn failure_is_reported_once_and_slot_released() {
        let (transport, scheduler, mut outcomes) = scheduler();
        let client = ClientId(7);
        transport.fail_client(client);

        assert_eq!(scheduler.offer(client, GRIP, payload("one")), Offer::Dispatched);
        assert_eq!(outcomes.recv().await, Some(Outcome::Failed(client, GRIP)));
        assert_eq!(scheduler.in_flight(), 0);
        assert!(transport.notifications().is_empty());
    }

    #[tokio::test]
    async fn ticker_stops_when_callback_declines() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let handle = spawn_ticker(Duration::from_millis(10), move || {
            counted.fetch_add(1, Ordering::SeqCst) < 2
        });
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
