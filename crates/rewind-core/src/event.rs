//! Simulation events and observer dispatch.
//!
//! Simulation logic raises events into the frame it is running on. After
//! each simulated tick the session drains them through the
//! [`EventReconciler`](crate::reconcile::EventReconciler), which decides
//! what observers see and with which [`DeliveryStatus`]. Delivery to
//! observers goes through an [`EventDispatcher`].
//!
//! # Subscriber ordering
//!
//! Subscribers run sorted by `(priority, insertion order)`, and an optional
//! filter can skip individual deliveries.

use std::collections::BTreeMap;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::checksum::StateHash;
use crate::fixed::Tick;
use crate::id::EventTypeId;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// A typed event that simulation logic can raise.
///
/// `KIND` must be unique per type and identical on every participant.
/// `SYNCED` events are only meaningful once verified: they are never
/// delivered from a predicted frame.
pub trait EventType: Serialize + DeserializeOwned + 'static {
    const KIND: EventTypeId;
    const SYNCED: bool = false;
}

/// A raised event in its encoded form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventTypeId,
    pub synced: bool,
    pub payload: Vec<u8>,
}

impl Event {
    pub fn encode<E: EventType>(event: &E) -> Result<Self, bitcode::Error> {
        Ok(Self {
            kind: E::KIND,
            synced: E::SYNCED,
            payload: bitcode::serialize(event)?,
        })
    }

    /// Decode into `E`. Returns `None` if this event is of another kind.
    pub fn decode<E: EventType>(&self) -> Option<Result<E, bitcode::Error>> {
        (self.kind == E::KIND).then(|| bitcode::deserialize(&self.payload))
    }

    /// Hash of the encoded payload, used to recognise the same occurrence
    /// across re-simulations.
    pub fn content_hash(&self) -> u64 {
        StateHash::of(&self.payload)
    }
}

/// What an observer is being told about an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryStatus {
    /// First observation. May come from a predicted frame.
    Raised,
    /// Re-observed on a verified frame; this happened.
    Confirmed,
    /// Never re-observed on a verified frame; this did not happen.
    Canceled,
}

/// An event handed to observers together with its origin tick and status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDelivery {
    pub tick: Tick,
    pub status: DeliveryStatus,
    pub event: Event,
}

impl EventDelivery {
    pub fn decode<E: EventType>(&self) -> Option<Result<E, bitcode::Error>> {
        self.event.decode()
    }
}

// ---------------------------------------------------------------------------
// Subscribers
// ---------------------------------------------------------------------------

/// Observer callback.
pub type EventListener = Box<dyn FnMut(&EventDelivery)>;

/// Optional predicate that filters deliveries for a subscriber.
pub type EventFilter = Box<dyn Fn(&EventDelivery) -> bool>;

/// Priority level for event subscribers. Lower priorities run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SubscriberPriority {
    Pre = 0,
    Normal = 1,
    Post = 2,
}

struct SubscriberEntry {
    listener: EventListener,
    priority: SubscriberPriority,
    filter: Option<EventFilter>,
    insertion_order: u64,
}

impl std::fmt::Debug for SubscriberEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberEntry")
            .field("priority", &self.priority)
            .field("filtered", &self.filter.is_some())
            .field("insertion_order", &self.insertion_order)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// EventDispatcher
// ---------------------------------------------------------------------------

/// Routes deliveries to the subscribers of their event kind.
#[derive(Debug, Default)]
pub struct EventDispatcher {
    subscribers: BTreeMap<EventTypeId, Vec<SubscriberEntry>>,
    catch_all: Vec<SubscriberEntry>,
    next_insertion_order: u64,
    delivered: u64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(
        &mut self,
        priority: SubscriberPriority,
        filter: Option<EventFilter>,
        listener: EventListener,
    ) -> SubscriberEntry {
        let order = self.next_insertion_order;
        self.next_insertion_order += 1;
        SubscriberEntry {
            listener,
            priority,
            filter,
            insertion_order: order,
        }
    }

    /// Subscribe to one event kind with normal priority and no filter.
    pub fn on(&mut self, kind: EventTypeId, listener: EventListener) {
        self.on_filtered(kind, SubscriberPriority::Normal, None, listener);
    }

    pub fn on_filtered(
        &mut self,
        kind: EventTypeId,
        priority: SubscriberPriority,
        filter: Option<EventFilter>,
        listener: EventListener,
    ) {
        let entry = self.entry(priority, filter, listener);
        let list = self.subscribers.entry(kind).or_default();
        list.push(entry);
        list.sort_by_key(|e| (e.priority, e.insertion_order));
    }

    /// Subscribe to every event kind.
    pub fn on_any(&mut self, priority: SubscriberPriority, listener: EventListener) {
        let entry = self.entry(priority, None, listener);
        self.catch_all.push(entry);
        self.catch_all.sort_by_key(|e| (e.priority, e.insertion_order));
    }

    /// Subscribe with a typed callback. Payloads that fail to decode are
    /// logged and skipped.
    pub fn on_typed<E: EventType>(
        &mut self,
        mut listener: impl FnMut(Tick, DeliveryStatus, &E) + 'static,
    ) {
        self.on(
            E::KIND,
            Box::new(move |d: &EventDelivery| match d.event.decode::<E>() {
                Some(Ok(event)) => listener(d.tick, d.status, &event),
                Some(Err(e)) => log::warn!("event {:?} failed to decode: {e}", E::KIND),
                None => {}
            }),
        );
    }

    /// Deliver one event: kind subscribers first, then catch-all ones.
    pub fn dispatch(&mut self, delivery: &EventDelivery) {
        self.delivered += 1;
        let kind_subs = self.subscribers.get_mut(&delivery.event.kind);
        for entry in kind_subs
            .into_iter()
            .flatten()
            .chain(self.catch_all.iter_mut())
        {
            if let Some(filter) = &entry.filter
                && !filter(delivery)
            {
                continue;
            }
            (entry.listener)(delivery);
        }
    }

    pub fn subscriber_count(&self, kind: EventTypeId) -> usize {
        self.subscribers.get(&kind).map_or(0, Vec::len) + self.catch_all.len()
    }

    /// Total deliveries dispatched so far.
    pub fn delivered_count(&self) -> u64 {
        self.delivered
    }

    pub fn clear_subscribers(&mut self) {
        self.subscribers.clear();
        self.catch_all.clear();
    }
}

// ===========================================================================
// Tests
// ===========================================================================
