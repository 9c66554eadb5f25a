//! Confirm/cancel reconciliation of raised events.
//!
//! Every simulated tick, predicted or verified, hands its raised events to
//! [`EventReconciler::drain`]. Observers see each distinct occurrence once
//! as [`DeliveryStatus::Raised`], then exactly once more as either
//! `Confirmed` (a verified pass raised it too) or `Canceled` (the verified
//! pass for its tick did not).
//!
//! An occurrence is identified by its [`EventKey`]. Resolution is strictly
//! tick ordered: the pending queue is walked from the front and stops at the
//! first entry whose tick is not verified yet.
//!
//! Synced events bypass all of this. They are delivered once, as `Raised`,
//! from verified frames only; from predicted frames they are dropped.

use std::collections::{HashMap, VecDeque};

use log::trace;

use crate::event::{DeliveryStatus, Event, EventDelivery};
use crate::fixed::Tick;
use crate::id::EventTypeId;

/// Identity of one raised occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub tick: Tick,
    pub kind: EventTypeId,
    pub content_hash: u64,
}

impl EventKey {
    pub fn of(tick: Tick, event: &Event) -> Self {
        Self {
            tick,
            kind: event.kind,
            content_hash: event.content_hash(),
        }
    }
}

#[derive(Debug)]
struct PendingEvent {
    event: Event,
    confirmed: bool,
}

#[derive(Debug, Default)]
pub struct EventReconciler {
    /// Ordered by tick; insertion order within a tick.
    queue: VecDeque<EventKey>,
    pending: HashMap<EventKey, PendingEvent>,
    last_verified: Option<Tick>,
}

impl EventReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    pub fn contains(&self, key: &EventKey) -> bool {
        self.pending.contains_key(key)
    }

    /// Tentative confirmation state of a pending event.
    pub fn is_confirmed(&self, key: &EventKey) -> Option<bool> {
        self.pending.get(key).map(|p| p.confirmed)
    }

    pub fn last_verified(&self) -> Option<Tick> {
        self.last_verified
    }

    /// Process the events one tick raised and append deliveries to `out`.
    pub fn drain(
        &mut self,
        tick: Tick,
        verified: bool,
        events: Vec<Event>,
        out: &mut Vec<EventDelivery>,
    ) {
        for event in events {
            if event.synced {
                if verified {
                    out.push(EventDelivery {
                        tick,
                        status: DeliveryStatus::Raised,
                        event,
                    });
                }
                continue;
            }

            let key = EventKey::of(tick, &event);
            if let Some(existing) = self.pending.get_mut(&key) {
                existing.confirmed |= verified;
                continue;
            }
            if self.last_verified.is_some_and(|v| tick <= v) && !verified {
                // Resolved history; a stale prediction cannot reopen it.
                continue;
            }

            out.push(EventDelivery {
                tick,
                status: DeliveryStatus::Raised,
                event: event.clone(),
            });
            let at = self.queue.partition_point(|k| k.tick <= tick);
            self.queue.insert(at, key);
            self.pending.insert(
                key,
                PendingEvent {
                    event,
                    confirmed: verified,
                },
            );
        }

        if verified {
            self.last_verified = Some(self.last_verified.map_or(tick, |v| v.max(tick)));
            self.resolve(out);
        }
    }

    fn resolve(&mut self, out: &mut Vec<EventDelivery>) {
        let Some(verified) = self.last_verified else {
            return;
        };
        while let Some(front) = self.queue.front()
            && front.tick <= verified
        {
            let key = *front;
            self.queue.pop_front();
            let Some(entry) = self.pending.remove(&key) else {
                continue;
            };
            let status = if entry.confirmed {
                DeliveryStatus::Confirmed
            } else {
                DeliveryStatus::Canceled
            };
            trace!("event {:?} at tick {} resolved as {status:?}", key.kind, key.tick);
            out.push(EventDelivery {
                tick: key.tick,
                status,
                event: entry.event,
            });
        }
    }

    /// Authoritative state replaced local history: cancel everything still
    /// pending, oldest first, and start over from `tick`.
    pub fn resync(&mut self, tick: Tick, out: &mut Vec<EventDelivery>) {
        for key in self.queue.drain(..) {
            if let Some(entry) = self.pending.remove(&key) {
                out.push(EventDelivery {
                    tick: key.tick,
                    status: DeliveryStatus::Canceled,
                    event: entry.event,
                });
            }
        }
        self.pending.clear();
        self.last_verified = Some(tick);
    }
}
