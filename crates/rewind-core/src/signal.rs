//! Synchronous same-tick signals between systems.
//!
//! A signal is a callback shape identified by a marker type implementing
//! [`Signal`]. Systems declare which signals they handle from
//! [`System::subscribe`]; the system graph collects those declarations once,
//! in system order, into one flat subscriber list per signal. Raising a
//! signal walks that list and skips systems whose hierarchy is disabled.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use crate::frame::Frame;
use crate::id::{PlayerRef, SystemId};
use crate::system::{System, SystemError};

/// A callback shape systems can subscribe to.
pub trait Signal: 'static {
    type Payload: 'static;
}

/// Raised after a player's join data is written into the frame.
pub struct PlayerDataSet;

impl Signal for PlayerDataSet {
    type Payload = PlayerRef;
}

pub(crate) type Trampoline<S> =
    Box<dyn Fn(&mut dyn System, &mut Frame, &<S as Signal>::Payload) -> Result<(), SystemError>>;

pub(crate) struct Subscribers<S: Signal> {
    pub(crate) entries: Vec<(SystemId, Trampoline<S>)>,
}

/// Per-signal subscriber lists, built once per session.
#[derive(Default)]
pub struct SignalTable {
    lists: HashMap<TypeId, Box<dyn Any>>,
}

impl SignalTable {
    pub(crate) fn subscribers<S: Signal>(&self) -> Option<&Subscribers<S>> {
        self.lists.get(&TypeId::of::<S>())?.downcast_ref()
    }

    pub fn subscriber_count<S: Signal>(&self) -> usize {
        self.subscribers::<S>().map_or(0, |s| s.entries.len())
    }

    /// Subscribed systems in invocation order.
    pub fn subscribed_systems<S: Signal>(&self) -> Vec<SystemId> {
        self.subscribers::<S>()
            .map(|s| s.entries.iter().map(|(id, _)| *id).collect())
            .unwrap_or_default()
    }

    fn push<S: Signal>(&mut self, id: SystemId, trampoline: Trampoline<S>) {
        let list = self
            .lists
            .entry(TypeId::of::<S>())
            .or_insert_with(|| Box::new(Subscribers::<S> { entries: Vec::new() }));
        if let Some(list) = list.downcast_mut::<Subscribers<S>>() {
            list.entries.push((id, trampoline));
        }
    }
}

impl std::fmt::Debug for SignalTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalTable")
            .field("signals", &self.lists.len())
            .finish()
    }
}

/// Handed to [`System::subscribe`] so a system can connect its handlers.
pub struct SignalRegistrar<'a> {
    table: &'a mut SignalTable,
    system: SystemId,
}

impl<'a> SignalRegistrar<'a> {
    pub(crate) fn new(table: &'a mut SignalTable, system: SystemId) -> Self {
        Self { table, system }
    }

    /// Connect `handler` to signal `S`. `T` must be the subscribing system's
    /// own type.
    pub fn connect<S: Signal, T: System>(
        &mut self,
        handler: fn(&mut T, &mut Frame, &S::Payload) -> Result<(), SystemError>,
    ) {
        let name = std::any::type_name::<T>();
        self.table.push::<S>(
            self.system,
            Box::new(
                move |system: &mut dyn System, frame: &mut Frame, payload: &S::Payload| {
                    match system.as_any_mut().downcast_mut::<T>() {
                        Some(t) => handler(t, frame, payload),
                        None => Err(SystemError::failed(format!(
                            "signal handler for {name} attached to a different system type"
                        ))),
                    }
                },
            ),
        );
    }
}
