//! Named events with subscriptions.
//!
//! Bindings create [`Event`]s through the [`EventHub`]. Connections (or
//! anything else interested) attach as [`EventListener`]s; a listener
//! receives lifecycle notices for every event, pushes for events it is
//! subscribed to, and every broadcast.
//!
//! Listener callbacks always run with the hub lock released.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

/// Event hub failure.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EventError {
    /// The event (or its hub) no longer exists.
    #[error("event no longer exists")]
    Gone,
}

/// Receives event traffic from a hub.
pub trait EventListener: Send + Sync {
    /// An event came into existence (also replayed on attach).
    fn on_event_create(&self, event_id: u32, name: &str);

    /// An event was destroyed.
    fn on_event_remove(&self, event_id: u32, name: &str);

    /// Data pushed on an event this listener subscribed to.
    fn on_event_push(&self, event_id: u32, name: &str, data: &Value);

    /// Data broadcast to everyone.
    fn on_event_broadcast(&self, name: &str, data: &Value);
}

type ListenerKey = usize;

fn listener_key(listener: &Arc<dyn EventListener>) -> ListenerKey {
    Arc::as_ptr(listener).cast::<()>() as usize
}

struct EventRecord {
    name: String,
    subscribers: HashSet<ListenerKey>,
}

#[derive(Default)]
struct HubState {
    listeners: HashMap<ListenerKey, Arc<dyn EventListener>>,
    events: HashMap<u32, EventRecord>,
}

struct HubShared {
    state: Mutex<HubState>,
    next_id: AtomicU32,
}

/// Registry of events and listeners. Cheap to clone.
#[derive(Clone)]
pub struct EventHub {
    shared: Arc<HubShared>,
}

impl Default for EventHub {
    fn default() -> EventHub {
        EventHub::new()
    }
}

impl EventHub {
    /// Create an empty hub.
    pub fn new() -> EventHub {
        EventHub {
            shared: Arc::new(HubShared {
                state: Mutex::new(HubState::default()),
                next_id: AtomicU32::new(1),
            }),
        }
    }

    /// Create an event. Its lifetime is the returned handle's: dropping
    /// the last clone destroys the event and notifies every listener.
    pub fn create(&self, name: &str) -> Event {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let audience: Vec<Arc<dyn EventListener>> = {
            let mut state = self.shared.state.lock();
            let _ = state.events.insert(
                id,
                EventRecord {
                    name: name.to_owned(),
                    subscribers: HashSet::new(),
                },
            );
            state.listeners.values().cloned().collect()
        };
        for listener in audience {
            listener.on_event_create(id, name);
        }
        debug!(event = name, id, "event created");
        Event {
            core: Arc::new(EventCore {
                hub: Arc::downgrade(&self.shared),
                id,
                name: name.to_owned(),
            }),
        }
    }

    /// Attach a listener. Creations of already-existing events are
    /// replayed to it so its view starts complete.
    pub fn add_listener(&self, listener: Arc<dyn EventListener>) {
        let existing: Vec<(u32, String)> = {
            let mut state = self.shared.state.lock();
            let _ = state
                .listeners
                .insert(listener_key(&listener), Arc::clone(&listener));
            state
                .events
                .iter()
                .map(|(id, rec)| (*id, rec.name.clone()))
                .collect()
        };
        for (id, name) in existing {
            listener.on_event_create(id, &name);
        }
    }

    /// Detach a listener and drop all its subscriptions.
    pub fn remove_listener(&self, listener: &Arc<dyn EventListener>) {
        let key = listener_key(listener);
        let mut state = self.shared.state.lock();
        let _ = state.listeners.remove(&key);
        for record in state.events.values_mut() {
            let _ = record.subscribers.remove(&key);
        }
    }

    /// Subscribe `listener` to `event`. Attaches the listener when it was
    /// not yet known.
    pub fn subscribe(
        &self,
        event: &Event,
        listener: &Arc<dyn EventListener>,
    ) -> Result<(), EventError> {
        let key = listener_key(listener);
        let mut state = self.shared.state.lock();
        let record = state.events.get_mut(&event.core.id).ok_or(EventError::Gone)?;
        let _ = record.subscribers.insert(key);
        let _ = state
            .listeners
            .entry(key)
            .or_insert_with(|| Arc::clone(listener));
        Ok(())
    }

    /// Drop `listener`'s subscription to `event`.
    pub fn unsubscribe(
        &self,
        event: &Event,
        listener: &Arc<dyn EventListener>,
    ) -> Result<(), EventError> {
        let key = listener_key(listener);
        let mut state = self.shared.state.lock();
        let record = state.events.get_mut(&event.core.id).ok_or(EventError::Gone)?;
        let _ = record.subscribers.remove(&key);
        Ok(())
    }

    /// Send `data` to every listener, subscribed or not.
    ///
    /// Returns how many listeners were reached.
    pub fn broadcast(&self, name: &str, data: &Value) -> usize {
        let audience: Vec<Arc<dyn EventListener>> = {
            let state = self.shared.state.lock();
            state.listeners.values().cloned().collect()
        };
        for listener in &audience {
            listener.on_event_broadcast(name, data);
        }
        audience.len()
    }

    /// Count of attached listeners.
    pub fn listener_count(&self) -> usize {
        self.shared.state.lock().listeners.len()
    }
}

struct EventCore {
    hub: Weak<HubShared>,
    id: u32,
    name: String,
}

impl Drop for EventCore {
    fn drop(&mut self) {
        let Some(shared) = self.hub.upgrade() else {
            return;
        };
        let audience: Vec<Arc<dyn EventListener>> = {
            let mut state = shared.state.lock();
            let _ = state.events.remove(&self.id);
            state.listeners.values().cloned().collect()
        };
        for listener in audience {
            listener.on_event_remove(self.id, &self.name);
        }
        debug!(event = %self.name, id = self.id, "event removed");
    }
}

/// Handle to a named event. Clones share the same event.
#[derive(Clone)]
pub struct Event {
    core: Arc<EventCore>,
}

impl Event {
    /// Numeric id, unique among this hub's live events.
    pub fn id(&self) -> u32 {
        self.core.id
    }

    /// Full event name.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Push `data` to the subscribers. Returns how many were reached.
    pub fn push(&self, data: &Value) -> usize {
        let Some(shared) = self.core.hub.upgrade() else {
            return 0;
        };
        let audience: Vec<Arc<dyn EventListener>> = {
            let state = shared.state.lock();
            let Some(record) = state.events.get(&self.core.id) else {
                return 0;
            };
            record
                .subscribers
                .iter()
                .filter_map(|key| state.listeners.get(key).cloned())
                .collect()
        };
        for listener in &audience {
            listener.on_event_push(self.core.id, &self.core.name, data);
        }
        audience.len()
    }
}
