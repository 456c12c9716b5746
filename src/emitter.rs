//! A typed publish/subscribe primitive.
//!
//! Events are addressed by [`Topic`]s: a name paired with the payload type the
//! topic carries. Listeners are called synchronously, in registration order,
//! on the thread that emits.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
};

use crate::sync::lock;

/// A named event carrying a payload of type `T`.
///
/// ```
/// use streamdeck_hass_plugin::emitter::{EventEmitter, Topic};
///
/// const COUNTER_CHANGED: Topic<i64> = Topic::new("counterChanged");
///
/// let emitter = EventEmitter::new();
/// let _subscription = emitter.on(COUNTER_CHANGED, |value| println!("now {value}"));
/// emitter.emit(COUNTER_CHANGED, &3);
/// ```
pub struct Topic<T> {
    name: &'static str,
    _payload: PhantomData<fn(&T)>,
}

impl<T> Topic<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _payload: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for Topic<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Topic<T> {}

impl<T> fmt::Debug for Topic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Topic").field(&self.name).finish()
    }
}

type Key = (&'static str, TypeId);
type Callback = Arc<dyn Fn(&dyn Any) + Send + Sync>;

struct Slot {
    id: u64,
    callback: Callback,
    /// Set once a `once` listener has been delivered to.
    spent: Option<Arc<AtomicBool>>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: HashMap<Key, Vec<Slot>>,
}

impl Registry {
    fn remove(&mut self, key: &Key, id: u64) -> bool {
        let Some(slots) = self.listeners.get_mut(key) else {
            return false;
        };
        let before = slots.len();
        slots.retain(|slot| slot.id != id);
        let removed = slots.len() != before;
        if slots.is_empty() {
            self.listeners.remove(key);
        }
        removed
    }
}

/// Handle returned by [`EventEmitter::on`] and [`EventEmitter::once`].
///
/// Dropping the handle keeps the listener registered; call
/// [`unsubscribe`](Self::unsubscribe) to remove it.
#[derive(Clone)]
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    key: Key,
    id: u64,
}

impl Subscription {
    /// Removes the listener. Returns `false` if it was already gone.
    pub fn unsubscribe(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => lock(&registry).remove(&self.key, self.id),
            None => false,
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.key.0)
            .field("id", &self.id)
            .finish()
    }
}

/// Cheaply cloneable emitter; clones share the same listener table.
#[derive(Clone, Default)]
pub struct EventEmitter {
    registry: Arc<Mutex<Registry>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<T, F>(&self, topic: Topic<T>, listener: F) -> Subscription
    where
        T: Any,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.register(topic, listener, None)
    }

    /// Registers a listener that is removed after its first delivery.
    pub fn once<T, F>(&self, topic: Topic<T>, listener: F) -> Subscription
    where
        T: Any,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.register(topic, listener, Some(Arc::new(AtomicBool::new(false))))
    }

    pub fn has_listener<T: Any>(&self, topic: Topic<T>) -> bool {
        lock(&self.registry)
            .listeners
            .get(&key_of(topic))
            .is_some_and(|slots| !slots.is_empty())
    }

    /// Delivers `payload` to every listener registered for `topic` when the
    /// call begins. Listeners added during delivery wait for the next emit;
    /// listeners removed during delivery are still called this time.
    pub fn emit<T: Any>(&self, topic: Topic<T>, payload: &T) {
        let key = key_of(topic);
        let snapshot: Vec<(u64, Callback, Option<Arc<AtomicBool>>)> = {
            let registry = lock(&self.registry);
            match registry.listeners.get(&key) {
                Some(slots) => slots
                    .iter()
                    .map(|slot| (slot.id, slot.callback.clone(), slot.spent.clone()))
                    .collect(),
                None => return,
            }
        };

        for (id, callback, spent) in snapshot {
            if let Some(spent) = spent {
                if spent.swap(true, Ordering::SeqCst) {
                    continue;
                }
                lock(&self.registry).remove(&key, id);
            }
            callback(payload);
        }
    }

    fn register<T, F>(
        &self,
        topic: Topic<T>,
        listener: F,
        spent: Option<Arc<AtomicBool>>,
    ) -> Subscription
    where
        T: Any,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let key = key_of(topic);
        let callback: Callback = Arc::new(move |payload: &dyn Any| {
            if let Some(payload) = payload.downcast_ref::<T>() {
                listener(payload);
            }
        });

        let mut registry = lock(&self.registry);
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .listeners
            .entry(key)
            .or_default()
            .push(Slot { id, callback, spent });

        Subscription {
            registry: Arc::downgrade(&self.registry),
            key,
            id,
        }
    }
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = lock(&self.registry);
        f.debug_struct("EventEmitter")
            .field("topics", &registry.listeners.len())
            .finish()
    }
}

fn key_of<T: Any>(topic: Topic<T>) -> Key {
    (topic.name, TypeId::of::<T>())
}
