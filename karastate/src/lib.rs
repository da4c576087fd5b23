//! # karastate: shared state cache
//!
//! A process-local, keyed, last-value-wins store. Each key holds one fact
//! pushed by the queue server (current song, queue, playback toggle, key
//! offset). Every key is independent: there is no merge logic and no
//! cross-key transaction, the server always sends complete replacement values.
//!
//! An entry can be in three states:
//! - **absent**: nothing received yet ("unknown"), [`StateCache::get`] returns `None`;
//! - **cleared**: an explicit null was written, the entry exists with `value == None`;
//! - **set**: the entry holds a value.
//!
//! ## Notification guarantees
//!
//! - a `set` is visible to any `get` issued after it returns (and from inside
//!   subscriber callbacks);
//! - each subscriber registered when the `set` happens is called exactly once,
//!   in subscription order;
//! - notifications for one key follow the order of the `set` calls;
//! - a subscriber removed while a write is being delivered is not called.
//!
//! Callbacks run synchronously on the writer's thread and may re-enter the
//! cache (read, write, subscribe, unsubscribe). A write made from inside a
//! callback is stored at once, but its notifications are queued and delivered
//! by the outermost `set` once the current ones are done.
//!
//! ```
//! use karastate::{CacheKey, StateCache};
//!
//! const VOLUME: CacheKey<u16> = CacheKey::new("volume");
//!
//! let cache = StateCache::new();
//! let _sub = cache.subscribe(&VOLUME, |v| println!("volume: {:?}", v));
//! cache.set(&VOLUME, Some(42)).unwrap();
//! assert_eq!(cache.value(&VOLUME), Some(42));
//! ```

mod error;

pub use error::{CacheError, Result};

use std::any::{Any, TypeId};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};
use tracing::{trace, warn};

/// Typed key identifying one cache entry by a static name.
pub struct CacheKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> CacheKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for CacheKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for CacheKey<T> {}

impl<T> fmt::Debug for CacheKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CacheKey").field(&self.name).finish()
    }
}

/// Snapshot of a present entry.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry<T> {
    pub key: &'static str,
    /// `None` when the server explicitly cleared the fact.
    pub value: Option<T>,
    /// Global write sequence number of the last `set` on this key.
    pub seq: u64,
}

impl<T> CacheEntry<T> {
    pub fn is_cleared(&self) -> bool {
        self.value.is_none()
    }
}

type Erased = Arc<dyn Any + Send + Sync>;
type Callback = Arc<dyn Fn(&(dyn Any + Send + Sync)) + Send + Sync>;

struct Stored {
    value: Erased,
    type_id: TypeId,
    seq: u64,
}

struct Subscriber {
    id: u64,
    callback: Callback,
}

struct Notification {
    key: &'static str,
    value: Erased,
    subscribers: Vec<(u64, Callback)>,
}

#[derive(Default)]
struct Slot {
    stored: Option<Stored>,
    subscribers: Vec<Subscriber>,
}

struct Inner {
    // Sérialise écriture + notification; réentrant pour les callbacks qui réécrivent.
    dispatch: ReentrantMutex<()>,
    slots: Mutex<HashMap<&'static str, Slot>>,
    // Notifications en attente; vidée par le `set` le plus externe.
    pending: Mutex<VecDeque<Notification>>,
    draining: AtomicBool,
    seq: AtomicU64,
    next_subscriber: AtomicU64,
}

/// Cloneable handle on a shared cache.
#[derive(Clone)]
pub struct StateCache {
    inner: Arc<Inner>,
}

impl Default for StateCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StateCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.inner.slots.lock();
        let mut keys: Vec<&&'static str> = slots.keys().collect();
        keys.sort();
        f.debug_struct("StateCache").field("keys", &keys).finish()
    }
}

impl StateCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                dispatch: ReentrantMutex::new(()),
                slots: Mutex::new(HashMap::new()),
                pending: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
                seq: AtomicU64::new(0),
                next_subscriber: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the entry for `key`, or `None` while nothing was received.
    pub fn get<T>(&self, key: &CacheKey<T>) -> Option<CacheEntry<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let slots = self.inner.slots.lock();
        let stored = slots.get(key.name)?.stored.as_ref()?;
        match stored.value.downcast_ref::<Option<T>>() {
            Some(value) => Some(CacheEntry {
                key: key.name,
                value: value.clone(),
                seq: stored.seq,
            }),
            None => {
                warn!(key = key.name, "cache entry read with a mismatched type");
                None
            }
        }
    }

    /// Current value, flattening "absent" and "cleared" to `None`.
    pub fn value<T>(&self, key: &CacheKey<T>) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.get(key).and_then(|entry| entry.value)
    }

    /// True once anything (including an explicit null) was written to `key`.
    pub fn contains<T>(&self, key: &CacheKey<T>) -> bool {
        self.inner
            .slots
            .lock()
            .get(key.name)
            .is_some_and(|slot| slot.stored.is_some())
    }

    /// Overwrites the entry and notifies its subscribers.
    ///
    /// Returns the sequence number assigned to this write.
    pub fn set<T>(&self, key: &CacheKey<T>, value: Option<T>) -> Result<u64>
    where
        T: Send + Sync + 'static,
    {
        let _dispatch = self.inner.dispatch.lock();
        self.store_and_notify(key, value)
    }

    /// Writes an explicit null.
    pub fn clear<T>(&self, key: &CacheKey<T>) -> Result<u64>
    where
        T: Send + Sync + 'static,
    {
        self.set(key, None)
    }

    /// Writes `value` only if the entry is still absent.
    ///
    /// Returns `true` when the write happened.
    pub fn set_if_absent<T>(&self, key: &CacheKey<T>, value: Option<T>) -> Result<bool>
    where
        T: Send + Sync + 'static,
    {
        let _dispatch = self.inner.dispatch.lock();
        if self.contains(key) {
            return Ok(false);
        }
        self.store_and_notify(key, value)?;
        Ok(true)
    }

    /// Atomic read-modify-write. `f` receives the current value (`None` when
    /// absent or cleared).
    pub fn update<T, F>(&self, key: &CacheKey<T>, f: F) -> Result<u64>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(Option<&T>) -> Option<T>,
    {
        let _dispatch = self.inner.dispatch.lock();
        let current = self.value(key);
        let next = f(current.as_ref());
        self.store_and_notify(key, next)
    }

    /// Registers `callback` for every future write on `key`.
    ///
    /// The callback stays registered until the returned [`Subscription`] is
    /// dropped.
    pub fn subscribe<T, F>(&self, key: &CacheKey<T>, callback: F) -> Subscription
    where
        T: Send + Sync + 'static,
        F: Fn(Option<&T>) + Send + Sync + 'static,
    {
        let name = key.name;
        let callback: Callback = Arc::new(move |value: &(dyn Any + Send + Sync)| {
            match value.downcast_ref::<Option<T>>() {
                Some(value) => callback(value.as_ref()),
                None => warn!(key = name, "subscriber registered with a mismatched type"),
            }
        });

        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.inner
            .slots
            .lock()
            .entry(name)
            .or_default()
            .subscribers
            .push(Subscriber { id, callback });

        Subscription {
            inner: Arc::downgrade(&self.inner),
            key: name,
            id,
        }
    }

    /// Like [`StateCache::subscribe`], but first calls `callback` with the
    /// current entry when one exists.
    ///
    /// Registration and the initial call happen atomically with respect to
    /// writers: no write can slip between them, so the subscriber sees every
    /// value from the current one on, in order.
    pub fn subscribe_with_current<T, F>(&self, key: &CacheKey<T>, callback: F) -> Subscription
    where
        T: Send + Sync + 'static,
        F: Fn(Option<&T>) + Send + Sync + 'static,
    {
        let _dispatch = self.inner.dispatch.lock();
        let current = self
            .inner
            .slots
            .lock()
            .get(key.name)
            .and_then(|slot| slot.stored.as_ref())
            .map(|stored| Arc::clone(&stored.value));

        if let Some(current) = current {
            match current.downcast_ref::<Option<T>>() {
                Some(value) => callback(value.as_ref()),
                None => warn!(key = key.name, "subscriber registered with a mismatched type"),
            }
        }
        self.subscribe(key, callback)
    }

    pub fn subscriber_count<T>(&self, key: &CacheKey<T>) -> usize {
        self.inner
            .slots
            .lock()
            .get(key.name)
            .map_or(0, |slot| slot.subscribers.len())
    }

    // Must be called with `dispatch` held.
    fn store_and_notify<T>(&self, key: &CacheKey<T>, value: Option<T>) -> Result<u64>
    where
        T: Send + Sync + 'static,
    {
        let type_id = TypeId::of::<Option<T>>();
        let erased: Erased = Arc::new(value);

        let (seq, subscribers) = {
            let mut slots = self.inner.slots.lock();
            let slot = slots.entry(key.name).or_default();
            if let Some(existing) = &slot.stored {
                if existing.type_id != type_id {
                    return Err(CacheError::TypeMismatch(key.name));
                }
            }
            let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed) + 1;
            slot.stored = Some(Stored {
                value: Arc::clone(&erased),
                type_id,
                seq,
            });
            let subscribers: Vec<(u64, Callback)> = slot
                .subscribers
                .iter()
                .map(|subscriber| (subscriber.id, Arc::clone(&subscriber.callback)))
                .collect();
            (seq, subscribers)
        };

        trace!(
            key = key.name,
            seq,
            subscribers = subscribers.len(),
            "cache entry written"
        );

        self.inner.pending.lock().push_back(Notification {
            key: key.name,
            value: erased,
            subscribers,
        });

        // Écriture imbriquée : la boucle externe livrera la notification.
        if !self.inner.draining.swap(true, Ordering::Relaxed) {
            let _draining = DrainGuard(&self.inner);
            self.drain();
        }

        Ok(seq)
    }

    // Must be called with `dispatch` held.
    fn drain(&self) {
        loop {
            let next = self.inner.pending.lock().pop_front();
            let Some(notification) = next else {
                break;
            };
            for (id, callback) in notification.subscribers {
                if self.is_subscribed(notification.key, id) {
                    callback(notification.value.as_ref());
                }
            }
        }
    }

    fn is_subscribed(&self, key: &'static str, id: u64) -> bool {
        self.inner
            .slots
            .lock()
            .get(key)
            .is_some_and(|slot| slot.subscribers.iter().any(|subscriber| subscriber.id == id))
    }
}

struct DrainGuard<'a>(&'a Inner);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        // Après un callback qui panique, les notifications restantes sont perdues.
        self.0.pending.lock().clear();
        self.0.draining.store(false, Ordering::Relaxed);
    }
}

/// Handle returned by [`StateCache::subscribe`]; unsubscribes on drop.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    inner: Weak<Inner>,
    key: &'static str,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            if let Some(slot) = inner.slots.lock().get_mut(self.key) {
                slot.subscribers.retain(|subscriber| subscriber.id != self.id);
            }
        }
    }
}
