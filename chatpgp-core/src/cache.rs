//! Bounded least-recently-used cache over decrypt results.
//!
//! Keys are the exact armored ciphertext. Values are produced by a loader that
//! usually shells out to `gpg`, so concurrent lookups for the same key share a
//! single in-flight fetch. Failed fetches are never stored.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::debug;

pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug)]
struct Lru<V> {
    capacity: usize,
    tick: u64,
    entries: HashMap<String, (V, u64)>,
    order: BTreeMap<u64, String>,
}

impl<V: Clone> Lru<V> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tick: 0,
            entries: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn get(&mut self, key: &str) -> Option<V> {
        let tick = self.next_tick();
        let (value, used) = self.entries.get_mut(key)?;
        self.order.remove(&*used);
        *used = tick;
        self.order.insert(tick, key.to_string());
        Some(value.clone())
    }

    fn put(&mut self, key: String, value: V) {
        let tick = self.next_tick();
        if let Some((_, used)) = self.entries.insert(key.clone(), (value, tick)) {
            self.order.remove(&used);
        }
        self.order.insert(tick, key);

        while self.entries.len() > self.capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

type Slot<V, E> = Arc<OnceCell<Result<V, E>>>;

/// A fetch in progress and the number of lookups waiting on it.
#[derive(Debug)]
struct Flight<V, E> {
    slot: Slot<V, E>,
    waiters: usize,
}

#[derive(Debug)]
struct State<V, E> {
    lru: Lru<V>,
    in_flight: HashMap<String, Flight<V, E>>,
    generation: u64,
}

#[derive(Debug)]
pub struct DecryptCache<V, E> {
    state: Mutex<State<V, E>>,
}

/// One lookup's claim on an in-flight fetch.
///
/// Dropping it releases the claim. The flight is forgotten once its outcome is
/// known or once no lookup waits on it any more, including cancelled ones.
struct Waiter<'a, V, E> {
    state: &'a Mutex<State<V, E>>,
    key: &'a str,
    slot: Slot<V, E>,
    settled: bool,
}

impl<V, E> Drop for Waiter<'_, V, E> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        let forget = match state.in_flight.get_mut(self.key) {
            Some(flight) if Arc::ptr_eq(&flight.slot, &self.slot) => {
                flight.waiters = flight.waiters.saturating_sub(1);
                self.settled || flight.waiters == 0
            }
            _ => false,
        };
        if forget {
            state.in_flight.remove(self.key);
        }
    }
}

impl<V: Clone, E: Clone> DecryptCache<V, E> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                lru: Lru::new(capacity),
                in_flight: HashMap::new(),
                generation: 0,
            }),
        }
    }

    /// Returns the cached value for `key`, or runs `fetch` to produce it.
    ///
    /// Callers racing on the same key await one fetch and all receive its
    /// outcome, success or failure. Only successes are cached, so the first
    /// lookup after a failure fetches again.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let (mut waiter, generation) = {
            let mut state = self.state.lock();
            if let Some(value) = state.lru.get(key) {
                debug!("decrypt cache hit");
                return Ok(value);
            }
            let flight = state
                .in_flight
                .entry(key.to_string())
                .or_insert_with(|| Flight {
                    slot: Arc::new(OnceCell::new()),
                    waiters: 0,
                });
            flight.waiters += 1;
            let waiter = Waiter {
                state: &self.state,
                key,
                slot: Arc::clone(&flight.slot),
                settled: false,
            };
            (waiter, state.generation)
        };

        let result = waiter.slot.get_or_init(fetch).await.clone();
        waiter.settled = true;

        if let Ok(value) = &result {
            let mut state = self.state.lock();
            if state.generation == generation {
                state.lru.put(key.to_string(), value.clone());
            }
        }
        result
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.lru.clear();
        state.in_flight.clear();
        state.generation += 1;
    }

    pub fn len(&self) -> usize {
        self.state.lock().lru.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().lru.entries.contains_key(key)
    }

    #[cfg(test)]
    fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }
}

impl<V: Clone, E: Clone> Default for DecryptCache<V, E> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
