//! Bounded pool of loaded inference sessions with hotness-ranked eviction
//!
//! The host registers one entry per model instance, but only `max_loaded`
//! sessions stay resident at once. A reservation pins one entry's session
//! for the duration of a request; admission of a cold entry evicts the
//! coldest peer whose lock can be taken, trying non-blocking acquisition
//! first so an idle victim is preferred over one mid-inference.
//!
//! Lock order is strict: the registry lock is always taken before an entry
//! lock. A thread holding only an entry lock (a reservation holder) must not
//! call back into the registry before releasing it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use tracing::{debug, error, info, trace, warn};

use crate::config::WarmCacheConfig;
use crate::descriptor::ModelDescriptor;
use crate::loader::SessionLoader;
use crate::{CacheError, Result};

type SlotGuard<S> = ArcMutexGuard<RawMutex, Option<S>>;

/// One registered model instance's slot in the cache
struct CacheEntry<S> {
    name: String,
    descriptor: ModelDescriptor,
    /// Successful reservations; read without locks, written under the slot lock
    hotness: AtomicUsize,
    /// Guards the session and serializes reservations against evictions
    slot: Arc<Mutex<Option<S>>>,
}

/// Registry state guarded by the cache-wide lock
struct Registry<S> {
    entries: HashMap<String, Arc<CacheEntry<S>>>,
    loaded: usize,
}

impl<S> Registry<S> {
    /// Capture the current relaxed hotness of every entry. The result is a
    /// plain list; ordering among equal hotness values is not significant.
    fn snapshot_hotness(&self) -> Vec<(usize, Arc<CacheEntry<S>>)> {
        self.entries
            .values()
            .map(|entry| (entry.hotness.load(Ordering::Relaxed), Arc::clone(entry)))
            .collect()
    }
}

struct Shared<L: SessionLoader> {
    loader: L,
    config: WarmCacheConfig,
    state: Mutex<Registry<L::Session>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    load_failures: AtomicU64,
    eviction_stalls: AtomicU64,
}

impl<L: SessionLoader> Shared<L> {
    /// Free the coldest peer whose lock can be taken. The non-blocking pass
    /// skips entries currently serving a request; the blocking pass is the
    /// progress backstop once no idle victim exists.
    ///
    /// Returns false when every peer is either the requester or already
    /// unloaded.
    fn evict_coldest(
        &self,
        state: &mut Registry<L::Session>,
        requester: &Arc<CacheEntry<L::Session>>,
    ) -> bool {
        let mut ranked = state.snapshot_hotness();
        ranked.sort_by_key(|&(hotness, _)| hotness);

        for blocking in [false, true] {
            for (_, victim) in &ranked {
                if Arc::ptr_eq(victim, requester) {
                    continue;
                }
                let mut slot = if blocking {
                    victim.slot.lock()
                } else {
                    match victim.slot.try_lock() {
                        Some(guard) => guard,
                        None => {
                            trace!("'{}' is busy, skipping", victim.name);
                            continue;
                        }
                    }
                };
                if let Some(session) = slot.take() {
                    state.loaded -= 1;
                    self.loader.unload(session);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "Evicted '{}' to make room ({} loaded)",
                        victim.name, state.loaded
                    );
                    return true;
                }
            }
        }
        false
    }
}

impl<L: SessionLoader> Drop for Shared<L> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for entry in state.entries.values() {
            let mut slot = entry.slot.lock();
            if let Some(session) = slot.take() {
                state.loaded -= 1;
                error!(
                    "Cache entry '{}' still loaded at teardown; unloading",
                    entry.name
                );
                self.loader.unload(session);
            }
        }
    }
}

/// Counters describing cache behavior since construction
#[derive(Debug, Clone, Default)]
pub struct WarmCacheStats {
    /// Entries currently registered
    pub registered: usize,
    /// Entries currently holding a session
    pub loaded: usize,
    /// Reservations served from an already-loaded session
    pub hits: u64,
    /// Reservations that had to load
    pub misses: u64,
    /// Sessions unloaded to make room (includes `evict_all`)
    pub evictions: u64,
    /// Loader failures surfaced through degraded reservations
    pub load_failures: u64,
    /// Admissions that found no evictable peer and overran the limit
    pub eviction_stalls: u64,
}

/// Bounded cache of loaded sessions, shared across the host's instance
/// threads. Clones are cheap and refer to the same cache.
pub struct WarmCache<L: SessionLoader> {
    shared: Arc<Shared<L>>,
}

impl<L: SessionLoader> Clone for WarmCache<L> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<L: SessionLoader> WarmCache<L> {
    /// Create a cache that builds sessions through `loader`
    pub fn new(loader: L, config: WarmCacheConfig) -> Result<Self> {
        config.validate()?;
        info!(
            "Initializing warm cache: at most {} loaded session(s){}",
            config.max_loaded,
            if config.skip_warm_cache {
                ", bypass mode"
            } else {
                ""
            }
        );
        Ok(Self {
            shared: Arc::new(Shared {
                loader,
                config,
                state: Mutex::new(Registry {
                    entries: HashMap::new(),
                    loaded: 0,
                }),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
                load_failures: AtomicU64::new(0),
                eviction_stalls: AtomicU64::new(0),
            }),
        })
    }

    /// Register a new, unloaded entry under `key`. Fails if the key is
    /// already present. In bypass mode the session loads eagerly and a load
    /// failure fails the registration.
    pub fn register<K>(&self, key: K, descriptor: ModelDescriptor) -> Result<EntryHandle<L>>
    where
        K: Into<String>,
    {
        let key = key.into();
        descriptor.validate()?;

        let mut state = self.shared.state.lock();
        if state.entries.contains_key(&key) {
            error!("Duplicate cache key '{}'", key);
            return Err(CacheError::duplicate_key(key));
        }

        let entry = Arc::new(CacheEntry {
            name: key.clone(),
            descriptor,
            hotness: AtomicUsize::new(0),
            slot: Arc::new(Mutex::new(None)),
        });

        if self.shared.config.skip_warm_cache {
            let session = self.shared.loader.load(&entry.descriptor)?;
            *entry.slot.lock() = Some(session);
            state.loaded += 1;
        }

        state.entries.insert(key.clone(), Arc::clone(&entry));
        info!("Registered cache entry '{}'", key);
        Ok(EntryHandle {
            shared: Arc::clone(&self.shared),
            entry,
        })
    }

    /// Look up a registered entry by key
    pub fn get(&self, key: &str) -> Option<EntryHandle<L>> {
        let state = self.shared.state.lock();
        state.entries.get(key).map(|entry| EntryHandle {
            shared: Arc::clone(&self.shared),
            entry: Arc::clone(entry),
        })
    }

    /// Remove an entry, unloading its session if present. Blocks until any
    /// in-flight reservation on the entry is released. Other clones of the
    /// handle become stale; reserving through them yields a degraded
    /// reservation.
    pub fn unregister(&self, handle: EntryHandle<L>) {
        if !Arc::ptr_eq(&self.shared, &handle.shared) {
            warn!(
                "Entry '{}' belongs to a different cache; not unregistering",
                handle.name()
            );
            return;
        }

        let mut state = self.shared.state.lock();
        let is_current = state
            .entries
            .get(&handle.entry.name)
            .map_or(false, |current| Arc::ptr_eq(current, &handle.entry));
        if is_current {
            state.entries.remove(&handle.entry.name);
        }

        // Waits out any reservation still holding the entry
        let mut slot = handle.entry.slot.lock();
        if let Some(session) = slot.take() {
            state.loaded -= 1;
            debug!("Unloading session for '{}' during unregister", handle.name());
            self.shared.loader.unload(session);
        }
        info!("Unregistered cache entry '{}'", handle.name());
    }

    /// Unload every loaded session, blocking per entry until reservations
    /// release. Entries stay registered and reload on their next reservation.
    pub fn evict_all(&self) {
        let mut state = self.shared.state.lock();
        let entries: Vec<_> = state.entries.values().map(Arc::clone).collect();
        let mut freed = 0usize;
        for entry in entries {
            let mut slot = entry.slot.lock();
            if let Some(session) = slot.take() {
                state.loaded -= 1;
                self.shared.loader.unload(session);
                self.shared.evictions.fetch_add(1, Ordering::Relaxed);
                freed += 1;
            }
        }
        info!("Evicted all sessions ({} unloaded)", freed);
    }

    /// Number of registered entries
    pub fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().entries.is_empty()
    }

    /// Number of entries currently holding a session
    pub fn loaded_count(&self) -> usize {
        self.shared.state.lock().loaded
    }

    pub fn config(&self) -> &WarmCacheConfig {
        &self.shared.config
    }

    /// Get cache statistics
    pub fn stats(&self) -> WarmCacheStats {
        let state = self.shared.state.lock();
        WarmCacheStats {
            registered: state.entries.len(),
            loaded: state.loaded,
            hits: self.shared.hits.load(Ordering::Relaxed),
            misses: self.shared.misses.load(Ordering::Relaxed),
            evictions: self.shared.evictions.load(Ordering::Relaxed),
            load_failures: self.shared.load_failures.load(Ordering::Relaxed),
            eviction_stalls: self.shared.eviction_stalls.load(Ordering::Relaxed),
        }
    }
}

/// Handle to one registered entry. Clones are cheap and refer to the same
/// entry; the handle stays valid across load/evict cycles.
pub struct EntryHandle<L: SessionLoader> {
    shared: Arc<Shared<L>>,
    entry: Arc<CacheEntry<L::Session>>,
}

impl<L: SessionLoader> std::fmt::Debug for EntryHandle<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryHandle").finish_non_exhaustive()
    }
}

impl<L: SessionLoader> Clone for EntryHandle<L> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            entry: Arc::clone(&self.entry),
        }
    }
}

impl<L: SessionLoader> EntryHandle<L> {
    /// Stable key this entry was registered under
    pub fn name(&self) -> &str {
        &self.entry.name
    }

    /// Relaxed read of the usage counter
    pub fn hotness(&self) -> usize {
        self.entry.hotness.load(Ordering::Relaxed)
    }

    /// Whether a session is currently loaded. Blocks while the entry is
    /// reserved.
    pub fn is_loaded(&self) -> bool {
        self.entry.slot.lock().is_some()
    }

    /// Pin this entry and return a reservation granting exclusive use of its
    /// session, loading it first if needed. When the pool is full, the
    /// coldest evictable peer is unloaded to make room.
    ///
    /// May block for a long time: on the registry lock, on a busy victim
    /// during eviction, and in the loader itself. A load failure yields a
    /// valid reservation whose `session()` is `None` and whose `error()`
    /// carries the cause; the entry stays unloaded and a later reservation
    /// retries.
    pub fn reserve(&self) -> Reservation<L> {
        if self.shared.config.skip_warm_cache {
            let guard = self.entry.slot.lock_arc();
            let error = if guard.is_none() {
                Some(CacheError::load(
                    self.entry.name.as_str(),
                    "session is not loaded",
                ))
            } else {
                self.entry.hotness.fetch_add(1, Ordering::Relaxed);
                self.shared.hits.fetch_add(1, Ordering::Relaxed);
                None
            };
            return Reservation {
                handle: self.clone(),
                guard,
                error,
            };
        }

        let mut state = self.shared.state.lock();
        let mut guard = self.entry.slot.lock_arc();

        // Fast path: still resident
        if guard.is_some() {
            drop(state);
            self.entry.hotness.fetch_add(1, Ordering::Relaxed);
            self.shared.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Warm cache hit for '{}'", self.entry.name);
            return Reservation {
                handle: self.clone(),
                guard,
                error: None,
            };
        }

        let registered = state
            .entries
            .get(&self.entry.name)
            .map_or(false, |current| Arc::ptr_eq(current, &self.entry));
        if !registered {
            drop(state);
            warn!("Reserve on unregistered entry '{}'", self.entry.name);
            return Reservation {
                handle: self.clone(),
                guard,
                error: Some(CacheError::load(
                    self.entry.name.as_str(),
                    "entry is no longer registered",
                )),
            };
        }

        debug!("Warm cache miss for '{}', loading...", self.entry.name);
        self.shared.misses.fetch_add(1, Ordering::Relaxed);

        while state.loaded >= self.shared.config.max_loaded {
            if !self.shared.evict_coldest(&mut state, &self.entry) {
                self.shared.eviction_stalls.fetch_add(1, Ordering::Relaxed);
                error!(
                    "No evictable session for '{}': {} loaded, limit {}",
                    self.entry.name, state.loaded, self.shared.config.max_loaded
                );
                break;
            }
        }

        let error = match self.shared.loader.load(&self.entry.descriptor) {
            Ok(session) => {
                *guard = Some(session);
                state.loaded += 1;
                self.entry.hotness.fetch_add(1, Ordering::Relaxed);
                info!(
                    "Loaded session for '{}' ({}/{} loaded)",
                    self.entry.name, state.loaded, self.shared.config.max_loaded
                );
                None
            }
            Err(err) => {
                self.shared.load_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to load session for '{}': {}", self.entry.name, err);
                Some(err)
            }
        };
        drop(state);

        Reservation {
            handle: self.clone(),
            guard,
            error,
        }
    }
}

/// Scoped reservation of one entry's session.
///
/// While the reservation lives, the entry cannot be evicted or unregistered
/// and the session is exclusive to the holder. Dropping it releases the entry
/// lock; the session stays loaded until evicted by a later admission.
///
/// Reservations are not sendable across threads, and the holder must not call
/// back into the cache (reserve, register, unregister) before dropping it.
pub struct Reservation<L: SessionLoader> {
    handle: EntryHandle<L>,
    guard: SlotGuard<L::Session>,
    error: Option<CacheError>,
}

impl<L: SessionLoader> Reservation<L> {
    /// The reserved session, or `None` when the load failed
    pub fn session(&self) -> Option<&L::Session> {
        self.guard.as_ref()
    }

    /// Exclusive access to the reserved session
    pub fn session_mut(&mut self) -> Option<&mut L::Session> {
        self.guard.as_mut()
    }

    /// The load failure behind a `None` session, if any
    pub fn error(&self) -> Option<&CacheError> {
        self.error.as_ref()
    }

    /// Handle of the reserved entry
    pub fn entry(&self) -> &EntryHandle<L> {
        &self.handle
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct LoaderCounters {
        loads: AtomicUsize,
        unloads: AtomicUsize,
    }

    struct TestSession;

    #[derive(Clone, Default)]
    struct TestLoader {
        counters: Arc<LoaderCounters>,
        fail: Arc<AtomicBool>,
    }

    impl SessionLoader for TestLoader {
        type Session = TestSession;

        fn load(&self, _descriptor: &ModelDescriptor) -> Result<TestSession> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(CacheError::load("test", "injected load failure"));
            }
            self.counters.loads.fetch_add(1, Ordering::SeqCst);
            Ok(TestSession)
        }

        fn unload(&self, _session: TestSession) {
            self.counters.unloads.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn descriptor() -> ModelDescriptor {
        ModelDescriptor::from_path("/models/test/model.onnx")
    }

    fn cache_with(max_loaded: usize) -> (WarmCache<TestLoader>, TestLoader) {
        let loader = TestLoader::default();
        let config = WarmCacheConfig {
            max_loaded,
            skip_warm_cache: false,
        };
        (WarmCache::new(loader.clone(), config).unwrap(), loader)
    }

    #[test]
    fn test_reserve_loads_once() {
        let (cache, loader) = cache_with(4);
        let entry = cache.register("model-a", descriptor()).unwrap();

        {
            let reservation = entry.reserve();
            assert!(reservation.session().is_some());
            assert!(reservation.error().is_none());
        }
        {
            let reservation = entry.reserve();
            assert!(reservation.session().is_some());
        }

        assert_eq!(loader.counters.loads.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.loaded, 1);
    }

    #[test]
    fn test_capacity_is_respected() {
        let (cache, _loader) = cache_with(2);
        let a = cache.register("model-a", descriptor()).unwrap();
        let b = cache.register("model-b", descriptor()).unwrap();
        let c = cache.register("model-c", descriptor()).unwrap();

        drop(a.reserve());
        drop(b.reserve());
        drop(c.reserve());

        let stats = cache.stats();
        assert_eq!(stats.loaded, 2);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.eviction_stalls, 0);
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let (cache, _loader) = cache_with(4);
        cache.register("model-a", descriptor()).unwrap();
        let err = cache.register("model-a", descriptor()).unwrap_err();
        assert!(matches!(err, CacheError::DuplicateKey { .. }));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_load_failure_leaves_entry_unloaded() {
        let (cache, loader) = cache_with(4);
        let entry = cache.register("model-a", descriptor()).unwrap();

        loader.fail.store(true, Ordering::SeqCst);
        {
            let reservation = entry.reserve();
            assert!(reservation.session().is_none());
            assert_eq!(reservation.error().unwrap().code(), "LOAD_FAILED");
        }
        assert_eq!(cache.loaded_count(), 0);
        assert_eq!(entry.hotness(), 0);

        // The failure is transient; the next reservation retries
        loader.fail.store(false, Ordering::SeqCst);
        let reservation = entry.reserve();
        assert!(reservation.session().is_some());
        assert_eq!(cache.loaded_count(), 1);
    }

    #[test]
    fn test_bypass_mode_loads_eagerly() {
        let loader = TestLoader::default();
        let config = WarmCacheConfig {
            max_loaded: 1,
            skip_warm_cache: true,
        };
        let cache = WarmCache::new(loader.clone(), config).unwrap();

        let a = cache.register("model-a", descriptor()).unwrap();
        let b = cache.register("model-b", descriptor()).unwrap();
        assert_eq!(cache.loaded_count(), 2);

        drop(a.reserve());
        drop(b.reserve());
        assert_eq!(loader.counters.loads.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_stale_handle_reserve_is_degraded() {
        let (cache, _loader) = cache_with(4);
        let entry = cache.register("model-a", descriptor()).unwrap();
        let stale = entry.clone();
        cache.unregister(entry);

        let reservation = stale.reserve();
        assert!(reservation.session().is_none());
        assert!(reservation.error().is_some());
        assert_eq!(cache.loaded_count(), 0);
    }

    #[test]
    fn test_hotness_counts_successful_reservations() {
        let (cache, _loader) = cache_with(4);
        let entry = cache.register("model-a", descriptor()).unwrap();
        assert_eq!(entry.hotness(), 0);
        for expected in 1..=3 {
            drop(entry.reserve());
            assert_eq!(entry.hotness(), expected);
        }
    }
}
