use crate::config::CacheConfig;
use crate::core::LogicalId;
use crate::entity::Entity;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{Level, event};

struct CacheEntry {
    entity: Entity,
    expires_at: Instant,
}

/// Short-lived snapshots of current entities, keyed by logical id.
///
/// Holds only live (current, not deleted) snapshots. Writers flush the whole
/// cache rather than single keys. Every flush bumps a generation counter, and
/// a reader must present the generation it saw before its select: a snapshot
/// read before a flush is never stored after it.
pub struct EntityCache {
    entries: Mutex<LruCache<LogicalId, CacheEntry>>,
    generation: AtomicU64,
    ttl: Duration,
}

impl EntityCache {
    pub fn new(config: &CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            generation: AtomicU64::new(0),
            ttl: config.ttl(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<LogicalId, CacheEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                event!(Level::WARN, "entity cache lock poisoned, clearing");
                let mut guard = poisoned.into_inner();
                guard.clear();
                guard
            }
        }
    }

    /// Cached snapshot of `id` if present, unexpired and of `entity_type`.
    pub fn get(&self, entity_type: &str, id: LogicalId) -> Option<Entity> {
        let mut entries = self.lock();
        let expired = match entries.get(&id) {
            None => return None,
            Some(entry) if entry.expires_at <= Instant::now() => true,
            Some(entry) if entry.entity.entity_type() != entity_type => return None,
            Some(entry) => return Some(entry.entity.clone()),
        };
        if expired {
            entries.pop(&id);
        }
        None
    }

    /// Current flush generation. Read it before fetching a row that will be
    /// handed to `put`.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Store a live snapshot read under `generation`. Dropped if the cache
    /// was flushed since.
    pub fn put(&self, entity: &Entity, generation: u64) -> bool {
        let Some(id) = entity.logical_id() else {
            return false;
        };
        if !entity.is_persisted() || !entity.is_current() || entity.is_deleted() {
            return false;
        }
        let mut entries = self.lock();
        // Flush bumps the counter under this lock, so the check cannot race it.
        if self.generation.load(Ordering::Acquire) != generation {
            event!(Level::TRACE, logical_id = %id, "stale snapshot not cached");
            return false;
        }
        entries.put(
            id,
            CacheEntry {
                entity: entity.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        true
    }

    pub fn invalidate(&self, id: LogicalId) {
        self.lock().pop(&id);
    }

    pub fn flush(&self) {
        let mut entries = self.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        if !entries.is_empty() {
            event!(Level::DEBUG, dropped = entries.len(), "entity cache flushed");
        }
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
