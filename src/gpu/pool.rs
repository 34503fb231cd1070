//! Bounded, buffer-keyed pool shared by the texture cache backends

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use super::{TextureCacheError, TextureKey};

struct Entry<R> {
    key: TextureKey,
    resource: Arc<R>,
    last_used: u64,
}

pub(crate) struct TexturePool<R> {
    capacity: usize,
    entries: Mutex<Vec<Entry<R>>>,
    clock: AtomicU64,
}

impl<R> TexturePool<R> {
    pub fn new(capacity: usize) -> Result<Self, TextureCacheError> {
        if capacity == 0 {
            return Err(TextureCacheError::ZeroCapacity);
        }
        Ok(Self {
            capacity,
            entries: Mutex::new(Vec::with_capacity(capacity)),
            clock: AtomicU64::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Resolve `key` to a resource.
    ///
    /// `make` receives the resource currently cached under `key` (if any)
    /// and returns the one to cache from now on. A new key takes a free
    /// slot, or recycles the least recently used entry nobody outside the
    /// pool still references.
    pub fn acquire<F>(&self, key: TextureKey, make: F) -> Result<Arc<R>, TextureCacheError>
    where
        F: FnOnce(Option<&Arc<R>>) -> Result<Arc<R>, TextureCacheError>,
    {
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.lock();

        if let Some(entry) = entries.iter_mut().find(|e| e.key == key) {
            entry.resource = make(Some(&entry.resource))?;
            entry.last_used = tick;
            return Ok(entry.resource.clone());
        }

        let resource = if entries.len() < self.capacity {
            let resource = make(None)?;
            entries.push(Entry {
                key,
                resource: resource.clone(),
                last_used: tick,
            });
            resource
        } else {
            let victim = entries
                .iter_mut()
                .filter(|e| Arc::strong_count(&e.resource) == 1)
                .min_by_key(|e| e.last_used)
                .ok_or(TextureCacheError::Exhausted {
                    capacity: self.capacity,
                })?;

            trace!(evicted = ?victim.key, ?key, "recycling texture cache entry");
            let resource = make(None)?;
            *victim = Entry {
                key,
                resource: resource.clone(),
                last_used: tick,
            };
            resource
        };

        Ok(resource)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry<R>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
