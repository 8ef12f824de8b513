//! Concurrency slot pools.
//!
//! One semaphore per resource class plus one per change source. A job
//! holds a [`SlotGuard`] from admission until it reaches a terminal
//! status; dropping the guard returns both permits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::AdmissionSettings;
use crate::models::ResourceClass;

/// Semaphore-backed pool for a single resource class.
#[derive(Debug)]
struct ClassPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: AtomicUsize,
}

impl ClassPool {
    fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    fn update_peak(&self, current: usize) {
        let mut peak = self.peak_in_flight.load(Ordering::Relaxed);
        while current > peak {
            match self.peak_in_flight.compare_exchange_weak(
                peak,
                current,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(p) => peak = p,
            }
        }
    }
}

/// Slot usage for one resource class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotUsage {
    pub capacity: usize,
    pub in_flight: usize,
    pub peak_in_flight: usize,
}

/// Fixed slot pools per resource class and per source.
#[derive(Debug)]
pub struct SlotPools {
    classes: HashMap<ResourceClass, ClassPool>,
    per_source: usize,
    sources: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl SlotPools {
    pub fn new(settings: &AdmissionSettings) -> Self {
        let classes = ResourceClass::ALL
            .iter()
            .map(|class| (*class, ClassPool::new(settings.slots_for(*class))))
            .collect();

        Self {
            classes,
            per_source: settings.per_source_slots,
            sources: Mutex::new(HashMap::new()),
        }
    }

    /// Take one class slot and one source slot, or neither.
    ///
    /// Never waits: `None` means the caller is over capacity.
    pub fn try_acquire(&self, class: ResourceClass, source: &str) -> Option<SlotGuard> {
        let pool = self.classes.get(&class)?;

        // Source permits are only taken under this lock, so a semaphore
        // with every permit back has no holders and can be dropped.
        let source_permit = {
            let mut sources = self.sources.lock();
            sources.retain(|name, semaphore| {
                name == source || semaphore.available_permits() < self.per_source
            });
            sources
                .entry(source.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_source)))
                .clone()
                .try_acquire_owned()
                .ok()?
        };

        // Dropping `source_permit` on the early return releases it again.
        let class_permit = pool.semaphore.clone().try_acquire_owned().ok()?;

        let current = pool.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        pool.update_peak(current);
        tracing::trace!(%class, source, in_flight = current, "Acquired slot");

        Some(SlotGuard {
            class,
            source: source.to_string(),
            in_flight: Arc::clone(&pool.in_flight),
            _class_permit: class_permit,
            _source_permit: source_permit,
        })
    }

    pub fn usage(&self, class: ResourceClass) -> SlotUsage {
        match self.classes.get(&class) {
            Some(pool) => SlotUsage {
                capacity: pool.capacity,
                in_flight: pool.in_flight.load(Ordering::Relaxed),
                peak_in_flight: pool.peak_in_flight.load(Ordering::Relaxed),
            },
            None => SlotUsage {
                capacity: 0,
                in_flight: 0,
                peak_in_flight: 0,
            },
        }
    }

    /// Free class slots right now.
    pub fn available(&self, class: ResourceClass) -> usize {
        self.classes
            .get(&class)
            .map(|pool| pool.semaphore.available_permits())
            .unwrap_or(0)
    }

    /// Sources currently tracked. Idle sources are pruned on acquisition.
    pub fn tracked_sources(&self) -> usize {
        self.sources.lock().len()
    }

    /// Free slots for a source (full allowance for unseen sources).
    pub fn available_for_source(&self, source: &str) -> usize {
        self.sources
            .lock()
            .get(source)
            .map(|s| s.available_permits())
            .unwrap_or(self.per_source)
    }
}

/// Held capacity for one live job.
#[derive(Debug)]
pub struct SlotGuard {
    class: ResourceClass,
    source: String,
    in_flight: Arc<AtomicUsize>,
    _class_permit: OwnedSemaphorePermit,
    _source_permit: OwnedSemaphorePermit,
}

impl SlotGuard {
    pub fn class(&self) -> ResourceClass {
        self.class
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let remaining = self.in_flight.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        tracing::trace!(class = %self.class, source = %self.source, in_flight = remaining, "Released slot");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(video: usize, per_source: usize) -> AdmissionSettings {
        AdmissionSettings {
            video_slots: video,
            per_source_slots: per_source,
            ..AdmissionSettings::default()
        }
    }

    #[test]
    fn class_pool_is_bounded() {
        let pools = SlotPools::new(&settings(2, 8));

        let a = pools.try_acquire(ResourceClass::Video, "s").unwrap();
        let _b = pools.try_acquire(ResourceClass::Video, "s").unwrap();
        assert!(pools.try_acquire(ResourceClass::Video, "s").is_none());
        assert_eq!(pools.usage(ResourceClass::Video).in_flight, 2);

        drop(a);
        assert_eq!(pools.available(ResourceClass::Video), 1);
        assert!(pools.try_acquire(ResourceClass::Video, "s").is_some());
        assert_eq!(pools.usage(ResourceClass::Video).peak_in_flight, 2);
    }

    #[test]
    fn source_pool_is_bounded_across_classes() {
        let pools = SlotPools::new(&settings(2, 2));

        let _a = pools.try_acquire(ResourceClass::Text, "sheet-a").unwrap();
        let _b = pools.try_acquire(ResourceClass::Audio, "sheet-a").unwrap();
        assert!(pools.try_acquire(ResourceClass::Text, "sheet-a").is_none());
        assert_eq!(pools.available_for_source("sheet-a"), 0);

        // Other sources are unaffected.
        assert!(pools.try_acquire(ResourceClass::Text, "sheet-b").is_some());
    }

    #[test]
    fn failed_class_acquire_returns_source_permit() {
        let pools = SlotPools::new(&settings(1, 4));

        let _held = pools.try_acquire(ResourceClass::Video, "s").unwrap();
        assert!(pools.try_acquire(ResourceClass::Video, "s").is_none());
        assert_eq!(pools.available_for_source("s"), 3);
    }

    #[test]
    fn idle_sources_are_pruned() {
        let pools = SlotPools::new(&settings(8, 1));

        let held = pools.try_acquire(ResourceClass::Text, "busy").unwrap();
        for source in ["a", "b", "c"] {
            drop(pools.try_acquire(ResourceClass::Text, source).unwrap());
        }
        assert!(pools.tracked_sources() >= 2);

        let _d = pools.try_acquire(ResourceClass::Text, "d").unwrap();
        assert_eq!(pools.tracked_sources(), 2);
        assert!(pools.try_acquire(ResourceClass::Text, "busy").is_none());
        assert_eq!(pools.available_for_source("a"), 1);

        drop(held);
        assert!(pools.try_acquire(ResourceClass::Text, "busy").is_some());
    }
}
