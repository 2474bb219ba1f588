//! Live-reloadable configuration handle.
//!
//! The attempt checker reads its tunables through a [`DynamicConfig`] so a host can apply a
//! configuration reload while attempts are in flight. Default uses `ArcSwap` for lock-free
//! reads; feature `adaptive-rwlock` switches to `RwLock`.

use std::sync::Arc;

#[cfg(feature = "adaptive-rwlock")]
use std::sync::RwLock;

#[cfg(not(feature = "adaptive-rwlock"))]
use arc_swap::ArcSwap;

/// Shared, swappable value. Clones observe the same updates.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    #[cfg(not(feature = "adaptive-rwlock"))]
    inner: Arc<ArcSwap<T>>,
    #[cfg(feature = "adaptive-rwlock")]
    inner: Arc<RwLock<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            Self { inner: Arc::new(RwLock::new(value)) }
        }
    }

    /// Snapshot the current value. Later `set` calls do not affect a snapshot already taken.
    #[cfg(not(feature = "adaptive-rwlock"))]
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Snapshot the current value (Clone under RwLock backend).
    #[cfg(feature = "adaptive-rwlock")]
    pub fn get(&self) -> Arc<T>
    where
        T: Clone,
    {
        let guard = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::new(guard.clone())
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.store(Arc::new(value));
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            *self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = value;
        }
    }

    /// Derive the next value from the current one.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
        T: Clone,
    {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            let cur = self.inner.load_full();
            self.inner.store(Arc::new(f(&cur)));
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            let mut guard = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            let next = f(&guard);
            *guard = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::DynamicConfig;
    use crate::ThrottleConfig;

    #[test]
    fn reload_is_visible_through_clones() {
        let handle = DynamicConfig::new(ThrottleConfig::new(3, 1));
        let reader = handle.clone();

        handle.set(ThrottleConfig::new(5, 2));
        assert_eq!(reader.get().refusal_threshold(), 5);
        assert_eq!(reader.get().refusal_window_minutes(), 2);
    }

    #[test]
    fn snapshot_survives_reload() {
        let handle = DynamicConfig::new(ThrottleConfig::new(3, 1));
        let snapshot = handle.get();

        handle.update(|cfg| ThrottleConfig::new(cfg.refusal_threshold() + 1, 9));

        assert_eq!(snapshot.refusal_threshold(), 3);
        assert_eq!(handle.get().refusal_threshold(), 4);
        assert_eq!(handle.get().refusal_window_minutes(), 9);
    }
}
