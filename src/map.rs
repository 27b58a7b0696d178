//! Thin map-style adapter over [`KiWi`].
//!
//! Exposes the conventional `get`/`put`/`remove`/`scan` surface, mapping
//! removal onto tombstone puts. Everything else is the store's semantics,
//! unchanged.

use crate::config::Config;
use crate::key::Key;
use crate::store::KiWi;

/// Map-flavored wrapper around a [`KiWi`] store.
///
/// ```rust
/// use kiwi::KiWiMap;
///
/// let map: KiWiMap<u64, String> = KiWiMap::new();
/// map.put(1, "one".to_owned());
/// assert_eq!(map.get(1).as_deref(), Some("one"));
///
/// map.remove(1);
/// assert_eq!(map.get(1), None);
/// ```
#[derive(Debug)]
pub struct KiWiMap<K: Key, V> {
    store: KiWi<K, V>,
}

impl<K: Key, V: Clone + Send + Sync + 'static> KiWiMap<K, V> {
    /// Create a map with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Create a map with an explicit configuration.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid.
    #[must_use]
    pub fn with_config(config: Config) -> Self {
        Self {
            store: KiWi::new(config),
        }
    }

    /// The value currently mapped to `key`.
    #[must_use]
    pub fn get(&self, key: K) -> Option<V> {
        self.store.get(key)
    }

    /// Map `key` to `value`, overwriting any previous mapping.
    pub fn put(&self, key: K, value: V) {
        self.store.put(key, Some(value));
    }

    /// Remove `key`'s mapping (a tombstone put).
    pub fn remove(&self, key: K) {
        self.store.put(key, None);
    }

    /// Whether `key` is currently mapped.
    #[must_use]
    pub fn contains_key(&self, key: K) -> bool {
        self.get(key).is_some()
    }

    /// Range scan into `out`; see [`KiWi::scan`].
    pub fn scan(&self, min: K, max: K, out: &mut [V]) -> usize {
        self.store.scan(min, max, out)
    }

    /// Access the underlying store.
    #[must_use]
    pub const fn store(&self) -> &KiWi<K, V> {
        &self.store
    }
}

impl<K: Key, V: Clone + Send + Sync + 'static> Default for KiWiMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
