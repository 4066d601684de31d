use std::borrow::BorrowMut;
use std::hash::Hash;
use std::sync::Arc;

use aya::Pod;
use aya::maps::{HashMap, MapData, MapError};
use dashmap::DashMap;
use svclb_common::{Backend4Key, Backend4Value, LbTables, Service4Key, Service4Value};
use tracing::warn;

use crate::Result;

/// Storage contract shared by the kernel maps and the in-memory stand-ins.
pub trait BpfMap<K, V> {
    fn update(&mut self, key: K, value: V) -> Result<()>;
    fn delete(&mut self, key: &K) -> Result<()>;
    fn get(&self, key: &K) -> Result<Option<V>>;
    fn get_state(&self) -> Result<ahash::HashMap<K, V>>;

    /// Writes every entry in order, stopping at the first failure.
    ///
    /// aya exposes no `BPF_MAP_UPDATE_BATCH` for hash maps, so readers can see
    /// a prefix of the batch. Callers only batch entries that stay invisible
    /// until a later master update publishes them.
    fn batch_update(&mut self, entries: &[(K, V)]) -> Result<()>
    where
        K: Copy,
        V: Copy,
    {
        for (key, value) in entries {
            self.update(*key, *value)?;
        }
        Ok(())
    }
}

impl<T: BorrowMut<MapData>, K: Pod + Eq + Hash, V: Pod> BpfMap<K, V> for HashMap<T, K, V> {
    fn update(&mut self, key: K, value: V) -> Result<()> {
        Ok(self.insert(key, value, 0)?)
    }
    fn delete(&mut self, key: &K) -> Result<()> {
        Ok(self.remove(key)?)
    }
    fn get(&self, key: &K) -> Result<Option<V>> {
        match <HashMap<T, K, V>>::get(self, key, 0) {
            Ok(value) => Ok(Some(value)),
            Err(MapError::KeyNotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
    fn get_state(&self) -> Result<ahash::HashMap<K, V>> {
        let mut map = ahash::HashMap::default();
        for v in self.iter() {
            match v {
                Ok((k, v)) => {
                    map.insert(k, v);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(map)
    }
}

impl<K: Eq + Hash + Copy, V: Copy> BpfMap<K, V> for ahash::HashMap<K, V> {
    fn update(&mut self, key: K, value: V) -> Result<()> {
        self.insert(key, value);
        Ok(())
    }
    fn delete(&mut self, key: &K) -> Result<()> {
        self.remove(key);
        Ok(())
    }
    fn get(&self, key: &K) -> Result<Option<V>> {
        Ok(<ahash::HashMap<K, V>>::get(self, key).copied())
    }
    fn get_state(&self) -> Result<ahash::HashMap<K, V>> {
        Ok(self.clone())
    }
}

/// Cloneable handle onto one in-memory table. Every clone sees the same
/// entries and per-key writes are atomic, which is what a pinned map gives a
/// second process.
pub struct SharedMap<K, V>
where
    K: Eq + Hash,
{
    inner: Arc<DashMap<K, V, ahash::RandomState>>,
}

impl<K: Eq + Hash, V> Clone for SharedMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: Eq + Hash, V> Default for SharedMap<K, V> {
    fn default() -> Self {
        Self {
            inner: Arc::new(DashMap::with_hasher(ahash::RandomState::default())),
        }
    }
}

impl<K: Eq + Hash, V> SharedMap<K, V> {
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<K: Eq + Hash + Copy, V: Copy> BpfMap<K, V> for SharedMap<K, V> {
    fn update(&mut self, key: K, value: V) -> Result<()> {
        self.inner.insert(key, value);
        Ok(())
    }
    fn delete(&mut self, key: &K) -> Result<()> {
        self.inner.remove(key);
        Ok(())
    }
    fn get(&self, key: &K) -> Result<Option<V>> {
        Ok(self.inner.get(key).map(|entry| *entry.value()))
    }
    fn get_state(&self) -> Result<ahash::HashMap<K, V>> {
        Ok(self
            .inner
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect())
    }
}

/// A map paired with a write-through cache of what this process wrote.
pub struct BpfState<M, K, V>
where
    M: BpfMap<K, V>,
    K: std::hash::Hash + std::cmp::Eq + Clone,
    V: Clone + std::cmp::PartialEq,
{
    cache: ahash::HashMap<K, V>,
    bpf_map: M,
}

impl<M, K, V> BpfState<M, K, V>
where
    M: BpfMap<K, V>,
    K: std::hash::Hash + std::cmp::Eq + Clone,
    V: Clone + std::cmp::PartialEq,
{
    pub fn new(bpf_map: M) -> Self {
        let cache = ahash::HashMap::default();
        Self { cache, bpf_map }
    }

    /// Seeds the cache from entries already in the map, e.g. a pinned map
    /// written by an earlier run.
    pub fn try_from_map(bpf_map: M) -> Result<Self> {
        let cache = bpf_map.get_state()?;
        Ok(Self { cache, bpf_map })
    }

    /// Replaces the cache with what the map holds now, picking up writes made
    /// by other processes through the pinned map.
    pub fn resync(&mut self) -> Result<()> {
        self.cache = self.bpf_map.get_state()?;
        Ok(())
    }

    pub fn update(&mut self, key: K, value: V) -> Result<()> {
        if let Some(current) = self.cache.get(&key)
            && *current == value
        {
            return Ok(());
        };
        self.bpf_map.update(key.clone(), value.clone())?;
        self.cache.insert(key, value);
        Ok(())
    }

    pub fn delete(&mut self, key: &K) -> Result<()> {
        self.bpf_map.delete(key)?;
        self.cache.remove(key);
        Ok(())
    }

    pub fn get_from_cache(&self, key: &K) -> Option<&V> {
        self.cache.get(key)
    }

    pub fn get_from_map(&self, key: &K) -> Result<Option<V>> {
        self.bpf_map.get(key)
    }

    pub fn cache(&self) -> &ahash::HashMap<K, V> {
        &self.cache
    }

    pub fn map(&self) -> &M {
        &self.bpf_map
    }
}

impl<M, K, V> BpfState<M, K, V>
where
    M: BpfMap<K, V>,
    K: std::hash::Hash + std::cmp::Eq + Copy,
    V: Copy + std::cmp::PartialEq,
{
    /// Batch write through to the map; the cache only takes the entries once
    /// the whole batch has been accepted.
    pub fn batch_update(&mut self, entries: &[(K, V)]) -> Result<()> {
        let pending: Vec<(K, V)> = entries
            .iter()
            .filter(|(k, v)| self.cache.get(k) != Some(v))
            .copied()
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        self.bpf_map.batch_update(&pending)?;
        self.cache.extend(pending);
        Ok(())
    }

    /// Puts a key back to `previous`, deleting it when it did not exist.
    pub fn restore(&mut self, key: K, previous: Option<V>) -> Result<()> {
        match previous {
            Some(value) => {
                self.bpf_map.update(key, value)?;
                self.cache.insert(key, value);
            }
            None => {
                self.bpf_map.delete(&key)?;
                self.cache.remove(&key);
            }
        }
        Ok(())
    }
}

/// Lookup view over a service map and a backend map, so the shared `resolve`
/// can run against kernel maps, pinned maps or test maps alike.
pub struct Tables<'a, S, B> {
    services: &'a S,
    backends: &'a B,
}

impl<'a, S, B> Tables<'a, S, B>
where
    S: BpfMap<Service4Key, Service4Value>,
    B: BpfMap<Backend4Key, Backend4Value>,
{
    pub fn new(services: &'a S, backends: &'a B) -> Self {
        Self { services, backends }
    }
}

impl<S, B> LbTables for Tables<'_, S, B>
where
    S: BpfMap<Service4Key, Service4Value>,
    B: BpfMap<Backend4Key, Backend4Value>,
{
    fn service(&self, key: &Service4Key) -> Option<Service4Value> {
        self.services.get(key).unwrap_or_else(|e| {
            warn!(%e, "service lookup failed");
            None
        })
    }

    fn backend(&self, key: &Backend4Key) -> Option<Backend4Value> {
        self.backends.get(key).unwrap_or_else(|e| {
            warn!(%e, "backend lookup failed");
            None
        })
    }
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use svclb_common::Protocol;

    use super::*;

    #[test]
    fn test_state_skips_unchanged_writes() -> crate::Result<()> {
        let map: SharedMap<Backend4Key, Backend4Value> = SharedMap::default();
        let mut state = BpfState::new(map.clone());
        let key = Backend4Key { id: 1 };
        let value = Backend4Value::new(Ipv4Addr::new(10, 0, 0, 1), 80, Protocol::Tcp);

        state.update(key, value)?;
        // a write behind the cache's back is not undone by an identical update
        let mut raw = map.clone();
        raw.delete(&key)?;
        state.update(key, value)?;
        assert_eq!(map.get(&key)?, None);
        assert_eq!(state.get_from_cache(&key), Some(&value));
        Ok(())
    }

    #[test]
    fn test_restore_puts_back_previous_value() -> crate::Result<()> {
        let mut state: BpfState<
            ahash::HashMap<Backend4Key, Backend4Value>,
            Backend4Key,
            Backend4Value,
        > = BpfState::new(ahash::HashMap::default());
        let key = Backend4Key { id: 9 };
        let old = Backend4Value::new(Ipv4Addr::new(10, 0, 0, 9), 80, Protocol::Tcp);
        let new = Backend4Value::new(Ipv4Addr::new(10, 0, 0, 10), 80, Protocol::Tcp);

        state.update(key, old)?;
        state.update(key, new)?;
        state.restore(key, Some(old))?;
        assert_eq!(state.get_from_map(&key)?, Some(old));

        state.restore(key, None)?;
        assert_eq!(state.get_from_map(&key)?, None);
        assert!(state.cache().is_empty());
        Ok(())
    }

    #[test]
    fn test_seed_cache_from_existing_map() -> crate::Result<()> {
        let mut map: SharedMap<Backend4Key, Backend4Value> = SharedMap::default();
        let value = Backend4Value::new(Ipv4Addr::new(192, 168, 1, 4), 443, Protocol::Tcp);
        map.update(Backend4Key { id: 4 }, value)?;

        let state = BpfState::try_from_map(map)?;
        assert_eq!(state.get_from_cache(&Backend4Key { id: 4 }), Some(&value));
        Ok(())
    }
}
