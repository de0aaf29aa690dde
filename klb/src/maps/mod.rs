pub mod bpf;
pub mod memory;
pub mod registry;
pub mod spec;

use std::borrow::BorrowMut;
use std::hash::Hash;

use aya::Pod;
use aya::maps::lpm_trie::{Key as LpmKey, LpmTrie};
use aya::maps::{HashMap, MapData};

use crate::{Error, Result};

/// Typed view over one kernel table. Implemented for the aya map types in
/// production and for plain `ahash::HashMap`s in tests, so everything above
/// this trait runs without a kernel.
///
/// LPM tables use `(prefix_len, data)` tuples as keys so fakes stay hashable.
///
/// The read accessor is named `lookup` so calls on a fake table cannot
/// resolve to the inherent `HashMap::get` instead of the trait.
pub trait BpfTable {
    type Key;
    type Value;
    fn update(&mut self, key: Self::Key, value: Self::Value) -> Result<()>;
    fn delete(&mut self, key: &Self::Key) -> Result<()>;
    fn lookup(&self, key: &Self::Key) -> Result<Self::Value>;
    fn snapshot(&self) -> Result<ahash::HashMap<Self::Key, Self::Value>>;
}

impl<T, K, V> BpfTable for HashMap<T, K, V>
where
    T: BorrowMut<MapData>,
    K: Pod + Eq + Hash,
    V: Pod,
{
    type Key = K;
    type Value = V;

    fn update(&mut self, key: K, value: V) -> Result<()> {
        Ok(self.insert(key, value, 0)?)
    }

    fn delete(&mut self, key: &K) -> Result<()> {
        Ok(self.remove(key)?)
    }

    fn lookup(&self, key: &K) -> Result<V> {
        Ok(<HashMap<T, K, V>>::get(self, key, 0)?)
    }

    fn snapshot(&self) -> Result<ahash::HashMap<K, V>> {
        let mut out = ahash::HashMap::default();
        for kv in self.iter() {
            let (k, v) = kv?;
            out.insert(k, v);
        }
        Ok(out)
    }
}

impl<T, K, V> BpfTable for LpmTrie<T, K, V>
where
    T: BorrowMut<MapData>,
    K: Pod,
    V: Pod,
{
    type Key = (u32, K);
    type Value = V;

    fn update(&mut self, (prefix_len, data): Self::Key, value: V) -> Result<()> {
        Ok(self.insert(&LpmKey::new(prefix_len, data), value, 0)?)
    }

    fn delete(&mut self, key: &Self::Key) -> Result<()> {
        Ok(self.remove(&LpmKey::new(key.0, key.1))?)
    }

    fn lookup(&self, key: &Self::Key) -> Result<V> {
        Ok(<LpmTrie<T, K, V>>::get(self, &LpmKey::new(key.0, key.1), 0)?)
    }

    // The kernel offers no prefix-preserving iteration we rely on.
    fn snapshot(&self) -> Result<ahash::HashMap<Self::Key, V>> {
        Err(Error::NotImplemented("lpm table snapshot"))
    }
}

impl<K, V> BpfTable for ahash::HashMap<K, V>
where
    K: Eq + Hash + Copy,
    V: Copy,
{
    type Key = K;
    type Value = V;

    fn update(&mut self, key: K, value: V) -> Result<()> {
        self.insert(key, value);
        Ok(())
    }

    fn delete(&mut self, key: &K) -> Result<()> {
        self.remove(key);
        Ok(())
    }

    fn lookup(&self, key: &K) -> Result<V> {
        match self.get(key) {
            Some(v) => Ok(*v),
            None => Err(Error::Conversion("key not found".into())),
        }
    }

    fn snapshot(&self) -> Result<ahash::HashMap<K, V>> {
        Ok(self.clone())
    }
}

/// Enforces a table's `max_entries` in front of any inner table, the way the
/// kernel rejects inserts past a map's capacity.
pub struct CappedTable<M> {
    name: &'static str,
    max_entries: u32,
    len: u32,
    inner: M,
}

impl<M: BpfTable> CappedTable<M>
where
    M::Key: Eq + Hash + Copy,
{
    pub fn new(name: &'static str, max_entries: u32, inner: M) -> Self {
        Self {
            name,
            max_entries,
            len: 0,
            inner,
        }
    }
}

impl<M: BpfTable> BpfTable for CappedTable<M>
where
    M::Key: Eq + Hash + Copy,
{
    type Key = M::Key;
    type Value = M::Value;

    fn update(&mut self, key: Self::Key, value: Self::Value) -> Result<()> {
        let exists = self.inner.lookup(&key).is_ok();
        if !exists && self.len >= self.max_entries {
            return Err(Error::CapacityExceeded { table: self.name });
        }
        self.inner.update(key, value)?;
        if !exists {
            self.len += 1;
        }
        Ok(())
    }

    fn delete(&mut self, key: &Self::Key) -> Result<()> {
        if self.inner.lookup(key).is_ok() {
            self.len -= 1;
        }
        self.inner.delete(key)
    }

    fn lookup(&self, key: &Self::Key) -> Result<Self::Value> {
        self.inner.lookup(key)
    }

    fn snapshot(&self) -> Result<ahash::HashMap<Self::Key, Self::Value>> {
        self.inner.snapshot()
    }
}
