use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::maps::registry::{TableBackend, TableError};
use crate::maps::spec::TableSpec;

/// In-process stand-in for the pinned-map filesystem. Tables persist for the
/// backend's lifetime, so dropping and rebuilding a registry over the same
/// backend behaves like a process restart against live pins.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
    fail_next_create: Arc<AtomicBool>,
}

#[derive(Default)]
struct Inner {
    tables: ahash::HashMap<String, MemoryTable>,
    create_counts: ahash::HashMap<String, u32>,
}

impl MemoryBackend {
    pub fn create_count(&self, versioned_name: &str) -> u32 {
        let inner = self.inner.lock().unwrap();
        inner.create_counts.get(versioned_name).copied().unwrap_or(0)
    }

    /// Make the next create attempt fail, for retry tests.
    pub fn fail_next_create(&self) {
        self.fail_next_create.store(true, Ordering::SeqCst);
    }
}

impl TableBackend for MemoryBackend {
    type Table = MemoryTable;

    fn open(&self, spec: &TableSpec) -> Result<Option<MemoryTable>, TableError> {
        let inner = self.inner.lock().unwrap();
        let Some(table) = inner.tables.get(&spec.versioned_name()) else {
            return Ok(None);
        };
        table.verify(spec)?;
        Ok(Some(table.clone()))
    }

    fn create(&self, spec: &TableSpec) -> Result<MemoryTable, TableError> {
        let name = spec.versioned_name();
        if self.fail_next_create.swap(false, Ordering::SeqCst) {
            return Err(TableError::Create(name, "injected failure".into()));
        }
        let mut inner = self.inner.lock().unwrap();
        let table = MemoryTable {
            spec: *spec,
            rows: Arc::new(Mutex::new(ahash::HashMap::default())),
        };
        inner.tables.insert(name.clone(), table.clone());
        *inner.create_counts.entry(name).or_insert(0) += 1;
        Ok(table)
    }
}

/// A single in-memory table. Handles are cheap clones sharing the same rows,
/// the way two pinned-map fds reference the same kernel object.
#[derive(Clone, Debug)]
pub struct MemoryTable {
    spec: TableSpec,
    rows: Arc<Mutex<ahash::HashMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryTable {
    pub fn spec(&self) -> &TableSpec {
        &self.spec
    }

    fn verify(&self, requested: &TableSpec) -> Result<(), TableError> {
        let pinned = &self.spec;
        let name = requested.versioned_name();
        let checks: [(&'static str, u64, u64); 3] = [
            ("key_size", requested.key_size as u64, pinned.key_size as u64),
            (
                "value_size",
                requested.value_size as u64,
                pinned.value_size as u64,
            ),
            (
                "max_entries",
                requested.max_entries as u64,
                pinned.max_entries as u64,
            ),
        ];
        for (field, expected, found) in checks {
            if expected != found {
                return Err(TableError::LayoutConflict {
                    name,
                    field,
                    expected,
                    found,
                });
            }
        }
        if requested.kind != pinned.kind {
            return Err(TableError::LayoutConflict {
                name,
                field: "kind",
                expected: requested.kind as u64,
                found: pinned.kind as u64,
            });
        }
        Ok(())
    }

    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<(), TableError> {
        let name = self.spec.versioned_name();
        if key.len() != self.spec.key_size as usize || value.len() != self.spec.value_size as usize
        {
            return Err(TableError::Io(name, "row size mismatch".into()));
        }
        let mut rows = self.rows.lock().unwrap();
        if !rows.contains_key(key) && rows.len() as u32 >= self.spec.max_entries {
            return Err(TableError::Capacity(name));
        }
        rows.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>, TableError> {
        let rows = self.rows.lock().unwrap();
        rows.get(key)
            .cloned()
            .ok_or_else(|| TableError::Io(self.spec.versioned_name(), "key not found".into()))
    }

    pub fn remove(&self, key: &[u8]) {
        let mut rows = self.rows.lock().unwrap();
        rows.remove(key);
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use crate::maps::spec::MACS;

    use super::*;

    #[test]
    fn capacity_is_enforced() {
        let backend = MemoryBackend::default();
        let spec = TableSpec {
            max_entries: 1,
            ..MACS
        };
        let table = backend.create(&spec).unwrap();
        table.insert(&1u32.to_ne_bytes(), &[0u8; 8]).unwrap();
        // replacement of an existing key is fine
        table.insert(&1u32.to_ne_bytes(), &[1u8; 8]).unwrap();
        match table.insert(&2u32.to_ne_bytes(), &[0u8; 8]) {
            Err(TableError::Capacity(_)) => {}
            other => panic!("expected Capacity, got {other:?}"),
        }
    }

    #[test]
    fn row_sizes_are_checked() {
        let backend = MemoryBackend::default();
        let table = backend.create(&MACS).unwrap();
        assert!(table.insert(&[0u8; 3], &[0u8; 8]).is_err());
        assert!(table.insert(&[0u8; 4], &[0u8; 9]).is_err());
    }
}
