use std::sync::{Arc, Mutex, OnceLock};

use thiserror::Error;
use tracing::{info, warn};

use crate::maps::spec::TableSpec;

/// Errors from opening or creating kernel tables. Kept `Clone` so a single
/// creation attempt's outcome can be handed to every concurrent caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TableError {
    #[error("table {name}: pinned {field} is {found}, descriptor wants {expected}")]
    LayoutConflict {
        name: String,
        field: &'static str,
        expected: u64,
        found: u64,
    },

    #[error("table {0}: create failed: {1}")]
    Create(String, String),

    #[error("table {0} is full")]
    Capacity(String),

    #[error("table {0}: {1}")]
    Io(String, String),
}

/// How tables are actually opened and created. `PinnedBackend` talks to the
/// kernel through pinned maps; `MemoryBackend` keeps everything in-process.
pub trait TableBackend {
    type Table: Clone;

    /// Reopen an existing table, verifying its layout against the
    /// descriptor. `Ok(None)` when nothing is pinned under the name.
    fn open(&self, spec: &TableSpec) -> Result<Option<Self::Table>, TableError>;

    /// Create and pin a fresh table for the descriptor.
    fn create(&self, spec: &TableSpec) -> Result<Self::Table, TableError>;
}

type Cell<T> = Arc<OnceLock<Result<T, TableError>>>;

struct Entry<T> {
    spec: TableSpec,
    cell: Cell<T>,
}

/// Owns the lifecycle of every kernel table. Explicitly constructed and
/// passed by reference; there is no process-wide instance.
///
/// `open_or_create` is idempotent and races are resolved to exactly one
/// creation attempt per versioned name; all concurrent callers observe that
/// attempt's result. A failed attempt is forgotten so a later call may retry.
pub struct MapRegistry<B: TableBackend> {
    backend: B,
    tables: Mutex<ahash::HashMap<String, Entry<B::Table>>>,
}

impl<B: TableBackend> MapRegistry<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            tables: Mutex::new(ahash::HashMap::default()),
        }
    }

    pub fn open_or_create(&self, spec: &TableSpec) -> Result<B::Table, TableError> {
        let name = spec.versioned_name();
        let cell = {
            let mut tables = self.tables.lock().unwrap();
            let entry = tables.entry(name.clone()).or_insert_with(|| Entry {
                spec: *spec,
                cell: Cell::default(),
            });
            // a cached handle only satisfies the layout it was opened with
            verify_layout(spec, &entry.spec)?;
            entry.cell.clone()
        };

        let result = cell
            .get_or_init(|| match self.backend.open(spec) {
                Ok(Some(table)) => {
                    info!(table = %name, "reattached to pinned table");
                    Ok(table)
                }
                Ok(None) => {
                    info!(table = %name, "creating table");
                    self.backend.create(spec)
                }
                Err(e) => Err(e),
            })
            .clone();

        if let Err(e) = &result {
            warn!(table = %name, %e, "table unavailable");
            let mut tables = self.tables.lock().unwrap();
            // forget only the cell that produced this failure
            if let Some(current) = tables.get(&name)
                && Arc::ptr_eq(&current.cell, &cell)
            {
                tables.remove(&name);
            }
        }
        result
    }

    /// Drop the cached handle. The pinned kernel object outlives the process
    /// and is left untouched.
    pub fn close(&self, spec: &TableSpec) {
        let mut tables = self.tables.lock().unwrap();
        tables.remove(&spec.versioned_name());
    }
}

fn verify_layout(requested: &TableSpec, cached: &TableSpec) -> Result<(), TableError> {
    let name = requested.versioned_name();
    let checks: [(&'static str, u64, u64); 3] = [
        (
            "key_size",
            requested.key_size as u64,
            cached.key_size as u64,
        ),
        (
            "value_size",
            requested.value_size as u64,
            cached.value_size as u64,
        ),
        (
            "max_entries",
            requested.max_entries as u64,
            cached.max_entries as u64,
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
    if requested.kind != cached.kind {
        return Err(TableError::LayoutConflict {
            name,
            field: "kind",
            expected: requested.kind as u64,
            found: cached.kind as u64,
        });
    }
    Ok(())
}
