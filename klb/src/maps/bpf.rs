use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use aya::Pod;
use aya::maps::lpm_trie::LpmTrie;
use aya::maps::{HashMap, Map, MapData, MapError, MapInfo, MapType};
use tracing::info;

use crate::maps::registry::{TableBackend, TableError};
use crate::maps::spec::{TableKind, TableSpec};
use crate::{Error, Result};

/// Ensures the datapath object is loaded. Loading with a map pin path makes
/// the kernel create and pin every missing table by name.
pub type EnsureDatapath = Arc<dyn Fn() -> Result<(), TableError> + Send + Sync>;

/// Backend over bpffs pins. Opening never creates; creation goes through the
/// datapath loader so tables always originate from the compiled object and
/// carry its layouts.
#[derive(Clone)]
pub struct PinnedBackend {
    bpf_fs: PathBuf,
    ensure_datapath: EnsureDatapath,
}

impl PinnedBackend {
    pub fn new(bpf_fs: PathBuf, ensure_datapath: EnsureDatapath) -> Self {
        Self {
            bpf_fs,
            ensure_datapath,
        }
    }
}

impl TableBackend for PinnedBackend {
    type Table = PinnedTable;

    fn open(&self, spec: &TableSpec) -> Result<Option<PinnedTable>, TableError> {
        let name = spec.versioned_name();
        let path = spec.pin_path(&self.bpf_fs);
        let info = match MapInfo::from_pin(&path) {
            Ok(info) => info,
            Err(MapError::SyscallError(e)) if e.io_error.kind() == ErrorKind::NotFound => {
                return Ok(None);
            }
            Err(e) => return Err(TableError::Io(name, e.to_string())),
        };
        verify_layout(spec, &info)?;
        Ok(Some(PinnedTable {
            path,
            kind: spec.kind,
        }))
    }

    fn create(&self, spec: &TableSpec) -> Result<PinnedTable, TableError> {
        let name = spec.versioned_name();
        info!(table = %name, "loading datapath object to create table");
        (self.ensure_datapath)()?;
        self.open(spec)?
            .ok_or_else(|| TableError::Create(name, "datapath object did not pin table".into()))
    }
}

fn verify_layout(spec: &TableSpec, info: &MapInfo) -> Result<(), TableError> {
    let name = spec.versioned_name();
    let found_type = info
        .map_type()
        .map_err(|e| TableError::Io(name.clone(), e.to_string()))?;
    let expected_type = match spec.kind {
        TableKind::Hash => MapType::Hash,
        TableKind::LruHash => MapType::LruHash,
        TableKind::LpmTrie => MapType::LpmTrie,
    };
    if found_type != expected_type {
        return Err(TableError::LayoutConflict {
            name,
            field: "kind",
            expected: expected_type as u64,
            found: found_type as u64,
        });
    }
    let checks: [(&'static str, u64, u64); 3] = [
        ("key_size", spec.key_size as u64, info.key_size() as u64),
        ("value_size", spec.value_size as u64, info.value_size() as u64),
        (
            "max_entries",
            spec.max_entries as u64,
            info.max_entries() as u64,
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
    Ok(())
}

/// Handle to a verified pinned table. Typed views each reopen the pin, so
/// every view is an independent fd onto the same kernel object; dropping a
/// view never unpins.
#[derive(Clone)]
pub struct PinnedTable {
    path: PathBuf,
    kind: TableKind,
}

impl PinnedTable {
    fn data(&self) -> Result<MapData> {
        Ok(MapData::from_pin(&self.path)?)
    }

    pub fn hash_map<K, V>(&self) -> Result<HashMap<MapData, K, V>>
    where
        K: Pod,
        V: Pod,
    {
        let data = self.data()?;
        let map = match self.kind {
            TableKind::Hash => Map::HashMap(data),
            TableKind::LruHash => Map::LruHashMap(data),
            TableKind::LpmTrie => {
                return Err(Error::Conversion(format!(
                    "{} is an lpm trie, not a hash table",
                    self.path.display()
                )));
            }
        };
        Ok(map.try_into()?)
    }

    pub fn lpm_trie<K, V>(&self) -> Result<LpmTrie<MapData, K, V>>
    where
        K: Pod,
        V: Pod,
    {
        if self.kind != TableKind::LpmTrie {
            return Err(Error::Conversion(format!(
                "{} is not an lpm trie",
                self.path.display()
            )));
        }
        let map = Map::LpmTrie(self.data()?);
        Ok(map.try_into()?)
    }
}
