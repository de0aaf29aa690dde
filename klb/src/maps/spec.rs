use std::path::{Path, PathBuf};

/// Pinned tables live under `<bpf_fs>/globals/<versioned_name>` so a
/// restarting process can reattach without data loss.
pub const GLOBALS_DIR: &str = "globals";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TableKind {
    Hash,
    LruHash,
    LpmTrie,
}

/// Static descriptor for one kernel table. Constructed once at startup and
/// immutable afterwards; a layout change requires a version bump, never an
/// in-place reinterpretation of pinned data.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TableSpec {
    pub name: &'static str,
    pub kind: TableKind,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub version: u16,
    pub flags: u32,
}

impl TableSpec {
    pub fn versioned_name(&self) -> String {
        if self.version <= 1 {
            self.name.to_string()
        } else {
            format!("{}{}", self.name, self.version)
        }
    }

    pub fn pin_path(&self, bpf_fs: &Path) -> PathBuf {
        bpf_fs.join(GLOBALS_DIR).join(self.versioned_name())
    }
}

pub const MAX_SERVICES: u32 = 512;
pub const DEFAULT_RING_SIZE: u32 = 65537;

pub const SERVICES: TableSpec = TableSpec {
    name: "klb_v4_svcs",
    kind: TableKind::Hash,
    key_size: 8,
    value_size: 12,
    max_entries: MAX_SERVICES,
    version: 1,
    flags: 0,
};

pub const BACKENDS: TableSpec = TableSpec {
    name: "klb_v4_reals",
    kind: TableKind::Hash,
    key_size: 4,
    value_size: 8,
    max_entries: 65536,
    version: 1,
    flags: 0,
};

pub const CH_RINGS: TableSpec = TableSpec {
    name: "klb_v4_ch",
    kind: TableKind::Hash,
    key_size: 4,
    value_size: 4,
    max_entries: MAX_SERVICES * DEFAULT_RING_SIZE,
    version: 1,
    flags: 0,
};

/// Ring descriptor sized for a configured ring. The pinned table must hold
/// `MAX_SERVICES * ring_size` slots exactly; a daemon restarted with a
/// different ring size hits a layout conflict instead of silently indexing
/// past the rows that exist. `None` when the product overflows.
pub fn ch_rings(ring_size: u32) -> Option<TableSpec> {
    let max_entries = MAX_SERVICES.checked_mul(ring_size)?;
    Some(TableSpec {
        max_entries,
        ..CH_RINGS
    })
}

pub const CONNTRACK: TableSpec = TableSpec {
    name: "klb_v4_ct",
    kind: TableKind::LruHash,
    key_size: 16,
    value_size: 64,
    max_entries: 1 << 20,
    version: 1,
    flags: 0,
};

// v2: the value grew a state field; v1 pins keep their old layout.
pub const ARP: TableSpec = TableSpec {
    name: "klb_v4_arp",
    kind: TableKind::Hash,
    key_size: 8,
    value_size: 12,
    max_entries: 4096,
    version: 2,
    flags: 0,
};

pub const ROUTES: TableSpec = TableSpec {
    name: "klb_v4_routes",
    kind: TableKind::LpmTrie,
    key_size: 8,
    value_size: 8,
    max_entries: 4096,
    version: 1,
    flags: 0,
};

pub const SRC_RANGES: TableSpec = TableSpec {
    name: "klb_v4_srcrange",
    kind: TableKind::LpmTrie,
    key_size: 12,
    value_size: 4,
    max_entries: 8192,
    version: 1,
    flags: 0,
};

pub const AFFINITY: TableSpec = TableSpec {
    name: "klb_v4_affinity",
    kind: TableKind::LruHash,
    key_size: 8,
    value_size: 16,
    max_entries: 1 << 17,
    version: 1,
    flags: 0,
};

pub const MACS: TableSpec = TableSpec {
    name: "klb_v4_macs",
    kind: TableKind::Hash,
    key_size: 4,
    value_size: 8,
    max_entries: 256,
    version: 1,
    flags: 0,
};

/// Tables the datapath cannot run without; failing to open any of these at
/// startup is fatal.
pub const REQUIRED: [&TableSpec; 9] = [
    &SERVICES,
    &BACKENDS,
    &CH_RINGS,
    &CONNTRACK,
    &ARP,
    &ROUTES,
    &SRC_RANGES,
    &AFFINITY,
    &MACS,
];
