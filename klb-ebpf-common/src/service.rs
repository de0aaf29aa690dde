use crate::{BackendId, ServiceId};

/// Set when the service keeps per-client session affinity.
pub const SERVICE_FLAG_AFFINITY: u16 = 1 << 0;
/// Set when the service restricts clients to the source-range table.
pub const SERVICE_FLAG_SRC_FILTER: u16 = 1 << 1;

/// Scheduling algorithm carried in the upper byte of `ServiceValue::flags`.
pub const SCHED_MAGLEV: u16 = 0 << 8;
pub const SCHED_ROUND_ROBIN: u16 = 1 << 8;

pub const BACKEND_FLAG_HEALTHY: u8 = 1 << 0;

/// VIP lookup key. 8 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ServiceKey {
    /// Stored in host order
    pub vip: u32,
    /// Stored in host order
    pub port: u16,
    pub proto: u8,
    pub _pad: u8,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for ServiceKey {}

/// Service row. 12 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ServiceValue {
    pub id: ServiceId,
    pub flags: u16,
    pub backend_count: u16,
    pub _pad: u16,
    pub affinity_timeout_s: u32,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for ServiceValue {}

/// Backend row key. 4 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct BackendKey {
    pub service_id: ServiceId,
    pub backend_id: BackendId,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for BackendKey {}

/// Backend row. 8 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct BackendValue {
    /// Stored in host order
    pub addr: u32,
    /// Stored in host order
    pub port: u16,
    pub weight: u8,
    pub flags: u8,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for BackendValue {}

/// Session affinity key. 8 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct AffinityKey {
    /// Stored in host order
    pub client_ip: u32,
    pub service_id: ServiceId,
    pub _pad: u16,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for AffinityKey {}

/// Session affinity row. 16 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct AffinityValue {
    pub backend_id: u32,
    pub _pad: u32,
    pub expires_at_ns: u64,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for AffinityValue {}

/// LPM data half of a source-range key; the full kernel key is
/// `{prefix_len: u32, data: SrcRangeKey}` with `prefix_len = 32 + cidr len`
/// so every rule is scoped to its owning service first.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct SrcRangeKey {
    pub service_id: u32,
    /// Stored in network order, LPM tries compare big-endian
    pub addr: u32,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for SrcRangeKey {}

/// Index of a consistent-hash ring slot: `service_id * ring_size + slot`.
pub const fn ring_index(service_id: ServiceId, ring_size: u32, slot: u32) -> u32 {
    service_id as u32 * ring_size + slot
}
