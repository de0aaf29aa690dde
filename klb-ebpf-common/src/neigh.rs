pub const ARP_STATE_REACHABLE: u16 = 1;
pub const ARP_STATE_STALE: u16 = 2;

/// ARP table key. 8 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ArpKey {
    /// Stored in host order
    pub ip: u32,
    pub ifindex: u32,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for ArpKey {}

/// ARP table row. 12 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ArpValue {
    pub mac: [u8; 6],
    pub state: u16,
    pub ifindex: u32,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for ArpValue {}

/// Route row; the key is an LPM `{prefix_len: u32, addr: u32}`. 8 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct RouteValue {
    /// Stored in host order
    pub next_hop: u32,
    pub ifindex: u32,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for RouteValue {}

/// Interface MAC row, keyed by ifindex. 8 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct MacValue {
    pub mac: [u8; 6],
    pub _pad: u16,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for MacValue {}
