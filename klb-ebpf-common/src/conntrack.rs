/// Connection tracking key. 16 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ConntrackKey {
    /// Stored in host order
    pub src_ip: u32,
    /// Stored in host order
    pub dst_ip: u32,
    /// Stored in host order
    pub src_port: u16,
    /// Stored in host order
    pub dst_port: u16,
    pub proto: u8,
    pub _pad: [u8; 3],
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for ConntrackKey {}

pub const CT_STATE_NEW: u32 = 0;
pub const CT_STATE_ESTABLISHED: u32 = 1;
pub const CT_STATE_FIN: u32 = 2;

/// Connection tracking row, written by the datapath. 64 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConntrackValue {
    pub state: u32,
    pub flags: u32,
    pub backend_id: u32,
    pub _reserved: u32,
    pub created_ns: u64,
    pub last_seen_ns: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
}
#[cfg(feature = "user")]
unsafe impl aya::Pod for ConntrackValue {}
