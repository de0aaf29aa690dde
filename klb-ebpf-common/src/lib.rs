#![no_std]

pub mod conntrack;
pub mod neigh;
pub mod service;

use core::fmt::Display;

pub type ServiceId = u16;
pub type BackendId = u16;

/// Ring slot value meaning "no backend assigned".
pub const BACKEND_NONE: u32 = u32::MAX;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Default)]
pub enum Protocol {
    #[default]
    Tcp = 6,
    Udp = 17,
    Sctp = 132,
}

impl TryFrom<&str> for Protocol {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "TCP" | "tcp" | "Tcp" => Ok(Protocol::Tcp),
            "UDP" | "udp" | "Udp" => Ok(Protocol::Udp),
            "SCTP" | "sctp" | "Sctp" => Ok(Protocol::Sctp),
            _ => Err("protocol must be one of TCP, UDP or SCTP"),
        }
    }
}

impl TryFrom<u8> for Protocol {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            6 => Ok(Protocol::Tcp),
            17 => Ok(Protocol::Udp),
            132 => Ok(Protocol::Sctp),
            _ => Err("protocol must be one of TCP, UDP or SCTP"),
        }
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Sctp => write!(f, "SCTP"),
        }
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for Protocol {}
