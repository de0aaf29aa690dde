use std::net::Ipv4Addr;

use klb_ebpf_common::neigh::{ARP_STATE_REACHABLE, ArpKey, ArpValue, MacValue, RouteValue};
use tracing::info;

use crate::maps::BpfTable;
use crate::{Error, Result};

/// Writers for the forwarding-support tables: neighbor resolution, routes,
/// and per-interface source MACs. These carry what the datapath needs to
/// rewrite L2 headers after a backend is picked.
pub struct NetTables<N, R, M> {
    pub arp: N,
    pub routes: R,
    pub macs: M,
}

impl<N, R, M> NetTables<N, R, M>
where
    N: BpfTable<Key = ArpKey, Value = ArpValue>,
    R: BpfTable<Key = (u32, u32), Value = RouteValue>,
    M: BpfTable<Key = u32, Value = MacValue>,
{
    pub fn upsert_neighbor(&mut self, ip: Ipv4Addr, ifindex: u32, mac: [u8; 6]) -> Result<()> {
        let key = ArpKey {
            ip: u32::from(ip),
            ifindex,
        };
        let value = ArpValue {
            mac,
            state: ARP_STATE_REACHABLE,
            ifindex,
        };
        self.arp.update(key, value)?;
        info!(%ip, ifindex, "neighbor updated");
        Ok(())
    }

    pub fn remove_neighbor(&mut self, ip: Ipv4Addr, ifindex: u32) -> Result<()> {
        self.arp.delete(&ArpKey {
            ip: u32::from(ip),
            ifindex,
        })
    }

    pub fn get_neighbor(&self, ip: Ipv4Addr, ifindex: u32) -> Result<ArpValue> {
        self.arp.lookup(&ArpKey {
            ip: u32::from(ip),
            ifindex,
        })
    }

    pub fn upsert_route(
        &mut self,
        dst: Ipv4Addr,
        prefix_len: u8,
        next_hop: Ipv4Addr,
        ifindex: u32,
    ) -> Result<()> {
        let key = route_key(dst, prefix_len)?;
        let value = RouteValue {
            next_hop: u32::from(next_hop),
            ifindex,
        };
        self.routes.update(key, value)?;
        info!(%dst, prefix_len, %next_hop, ifindex, "route updated");
        Ok(())
    }

    pub fn remove_route(&mut self, dst: Ipv4Addr, prefix_len: u8) -> Result<()> {
        let key = route_key(dst, prefix_len)?;
        self.routes.delete(&key)
    }

    pub fn change_mac_address(&mut self, ifindex: u32, mac: [u8; 6]) -> Result<()> {
        self.macs.update(ifindex, MacValue { mac, _pad: 0 })?;
        info!(ifindex, "interface mac updated");
        Ok(())
    }

    pub fn get_mac_address(&self, ifindex: u32) -> Result<[u8; 6]> {
        Ok(self.macs.lookup(&ifindex)?.mac)
    }
}

fn route_key(dst: Ipv4Addr, prefix_len: u8) -> Result<(u32, u32)> {
    if prefix_len > 32 {
        return Err(Error::InvalidInput(format!(
            "route prefix length {prefix_len} out of range"
        )));
    }
    // LPM tries compare big-endian
    Ok((prefix_len as u32, u32::from(dst).to_be()))
}
