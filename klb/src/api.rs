use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use klb_ebpf_common::neigh::{ArpKey, ArpValue, MacValue, RouteValue};
use klb_ebpf_common::{BackendId, ServiceId};
use tokio::sync::Notify;

use crate::maps::BpfTable;
use crate::net::NetTables;
use crate::state::{
    AffinityPolicy, Backend, Service, ServiceSnapshot, ServiceStateStore, SourceRange,
};
use crate::Result;

/// The control mutation surface. Everything a transport would expose lands
/// here: mutations validate against the store, and accepted changes nudge the
/// synchronizer so the kernel converges without waiting for the next tick.
/// Forwarding-support tables (neighbors, routes, interface MACs) are written
/// directly; they carry no derived state.
pub struct Controller<N, R, M> {
    store: ServiceStateStore,
    trigger: Arc<Notify>,
    net: Mutex<NetTables<N, R, M>>,
}

impl<N, R, M> Controller<N, R, M>
where
    N: BpfTable<Key = ArpKey, Value = ArpValue>,
    R: BpfTable<Key = (u32, u32), Value = RouteValue>,
    M: BpfTable<Key = u32, Value = MacValue>,
{
    pub fn new(store: ServiceStateStore, trigger: Arc<Notify>, net: NetTables<N, R, M>) -> Self {
        Self {
            store,
            trigger,
            net: Mutex::new(net),
        }
    }

    pub fn upsert_service(&self, service: Service) -> Result<()> {
        self.store.upsert_service(service)?;
        self.trigger.notify_one();
        Ok(())
    }

    pub fn remove_service(&self, id: ServiceId) -> Result<()> {
        self.store.remove_service(id)?;
        self.trigger.notify_one();
        Ok(())
    }

    pub fn upsert_backend(&self, service_id: ServiceId, backend: Backend) -> Result<()> {
        self.store.upsert_backend(service_id, backend)?;
        self.trigger.notify_one();
        Ok(())
    }

    pub fn remove_backend(
        &self,
        service_id: ServiceId,
        backend_id: BackendId,
        force: bool,
    ) -> Result<()> {
        self.store.remove_backend(service_id, backend_id, force)?;
        self.trigger.notify_one();
        Ok(())
    }

    pub fn set_affinity_policy(
        &self,
        service_id: ServiceId,
        policy: Option<AffinityPolicy>,
    ) -> Result<()> {
        self.store.set_affinity_policy(service_id, policy)?;
        self.trigger.notify_one();
        Ok(())
    }

    pub fn set_source_ranges(
        &self,
        service_id: ServiceId,
        ranges: Vec<SourceRange>,
    ) -> Result<()> {
        self.store.set_source_ranges(service_id, ranges)?;
        self.trigger.notify_one();
        Ok(())
    }

    pub fn get_service_state(&self, id: ServiceId) -> Option<ServiceSnapshot> {
        self.store.get_service(id)
    }

    pub fn list_backends(&self, service_id: ServiceId) -> Result<Vec<Backend>> {
        self.store.list_backends(service_id)
    }

    pub fn upsert_neighbor(&self, ip: Ipv4Addr, ifindex: u32, mac: [u8; 6]) -> Result<()> {
        self.net.lock().unwrap().upsert_neighbor(ip, ifindex, mac)
    }

    pub fn remove_neighbor(&self, ip: Ipv4Addr, ifindex: u32) -> Result<()> {
        self.net.lock().unwrap().remove_neighbor(ip, ifindex)
    }

    pub fn upsert_route(
        &self,
        dst: Ipv4Addr,
        prefix_len: u8,
        next_hop: Ipv4Addr,
        ifindex: u32,
    ) -> Result<()> {
        self.net
            .lock()
            .unwrap()
            .upsert_route(dst, prefix_len, next_hop, ifindex)
    }

    pub fn remove_route(&self, dst: Ipv4Addr, prefix_len: u8) -> Result<()> {
        self.net.lock().unwrap().remove_route(dst, prefix_len)
    }

    pub fn change_mac_address(&self, ifindex: u32, mac: [u8; 6]) -> Result<()> {
        self.net.lock().unwrap().change_mac_address(ifindex, mac)
    }

    pub fn get_mac_address(&self, ifindex: u32) -> Result<[u8; 6]> {
        self.net.lock().unwrap().get_mac_address(ifindex)
    }
}
