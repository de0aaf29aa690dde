use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use klb_ebpf_common::{BackendId, Protocol, ServiceId};

use crate::maps::spec::MAX_SERVICES;
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Scheduler {
    Maglev,
    RoundRobin,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Service {
    pub id: ServiceId,
    pub vip: Ipv4Addr,
    pub port: u16,
    pub protocol: Protocol,
    pub scheduler: Scheduler,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backend {
    pub id: BackendId,
    pub addr: Ipv4Addr,
    pub port: u16,
    pub weight: u8,
    pub healthy: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AffinityPolicy {
    pub timeout: Duration,
}

/// One allowed client CIDR for a service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceRange {
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
}

/// Point-in-time copy of one service and everything derived state needs.
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceSnapshot {
    pub service: Service,
    /// Sorted by backend id.
    pub backends: Vec<Backend>,
    pub affinity: Option<AffinityPolicy>,
    pub source_ranges: Vec<SourceRange>,
}

/// Point-in-time copy of the whole desired state, sorted by service id.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Snapshot {
    pub services: Vec<ServiceSnapshot>,
}

struct State {
    services: ahash::HashMap<ServiceId, Service>,
    backends: ahash::HashMap<BackendId, Backend>,
    members: ahash::HashMap<ServiceId, BTreeSet<BackendId>>,
    affinity: ahash::HashMap<ServiceId, AffinityPolicy>,
    source_ranges: ahash::HashMap<ServiceId, Vec<SourceRange>>,
}

struct Shared {
    state: Mutex<State>,
}

/// The single source of truth for what the kernel tables should contain.
/// Mutations validate first and apply atomically under the store lock; reads
/// hand out clones, never references into the store. Kernel I/O and ring
/// rebuilds happen elsewhere, against snapshots, so the lock is only ever
/// held for map bookkeeping.
#[derive(Clone)]
pub struct ServiceStateStore {
    shared: Arc<Shared>,
}

impl Default for ServiceStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceStateStore {
    pub fn new() -> Self {
        let state = State {
            services: ahash::HashMap::default(),
            backends: ahash::HashMap::default(),
            members: ahash::HashMap::default(),
            affinity: ahash::HashMap::default(),
            source_ranges: ahash::HashMap::default(),
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
            }),
        }
    }

    /// Insert or replace a service. Replacing does not carry over the old
    /// entry's backend references; callers that want them must re-attach.
    pub fn upsert_service(&self, service: Service) -> Result<()> {
        if service.port == 0 {
            return Err(Error::InvalidInput("service port must be non-zero".into()));
        }
        // the ring table is addressed by service_id * ring_size, so ids past
        // the table's service capacity would index out of the pinned rows
        if service.id as u32 >= MAX_SERVICES {
            return Err(Error::InvalidInput(format!(
                "service id {} exceeds the capacity of {MAX_SERVICES} services",
                service.id
            )));
        }
        let mut state = self.shared.state.lock().unwrap();
        let id = service.id;
        let replaced = state.services.insert(id, service).is_some();
        if replaced {
            state.members.insert(id, BTreeSet::new());
            state.affinity.remove(&id);
            state.source_ranges.remove(&id);
        } else {
            state.members.entry(id).or_default();
        }
        Ok(())
    }

    /// Remove a service and its references. Its backends stay pooled until a
    /// `remove_backend` drops them, so a removal retried after the service
    /// went away still succeeds instead of reporting the backend unknown.
    pub fn remove_service(&self, id: ServiceId) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        if state.services.remove(&id).is_none() {
            return Err(Error::UnknownService(id));
        }
        state.members.remove(&id);
        state.affinity.remove(&id);
        state.source_ranges.remove(&id);
        Ok(())
    }

    /// Pool the backend (insert or replace) and attach it to the service.
    pub fn upsert_backend(&self, service_id: ServiceId, backend: Backend) -> Result<()> {
        if backend.port == 0 {
            return Err(Error::InvalidInput("backend port must be non-zero".into()));
        }
        let mut state = self.shared.state.lock().unwrap();
        if !state.services.contains_key(&service_id) {
            return Err(Error::UnknownService(service_id));
        }
        let backend_id = backend.id;
        state.backends.insert(backend_id, backend);
        state
            .members
            .entry(service_id)
            .or_default()
            .insert(backend_id);
        Ok(())
    }

    /// Detach a backend from a service and drop it from the pool once nothing
    /// references it. Fails with `BackendInUse` while other services still
    /// reference it, unless `force` detaches it everywhere.
    pub fn remove_backend(
        &self,
        service_id: ServiceId,
        backend_id: BackendId,
        force: bool,
    ) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        if !state.backends.contains_key(&backend_id) {
            return Err(Error::UnknownBackend(backend_id));
        }
        let mut referenced_by: Vec<ServiceId> = state
            .members
            .iter()
            .filter(|(sid, members)| **sid != service_id && members.contains(&backend_id))
            .map(|(sid, _)| *sid)
            .collect();
        referenced_by.sort_unstable();
        if !referenced_by.is_empty() && !force {
            return Err(Error::BackendInUse {
                backend_id,
                referenced_by,
            });
        }
        if let Some(members) = state.members.get_mut(&service_id) {
            members.remove(&backend_id);
        }
        if force {
            for members in state.members.values_mut() {
                members.remove(&backend_id);
            }
        }
        if !state.members.values().any(|m| m.contains(&backend_id)) {
            state.backends.remove(&backend_id);
        }
        Ok(())
    }

    pub fn set_affinity_policy(
        &self,
        service_id: ServiceId,
        policy: Option<AffinityPolicy>,
    ) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        if !state.services.contains_key(&service_id) {
            return Err(Error::UnknownService(service_id));
        }
        match policy {
            Some(policy) => {
                if policy.timeout.is_zero() {
                    return Err(Error::InvalidInput(
                        "affinity timeout must be non-zero".into(),
                    ));
                }
                state.affinity.insert(service_id, policy);
            }
            None => {
                state.affinity.remove(&service_id);
            }
        }
        Ok(())
    }

    pub fn set_source_ranges(
        &self,
        service_id: ServiceId,
        ranges: Vec<SourceRange>,
    ) -> Result<()> {
        if let Some(bad) = ranges.iter().find(|r| r.prefix_len > 32) {
            return Err(Error::InvalidInput(format!(
                "prefix length {} exceeds 32",
                bad.prefix_len
            )));
        }
        let mut state = self.shared.state.lock().unwrap();
        if !state.services.contains_key(&service_id) {
            return Err(Error::UnknownService(service_id));
        }
        if ranges.is_empty() {
            state.source_ranges.remove(&service_id);
        } else {
            state.source_ranges.insert(service_id, ranges);
        }
        Ok(())
    }

    pub fn get_service(&self, id: ServiceId) -> Option<ServiceSnapshot> {
        let state = self.shared.state.lock().unwrap();
        state
            .services
            .get(&id)
            .map(|service| snapshot_service(&state, service))
    }

    pub fn list_backends(&self, service_id: ServiceId) -> Result<Vec<Backend>> {
        let state = self.shared.state.lock().unwrap();
        if !state.services.contains_key(&service_id) {
            return Err(Error::UnknownService(service_id));
        }
        let members = state.members.get(&service_id);
        Ok(members
            .into_iter()
            .flatten()
            .filter_map(|id| state.backends.get(id).cloned())
            .collect())
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = self.shared.state.lock().unwrap();
        let mut services: Vec<ServiceSnapshot> = state
            .services
            .values()
            .map(|service| snapshot_service(&state, service))
            .collect();
        services.sort_by_key(|s| s.service.id);
        Snapshot { services }
    }
}

fn snapshot_service(state: &State, service: &Service) -> ServiceSnapshot {
    let backends = state
        .members
        .get(&service.id)
        .into_iter()
        .flatten()
        .filter_map(|id| state.backends.get(id).cloned())
        .collect();
    ServiceSnapshot {
        service: service.clone(),
        backends,
        affinity: state.affinity.get(&service.id).copied(),
        source_ranges: state
            .source_ranges
            .get(&service.id)
            .cloned()
            .unwrap_or_default(),
    }
}
