use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use klb_ebpf_common::conntrack::{ConntrackKey, ConntrackValue};
use klb_ebpf_common::service::{
    AffinityKey, AffinityValue, BACKEND_FLAG_HEALTHY, BackendKey, BackendValue, SCHED_MAGLEV,
    SCHED_ROUND_ROBIN, SERVICE_FLAG_AFFINITY, SERVICE_FLAG_SRC_FILTER, ServiceKey, ServiceValue,
    SrcRangeKey, ring_index,
};
use klb_ebpf_common::{BACKEND_NONE, BackendId, ServiceId};

use crate::conntrack;
use crate::maglev;
use crate::maps::BpfTable;
use crate::state::{Scheduler, ServiceSnapshot, ServiceStateStore, Snapshot, SourceRange};
use crate::{Error, Result};

const WRITE_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(10);

/// The kernel tables the synchronizer writes.
pub struct Tables<S, B, R, A, F, C> {
    pub services: S,
    pub backends: B,
    pub ring: R,
    pub affinity: A,
    pub src_ranges: F,
    pub conntrack: C,
}

/// Outcome of one reconciliation pass. A pass is not an atomic batch: rows
/// applied before a failure stay applied, and failed service ids are left
/// for the next pass to retry.
#[derive(Debug, Default)]
pub struct Report {
    pub applied: Vec<ServiceId>,
    pub removed: Vec<ServiceId>,
    pub failed: Vec<(ServiceId, Error)>,
}

impl Report {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

struct AppliedService {
    key: ServiceKey,
    value: ServiceValue,
    backends: ahash::HashMap<BackendId, BackendValue>,
    ring: Vec<u32>,
    src_ranges: Vec<SourceRange>,
}

/// Diffs desired state against the last-applied kernel rows and writes the
/// minimal set of changes. Owned by exactly one task; see [`run`].
pub struct Synchronizer<S, B, R, A, F, C>
where
    S: BpfTable<Key = ServiceKey, Value = ServiceValue>,
    B: BpfTable<Key = BackendKey, Value = BackendValue>,
    R: BpfTable<Key = u32, Value = u32>,
    A: BpfTable<Key = AffinityKey, Value = AffinityValue>,
    F: BpfTable<Key = (u32, SrcRangeKey), Value = u32>,
    C: BpfTable<Key = ConntrackKey, Value = ConntrackValue>,
{
    tables: Tables<S, B, R, A, F, C>,
    applied: ahash::HashMap<ServiceId, AppliedService>,
    ring_size: u32,
}

impl<S, B, R, A, F, C> Synchronizer<S, B, R, A, F, C>
where
    S: BpfTable<Key = ServiceKey, Value = ServiceValue>,
    B: BpfTable<Key = BackendKey, Value = BackendValue>,
    R: BpfTable<Key = u32, Value = u32>,
    A: BpfTable<Key = AffinityKey, Value = AffinityValue>,
    F: BpfTable<Key = (u32, SrcRangeKey), Value = u32>,
    C: BpfTable<Key = ConntrackKey, Value = ConntrackValue>,
{
    pub fn new(tables: Tables<S, B, R, A, F, C>, ring_size: u32) -> Self {
        Self {
            tables,
            applied: ahash::HashMap::default(),
            ring_size,
        }
    }

    /// One reconciliation pass. Service failures are isolated: a failing
    /// service is reported and the pass moves on; nothing already applied
    /// is rolled back. The cancellation token is checked between services
    /// so shutdown never waits on more than one service's worth of work.
    pub async fn reconcile(&mut self, desired: &Snapshot, cancel: &CancellationToken) -> Report {
        let mut report = Report::default();

        let mut stale: Vec<ServiceId> = self
            .applied
            .keys()
            .filter(|id| !desired.services.iter().any(|s| s.service.id == **id))
            .copied()
            .collect();
        stale.sort_unstable();

        for id in stale {
            if cancel.is_cancelled() {
                return report;
            }
            match self.remove_service(id).await {
                Ok(()) => {
                    info!(service = id, "removed service");
                    report.removed.push(id);
                }
                Err(e) => {
                    error!(service = id, %e, "failed to remove service");
                    report.failed.push((id, e));
                }
            }
        }

        for svc in &desired.services {
            if cancel.is_cancelled() {
                return report;
            }
            let id = svc.service.id;
            match self.apply_service(svc).await {
                Ok(true) => report.applied.push(id),
                Ok(false) => debug!(service = id, "service unchanged"),
                Err(e) => {
                    error!(service = id, %e, "failed to apply service");
                    report.failed.push((id, e));
                }
            }
        }
        report
    }

    async fn apply_service(&mut self, svc: &ServiceSnapshot) -> Result<bool> {
        let id = svc.service.id;
        let key = service_key(svc);
        let backend_rows = backend_rows(svc);
        let value = service_value(svc, backend_rows.len() as u16);

        let (prev_key, prev_backends, prev_ring, prev_ranges) = match self.applied.get(&id) {
            Some(prev) => {
                if prev.key == key
                    && prev.value == value
                    && prev.backends == backend_rows
                    && prev.src_ranges == svc.source_ranges
                {
                    return Ok(false);
                }
                (
                    Some(prev.key),
                    prev.backends.clone(),
                    prev.ring.clone(),
                    prev.src_ranges.clone(),
                )
            }
            None => (None, ahash::HashMap::default(), Vec::new(), Vec::new()),
        };

        // backend rows land before anything can point at them
        for (backend_id, row) in &backend_rows {
            if prev_backends.get(backend_id) != Some(row) {
                let bkey = BackendKey {
                    service_id: id,
                    backend_id: *backend_id,
                };
                write_with_retry(|| self.tables.backends.update(bkey, *row)).await?;
            }
        }

        // ring slots: full rebuild, minimal slot writes against the old ring
        let ring = if prev_backends == backend_rows {
            prev_ring.clone()
        } else {
            maglev::build_ring(id, &svc.backends, self.ring_size)
        };
        let mut moved = 0usize;
        for (slot, backend) in ring.iter().enumerate() {
            if prev_ring.get(slot) != Some(backend) {
                let rkey = ring_index(id, self.ring_size, slot as u32);
                write_with_retry(|| self.tables.ring.update(rkey, *backend)).await?;
                moved += 1;
            }
        }
        if moved > 0 {
            debug!(service = id, slots = moved, "rewrote ring slots");
        }

        if prev_ranges != svc.source_ranges {
            self.apply_source_ranges(id, &prev_ranges, &svc.source_ranges)
                .await?;
        }

        // now stale backend rows are unreferenced and safe to drop
        let dropped: Vec<BackendId> = prev_backends
            .keys()
            .filter(|b| !backend_rows.contains_key(b))
            .copied()
            .collect();
        for backend_id in &dropped {
            let bkey = BackendKey {
                service_id: id,
                backend_id: *backend_id,
            };
            write_with_retry(|| self.tables.backends.delete(&bkey)).await?;
        }

        // service row last, so a kernel lookup never sees the service before
        // its ring and backends exist
        write_with_retry(|| self.tables.services.update(key, value)).await?;
        if let Some(prev_key) = prev_key
            && prev_key != key
        {
            write_with_retry(|| self.tables.services.delete(&prev_key)).await?;
        }

        for backend_id in dropped {
            self.purge_affinity(id, backend_id as u32)?;
        }

        self.applied.insert(
            id,
            AppliedService {
                key,
                value,
                backends: backend_rows,
                ring,
                src_ranges: svc.source_ranges.clone(),
            },
        );
        Ok(true)
    }

    /// Teardown runs in the reverse of apply: ring slots first, then backend
    /// rows, then source ranges, then the service row itself.
    async fn remove_service(&mut self, id: ServiceId) -> Result<()> {
        let Some(applied) = self.applied.get(&id) else {
            return Ok(());
        };
        let key = applied.key;
        let slots = applied.ring.len() as u32;
        let backend_ids: Vec<BackendId> = applied.backends.keys().copied().collect();
        let ranges = applied.src_ranges.clone();

        for slot in 0..slots {
            let rkey = ring_index(id, self.ring_size, slot);
            write_with_retry(|| self.tables.ring.delete(&rkey)).await?;
        }
        for backend_id in &backend_ids {
            let bkey = BackendKey {
                service_id: id,
                backend_id: *backend_id,
            };
            write_with_retry(|| self.tables.backends.delete(&bkey)).await?;
        }
        for range in &ranges {
            let rkey = src_range_key(id, range);
            write_with_retry(|| self.tables.src_ranges.delete(&rkey)).await?;
        }
        write_with_retry(|| self.tables.services.delete(&key)).await?;

        // established flows to the dead vip must not keep steering packets
        let purged = conntrack::purge_vip(&mut self.tables.conntrack, key.vip, key.port, key.proto)?;
        if purged > 0 {
            debug!(service = id, purged, "flushed conntrack entries");
        }
        self.purge_affinity(id, BACKEND_NONE)?;
        self.applied.remove(&id);
        Ok(())
    }

    async fn apply_source_ranges(
        &mut self,
        id: ServiceId,
        previous: &[SourceRange],
        desired: &[SourceRange],
    ) -> Result<()> {
        for range in desired {
            if !previous.contains(range) {
                let key = src_range_key(id, range);
                write_with_retry(|| self.tables.src_ranges.update(key, 1)).await?;
            }
        }
        for range in previous {
            if !desired.contains(range) {
                let key = src_range_key(id, range);
                write_with_retry(|| self.tables.src_ranges.delete(&key)).await?;
            }
        }
        Ok(())
    }

    /// Evict affinity entries pinned to a removed backend, or every entry of
    /// a service when `backend_id` is `BACKEND_NONE`.
    fn purge_affinity(&mut self, service_id: ServiceId, backend_id: u32) -> Result<()> {
        let entries = self.tables.affinity.snapshot()?;
        for (key, value) in entries {
            if key.service_id == service_id
                && (backend_id == BACKEND_NONE || value.backend_id == backend_id)
            {
                self.tables.affinity.delete(&key)?;
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn tables(&self) -> &Tables<S, B, R, A, F, C> {
        &self.tables
    }

    #[cfg(test)]
    fn tables_mut(&mut self) -> &mut Tables<S, B, R, A, F, C> {
        &mut self.tables
    }
}

fn service_key(svc: &ServiceSnapshot) -> ServiceKey {
    ServiceKey {
        vip: u32::from(svc.service.vip),
        port: svc.service.port,
        proto: svc.service.protocol as u8,
        _pad: 0,
    }
}

fn service_value(svc: &ServiceSnapshot, backend_count: u16) -> ServiceValue {
    let mut flags = match svc.service.scheduler {
        Scheduler::Maglev => SCHED_MAGLEV,
        Scheduler::RoundRobin => SCHED_ROUND_ROBIN,
    };
    let mut affinity_timeout_s = 0;
    if let Some(policy) = &svc.affinity {
        flags |= SERVICE_FLAG_AFFINITY;
        affinity_timeout_s = policy.timeout.as_secs() as u32;
    }
    if !svc.source_ranges.is_empty() {
        flags |= SERVICE_FLAG_SRC_FILTER;
    }
    ServiceValue {
        id: svc.service.id,
        flags,
        backend_count,
        _pad: 0,
        affinity_timeout_s,
    }
}

fn backend_rows(svc: &ServiceSnapshot) -> ahash::HashMap<BackendId, BackendValue> {
    svc.backends
        .iter()
        .map(|b| {
            let flags = if b.healthy { BACKEND_FLAG_HEALTHY } else { 0 };
            (
                b.id,
                BackendValue {
                    addr: u32::from(b.addr),
                    port: b.port,
                    weight: b.weight,
                    flags,
                },
            )
        })
        .collect()
}

fn src_range_key(service_id: ServiceId, range: &SourceRange) -> (u32, SrcRangeKey) {
    // the service id occupies the first 32 prefix bits; LPM tries compare
    // big-endian, so both halves go in network order
    (
        32 + range.prefix_len as u32,
        SrcRangeKey {
            service_id: (service_id as u32).to_be(),
            addr: u32::from(range.addr).to_be(),
        },
    )
}

/// Retry transient kernel write failures a bounded number of times with a
/// doubling backoff before surfacing the error.
async fn write_with_retry<Op>(mut op: Op) -> Result<()>
where
    Op: FnMut() -> Result<()>,
{
    let mut attempt = 0;
    loop {
        match op() {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt + 1 < WRITE_RETRIES => {
                attempt += 1;
                warn!(%e, attempt, "retrying kernel write");
                tokio::time::sleep(RETRY_BASE_DELAY * (1 << attempt)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Drive the synchronizer from desired-state change notifications and a
/// periodic tick. The synchronizer lives inside this single task, so no two
/// passes ever run concurrently and triggers arriving mid-pass coalesce into
/// the next one.
pub async fn run<S, B, R, A, F, C>(
    mut sync: Synchronizer<S, B, R, A, F, C>,
    store: ServiceStateStore,
    trigger: std::sync::Arc<Notify>,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<()>
where
    S: BpfTable<Key = ServiceKey, Value = ServiceValue>,
    B: BpfTable<Key = BackendKey, Value = BackendValue>,
    R: BpfTable<Key = u32, Value = u32>,
    A: BpfTable<Key = AffinityKey, Value = AffinityValue>,
    F: BpfTable<Key = (u32, SrcRangeKey), Value = u32>,
    C: BpfTable<Key = ConntrackKey, Value = ConntrackValue>,
{
    info!("starting reconcile loop");
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = trigger.notified() => {}
            _ = ticker.tick() => {}
        }
        let snapshot = store.snapshot();
        let report = sync.reconcile(&snapshot, &cancel).await;
        if !report.is_clean() {
            warn!(
                failed = report.failed.len(),
                "reconcile pass left services unapplied; retrying next pass"
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use klb_ebpf_common::Protocol;
    use klb_ebpf_common::conntrack::CT_STATE_ESTABLISHED;

    use crate::state::{AffinityPolicy, Backend, Service};

    use super::*;

    type FakeServices = ahash::HashMap<ServiceKey, ServiceValue>;
    type FakeBackends = ahash::HashMap<BackendKey, BackendValue>;
    type FakeRing = ahash::HashMap<u32, u32>;
    type FakeAffinity = ahash::HashMap<AffinityKey, AffinityValue>;
    type FakeRanges = ahash::HashMap<(u32, SrcRangeKey), u32>;
    type FakeCt = ahash::HashMap<ConntrackKey, ConntrackValue>;

    const M: u32 = maglev::DEFAULT_RING_SIZE;

    fn new_sync()
    -> Synchronizer<FakeServices, FakeBackends, FakeRing, FakeAffinity, FakeRanges, FakeCt> {
        Synchronizer::new(
            Tables {
                services: FakeServices::default(),
                backends: FakeBackends::default(),
                ring: FakeRing::default(),
                affinity: FakeAffinity::default(),
                src_ranges: FakeRanges::default(),
                conntrack: FakeCt::default(),
            },
            M,
        )
    }

    fn store_with_service() -> ServiceStateStore {
        let store = ServiceStateStore::new();
        store
            .upsert_service(Service {
                id: 1,
                vip: Ipv4Addr::new(10, 0, 0, 1),
                port: 80,
                protocol: Protocol::Tcp,
                scheduler: Scheduler::Maglev,
            })
            .unwrap();
        store
    }

    fn backend(id: u16) -> Backend {
        Backend {
            id,
            addr: Ipv4Addr::new(192, 168, 0, id as u8),
            port: 8080,
            weight: 1,
            healthy: true,
        }
    }

    fn ring_counts(ring: &FakeRing, service_id: ServiceId) -> ahash::HashMap<u32, usize> {
        let mut counts: ahash::HashMap<u32, usize> = ahash::HashMap::default();
        for slot in 0..M {
            let backend = ring
                .get(&ring_index(service_id, M, slot))
                .copied()
                .unwrap_or(BACKEND_NONE);
            *counts.entry(backend).or_insert(0) += 1;
        }
        counts
    }

    #[tokio::test]
    async fn end_to_end_two_backends_then_one() {
        let store = store_with_service();
        store.upsert_backend(1, backend(1)).unwrap();
        store.upsert_backend(1, backend(2)).unwrap();

        let mut sync = new_sync();
        let cancel = CancellationToken::new();
        let report = sync.reconcile(&store.snapshot(), &cancel).await;
        assert!(report.is_clean());
        assert_eq!(report.applied, vec![1]);

        let counts = ring_counts(&sync.tables().ring, 1);
        let one = counts.get(&1).copied().unwrap_or(0);
        let two = counts.get(&2).copied().unwrap_or(0);
        assert_eq!(one + two, M as usize);
        let half = M as f64 / 2.0;
        assert!((one as f64 - half).abs() / half < 0.01, "split {one}/{two}");

        store.remove_backend(1, 2, false).unwrap();
        let report = sync.reconcile(&store.snapshot(), &cancel).await;
        assert!(report.is_clean());

        let counts = ring_counts(&sync.tables().ring, 1);
        assert_eq!(counts.get(&1).copied().unwrap_or(0), M as usize);
        // the stale backend row is gone too
        assert!(
            sync.tables()
                .backends
                .lookup(&BackendKey {
                    service_id: 1,
                    backend_id: 2
                })
                .is_err()
        );
    }

    #[tokio::test]
    async fn service_removal_clears_every_row() {
        let store = store_with_service();
        store.upsert_backend(1, backend(1)).unwrap();
        store
            .set_source_ranges(
                1,
                vec![SourceRange {
                    addr: Ipv4Addr::new(10, 1, 0, 0),
                    prefix_len: 16,
                }],
            )
            .unwrap();

        let mut sync = new_sync();
        let cancel = CancellationToken::new();
        sync.reconcile(&store.snapshot(), &cancel).await;
        assert!(!sync.tables().services.is_empty());
        assert!(!sync.tables().ring.is_empty());
        assert!(!sync.tables().src_ranges.is_empty());

        store.remove_service(1).unwrap();
        let report = sync.reconcile(&store.snapshot(), &cancel).await;
        assert!(report.is_clean());
        assert_eq!(report.removed, vec![1]);
        assert!(sync.tables().services.is_empty());
        assert!(sync.tables().backends.is_empty());
        assert!(sync.tables().ring.is_empty());
        assert!(sync.tables().src_ranges.is_empty());
    }

    #[tokio::test]
    async fn service_removal_flushes_its_conntrack_entries() {
        let store = store_with_service();
        store.upsert_backend(1, backend(1)).unwrap();

        let mut sync = new_sync();
        let cancel = CancellationToken::new();
        sync.reconcile(&store.snapshot(), &cancel).await;

        // flows the datapath established: one to the service vip, one not
        let stale = ct_key(Ipv4Addr::new(10, 0, 0, 1), 80);
        let unrelated = ct_key(Ipv4Addr::new(10, 0, 0, 8), 80);
        sync.tables_mut().conntrack.update(stale, ct_value()).unwrap();
        sync.tables_mut()
            .conntrack
            .update(unrelated, ct_value())
            .unwrap();

        store.remove_service(1).unwrap();
        let report = sync.reconcile(&store.snapshot(), &cancel).await;
        assert!(report.is_clean());
        assert_eq!(report.removed, vec![1]);

        // only the removed service's flows were flushed
        assert!(sync.tables().conntrack.lookup(&stale).is_err());
        assert!(sync.tables().conntrack.lookup(&unrelated).is_ok());
    }

    fn ct_key(dst: Ipv4Addr, dst_port: u16) -> ConntrackKey {
        ConntrackKey {
            src_ip: u32::from(Ipv4Addr::new(10, 9, 0, 2)),
            dst_ip: u32::from(dst),
            src_port: 40000,
            dst_port,
            proto: Protocol::Tcp as u8,
            _pad: [0; 3],
        }
    }

    fn ct_value() -> ConntrackValue {
        ConntrackValue {
            state: CT_STATE_ESTABLISHED,
            flags: 0,
            backend_id: 1,
            _reserved: 0,
            created_ns: 0,
            last_seen_ns: 0,
            tx_packets: 1,
            tx_bytes: 64,
            rx_packets: 1,
            rx_bytes: 64,
        }
    }

    #[tokio::test]
    async fn unchanged_service_is_not_rewritten() {
        let store = store_with_service();
        store.upsert_backend(1, backend(1)).unwrap();

        let mut sync = new_sync();
        let cancel = CancellationToken::new();
        let first = sync.reconcile(&store.snapshot(), &cancel).await;
        assert_eq!(first.applied, vec![1]);
        let second = sync.reconcile(&store.snapshot(), &cancel).await;
        assert!(second.applied.is_empty());
        assert!(second.is_clean());
    }

    #[tokio::test]
    async fn failure_on_one_service_leaves_the_other_applied() {
        let store = store_with_service();
        store.upsert_backend(1, backend(1)).unwrap();
        store
            .upsert_service(Service {
                id: 2,
                vip: Ipv4Addr::new(10, 0, 0, 2),
                port: 80,
                protocol: Protocol::Tcp,
                scheduler: Scheduler::Maglev,
            })
            .unwrap();
        store.upsert_backend(2, backend(3)).unwrap();

        let fail_key = ServiceKey {
            vip: u32::from(Ipv4Addr::new(10, 0, 0, 2)),
            port: 80,
            proto: Protocol::Tcp as u8,
            _pad: 0,
        };
        let mut sync = Synchronizer::new(
            Tables {
                services: FailOn {
                    inner: FakeServices::default(),
                    fail_key,
                },
                backends: FakeBackends::default(),
                ring: FakeRing::default(),
                affinity: FakeAffinity::default(),
                src_ranges: FakeRanges::default(),
                conntrack: FakeCt::default(),
            },
            M,
        );
        let cancel = CancellationToken::new();
        let report = sync.reconcile(&store.snapshot(), &cancel).await;

        assert_eq!(report.applied, vec![1]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, 2);
        // service 1's row is intact and correct
        let key = ServiceKey {
            vip: u32::from(Ipv4Addr::new(10, 0, 0, 1)),
            port: 80,
            proto: Protocol::Tcp as u8,
            _pad: 0,
        };
        let row = sync.tables().services.lookup(&key).unwrap();
        assert_eq!(row.id, 1);
        assert_eq!(row.backend_count, 1);
    }

    #[tokio::test]
    async fn transient_write_errors_are_retried() {
        let store = store_with_service();
        store.upsert_backend(1, backend(1)).unwrap();

        let mut sync = Synchronizer::new(
            Tables {
                services: Flaky {
                    inner: FakeServices::default(),
                    failures_left: 2,
                },
                backends: FakeBackends::default(),
                ring: FakeRing::default(),
                affinity: FakeAffinity::default(),
                src_ranges: FakeRanges::default(),
                conntrack: FakeCt::default(),
            },
            M,
        );
        let cancel = CancellationToken::new();
        let report = sync.reconcile(&store.snapshot(), &cancel).await;
        assert!(report.is_clean(), "failed: {:?}", report.failed);
        assert_eq!(report.applied, vec![1]);
    }

    #[tokio::test]
    async fn affinity_entries_follow_their_backend_out() {
        let store = store_with_service();
        store.upsert_backend(1, backend(1)).unwrap();
        store.upsert_backend(1, backend(2)).unwrap();
        store
            .set_affinity_policy(
                1,
                Some(AffinityPolicy {
                    timeout: Duration::from_secs(60),
                }),
            )
            .unwrap();

        let mut sync = new_sync();
        let cancel = CancellationToken::new();
        sync.reconcile(&store.snapshot(), &cancel).await;

        // the datapath pinned two clients, one per backend
        sync.tables_mut()
            .affinity
            .update(
                AffinityKey {
                    client_ip: u32::from(Ipv4Addr::new(10, 0, 0, 99)),
                    service_id: 1,
                    _pad: 0,
                },
                AffinityValue {
                    backend_id: 1,
                    _pad: 0,
                    expires_at_ns: u64::MAX,
                },
            )
            .unwrap();
        sync.tables_mut()
            .affinity
            .update(
                AffinityKey {
                    client_ip: u32::from(Ipv4Addr::new(10, 0, 0, 100)),
                    service_id: 1,
                    _pad: 0,
                },
                AffinityValue {
                    backend_id: 2,
                    _pad: 0,
                    expires_at_ns: u64::MAX,
                },
            )
            .unwrap();

        store.remove_backend(1, 2, false).unwrap();
        sync.reconcile(&store.snapshot(), &cancel).await;

        let left = sync.tables().affinity.snapshot().unwrap();
        assert_eq!(left.len(), 1);
        assert!(left.values().all(|v| v.backend_id == 1));
    }

    #[tokio::test]
    async fn vip_change_drops_the_old_lookup_row() {
        let store = store_with_service();
        store.upsert_backend(1, backend(1)).unwrap();

        let mut sync = new_sync();
        let cancel = CancellationToken::new();
        sync.reconcile(&store.snapshot(), &cancel).await;

        store
            .upsert_service(Service {
                id: 1,
                vip: Ipv4Addr::new(10, 0, 0, 9),
                port: 80,
                protocol: Protocol::Tcp,
                scheduler: Scheduler::Maglev,
            })
            .unwrap();
        store.upsert_backend(1, backend(1)).unwrap();
        sync.reconcile(&store.snapshot(), &cancel).await;

        let old_key = ServiceKey {
            vip: u32::from(Ipv4Addr::new(10, 0, 0, 1)),
            port: 80,
            proto: Protocol::Tcp as u8,
            _pad: 0,
        };
        let new_key = ServiceKey {
            vip: u32::from(Ipv4Addr::new(10, 0, 0, 9)),
            port: 80,
            proto: Protocol::Tcp as u8,
            _pad: 0,
        };
        assert!(sync.tables().services.lookup(&old_key).is_err());
        assert!(sync.tables().services.lookup(&new_key).is_ok());
    }

    struct FailOn<M: BpfTable> {
        inner: M,
        fail_key: M::Key,
    }

    impl<M: BpfTable> BpfTable for FailOn<M>
    where
        M::Key: PartialEq,
    {
        type Key = M::Key;
        type Value = M::Value;
        fn update(&mut self, key: Self::Key, value: Self::Value) -> Result<()> {
            if key == self.fail_key {
                return Err(Error::Ebpf("injected write failure".into()));
            }
            self.inner.update(key, value)
        }
        fn delete(&mut self, key: &Self::Key) -> Result<()> {
            self.inner.delete(key)
        }
        fn lookup(&self, key: &Self::Key) -> Result<Self::Value> {
            self.inner.lookup(key)
        }
        fn snapshot(&self) -> Result<ahash::HashMap<Self::Key, Self::Value>> {
            self.inner.snapshot()
        }
    }

    struct Flaky<M> {
        inner: M,
        failures_left: u32,
    }

    impl<M: BpfTable> BpfTable for Flaky<M> {
        type Key = M::Key;
        type Value = M::Value;
        fn update(&mut self, key: Self::Key, value: Self::Value) -> Result<()> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(Error::Transient("resource temporarily unavailable".into()));
            }
            self.inner.update(key, value)
        }
        fn delete(&mut self, key: &Self::Key) -> Result<()> {
            self.inner.delete(key)
        }
        fn lookup(&self, key: &Self::Key) -> Result<Self::Value> {
            self.inner.lookup(key)
        }
        fn snapshot(&self) -> Result<ahash::HashMap<Self::Key, Self::Value>> {
            self.inner.snapshot()
        }
    }
}
