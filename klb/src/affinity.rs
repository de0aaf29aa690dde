use std::time::Duration;

use klb_ebpf_common::ServiceId;
use klb_ebpf_common::service::{AffinityKey, AffinityValue};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::Result;
use crate::conntrack::monotonic_ns;
use crate::maps::BpfTable;

/// Evict affinity entries whose deadline has passed. The datapath refreshes
/// `expires_at_ns` on every hit, so anything past it is a dead session.
pub fn sweep<M>(table: &mut M, now_ns: u64) -> Result<usize>
where
    M: BpfTable<Key = AffinityKey, Value = AffinityValue>,
{
    let mut expired = Vec::new();
    for (key, value) in table.snapshot()? {
        if value.expires_at_ns <= now_ns {
            expired.push(key);
        }
    }
    let evicted = expired.len();
    for key in expired {
        table.delete(&key)?;
    }
    Ok(evicted)
}

/// Drop every pinned session of one service/backend pair. Called when a
/// backend leaves a service so clients re-hash instead of chasing it.
pub fn purge_backend<M>(table: &mut M, service_id: ServiceId, backend_id: u32) -> Result<usize>
where
    M: BpfTable<Key = AffinityKey, Value = AffinityValue>,
{
    let mut stale = Vec::new();
    for (key, value) in table.snapshot()? {
        if key.service_id == service_id && value.backend_id == backend_id {
            stale.push(key);
        }
    }
    let purged = stale.len();
    for key in stale {
        table.delete(&key)?;
    }
    Ok(purged)
}

pub async fn run<M>(mut table: M, sweep_interval: Duration, cancel: CancellationToken) -> Result<()>
where
    M: BpfTable<Key = AffinityKey, Value = AffinityValue>,
{
    info!("starting affinity cleanup task");
    let mut ticker = interval(sweep_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match monotonic_ns().and_then(|now| sweep(&mut table, now)) {
                    Ok(evicted) if evicted > 0 => debug!(evicted, "swept affinity entries"),
                    Ok(_) => {}
                    Err(e) => error!(%e, "error cleaning up affinity"),
                }
            }
        }
    }
    Ok(())
}
