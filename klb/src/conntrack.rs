use std::time::Duration;

use klb_ebpf_common::Protocol;
use klb_ebpf_common::conntrack::{ConntrackKey, ConntrackValue};
use nix::time::{ClockId, clock_gettime};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::Result;
use crate::maps::BpfTable;

/// Per-protocol idle timeouts for kernel-originated conntrack entries. The
/// control plane only observes and clears this table; the datapath writes it.
#[derive(Clone, Copy, Debug)]
pub struct Timeouts {
    pub tcp: Duration,
    pub udp: Duration,
    pub sctp: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            tcp: Duration::from_secs(60 * 60 * 12),
            udp: Duration::from_secs(60),
            sctp: Duration::from_secs(60),
        }
    }
}

impl Timeouts {
    fn for_proto(&self, proto: u8) -> u64 {
        let timeout = match Protocol::try_from(proto) {
            Ok(Protocol::Tcp) => self.tcp,
            Ok(Protocol::Udp) => self.udp,
            Ok(Protocol::Sctp) => self.sctp,
            Err(_) => self.udp,
        };
        timeout.as_nanos() as u64
    }
}

/// Remove entries idle past their protocol's timeout. Returns how many were
/// evicted.
pub fn sweep<M>(table: &mut M, timeouts: &Timeouts, now_ns: u64) -> Result<usize>
where
    M: BpfTable<Key = ConntrackKey, Value = ConntrackValue>,
{
    let mut expired = Vec::new();
    for (key, value) in table.snapshot()? {
        if now_ns.saturating_sub(value.last_seen_ns) > timeouts.for_proto(key.proto) {
            expired.push(key);
        }
    }
    let evicted = expired.len();
    for key in expired {
        table.delete(&key)?;
    }
    Ok(evicted)
}

/// Drop every entry addressed to a removed service, so old flows cannot keep
/// steering to backends the service no longer owns.
pub fn purge_vip<M>(table: &mut M, vip: u32, port: u16, proto: u8) -> Result<usize>
where
    M: BpfTable<Key = ConntrackKey, Value = ConntrackValue>,
{
    let mut stale = Vec::new();
    for (key, _) in table.snapshot()? {
        if key.dst_ip == vip && key.dst_port == port && key.proto == proto {
            stale.push(key);
        }
    }
    let purged = stale.len();
    for key in stale {
        table.delete(&key)?;
    }
    Ok(purged)
}

pub async fn run<M>(
    mut table: M,
    timeouts: Timeouts,
    sweep_interval: Duration,
    cancel: CancellationToken,
) -> Result<()>
where
    M: BpfTable<Key = ConntrackKey, Value = ConntrackValue>,
{
    info!("starting conntrack cleanup task");
    let mut ticker = interval(sweep_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match monotonic_ns().and_then(|now| sweep(&mut table, &timeouts, now)) {
                    Ok(evicted) if evicted > 0 => debug!(evicted, "swept conntrack entries"),
                    Ok(_) => {}
                    Err(e) => error!(%e, "error cleaning up conntrack"),
                }
            }
        }
    }
    Ok(())
}

/// The datapath stamps entries with CLOCK_MONOTONIC (bpf_ktime_get_ns), so
/// expiry comparisons have to use the same clock.
pub(crate) fn monotonic_ns() -> Result<u64> {
    let ts = clock_gettime(ClockId::CLOCK_MONOTONIC)?;
    Ok((ts.tv_sec() as u64).saturating_mul(1_000_000_000) + ts.tv_nsec() as u64)
}

#[cfg(test)]
mod test {
    use klb_ebpf_common::conntrack::CT_STATE_ESTABLISHED;

    use super::*;

    type FakeConntrack = ahash::HashMap<ConntrackKey, ConntrackValue>;

    fn key(src_port: u16, proto: Protocol) -> ConntrackKey {
        ConntrackKey {
            src_ip: 0x0a000002,
            dst_ip: 0x0a000001,
            src_port,
            dst_port: 80,
            proto: proto as u8,
            _pad: [0; 3],
        }
    }

    fn value(last_seen_ns: u64) -> ConntrackValue {
        ConntrackValue {
            state: CT_STATE_ESTABLISHED,
            flags: 0,
            backend_id: 1,
            _reserved: 0,
            created_ns: 0,
            last_seen_ns,
            tx_packets: 1,
            tx_bytes: 64,
            rx_packets: 1,
            rx_bytes: 64,
        }
    }

    #[test]
    fn sweep_respects_per_protocol_timeouts() {
        let timeouts = Timeouts::default();
        let now = 24 * 60 * 60 * 1_000_000_000u64;
        let udp_ns = timeouts.udp.as_nanos() as u64;

        let mut table = FakeConntrack::default();
        // idle past the udp timeout but well inside the tcp one
        let idle = now - 2 * udp_ns;
        table.update(key(1000, Protocol::Udp), value(idle)).unwrap();
        table.update(key(1001, Protocol::Tcp), value(idle)).unwrap();
        // fresh udp entry stays
        table.update(key(1002, Protocol::Udp), value(now)).unwrap();

        let evicted = sweep(&mut table, &timeouts, now).unwrap();
        assert_eq!(evicted, 1);
        assert!(table.lookup(&key(1000, Protocol::Udp)).is_err());
        assert!(table.lookup(&key(1001, Protocol::Tcp)).is_ok());
        assert!(table.lookup(&key(1002, Protocol::Udp)).is_ok());
    }

    #[test]
    fn purge_vip_only_touches_the_named_service() {
        let mut table = FakeConntrack::default();
        table.update(key(1000, Protocol::Tcp), value(0)).unwrap();
        let mut other = key(1001, Protocol::Tcp);
        other.dst_ip = 0x0a000009;
        table.update(other, value(0)).unwrap();

        let purged = purge_vip(&mut table, 0x0a000001, 80, Protocol::Tcp as u8).unwrap();
        assert_eq!(purged, 1);
        assert!(table.lookup(&key(1000, Protocol::Tcp)).is_err());
        assert!(table.lookup(&other).is_ok());
    }
}
