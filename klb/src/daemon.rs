use std::sync::Arc;
use std::time::Duration;

use aya::maps::MapData;
use aya::maps::lpm_trie::LpmTrie;
use klb_ebpf_common::conntrack::{ConntrackKey, ConntrackValue};
use klb_ebpf_common::neigh::{ArpKey, ArpValue, MacValue, RouteValue};
use klb_ebpf_common::service::{
    AffinityKey, AffinityValue, BackendKey, BackendValue, ServiceKey, ServiceValue, SrcRangeKey,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::api::Controller;
use crate::config::DaemonArgs;
use crate::loader::{ConfigHash, ObjectLoader, TemplateCache, ensure_datapath};
use crate::maps::bpf::PinnedBackend;
use crate::maps::registry::MapRegistry;
use crate::maps::spec;
use crate::net::NetTables;
use crate::state::ServiceStateStore;
use crate::sync::{Synchronizer, Tables};
use crate::{Error, Result, affinity, conntrack, maglev, sync};

type AyaHash<K, V> = aya::maps::HashMap<MapData, K, V>;

/// Bring every required table up, wire the reconcile loop and the janitors,
/// and run until cancelled. Any table that cannot be opened or created is
/// fatal: a datapath without its full table set must not serve.
pub async fn start(args: DaemonArgs, cancel: CancellationToken) -> Result<()> {
    maglev::validate_ring_size(args.ring_size)?;
    let ring_spec = spec::ch_rings(args.ring_size).ok_or_else(|| {
        Error::InvalidInput(format!(
            "ring size {} overflows the ring table",
            args.ring_size
        ))
    })?;

    let loader = ObjectLoader::new(args.datapath_object.clone(), args.bpf_fs.clone());
    let templates = Arc::new(TemplateCache::new(loader, args.cache_bound()));
    // the ring size is the only parameter the template is specialized on
    let config = ConfigHash(args.ring_size as u64);
    let backend = PinnedBackend::new(
        args.bpf_fs.clone(),
        ensure_datapath(templates.clone(), config),
    );
    let registry = MapRegistry::new(backend);

    // the ring table's geometry follows the configured ring size
    for table in spec::REQUIRED {
        if table.name == spec::CH_RINGS.name {
            registry.open_or_create(&ring_spec)?;
        } else {
            registry.open_or_create(table)?;
        }
    }
    info!("all kernel tables attached");

    let services = registry.open_or_create(&spec::SERVICES)?;
    let backends = registry.open_or_create(&spec::BACKENDS)?;
    let ring = registry.open_or_create(&ring_spec)?;
    let ct = registry.open_or_create(&spec::CONNTRACK)?;
    let arp = registry.open_or_create(&spec::ARP)?;
    let routes = registry.open_or_create(&spec::ROUTES)?;
    let src_ranges = registry.open_or_create(&spec::SRC_RANGES)?;
    let affinity_pin = registry.open_or_create(&spec::AFFINITY)?;
    let macs = registry.open_or_create(&spec::MACS)?;

    let store = ServiceStateStore::new();
    let trigger = Arc::new(Notify::new());

    let synchronizer = Synchronizer::new(
        Tables {
            services: services.hash_map::<ServiceKey, ServiceValue>()?,
            backends: backends.hash_map::<BackendKey, BackendValue>()?,
            ring: ring.hash_map::<u32, u32>()?,
            affinity: affinity_pin.hash_map::<AffinityKey, AffinityValue>()?,
            src_ranges: src_ranges.lpm_trie::<SrcRangeKey, u32>()?,
            // the janitor task keeps its own view; pins reopen per caller
            conntrack: ct.hash_map::<ConntrackKey, ConntrackValue>()?,
        },
        args.ring_size,
    );

    // the control surface a transport would mount; held for the daemon's
    // lifetime
    let _controller: Controller<
        AyaHash<ArpKey, ArpValue>,
        LpmTrie<MapData, u32, RouteValue>,
        AyaHash<u32, MacValue>,
    > = Controller::new(
        store.clone(),
        trigger.clone(),
        NetTables {
            arp: arp.hash_map()?,
            routes: routes.lpm_trie()?,
            macs: macs.hash_map()?,
        },
    );

    let timeouts = conntrack::Timeouts {
        tcp: Duration::from_secs(args.conntrack_tcp_timeout_s),
        udp: Duration::from_secs(args.conntrack_udp_timeout_s),
        sctp: Duration::from_secs(args.conntrack_sctp_timeout_s),
    };

    let sync_handle = tokio::spawn(sync::run(
        synchronizer,
        store.clone(),
        trigger.clone(),
        Duration::from_secs(args.reconcile_interval_s),
        cancel.child_token(),
    ));
    let ct_handle = tokio::spawn(conntrack::run(
        ct.hash_map::<ConntrackKey, ConntrackValue>()?,
        timeouts,
        Duration::from_secs(args.conntrack_sweep_interval_s),
        cancel.child_token(),
    ));
    let affinity_handle = tokio::spawn(affinity::run(
        affinity_pin.hash_map::<AffinityKey, AffinityValue>()?,
        Duration::from_secs(args.affinity_sweep_interval_s),
        cancel.child_token(),
    ));

    let (sync_out, ct_out, affinity_out) = tokio::join!(sync_handle, ct_handle, affinity_handle);
    for (task, out) in [
        ("sync", sync_out),
        ("conntrack", ct_out),
        ("affinity", affinity_out),
    ] {
        match out {
            Ok(Ok(())) => info!("{task} exited"),
            Ok(Err(e)) => error!("{task} failed with error: {e}"),
            Err(e) => error!("{task} task failed to complete: {e}"),
        }
    }
    Ok(())
}
