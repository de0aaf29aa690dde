use klb_ebpf_common::{BACKEND_NONE, ServiceId};

use crate::state::Backend;
use crate::{Error, Result};

/// Default ring size. Prime, per maglev.
pub const DEFAULT_RING_SIZE: u32 = crate::maps::spec::DEFAULT_RING_SIZE;

// Fixed seeds: the ring must be a pure function of the backend identities,
// stable across processes, so the permutations cannot use per-process
// hasher randomness.
const OFFSET_SEEDS: (u64, u64, u64, u64) = (
    0x9e37_79b9_7f4a_7c15,
    0xf39c_c060_5ced_c834,
    0x1082_276b_f3a2_7251,
    0x7109_87c8_ccb3_91ab,
);
const SKIP_SEEDS: (u64, u64, u64, u64) = (
    0x2545_f491_4f6c_dd1d,
    0x9c6e_6b1b_6d54_7a21,
    0xd1b5_4a32_d192_ed03,
    0x8f6e_4b3a_0aa9_4f52,
);

/// The fill loop below steps through slots with `offset + next * skip`
/// modulo the ring size; only a prime ring size guarantees every skip
/// visits every slot, and sizes below 3 break the `skip` range. Reject
/// anything else up front instead of hanging or dividing by zero mid-fill.
pub fn validate_ring_size(ring_size: u32) -> Result<()> {
    if ring_size < 3 || !is_prime(ring_size) {
        return Err(Error::InvalidInput(format!(
            "ring size {ring_size} must be a prime of at least 3"
        )));
    }
    Ok(())
}

fn is_prime(n: u32) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut d = 3u64;
    let n = n as u64;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}

struct Cursor {
    id: u32,
    weight: u32,
    offset: u64,
    skip: u64,
    next: u64,
}

/// Build the consistent-hash ring for one service: `ring[slot]` is the
/// backend id serving that hash bucket, `BACKEND_NONE` when no backend is
/// eligible.
///
/// Pure function of `(service_id, backend identities, ring_size)`: input
/// ordering does not matter, ties go to the lower backend id, and rebuilding
/// with one backend removed leaves slots owned by the survivors in place
/// except for the O(M/N) share the removed backend held.
pub fn build_ring(service_id: ServiceId, backends: &[Backend], ring_size: u32) -> Vec<u32> {
    let m = ring_size as u64;
    let mut ring = vec![BACKEND_NONE; ring_size as usize];

    let mut eligible: Vec<&Backend> = backends
        .iter()
        .filter(|b| b.healthy && b.weight > 0)
        .collect();
    eligible.sort_by_key(|b| b.id);
    eligible.dedup_by_key(|b| b.id);
    if eligible.is_empty() {
        return ring;
    }

    let offset_hasher = ahash::RandomState::with_seeds(
        OFFSET_SEEDS.0,
        OFFSET_SEEDS.1,
        OFFSET_SEEDS.2,
        OFFSET_SEEDS.3,
    );
    let skip_hasher =
        ahash::RandomState::with_seeds(SKIP_SEEDS.0, SKIP_SEEDS.1, SKIP_SEEDS.2, SKIP_SEEDS.3);

    let mut cursors: Vec<Cursor> = eligible
        .iter()
        .map(|b| {
            let identity = (service_id, b.id, u32::from(b.addr), b.port);
            Cursor {
                id: b.id as u32,
                weight: b.weight as u32,
                offset: offset_hasher.hash_one(identity) % m,
                skip: skip_hasher.hash_one(identity) % (m - 1) + 1,
                next: 0,
            }
        })
        .collect();

    let mut filled = 0usize;
    let total = ring_size as usize;
    'fill: loop {
        for cursor in cursors.iter_mut() {
            // a backend claims `weight` slots per round
            for _ in 0..cursor.weight {
                loop {
                    let slot = ((cursor.offset + cursor.next * cursor.skip) % m) as usize;
                    cursor.next += 1;
                    if ring[slot] == BACKEND_NONE {
                        ring[slot] = cursor.id;
                        filled += 1;
                        break;
                    }
                }
                if filled == total {
                    break 'fill;
                }
            }
        }
    }
    ring
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use super::*;

    const M: u32 = DEFAULT_RING_SIZE;

    fn backend(id: u16) -> Backend {
        Backend {
            id,
            addr: Ipv4Addr::new(192, 168, 1, id as u8),
            port: 8080,
            weight: 1,
            healthy: true,
        }
    }

    #[test]
    fn ring_size_must_be_an_odd_prime() {
        assert!(matches!(
            validate_ring_size(1),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            validate_ring_size(2),
            Err(Error::InvalidInput(_))
        ));
        // 65536 = 2^16, a skip of 2 would only ever visit even slots
        assert!(matches!(
            validate_ring_size(65536),
            Err(Error::InvalidInput(_))
        ));
        validate_ring_size(7).unwrap();
        validate_ring_size(DEFAULT_RING_SIZE).unwrap();
    }

    #[test]
    fn rebuild_is_deterministic_regardless_of_input_order() {
        let forward: Vec<Backend> = (1..=10).map(backend).collect();
        let mut reversed = forward.clone();
        reversed.reverse();

        let a = build_ring(1, &forward, M);
        let b = build_ring(1, &reversed, M);
        assert_eq!(a, b);
        // and stable across repeated rebuilds
        assert_eq!(a, build_ring(1, &forward, M));
    }

    #[test]
    fn two_equal_backends_split_the_ring_evenly() {
        let backends = vec![backend(1), backend(2)];
        let ring = build_ring(1, &backends, M);
        let one = ring.iter().filter(|&&s| s == 1).count();
        let two = ring.iter().filter(|&&s| s == 2).count();
        assert_eq!(one + two, M as usize);
        let half = M as f64 / 2.0;
        assert!((one as f64 - half).abs() / half < 0.01, "split {one}/{two}");
    }

    #[test]
    fn removing_one_backend_disrupts_a_bounded_share_of_slots() {
        let n = 10usize;
        let backends: Vec<Backend> = (1..=n as u16).map(backend).collect();
        let before = build_ring(1, &backends, M);

        let survivors: Vec<Backend> = backends[..n - 1].to_vec();
        let after = build_ring(1, &survivors, M);

        let removed_id = n as u32;
        let mut moved = 0usize;
        for (slot, old) in before.iter().enumerate() {
            if *old != removed_id && after[slot] != *old {
                moved += 1;
            }
        }
        let bound = 3 * M as usize / n;
        assert!(moved < bound, "{moved} unaffected slots moved, bound {bound}");
        // every slot the removed backend held was reassigned to a survivor
        assert!(after.iter().all(|&s| s != removed_id && s != BACKEND_NONE));
    }

    #[test]
    fn weight_skews_slot_ownership() {
        let mut heavy = backend(1);
        heavy.weight = 3;
        let backends = vec![heavy, backend(2)];
        let ring = build_ring(1, &backends, M);
        let one = ring.iter().filter(|&&s| s == 1).count();
        let two = ring.iter().filter(|&&s| s == 2).count();
        assert!(one > two * 2, "weight 3 vs 1 got {one}/{two}");
    }

    #[test]
    fn unhealthy_and_zero_weight_backends_get_no_slots() {
        let mut down = backend(2);
        down.healthy = false;
        let mut drained = backend(3);
        drained.weight = 0;
        let ring = build_ring(1, &[backend(1), down, drained], M);
        assert!(ring.iter().all(|&s| s == 1));
    }

    #[test]
    fn empty_backend_set_yields_sentinel_ring() {
        let ring = build_ring(1, &[], M);
        assert_eq!(ring.len(), M as usize);
        assert!(ring.iter().all(|&s| s == BACKEND_NONE));
    }
}
