//! RFC 2782 weighted selection
//!
//! Candidates are grouped by ascending priority. Within a group each pass
//! draws one enabled candidate with probability proportional to its weight,
//! disables it and removes it from the pool, until the group is empty:
//!
//! ```text
//! group (priority 0):  [w=0 a] [w=10 b] [w=30 c]
//! running sums:            0        10       40
//! draw r in [0, 40]:   r=0 -> a   r=1..10 -> b   r=11..40 -> c
//! ```
//!
//! Zero-weight candidates are moved to the front of the group before the
//! running sums are computed, so they are picked only when the draw is 0.
//! When every weight in a group is zero each candidate counts as weight 1,
//! giving a uniform random order.

use std::collections::BTreeMap;

use rand::Rng;

use super::records::SrvCandidate;

/// Order `candidates` into a full weighted permutation
///
/// Disabled candidates are skipped; every enabled one appears exactly once
/// and leaves the call disabled. Lower priority groups always come first.
pub fn order_candidates<R: Rng + ?Sized>(candidates: &mut [SrvCandidate], rng: &mut R) -> Vec<SrvCandidate> {
    let mut groups: BTreeMap<u16, Vec<usize>> = BTreeMap::new();
    for (index, candidate) in candidates.iter().enumerate() {
        if candidate.enabled {
            groups.entry(candidate.priority).or_default().push(index);
        }
    }

    let mut ordered = Vec::with_capacity(candidates.len());
    for (_, mut pool) in groups {
        // Stable sort keeps the answer order among equal weights
        pool.sort_by_key(|&index| candidates[index].weight != 0);
        while !pool.is_empty() {
            let picked = select_one(candidates, &mut pool, rng);
            ordered.push(candidates[picked].clone());
        }
    }
    ordered
}

/// Draw one candidate from `pool`, disable it and remove it from the pool
fn select_one<R: Rng + ?Sized>(candidates: &mut [SrvCandidate], pool: &mut Vec<usize>, rng: &mut R) -> usize {
    let all_zero = pool.iter().all(|&index| candidates[index].weight == 0);

    let mut sum: u32 = 0;
    for &index in pool.iter() {
        let weight = if all_zero { 1 } else { u32::from(candidates[index].weight) };
        sum += weight;
        candidates[index].running_sum = sum;
    }

    // With all-zero weights the sums start at 1, so draw from [1, sum]
    let draw = if all_zero {
        rng.gen_range(1..=sum)
    } else {
        rng.gen_range(0..=sum)
    };

    let position = pool
        .iter()
        .position(|&index| candidates[index].running_sum >= draw)
        .unwrap_or(pool.len() - 1);

    let picked = pool.remove(position);
    candidates[picked].enabled = false;
    picked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn candidate(priority: u16, weight: u16, host: &str) -> SrvCandidate {
        SrvCandidate::new(priority, weight, host, 5060, Transport::Udp)
    }

    fn hosts(ordered: &[SrvCandidate]) -> Vec<String> {
        ordered.iter().map(|c| c.host.clone()).collect()
    }

    #[test]
    fn test_full_permutation_with_priority_order() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let mut candidates = vec![
                candidate(20, 5, "d"),
                candidate(10, 60, "a"),
                candidate(10, 40, "b"),
                candidate(10, 0, "c"),
                candidate(20, 95, "e"),
                candidate(30, 0, "f"),
            ];
            let ordered = order_candidates(&mut candidates, &mut rng);

            assert_eq!(ordered.len(), 6);
            let mut seen = hosts(&ordered);
            seen.sort();
            assert_eq!(seen, vec!["a", "b", "c", "d", "e", "f"]);
            assert!(ordered.windows(2).all(|w| w[0].priority <= w[1].priority));
            assert!(candidates.iter().all(|c| !c.enabled));
        }
    }

    #[test]
    fn test_disabled_candidates_skipped() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut candidates = vec![candidate(0, 10, "a"), candidate(0, 10, "b")];
        candidates[0].enabled = false;
        let ordered = order_candidates(&mut candidates, &mut rng);
        assert_eq!(hosts(&ordered), vec!["b"]);
    }

    #[test]
    fn test_all_zero_weights_uniform() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut first_counts = [0usize; 3];
        for _ in 0..3000 {
            let mut candidates = vec![candidate(0, 0, "a"), candidate(0, 0, "b"), candidate(0, 0, "c")];
            let ordered = order_candidates(&mut candidates, &mut rng);
            assert_eq!(ordered.len(), 3);
            let index = (ordered[0].host.as_bytes()[0] - b'a') as usize;
            first_counts[index] += 1;
        }
        for count in first_counts {
            assert!(count > 800, "zero-weight candidate rarely first: {:?}", first_counts);
        }
    }

    #[test]
    fn test_zero_weight_rarely_first_against_heavy_weight() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut zero_first = 0;
        for _ in 0..1000 {
            let mut candidates = vec![candidate(0, 0, "a"), candidate(0, 100, "b")];
            let ordered = order_candidates(&mut candidates, &mut rng);
            assert_eq!(ordered.len(), 2);
            if ordered[0].host == "a" {
                zero_first += 1;
            }
        }
        // Draw of exactly 0 out of [0, 100]
        assert!(zero_first < 50, "zero-weight chosen first {} times", zero_first);
    }

    #[test]
    fn test_weights_bias_selection() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut heavy_first = 0;
        for _ in 0..1000 {
            let mut candidates = vec![candidate(0, 10, "light"), candidate(0, 90, "heavy")];
            if order_candidates(&mut candidates, &mut rng)[0].host == "heavy" {
                heavy_first += 1;
            }
        }
        assert!(heavy_first > 800 && heavy_first < 970, "heavy first {} times", heavy_first);
    }

    proptest! {
        #[test]
        fn test_any_candidate_set_orders_into_priority_sorted_permutation(
            specs in proptest::collection::vec((0u16..4, any::<u16>(), any::<bool>()), 0..16),
            seed in any::<u64>(),
        ) {
            let mut candidates: Vec<SrvCandidate> = specs
                .iter()
                .enumerate()
                .map(|(i, &(priority, weight, enabled))| {
                    let mut c = candidate(priority, weight, &format!("h{}", i));
                    c.enabled = enabled;
                    c
                })
                .collect();
            let mut expected: Vec<String> = candidates.iter().filter(|c| c.enabled).map(|c| c.host.clone()).collect();
            expected.sort();

            let mut rng = StdRng::seed_from_u64(seed);
            let ordered = order_candidates(&mut candidates, &mut rng);

            let mut seen = hosts(&ordered);
            seen.sort();
            prop_assert_eq!(seen, expected);
            prop_assert!(ordered.windows(2).all(|w| w[0].priority <= w[1].priority));
            prop_assert!(candidates.iter().all(|c| !c.enabled));
        }
    }
}
