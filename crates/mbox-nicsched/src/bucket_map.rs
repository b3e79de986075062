//! Bucket-to-core reassignment solvers, grounded on
//! `vendor/nicscheduler/methods/solver.hh`'s `BucketMapProblem` /
//! `BucketMapTargetProblem`, simplified per spec §4.8 points 2 and 5 into a
//! greedy assignment and a binary-search-on-tolerance assignment.

/// Spread `buckets` (bucket index, load) across `cores` (core id, starting
/// load) to minimize post-migration imbalance: a simple greedy — always
/// hand the heaviest remaining bucket to the currently least-loaded core.
/// Used when a core is being retired entirely (spec §4.8 point 2).
pub fn bucket_map_problem(buckets: &[(usize, f64)], cores: &[usize], core_load: &mut [f64]) -> Vec<(usize, usize)> {
    assert_eq!(cores.len(), core_load.len());
    let mut sorted: Vec<(usize, f64)> = buckets.to_vec();
    sorted.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());

    let mut moves = Vec::with_capacity(sorted.len());
    for (bucket, load) in sorted {
        let (idx, _) = core_load
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap();
        core_load[idx] += load;
        moves.push((bucket, cores[idx]));
    }
    moves
}

/// Move buckets from `from_core` (given by `buckets`, sorted caller-side by
/// load) onto the cores in `to_cores` so the sum of squared post-move
/// imbalances is minimized, converging by binary search on how large a
/// bucket is allowed to move in any one pass (spec §4.8 point 5). `imbalance`
/// maps core -> signed deviation from target (positive = underloaded
/// capacity still available); it is updated in place as moves are chosen.
pub fn bucket_map_target_problem(
    buckets: &[(usize, f64)],
    to_cores: &[usize],
    imbalance: &mut std::collections::HashMap<usize, f64>,
) -> Vec<(usize, usize)> {
    const MAX_ITERATIONS: usize = 10;

    let mut remaining: Vec<(usize, f64)> = buckets.to_vec();
    let mut moves = Vec::new();

    let mut lo = 0.0f64;
    let mut hi = buckets.iter().map(|&(_, l)| l).fold(0.0, f64::max);

    for _ in 0..MAX_ITERATIONS {
        if remaining.is_empty() || to_cores.is_empty() {
            break;
        }
        let tolerance = (lo + hi) / 2.0;

        let mut moved_any = false;
        remaining.retain(|&(bucket, load)| {
            if load > tolerance + f64::EPSILON && tolerance > 0.0 {
                return true;
            }
            let best = to_cores
                .iter()
                .copied()
                .max_by(|&a, &b| {
                    imbalance.get(&a).unwrap_or(&0.0).partial_cmp(imbalance.get(&b).unwrap_or(&0.0)).unwrap()
                })
                .unwrap();
            let room = *imbalance.get(&best).unwrap_or(&0.0);
            if room <= 0.0 && tolerance > 0.0 {
                return true;
            }
            *imbalance.entry(best).or_insert(0.0) -= load;
            moves.push((bucket, best));
            moved_any = true;
            false
        });

        if remaining.is_empty() {
            break;
        }
        if moved_any {
            hi = tolerance;
        } else {
            lo = tolerance;
        }
    }

    // Anything still unresolved after the budgeted iterations goes to
    // whichever core currently has the most room, to guarantee every bucket
    // lands somewhere (spec §8 "total bucket count conserved").
    for (bucket, load) in remaining {
        if let Some(&best) = to_cores.iter().max_by(|&&a, &&b| {
            imbalance.get(&a).unwrap_or(&0.0).partial_cmp(imbalance.get(&b).unwrap_or(&0.0)).unwrap()
        }) {
            *imbalance.entry(best).or_insert(0.0) -= load;
            moves.push((bucket, best));
        }
    }

    moves
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn bucket_map_problem_prefers_least_loaded_core() {
        let buckets = vec![(0, 0.3), (1, 0.2), (2, 0.1)];
        let cores = vec![10, 11];
        let mut load = vec![0.0, 0.5];
        let moves = bucket_map_problem(&buckets, &cores, &mut load);
        assert_eq!(moves[0], (0, 10));
    }

    #[test]
    fn target_problem_conserves_every_bucket() {
        let buckets = vec![(0, 0.1), (1, 0.2), (2, 0.05)];
        let to_cores = vec![1, 2];
        let mut imbalance = HashMap::new();
        imbalance.insert(1, 0.2);
        imbalance.insert(2, 0.2);
        let moves = bucket_map_target_problem(&buckets, &to_cores, &mut imbalance);
        assert_eq!(moves.len(), buckets.len());
    }
}
