//! Seed resolution and per-image seed expansion.

use rand::Rng;

/// Sentinel value requesting a randomly drawn seed.
pub const RANDOM_SEED: i64 = -1;

/// Exclusive upper bound for randomly drawn seeds (`2^32 - 2`), kept low
/// enough that per-image increments stay inside the u32 range frontends
/// tend to assume.
pub const RANDOM_SEED_RANGE: i64 = 4_294_967_294;

/// Replaces the random-seed sentinel with a concrete seed.
///
/// Non-negative seeds pass through untouched; anything else draws uniformly
/// from `[0, RANDOM_SEED_RANGE)`.
pub fn resolve_seed(seed: i64) -> i64 {
    if seed >= 0 {
        seed
    } else {
        rand::thread_rng().gen_range(0..RANDOM_SEED_RANGE)
    }
}

/// Expands a base seed into one seed per image.
///
/// Without variation (`subseed_strength == 0`) consecutive images get
/// consecutive seeds. With variation active every image shares the base
/// seed and is distinguished by its subseed instead.
pub fn expand_seeds(seed: i64, count: usize, subseed_strength: f64) -> Vec<i64> {
    (0..count)
        .map(|i| {
            if subseed_strength == 0.0 {
                seed + i as i64
            } else {
                seed
            }
        })
        .collect()
}

/// Expands a base subseed into one subseed per image (always incrementing).
pub fn expand_subseeds(subseed: i64, count: usize) -> Vec<i64> {
    (0..count).map(|i| subseed + i as i64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_passes_fixed_seeds_through() {
        assert_eq!(resolve_seed(42), 42);
        assert_eq!(resolve_seed(0), 0);
    }

    #[test]
    fn resolve_draws_in_range_for_sentinel() {
        for _ in 0..32 {
            let seed = resolve_seed(RANDOM_SEED);
            assert!((0..RANDOM_SEED_RANGE).contains(&seed));
        }
    }

    #[test]
    fn seeds_increment_without_variation() {
        assert_eq!(expand_seeds(42, 3, 0.0), vec![42, 43, 44]);
    }

    #[test]
    fn seeds_stay_fixed_with_variation() {
        assert_eq!(expand_seeds(42, 3, 0.4), vec![42, 42, 42]);
        assert_eq!(expand_subseeds(7, 3), vec![7, 8, 9]);
    }
}
