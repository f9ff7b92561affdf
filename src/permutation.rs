//! Deterministic index shuffling for constraint solve order.

/// Primes used as multipliers. Each exceeds the maximum permitted set
/// size, so it is coprime with any set size and the mapping stays a
/// bijection.
const PRIMES: [i64; 8] = [
    402_653_189,
    805_306_457,
    998_244_353,
    1_000_000_007,
    1_000_000_009,
    1_610_612_741,
    2_013_265_921,
    2_147_483_647,
];

/// Stride applied to the permutation index to vary the offset between
/// permutations.
const OFFSET_STRIDE: i64 = 786_433;

/// Maps indices to permuted versions of the indices.
///
/// Solving joints in a shuffled order every subiteration avoids corner
/// cases caused by solve-order bias, but the shuffle must be repeatable:
/// if a simulation restarts from a given frame, setting the permutation
/// index consistently is required for deterministic results.
#[derive(Clone, Copy, Debug)]
pub struct PermutationMapper {
    permutation_index: i64,
    current_offset: i64,
    current_prime: i64,
}

impl Default for PermutationMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl PermutationMapper {
    pub fn new() -> Self {
        let mut mapper = PermutationMapper {
            permutation_index: 0,
            current_offset: 0,
            current_prime: PRIMES[0],
        };
        mapper.set_permutation_index(0);
        mapper
    }

    /// Sets the permutation index used by the solver, rebuilding the
    /// multiplier and offset it implies.
    pub fn set_permutation_index(&mut self, value: i64) {
        self.permutation_index = value;
        self.current_prime = PRIMES[value.rem_euclid(PRIMES.len() as i64) as usize];
        self.current_offset = value.wrapping_mul(OFFSET_STRIDE);
    }

    pub fn permutation_index(&self) -> i64 {
        self.permutation_index
    }

    /// Gets the remapped position of `index` within a set of `set_size`
    /// elements. The set size must be smaller than 350000041.
    pub fn get_mapped_index(&self, index: i64, set_size: usize) -> usize {
        debug_assert!(set_size < 350_000_041);
        debug_assert!((index as usize) < set_size);
        let n = set_size as i64;
        let shuffled = (index * self.current_prime).rem_euclid(n);
        ((shuffled + self.current_offset.rem_euclid(n)) % n) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapped(mapper: &PermutationMapper, n: usize) -> Vec<usize> {
        (0..n as i64).map(|i| mapper.get_mapped_index(i, n)).collect()
    }

    #[test]
    fn mapping_is_a_bijection() {
        let mut mapper = PermutationMapper::new();
        for index in [0, 1, 2, 17, 1000] {
            mapper.set_permutation_index(index);
            for n in [1, 2, 3, 7, 64, 1000] {
                let mut seen = vec![false; n];
                for i in 0..n as i64 {
                    let m = mapper.get_mapped_index(i, n);
                    assert!(!seen[m], "index {index}, n {n}: duplicate target {m}");
                    seen[m] = true;
                }
            }
        }
    }

    #[test]
    fn identical_indices_give_identical_sequences() {
        let mut a = PermutationMapper::new();
        let mut b = PermutationMapper::new();
        a.set_permutation_index(42);
        b.set_permutation_index(42);
        assert_eq!(mapped(&a, 100), mapped(&b, 100));
    }

    #[test]
    fn different_indices_give_different_orderings() {
        let mut mapper = PermutationMapper::new();
        mapper.set_permutation_index(0);
        let first = mapped(&mapper, 100);
        mapper.set_permutation_index(1);
        let second = mapped(&mapper, 100);
        assert_ne!(first, second);
    }
}
