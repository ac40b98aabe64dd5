use num_traits::Float;
use rand::{Rng, SeedableRng, rngs::StdRng};

/// Input generator: seeded when asked to, from entropy otherwise.
pub fn input_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// `len` values from `{0.00, 0.01, .., 0.99}`.
pub fn rand_vector<R: Rng>(rng: &mut R, len: usize) -> Vec<f32> {
    (0..len)
        .map(|_| rng.gen_range(0..100u32) as f32 / 100.0)
        .collect()
}

/// Column sums of `groups` rows of `length` values, accumulated in row order.
pub fn host_workgroup_reduce<T: Float>(input: &[T], groups: usize, length: usize) -> Vec<T> {
    assert_eq!(input.len(), groups * length, "Input is not groups x length!");
    (0..length)
        .map(|l| {
            (0..groups).fold(T::zero(), |sum, g| sum + input[g * length + l])
        })
        .collect()
}
