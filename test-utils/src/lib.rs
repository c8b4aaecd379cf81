use num_traits::Float;
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::thread;

/// Maximum absolute difference and relative L1 difference of `result` to `ans`.
pub fn diff<T: Float>(result: &[T], ans: &[T]) -> (f64, f64) {
    assert_eq!(result.len(), ans.len());
    let mut max_abs_diff = 0.;
    let mut up = 0.;
    let mut down = 0.;
    for (r, a) in result.iter().zip(ans) {
        let r = r.to_f64().unwrap();
        let a = a.to_f64().unwrap();
        let diff = (r - a).abs();
        max_abs_diff = max_abs_diff.max(diff);
        up += diff;
        down += a.abs();
    }
    (max_abs_diff, up / down)
}

/// Reproducible samples in `[-1, 1)`.
pub fn random_f32(seed: u64, len: usize) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.random_range(-1.0..1.0)).collect()
}

/// Runs `f` once per item, each on its own thread, the way ranks of a
/// collective group run in separate processes. Results come back in item
/// order; a panic on any thread is propagated.
pub fn run_ranks<T, R>(items: Vec<T>, f: impl Fn(T) -> R + Sync) -> Vec<R>
where
    T: Send,
    R: Send,
{
    let f = &f;
    thread::scope(|s| {
        items
            .into_iter()
            .map(|item| s.spawn(move || f(item)))
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect()
    })
}

#[test]
fn test_diff() {
    let (max, rel) = diff(&[1.0f32, 2., 4.], &[1., 2.5, 4.5]);
    assert_eq!(max, 0.5);
    assert_eq!(rel, 1. / 8.);
}

#[test]
fn test_run_ranks() {
    let ans = run_ranks((0..4).collect(), |i: usize| i * 10);
    assert_eq!(ans, [0, 10, 20, 30]);
    assert_eq!(random_f32(3, 8), random_f32(3, 8));
}
