use foldhash::{HashSet, HashSetExt};
use rayon::prelude::*;

use crate::error::SplatError;

const INIT_ATTEMPTS: usize = 3;
const SEED_SAMPLE_PER_CENTROID: usize = 10;
const SELECT_BATCH: usize = 1024;
const FINAL_CHUNK: usize = 64 * 1024;

/// PCG output hash over a 32-bit LCG state. Small, deterministic and good
/// enough for sampling; never used for anything security-sensitive.
pub(crate) struct PcgRng {
    state: u32,
}

impl PcgRng {
    pub fn new(seed: u32) -> Self {
        Self { state: seed }
    }

    #[inline]
    fn next(&mut self) -> u32 {
        self.state = self
            .state
            .wrapping_mul(747_796_405)
            .wrapping_add(2_891_336_453);
        let word = ((self.state >> ((self.state >> 28) + 4)) ^ self.state)
            .wrapping_mul(277_803_737);
        (word >> 22) ^ word
    }

    /// Uniform in [0, 1) with 24 bits of mantissa.
    #[inline]
    fn next_f32(&mut self) -> f32 {
        (self.next() >> 8) as f32 / (1 << 24) as f32
    }

    /// Uniform in [0, n) without modulo bias worth caring about here.
    #[inline]
    fn next_range(&mut self, n: usize) -> usize {
        ((self.next() as u64 * n as u64) >> 32) as usize
    }
}

/// Squared Euclidean distance. Eight independent accumulator lanes on the
/// main stretch so the compiler can vectorize, then a four-lane step and a
/// scalar tail.
pub(crate) fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut lanes = [0.0f32; 8];
    let mut ca = a.chunks_exact(8);
    let mut cb = b.chunks_exact(8);
    for (xa, xb) in ca.by_ref().zip(cb.by_ref()) {
        for l in 0..8 {
            let d = xa[l] - xb[l];
            lanes[l] += d * d;
        }
    }
    let mut sum: f32 = lanes.iter().sum();

    let ra = ca.remainder();
    let rb = cb.remainder();
    let mut i = 0;
    if ra.len() >= 4 {
        let mut four = [0.0f32; 4];
        for l in 0..4 {
            let d = ra[l] - rb[l];
            four[l] = d * d;
        }
        sum += four.iter().sum::<f32>();
        i = 4;
    }
    while i < ra.len() {
        let d = ra[i] - rb[i];
        sum += d * d;
        i += 1;
    }
    sum
}

#[inline]
fn point_of(data: &[f32], dim: usize, i: usize) -> &[f32] {
    &data[i * dim..(i + 1) * dim]
}

fn nearest(means: &[f32], dim: usize, p: &[f32]) -> (usize, f32) {
    let mut best = 0usize;
    let mut best_d = f32::MAX;
    for (c, m) in means.chunks_exact(dim).enumerate() {
        let d = squared_distance(m, p);
        if d < best_d {
            best_d = d;
            best = c;
        }
    }
    (best, best_d)
}

/// Picks the first index whose running weight sum reaches `target`,
/// scanning in fixed-size batches and binary-searching the batch whose
/// total crosses the target. Falls back to the last index when floating
/// point drift lets the target escape the total.
fn weighted_pick(weights: &[f32], target: f32) -> usize {
    let mut prefix = [0.0f32; SELECT_BATCH];
    let mut running = 0.0f32;
    for (b, chunk) in weights.chunks(SELECT_BATCH).enumerate() {
        let mut acc = running;
        for (j, &w) in chunk.iter().enumerate() {
            acc += w;
            prefix[j] = acc;
        }
        if acc >= target {
            let within = prefix[..chunk.len()].partition_point(|&p| p < target);
            return b * SELECT_BATCH + within.min(chunk.len() - 1);
        }
        running = acc;
    }
    weights.len() - 1
}

/// Mini-batch k-means with k-means++ seeding.
///
/// `data` holds `n = data.len() / dim` points, `means` holds `k` centroids
/// that are overwritten with the result, and `labels` receives the final
/// nearest-centroid index of every point. `progress` is called with a
/// fraction in [0, 1]; returning `false` abandons the run, which surfaces
/// as `Ok(false)` with `means` and `labels` in an unspecified state.
///
/// Fixed inputs and a fixed seed always produce identical output.
#[allow(clippy::too_many_arguments)]
pub fn cluster(
    dim: usize,
    data: &[f32],
    batch_size: usize,
    passes_over_data: f32,
    seed: u32,
    means: &mut [f32],
    labels: &mut [u32],
    progress: &mut dyn FnMut(f32) -> bool,
) -> Result<bool, SplatError> {
    if dim == 0 {
        return Err(SplatError::Config("point dimension must be non-zero".to_string()));
    }
    if data.len() % dim != 0 || means.len() % dim != 0 {
        return Err(SplatError::Config(format!(
            "data ({}) and means ({}) must be multiples of the dimension {}",
            data.len(),
            means.len(),
            dim
        )));
    }
    let n = data.len() / dim;
    let k = means.len() / dim;
    if n == 0 || k == 0 {
        return Err(SplatError::Config(
            "at least one point and one centroid are required".to_string(),
        ));
    }
    if k > n {
        return Err(SplatError::Config(format!(
            "cannot seed {} centroids from {} points",
            k, n
        )));
    }
    if labels.len() != n {
        return Err(SplatError::Config(format!(
            "labels length {} does not match the point count {}",
            labels.len(),
            n
        )));
    }
    if batch_size == 0 {
        return Err(SplatError::Config("batch size must be non-zero".to_string()));
    }
    if !passes_over_data.is_finite() || passes_over_data <= 0.0 {
        return Err(SplatError::Config(format!(
            "invalid pass count {}",
            passes_over_data
        )));
    }

    let mut rng = PcgRng::new(seed);
    if !progress(0.0) {
        return Ok(false);
    }

    // Seeding runs on samples drawn with replacement, sized relative to
    // the codebook rather than the dataset.
    let sample_size = SEED_SAMPLE_PER_CENTROID * k;
    let seed_work = (INIT_ATTEMPTS * k) as f32;
    let mut best: Vec<f32> = vec![0.0; k * dim];
    let mut best_cost = f32::INFINITY;

    for attempt in 0..INIT_ATTEMPTS {
        let sample: Vec<usize> = (0..sample_size).map(|_| rng.next_range(n)).collect();
        let validation: Vec<usize> = (0..sample_size).map(|_| rng.next_range(n)).collect();

        let mut centers: Vec<f32> = Vec::with_capacity(k * dim);
        let mut taken: HashSet<usize> = HashSet::with_capacity(k);
        let mut dist2 = vec![f32::MAX; sample_size];

        let first = sample[rng.next_range(sample_size)];
        centers.extend_from_slice(point_of(data, dim, first));
        taken.insert(first);

        for c in 1..k {
            // Nearest-center distances only change against the newest center.
            let newest = centers[(c - 1) * dim..c * dim].to_vec();
            sample
                .par_iter()
                .zip(dist2.par_iter_mut())
                .with_min_len(512)
                .for_each(|(&i, d)| {
                    let dd = squared_distance(&newest, point_of(data, dim, i));
                    if dd < *d {
                        *d = dd;
                    }
                });

            let total: f32 = dist2.iter().sum();
            let mut p = if total > 0.0 {
                sample[weighted_pick(&dist2, rng.next_f32() * total)]
            } else {
                sample[sample_size - 1]
            };
            if taken.contains(&p) {
                p = match sample.iter().rev().copied().find(|q| !taken.contains(q)) {
                    Some(q) => q,
                    // Fewer distinct points than centroids; tolerate a
                    // duplicate center rather than failing.
                    None => sample[rng.next_range(sample_size)],
                };
            }
            centers.extend_from_slice(point_of(data, dim, p));
            taken.insert(p);

            if c % 256 == 0 {
                let done = (attempt * k + c) as f32;
                if !progress(0.4 * done / seed_work) {
                    return Ok(false);
                }
            }
        }

        // Score the attempt on an independent sample. Summed sequentially
        // so thread scheduling cannot flip which attempt wins.
        let costs: Vec<f32> = validation
            .par_iter()
            .with_min_len(64)
            .map(|&i| nearest(&centers, dim, point_of(data, dim, i)).1)
            .collect();
        let cost: f32 = costs.iter().sum();
        if cost < best_cost {
            best_cost = cost;
            best.copy_from_slice(&centers);
        }
    }
    means.copy_from_slice(&best);

    // Mini-batch refinement: each centroid tracks how many points have ever
    // hit it and moves toward each new one by 1/count, so it settles into
    // the running mean of its assignments.
    let total_batches = ((n as f32 * passes_over_data) / batch_size as f32).ceil() as usize;
    let effective_batch = batch_size.min(n);
    let mut counts = vec![1u32; k];
    let mut batch_idx: Vec<usize> = Vec::with_capacity(effective_batch);
    let mut assignments = vec![0u32; effective_batch];
    let mut visited: HashSet<usize> = HashSet::with_capacity(effective_batch);
    for b in 0..total_batches {
        // Each batch holds distinct points, drawn by rejection sampling.
        batch_idx.clear();
        visited.clear();
        while batch_idx.len() < effective_batch {
            let i = rng.next_range(n);
            if visited.insert(i) {
                batch_idx.push(i);
            }
        }
        batch_idx
            .par_iter()
            .zip(assignments.par_iter_mut())
            .with_min_len(16)
            .for_each(|(&i, a)| {
                *a = nearest(means, dim, point_of(data, dim, i)).0 as u32;
            });
        for (&i, &a) in batch_idx.iter().zip(assignments.iter()) {
            let c = a as usize;
            counts[c] += 1;
            let lr = 1.0 / counts[c] as f32;
            let m = &mut means[c * dim..(c + 1) * dim];
            for (mv, &pv) in m.iter_mut().zip(point_of(data, dim, i)) {
                *mv += (pv - *mv) * lr;
            }
        }
        if !progress(0.4 + 0.4 * (b + 1) as f32 / total_batches as f32) {
            return Ok(false);
        }
    }

    // Exhaustive final assignment over every point, chunked so progress
    // still ticks on large clouds.
    let mut done = 0usize;
    for (ci, chunk) in labels.chunks_mut(FINAL_CHUNK).enumerate() {
        let base = ci * FINAL_CHUNK;
        chunk
            .par_iter_mut()
            .enumerate()
            .with_min_len(64)
            .for_each(|(j, l)| {
                *l = nearest(means, dim, point_of(data, dim, base + j)).0 as u32;
            });
        done += chunk.len();
        if !progress(0.8 + 0.2 * done as f32 / n as f32) {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(
        dim: usize,
        data: &[f32],
        k: usize,
        seed: u32,
    ) -> Result<(Vec<f32>, Vec<u32>, bool), SplatError> {
        let mut means = vec![0.0f32; k * dim];
        let mut labels = vec![0u32; data.len() / dim];
        let done = cluster(dim, data, 64, 2.0, seed, &mut means, &mut labels, &mut |_| true)?;
        Ok((means, labels, done))
    }

    /// Four tight 2D sites far apart, 50 points each.
    fn separated_sites() -> Vec<f32> {
        let sites = [[0.0f32, 0.0], [10.0, 0.0], [0.0, 10.0], [10.0, 10.0]];
        let mut rng = PcgRng::new(99);
        let mut data = Vec::with_capacity(4 * 50 * 2);
        for s in sites {
            for _ in 0..50 {
                data.push(s[0] + rng.next_f32() * 0.2 - 0.1);
                data.push(s[1] + rng.next_f32() * 0.2 - 0.1);
            }
        }
        data
    }

    #[test]
    fn test_squared_distance_matches_naive() {
        let mut rng = PcgRng::new(7);
        for dim in 1..=20 {
            let a: Vec<f32> = (0..dim).map(|_| rng.next_f32() * 4.0 - 2.0).collect();
            let b: Vec<f32> = (0..dim).map(|_| rng.next_f32() * 4.0 - 2.0).collect();
            let naive: f32 = a.iter().zip(&b).map(|(x, y)| (x - y) * (x - y)).sum();
            assert!((squared_distance(&a, &b) - naive).abs() < 1.0e-5);
        }
    }

    #[test]
    fn test_config_errors() {
        let data = [0.0f32; 8];
        let mut means = [0.0f32; 4];
        let mut labels = [0u32; 4];
        let mut always = |_: f32| true;

        assert!(cluster(0, &data, 64, 1.0, 0, &mut means, &mut labels, &mut always).is_err());
        assert!(cluster(3, &data, 64, 1.0, 0, &mut means, &mut labels, &mut always).is_err());
        // k = 2 > n = 1
        assert!(
            cluster(2, &data[..2], 64, 1.0, 0, &mut means, &mut labels[..1], &mut always).is_err()
        );
        // labels length mismatch
        assert!(cluster(2, &data, 64, 1.0, 0, &mut means, &mut labels[..3], &mut always).is_err());
        assert!(cluster(2, &data, 0, 1.0, 0, &mut means, &mut labels, &mut always).is_err());
        assert!(
            cluster(2, &data, 64, f32::NAN, 0, &mut means, &mut labels, &mut always).is_err()
        );
        assert!(cluster(2, &data, 64, 0.0, 0, &mut means, &mut labels, &mut always).is_err());
    }

    #[test]
    fn test_recovers_separated_clusters() {
        let data = separated_sites();
        let (means, labels, done) = run(2, &data, 4, 42).unwrap();
        assert!(done);

        for (i, chunk) in data.chunks_exact(2).enumerate() {
            let l = labels[i] as usize;
            assert!(l < 4);
            let m = &means[l * 2..l * 2 + 2];
            assert!(
                squared_distance(m, chunk) < 1.0,
                "point {:?} labeled to distant mean {:?}",
                chunk,
                m
            );
        }
        // Points of the same site share a label.
        for site in 0..4 {
            let first = labels[site * 50];
            assert!(labels[site * 50..(site + 1) * 50].iter().all(|&l| l == first));
        }
    }

    #[test]
    fn test_fixed_seed_is_deterministic() {
        let data = separated_sites();
        let a = run(2, &data, 4, 1234).unwrap();
        let b = run(2, &data, 4, 1234).unwrap();
        assert_eq!(a.0, b.0);
        assert_eq!(a.1, b.1);
    }

    #[test]
    fn test_cancellation_returns_ok_false() {
        let data = separated_sites();
        let mut means = vec![0.0f32; 4 * 2];
        let mut labels = vec![0u32; data.len() / 2];
        let r = cluster(2, &data, 64, 1.0, 0, &mut means, &mut labels, &mut |_| false);
        assert_eq!(r.unwrap(), false);
    }

    #[test]
    fn test_weighted_pick_spans_batches() {
        // Enough weights to cross a batch boundary; all the mass sits on
        // the last element.
        let mut w = vec![0.0f32; SELECT_BATCH + 10];
        *w.last_mut().unwrap() = 5.0;
        assert_eq!(weighted_pick(&w, 2.5), SELECT_BATCH + 9);
        assert_eq!(weighted_pick(&w, 100.0), SELECT_BATCH + 9);

        let w = [1.0f32, 1.0, 1.0, 1.0];
        assert_eq!(weighted_pick(&w, 0.5), 0);
        assert_eq!(weighted_pick(&w, 3.5), 3);
    }

    /// Full-scale codebook quality check; slow, run explicitly.
    #[test]
    #[ignore]
    fn test_reconstruction_error_at_scale() {
        let dim = 45;
        let k = 4096;
        let n = 300_000;
        let mut rng = PcgRng::new(3);
        let centers: Vec<f32> = (0..k * dim).map(|_| rng.next_f32()).collect();
        let mut data = Vec::with_capacity(n * dim);
        for _ in 0..n {
            let c = rng.next_range(k);
            for d in 0..dim {
                data.push(centers[c * dim + d] + (rng.next_f32() - 0.5) * 0.01);
            }
        }

        let mut means = vec![0.0f32; k * dim];
        let mut labels = vec![0u32; n];
        let done = cluster(dim, &data, 2048, 1.2, 7, &mut means, &mut labels, &mut |_| true)
            .unwrap();
        assert!(done);

        let mse: f64 = data
            .chunks_exact(dim)
            .zip(&labels)
            .map(|(p, &l)| {
                squared_distance(&means[l as usize * dim..(l as usize + 1) * dim], p) as f64
            })
            .sum::<f64>()
            / n as f64;
        // Random 45-dim assignments would score around 7.5 here.
        assert!(mse < 0.5, "mean squared reconstruction error {}", mse);
    }
}
