//! 种子化 K-Means 聚类 (k-means++ 初始化)
//! Seeded k-means over 3-component colour samples.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub type Point = [f32; 3];

#[inline]
pub fn squared_distance(a: &Point, b: &Point) -> f32 {
    let d0 = a[0] - b[0];
    let d1 = a[1] - b[1];
    let d2 = a[2] - b[2];
    d0 * d0 + d1 * d1 + d2 * d2
}

/// K-Means 参数
#[derive(Clone, Copy, Debug)]
pub struct KMeansParams {
    pub k: usize,
    pub n_init: usize,
    pub max_iter: usize,
    pub seed: u64,
    /// Stop once no centroid moves more than this (squared distance)
    pub tolerance: f32,
}

impl KMeansParams {
    pub fn new(k: usize, seed: u64) -> Self {
        Self {
            k,
            n_init: 1,
            max_iter: 100,
            seed,
            tolerance: 1e-4,
        }
    }

    pub fn n_init(mut self, n_init: usize) -> Self {
        self.n_init = n_init.max(1);
        self
    }

    pub fn max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter.max(1);
        self
    }
}

/// Fitted clustering: centroids plus the label of every training sample.
#[derive(Clone, Debug, PartialEq)]
pub struct KMeans {
    centroids: Vec<Point>,
    labels: Vec<usize>,
    inertia: f32,
}

impl KMeans {
    /// Fit `params.k` clusters. Returns `None` when there are no samples or
    /// `k` is zero. With fewer distinct samples than `k` some centroids
    /// coincide.
    pub fn fit(points: &[Point], params: &KMeansParams) -> Option<Self> {
        if points.is_empty() || params.k == 0 {
            return None;
        }

        let mut rng = StdRng::seed_from_u64(params.seed);
        let mut best: Option<KMeans> = None;

        for _ in 0..params.n_init.max(1) {
            let init = Self::init_plus_plus(points, params.k, &mut rng);
            let run = Self::lloyd(points, init, params);
            // 取惯性最小的一次
            if best.as_ref().map_or(true, |b| run.inertia < b.inertia) {
                best = Some(run);
            }
        }
        best
    }

    /// Build a model from fixed centroids; every centroid labels itself.
    pub fn from_centroids(centroids: Vec<Point>) -> Self {
        let labels = (0..centroids.len()).collect();
        Self {
            centroids,
            labels,
            inertia: 0.0,
        }
    }

    pub fn centroids(&self) -> &[Point] {
        &self.centroids
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    pub fn inertia(&self) -> f32 {
        self.inertia
    }

    /// Index of the nearest centroid; ties go to the lower index.
    pub fn predict(&self, point: &Point) -> usize {
        nearest(&self.centroids, point).0
    }

    fn init_plus_plus(points: &[Point], k: usize, rng: &mut StdRng) -> Vec<Point> {
        let mut centroids = Vec::with_capacity(k);
        centroids.push(points[rng.gen_range(0..points.len())]);

        let mut dist: Vec<f32> = points
            .iter()
            .map(|p| squared_distance(p, &centroids[0]))
            .collect();

        while centroids.len() < k {
            let total: f32 = dist.iter().sum();
            let next = if total > 0.0 {
                let mut target = rng.gen::<f32>() * total;
                let mut chosen = points.len() - 1;
                for (i, d) in dist.iter().enumerate() {
                    if target < *d {
                        chosen = i;
                        break;
                    }
                    target -= d;
                }
                chosen
            } else {
                // 所有样本重合
                rng.gen_range(0..points.len())
            };

            let c = points[next];
            for (d, p) in dist.iter_mut().zip(points) {
                *d = d.min(squared_distance(p, &c));
            }
            centroids.push(c);
        }
        centroids
    }

    fn lloyd(points: &[Point], mut centroids: Vec<Point>, params: &KMeansParams) -> KMeans {
        let k = centroids.len();
        let mut labels = vec![0usize; points.len()];

        for _ in 0..params.max_iter {
            for (label, p) in labels.iter_mut().zip(points) {
                *label = nearest(&centroids, p).0;
            }

            let mut sums = vec![[0.0f64; 3]; k];
            let mut counts = vec![0usize; k];
            for (label, p) in labels.iter().zip(points) {
                counts[*label] += 1;
                for c in 0..3 {
                    sums[*label][c] += p[c] as f64;
                }
            }

            let mut shift = 0.0f32;
            for i in 0..k {
                // 空簇保持原中心
                if counts[i] == 0 {
                    continue;
                }
                let n = counts[i] as f64;
                let updated = [
                    (sums[i][0] / n) as f32,
                    (sums[i][1] / n) as f32,
                    (sums[i][2] / n) as f32,
                ];
                shift = shift.max(squared_distance(&updated, &centroids[i]));
                centroids[i] = updated;
            }

            if shift <= params.tolerance {
                break;
            }
        }

        let mut inertia = 0.0f32;
        for (label, p) in labels.iter_mut().zip(points) {
            let (idx, d) = nearest(&centroids, p);
            *label = idx;
            inertia += d;
        }

        KMeans {
            centroids,
            labels,
            inertia,
        }
    }
}

fn nearest(centroids: &[Point], point: &Point) -> (usize, f32) {
    let mut best = (0, f32::INFINITY);
    for (i, c) in centroids.iter().enumerate() {
        let d = squared_distance(c, point);
        if d < best.1 {
            best = (i, d);
        }
    }
    best
}
