//! Small statistics toolkit shared by the calibration stages: medians,
//! sigma clipping, density histograms and a cubic smoothing spline.

use std::cmp::Ordering;

fn finite_sorted(values: &[f64]) -> Vec<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    sorted
}

fn median_of_sorted(sorted: &[f64]) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Median of the finite values, `None` if there are none.
pub fn median(values: &[f64]) -> Option<f64> {
    median_of_sorted(&finite_sorted(values))
}

/// Arithmetic mean of the finite values, `None` if there are none.
pub fn mean(values: &[f64]) -> Option<f64> {
    let (sum, n) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        None
    } else {
        Some(sum / n as f64)
    }
}

/// Population standard deviation (ddof = 0) of the finite values.
pub fn std_dev(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let (ss, n) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(s, n), v| (s + (v - m).powi(2), n + 1));
    Some((ss / n as f64).sqrt())
}

/// Result of iterative sigma clipping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClippedStats {
    pub mean: f64,
    pub median: f64,
    pub std: f64,
    /// Number of values that survived the clipping.
    pub n: usize,
}

/// Sigma-clipped statistics around the median.
///
/// Values further than `sigma` standard deviations from the median are
/// rejected, and the process repeats until nothing more is rejected or
/// `max_iters` passes have run. Non-finite values are ignored.
pub fn sigma_clipped_stats(values: &[f64], sigma: f64, max_iters: usize) -> Option<ClippedStats> {
    let mut kept = finite_sorted(values);
    if kept.is_empty() {
        return None;
    }
    for _ in 0..max_iters {
        let center = median_of_sorted(&kept)?;
        let spread = std_dev(&kept)?;
        let before = kept.len();
        kept.retain(|v| (v - center).abs() <= sigma * spread);
        if kept.len() == before || kept.is_empty() {
            break;
        }
    }
    if kept.is_empty() {
        return None;
    }
    Some(ClippedStats {
        mean: mean(&kept)?,
        median: median_of_sorted(&kept)?,
        std: std_dev(&kept)?,
        n: kept.len(),
    })
}

/// A location estimate with its scatter and standard error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RobustEstimate {
    pub value: f64,
    /// Standard deviation of the values that survived clipping.
    pub scatter: f64,
    /// Standard error of the median, `sqrt(pi/2) * scatter / sqrt(n)`.
    pub error: f64,
    pub n: usize,
}

/// Outlier-resistant median: 3-sigma clipped, at most 5 iterations.
///
/// Deterministic for a given input, so calibrating the same data twice
/// gives bit-identical results.
pub fn robust_median(values: &[f64]) -> Option<RobustEstimate> {
    let clipped = sigma_clipped_stats(values, 3.0, 5)?;
    let error = if clipped.n > 1 {
        (std::f64::consts::PI / 2.0).sqrt() * clipped.std / (clipped.n as f64).sqrt()
    } else {
        0.0
    };
    Some(RobustEstimate {
        value: clipped.median,
        scatter: clipped.std,
        error,
        n: clipped.n,
    })
}

/// A histogram normalised to unit area, with numpy's binning rules: `bins`
/// equal bins over `[min, max]`, the last bin closed on the right.
#[derive(Debug, Clone, PartialEq)]
pub struct DensityHistogram {
    pub edges: Vec<f64>,
    pub density: Vec<f64>,
}

impl DensityHistogram {
    pub fn new(values: &[f64], bins: usize) -> Option<Self> {
        let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if finite.is_empty() || bins == 0 {
            return None;
        }
        let mut lo = finite.iter().copied().fold(f64::INFINITY, f64::min);
        let mut hi = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if lo == hi {
            lo -= 0.5;
            hi += 0.5;
        }
        let width = (hi - lo) / bins as f64;
        let edges: Vec<f64> = (0..=bins).map(|i| lo + width * i as f64).collect();
        let mut counts = vec![0usize; bins];
        for v in &finite {
            let idx = (((v - lo) / (hi - lo)) * bins as f64).floor() as usize;
            counts[idx.min(bins - 1)] += 1;
        }
        let norm = finite.len() as f64 * width;
        let density = counts.iter().map(|&c| c as f64 / norm).collect();
        Some(DensityHistogram { edges, density })
    }

    pub fn upper_edges(&self) -> &[f64] {
        &self.edges[1..]
    }
}

/// `n` evenly spaced samples over `[start, end]`, both ends included.
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

/// Natural cubic smoothing spline.
///
/// The smoothing factor follows the usual convention: the fitted curve is the
/// smoothest natural cubic spline whose residual sum of squares does not
/// exceed `s`. The fit uses the Reinsch formulation, solving
/// `(R + a QᵀQ) γ = Qᵀy` for the second derivatives at the interior knots,
/// with the penalty weight `a` found by bisection on the residual budget.
#[derive(Debug, Clone)]
pub struct SmoothingSpline {
    x: Vec<f64>,
    g: Vec<f64>,
    gamma: Vec<f64>,
}

struct ReinschSystem {
    h: Vec<f64>,
    // (q0, q1, q2) per interior knot: the non-zero entries of column j of Q
    q: Vec<[f64; 3]>,
    r_diag: Vec<f64>,
    r_off: Vec<f64>,
    qty: Vec<f64>,
}

impl ReinschSystem {
    fn new(x: &[f64], y: &[f64]) -> Self {
        let n = x.len();
        let h: Vec<f64> = x.windows(2).map(|w| w[1] - w[0]).collect();
        let m = n - 2;
        let mut q = Vec::with_capacity(m);
        let mut r_diag = Vec::with_capacity(m);
        let mut r_off = Vec::with_capacity(m.saturating_sub(1));
        let mut qty = Vec::with_capacity(m);
        for j in 1..n - 1 {
            let (h0, h1) = (h[j - 1], h[j]);
            let col = [1.0 / h0, -1.0 / h0 - 1.0 / h1, 1.0 / h1];
            qty.push(col[0] * y[j - 1] + col[1] * y[j] + col[2] * y[j + 1]);
            q.push(col);
            r_diag.push((h0 + h1) / 3.0);
            if j < n - 2 {
                r_off.push(h1 / 6.0);
            }
        }
        ReinschSystem {
            h,
            q,
            r_diag,
            r_off,
            qty,
        }
    }

    /// Second derivatives at the interior knots and the fitted values.
    fn solve(&self, y: &[f64], alpha: f64) -> Option<(Vec<f64>, Vec<f64>)> {
        let m = self.q.len();
        let diag: Vec<f64> = (0..m)
            .map(|a| {
                let c = self.q[a];
                self.r_diag[a] + alpha * (c[0] * c[0] + c[1] * c[1] + c[2] * c[2])
            })
            .collect();
        let off1: Vec<f64> = (0..m.saturating_sub(1))
            .map(|a| {
                let (ca, cb) = (self.q[a], self.q[a + 1]);
                self.r_off[a] + alpha * (ca[1] * cb[0] + ca[2] * cb[1])
            })
            .collect();
        let off2: Vec<f64> = (0..m.saturating_sub(2))
            .map(|a| alpha * self.q[a][2] * self.q[a + 2][0])
            .collect();
        let gamma = solve_pentadiagonal(&diag, &off1, &off2, &self.qty)?;

        let mut fitted = y.to_vec();
        for (a, col) in self.q.iter().enumerate() {
            for (k, coeff) in col.iter().enumerate() {
                fitted[a + k] -= alpha * coeff * gamma[a];
            }
        }
        Some((gamma, fitted))
    }
}

/// Cholesky solve of a symmetric positive definite matrix with two
/// off-diagonal bands.
fn solve_pentadiagonal(diag: &[f64], off1: &[f64], off2: &[f64], rhs: &[f64]) -> Option<Vec<f64>> {
    let m = diag.len();
    let mut ld = vec![0.0; m];
    let mut l1 = vec![0.0; m];
    let mut l2 = vec![0.0; m];
    for i in 0..m {
        if i >= 2 {
            l2[i] = off2[i - 2] / ld[i - 2];
        }
        if i >= 1 {
            l1[i] = (off1[i - 1] - l2[i] * l1[i - 1]) / ld[i - 1];
        }
        let d = diag[i] - l1[i] * l1[i] - l2[i] * l2[i];
        if !(d > 0.0) {
            return None;
        }
        ld[i] = d.sqrt();
    }
    let mut z = vec![0.0; m];
    for i in 0..m {
        let mut acc = rhs[i];
        if i >= 1 {
            acc -= l1[i] * z[i - 1];
        }
        if i >= 2 {
            acc -= l2[i] * z[i - 2];
        }
        z[i] = acc / ld[i];
    }
    let mut x = vec![0.0; m];
    for i in (0..m).rev() {
        let mut acc = z[i];
        if i + 1 < m {
            acc -= l1[i + 1] * x[i + 1];
        }
        if i + 2 < m {
            acc -= l2[i + 2] * x[i + 2];
        }
        x[i] = acc / ld[i];
    }
    Some(x)
}

const LOG_ALPHA_MIN: f64 = -15.0;
const LOG_ALPHA_MAX: f64 = 15.0;

impl SmoothingSpline {
    /// Fit a spline through strictly increasing `x`. Returns `None` when the
    /// abscissae are not strictly increasing or the inputs are not finite.
    pub fn fit(x: &[f64], y: &[f64], s: f64) -> Option<Self> {
        let n = x.len();
        if n == 0 || n != y.len() || !x.iter().chain(y).all(|v| v.is_finite()) {
            return None;
        }
        if x.windows(2).any(|w| w[1] <= w[0]) {
            return None;
        }
        if n < 3 {
            return Some(SmoothingSpline {
                x: x.to_vec(),
                g: y.to_vec(),
                gamma: vec![0.0; n],
            });
        }

        let system = ReinschSystem::new(x, y);
        let rss = |fitted: &[f64]| -> f64 { y.iter().zip(fitted).map(|(a, b)| (a - b).powi(2)).sum() };

        let (mut gamma, mut fitted) = system.solve(y, 10f64.powf(LOG_ALPHA_MAX))?;
        if rss(&fitted) > s {
            let (mut lo, mut hi) = (LOG_ALPHA_MIN, LOG_ALPHA_MAX);
            let (g_lo, f_lo) = system.solve(y, 10f64.powf(lo))?;
            gamma = g_lo;
            fitted = f_lo;
            for _ in 0..100 {
                let mid = 0.5 * (lo + hi);
                let (g_mid, f_mid) = system.solve(y, 10f64.powf(mid))?;
                if rss(&f_mid) > s {
                    hi = mid;
                } else {
                    lo = mid;
                    gamma = g_mid;
                    fitted = f_mid;
                }
                if hi - lo < 1e-6 {
                    break;
                }
            }
        }

        let mut full_gamma = Vec::with_capacity(n);
        full_gamma.push(0.0);
        full_gamma.extend(gamma);
        full_gamma.push(0.0);
        debug_assert_eq!(system.h.len(), n - 1);
        Some(SmoothingSpline {
            x: x.to_vec(),
            g: fitted,
            gamma: full_gamma,
        })
    }

    /// Evaluate the spline; outside the knot range it extends linearly.
    pub fn eval(&self, t: f64) -> f64 {
        let n = self.x.len();
        if n == 1 {
            return self.g[0];
        }
        if t < self.x[0] {
            let h = self.x[1] - self.x[0];
            let slope = (self.g[1] - self.g[0]) / h - h * self.gamma[1] / 6.0;
            return self.g[0] + slope * (t - self.x[0]);
        }
        if t > self.x[n - 1] {
            let h = self.x[n - 1] - self.x[n - 2];
            let slope = (self.g[n - 1] - self.g[n - 2]) / h + h * self.gamma[n - 2] / 6.0;
            return self.g[n - 1] + slope * (t - self.x[n - 1]);
        }
        let i = match self.x.partition_point(|&xi| xi <= t) {
            0 => 0,
            p => (p - 1).min(n - 2),
        };
        let (x0, x1) = (self.x[i], self.x[i + 1]);
        let h = x1 - x0;
        let (dl, dr) = (t - x0, x1 - t);
        (dl * self.g[i + 1] + dr * self.g[i]) / h
            - dl * dr / 6.0 * ((1.0 + dl / h) * self.gamma[i + 1] + (1.0 + dr / h) * self.gamma[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_even_odd() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(&[f64::NAN, 1.0]), Some(1.0));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_sigma_clip_rejects_outlier() {
        let mut values = vec![10.0; 20];
        for (i, v) in values.iter_mut().enumerate() {
            *v += (i as f64 - 10.0) * 0.01;
        }
        values.push(100.0);
        let stats = sigma_clipped_stats(&values, 3.0, 10).unwrap();
        assert_eq!(stats.n, 20);
        assert!((stats.median - 10.0).abs() < 0.02);
    }

    #[test]
    fn test_robust_median_constant() {
        let est = robust_median(&[30.2, 30.2, 30.2, 30.2]).unwrap();
        assert!((est.value - 30.2).abs() < 1e-12);
        assert_eq!(est.error, 0.0);
        assert_eq!(est.n, 4);
    }

    #[test]
    fn test_histogram_density_integrates_to_one() {
        let values: Vec<f64> = (0..1000).map(|i| (i % 37) as f64 * 0.1).collect();
        let hist = DensityHistogram::new(&values, 150).unwrap();
        assert_eq!(hist.edges.len(), 151);
        let width = hist.edges[1] - hist.edges[0];
        let area: f64 = hist.density.iter().map(|d| d * width).sum();
        assert!((area - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_histogram_single_value() {
        let hist = DensityHistogram::new(&[5.0, 5.0], 10).unwrap();
        assert!((hist.edges[0] - 4.5).abs() < 1e-12);
        assert!((hist.edges[10] - 5.5).abs() < 1e-12);
    }

    #[test]
    fn test_spline_interpolates_with_zero_smoothing() {
        let x = linspace(0.0, 3.0, 7);
        let y: Vec<f64> = x.iter().map(|v| v * v).collect();
        let spline = SmoothingSpline::fit(&x, &y, 0.0).unwrap();
        for (xi, yi) in x.iter().zip(&y) {
            assert!((spline.eval(*xi) - yi).abs() < 1e-6);
        }
    }

    #[test]
    fn test_spline_large_smoothing_is_linear() {
        let x = linspace(0.0, 1.0, 20);
        let y: Vec<f64> = x.iter().map(|v| 2.0 * v + 1.0 + if (v * 20.0) as i32 % 2 == 0 { 0.05 } else { -0.05 }).collect();
        let spline = SmoothingSpline::fit(&x, &y, 10.0).unwrap();
        let mid = spline.eval(0.5);
        assert!((mid - 2.0).abs() < 0.05);
    }

    #[test]
    fn test_spline_recovers_peak() {
        let x = linspace(18.0, 26.0, 150);
        let y: Vec<f64> = x.iter().map(|v| (-(v - 24.0_f64).powi(2) / 0.5).exp()).collect();
        let spline = SmoothingSpline::fit(&x, &y, 0.02).unwrap();
        let grid = linspace(18.0, 26.0, 200);
        let peak = grid
            .iter()
            .copied()
            .max_by(|a, b| spline.eval(*a).partial_cmp(&spline.eval(*b)).unwrap())
            .unwrap();
        assert!((peak - 24.0).abs() < 0.1);
    }

    #[test]
    fn test_spline_rejects_unsorted() {
        assert!(SmoothingSpline::fit(&[0.0, 0.0, 1.0], &[1.0, 2.0, 3.0], 0.0).is_none());
    }
}
