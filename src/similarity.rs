//! Series distance kernels
//!
//! Two distances are used by the search engines:
//!
//! - z-normalized Euclidean distance, for refining iSAX candidates;
//! - the normalized cross-correlation distance `√(2·(1 − max_τ NCC))`,
//!   for the vantage-point engine. The maximum runs over all circular lags
//!   of the z-normalized series, so the distance is phase-invariant and
//!   zero for a series against itself.

use crate::storage::series::TimeSeries;

/// Standard deviations below this are treated as zero; the z-normalized
/// series is then all zeros.
pub const NORM_EPSILON: f64 = 1e-10;

/// Z-normalize: subtract the mean, divide by the population standard
/// deviation. Near-constant input normalizes to all zeros.
pub fn z_normalize(values: &[f64]) -> Vec<f64> {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    let std = var.sqrt();

    if std < NORM_EPSILON {
        return vec![0.0; values.len()];
    }
    values.iter().map(|v| (v - mean) / std).collect()
}

/// Euclidean distance between the z-normalized forms of two equal-length
/// value sequences.
pub fn euclidean_znorm(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    let za = z_normalize(a);
    let zb = z_normalize(b);
    za.iter()
        .zip(&zb)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

/// Maximum normalized cross-correlation over all circular lags of the
/// z-normalized series. Ranges over [-1, 1] up to rounding.
pub fn ncc_max(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    let n = a.len();
    let za = z_normalize(a);
    let zb = z_normalize(b);

    let mut best = f64::NEG_INFINITY;
    for lag in 0..n {
        let mut acc = 0.0;
        for i in 0..n {
            acc += za[i] * zb[(i + lag) % n];
        }
        let ncc = acc / n as f64;
        if ncc > best {
            best = ncc;
        }
    }
    best
}

/// The vantage-point distance `√(2·(1 − max_τ NCC(a,b,τ)))`, clamped at
/// zero against rounding on identical series.
pub fn ncc_distance(a: &TimeSeries, b: &TimeSeries) -> f64 {
    let ncc = ncc_max(a.values(), b.values());
    (2.0 * (1.0 - ncc)).max(0.0).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(values: Vec<f64>) -> TimeSeries {
        let times: Vec<f64> = (0..values.len()).map(|i| i as f64).collect();
        TimeSeries::new(times, values).unwrap()
    }

    fn sine(n: usize, phase: f64) -> Vec<f64> {
        (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * i as f64 / n as f64 + phase).sin())
            .collect()
    }

    #[test]
    fn test_z_normalize() {
        let z = z_normalize(&[1.0, 2.0, 3.0, 4.0]);
        let mean: f64 = z.iter().sum::<f64>() / 4.0;
        let var: f64 = z.iter().map(|v| v * v).sum::<f64>() / 4.0;
        assert!(mean.abs() < 1e-12);
        assert!((var - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_z_normalize_constant_series() {
        let z = z_normalize(&[3.0, 3.0, 3.0]);
        assert_eq!(z, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_self_distance_is_zero() {
        let a = series(sine(64, 0.0));
        assert!(ncc_distance(&a, &a) < 1e-6);
        assert_eq!(euclidean_znorm(a.values(), a.values()), 0.0);
    }

    #[test]
    fn test_symmetry() {
        let a = series(sine(64, 0.0));
        let b = series((0..64).map(|i| (i as f64 * 0.3).cos() + 0.1 * i as f64).collect());
        let d_ab = ncc_distance(&a, &b);
        let d_ba = ncc_distance(&b, &a);
        assert!((d_ab - d_ba).abs() < 1e-9);
    }

    #[test]
    fn test_phase_shift_invariance() {
        // a circularly shifted sine correlates perfectly at some lag
        let a = series(sine(64, 0.0));
        let b = series(sine(64, std::f64::consts::PI / 2.0));
        assert!(ncc_distance(&a, &b) < 1e-6);
    }

    #[test]
    fn test_anticorrelated_is_far() {
        let a = series(sine(64, 0.0));
        let neg: Vec<f64> = a.values().iter().map(|v| -v).collect();
        let b = series(neg);
        // the circular shift realigns a sine with its negation
        assert!(ncc_distance(&a, &b) < 1e-6);

        // a linear ramp against a sine stays genuinely distant
        let ramp = series((0..64).map(|i| i as f64).collect());
        assert!(ncc_distance(&a, &ramp) > 0.3);
    }

    #[test]
    fn test_scale_invariance() {
        let a = series(sine(64, 0.0));
        let scaled: Vec<f64> = a.values().iter().map(|v| 10.0 * v + 3.0).collect();
        let b = series(scaled);
        assert!(ncc_distance(&a, &b) < 1e-6);
    }
}
