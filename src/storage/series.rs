//! The time-series value type
//!
//! A `TimeSeries` is a pair of equal-length sequences of `f64`: sample times
//! and sample values. The database fixes one length for every series it
//! stores; validation of that length happens at the engine boundary, while
//! structural validation (equal lengths, strictly increasing times) happens
//! here.

use crate::storage::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};

/// A fixed-length time series: sample times paired with sample values.
///
/// Equality is elementwise over both sequences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    times: Vec<f64>,
    values: Vec<f64>,
}

impl TimeSeries {
    /// Create a series from times and values.
    ///
    /// Fails with `InvalidArgument` if the sequences differ in length, are
    /// empty, or the times are not strictly increasing.
    pub fn new(times: Vec<f64>, values: Vec<f64>) -> DbResult<Self> {
        if times.len() != values.len() {
            return Err(DbError::InvalidArgument(format!(
                "times ({}) and values ({}) differ in length",
                times.len(),
                values.len()
            )));
        }
        if times.is_empty() {
            return Err(DbError::InvalidArgument("empty series".to_string()));
        }
        if times.windows(2).any(|w| w[0] >= w[1]) {
            return Err(DbError::InvalidArgument(
                "times must be strictly increasing".to_string(),
            ));
        }
        Ok(Self { times, values })
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Arithmetic mean of the values.
    pub fn mean(&self) -> f64 {
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    /// Population standard deviation of the values.
    pub fn std(&self) -> f64 {
        let m = self.mean();
        let var = self.values.iter().map(|v| (v - m) * (v - m)).sum::<f64>()
            / self.values.len() as f64;
        var.sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_creation() {
        let ts = TimeSeries::new(vec![0.0, 1.0, 2.0], vec![5.0, 6.0, 7.0]).unwrap();
        assert_eq!(ts.len(), 3);
        assert_eq!(ts.times(), &[0.0, 1.0, 2.0]);
        assert_eq!(ts.values(), &[5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let err = TimeSeries::new(vec![0.0, 1.0], vec![5.0]).unwrap_err();
        assert_eq!(err.kind(), "InvalidArgument");
    }

    #[test]
    fn test_non_monotonic_times_rejected() {
        let err = TimeSeries::new(vec![0.0, 2.0, 1.0], vec![1.0, 2.0, 3.0]).unwrap_err();
        assert_eq!(err.kind(), "InvalidArgument");

        // equal adjacent times are also rejected
        let err = TimeSeries::new(vec![0.0, 1.0, 1.0], vec![1.0, 2.0, 3.0]).unwrap_err();
        assert_eq!(err.kind(), "InvalidArgument");
    }

    #[test]
    fn test_elementwise_equality() {
        let a = TimeSeries::new(vec![0.0, 1.0], vec![2.0, 3.0]).unwrap();
        let b = TimeSeries::new(vec![0.0, 1.0], vec![2.0, 3.0]).unwrap();
        let c = TimeSeries::new(vec![0.0, 1.0], vec![2.0, 3.5]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_mean_and_std() {
        let ts = TimeSeries::new(vec![0.0, 1.0, 2.0, 3.0], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert!((ts.mean() - 2.5).abs() < 1e-12);
        // population std of 1..4
        assert!((ts.std() - (1.25f64).sqrt()).abs() < 1e-12);
    }
}
