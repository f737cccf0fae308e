//! Symbolic Aggregate Approximation
//!
//! A series is reduced to a word of `w` symbols over an alphabet of
//! cardinality `c`: z-normalize, average into `w` equal segments (PAA),
//! then quantize each mean against the `c − 1` breakpoints that cut the
//! standard normal into `c` equiprobable bands. Band 0 is the lowest.
//!
//! Symbols render as fixed-width binary strings of `log2(c)` digits, which
//! is the word form used in diagnostics and the tree display.

pub mod tree;

use crate::similarity::z_normalize;
use crate::storage::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A SAX word: one symbol per PAA segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SaxWord {
    symbols: Vec<u8>,
    /// Binary digits per symbol (`log2(cardinality)`), kept for display.
    bits: u8,
}

impl SaxWord {
    pub fn new(symbols: Vec<u8>, bits: u8) -> Self {
        Self { symbols, bits }
    }

    pub fn symbols(&self) -> &[u8] {
        &self.symbols
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

impl fmt::Display for SaxWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, s) in self.symbols.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:0width$b}", s, width = self.bits as usize)?;
        }
        Ok(())
    }
}

/// Breakpoints cutting the standard normal into `cardinality` equiprobable
/// bands; `cardinality − 1` ascending values.
pub fn breakpoints(cardinality: usize) -> Vec<f64> {
    (1..cardinality)
        .map(|i| inverse_normal_cdf(i as f64 / cardinality as f64))
        .collect()
}

/// Acklam's rational approximation to the standard normal quantile
/// function (absolute error below 1.2e-9 over (0, 1)).
fn inverse_normal_cdf(p: f64) -> f64 {
    debug_assert!(p > 0.0 && p < 1.0);

    const A: [f64; 6] = [
        -3.969683028665376e+01,
        2.209460984245205e+02,
        -2.759285104469687e+02,
        1.383577518672690e+02,
        -3.066479806614716e+01,
        2.506628277459239e+00,
    ];
    const B: [f64; 5] = [
        -5.447609879822406e+01,
        1.615858368580409e+02,
        -1.556989798598866e+02,
        6.680131188771972e+01,
        -1.328068155288572e+01,
    ];
    const C: [f64; 6] = [
        -7.784894002430293e-03,
        -3.223964580411365e-01,
        -2.400758277161838e+00,
        -2.549732539343734e+00,
        4.374664141464968e+00,
        2.938163982698783e+00,
    ];
    const D: [f64; 4] = [
        7.784695709041462e-03,
        3.224671290700398e-01,
        2.445134137142996e+00,
        3.754408661907416e+00,
    ];
    const P_LOW: f64 = 0.02425;

    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -((((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0))
    }
}

/// Converts fixed-length series into SAX words.
#[derive(Debug, Clone)]
pub struct SaxEncoder {
    word_length: usize,
    cardinality: usize,
    bits: u8,
    breakpoints: Vec<f64>,
}

impl SaxEncoder {
    /// `word_length ≥ 1`; `cardinality` a power of two in [2, 256].
    pub fn new(word_length: usize, cardinality: usize) -> DbResult<Self> {
        if word_length == 0 {
            return Err(DbError::InvalidArgument(
                "SAX word length must be positive".to_string(),
            ));
        }
        if !(2..=256).contains(&cardinality) || !cardinality.is_power_of_two() {
            return Err(DbError::InvalidArgument(format!(
                "SAX cardinality must be a power of two in [2, 256], got {}",
                cardinality
            )));
        }
        Ok(Self {
            word_length,
            cardinality,
            bits: cardinality.trailing_zeros() as u8,
            breakpoints: breakpoints(cardinality),
        })
    }

    pub fn word_length(&self) -> usize {
        self.word_length
    }

    pub fn cardinality(&self) -> usize {
        self.cardinality
    }

    pub fn breakpoints(&self) -> &[f64] {
        &self.breakpoints
    }

    /// Encode a value sequence whose length is a multiple of the word
    /// length.
    pub fn encode(&self, values: &[f64]) -> DbResult<SaxWord> {
        if values.is_empty() || values.len() % self.word_length != 0 {
            return Err(DbError::InvalidArgument(format!(
                "series length {} is not divisible by SAX word length {}",
                values.len(),
                self.word_length
            )));
        }

        let normalized = z_normalize(values);
        let segment = values.len() / self.word_length;

        let symbols = (0..self.word_length)
            .map(|chunk| {
                let window = &normalized[chunk * segment..(chunk + 1) * segment];
                let mean = window.iter().sum::<f64>() / segment as f64;
                self.quantize(mean)
            })
            .collect();

        Ok(SaxWord::new(symbols, self.bits))
    }

    /// Band index of a z-scale value: the first breakpoint it falls below,
    /// or the top band.
    fn quantize(&self, value: f64) -> u8 {
        self.breakpoints
            .iter()
            .position(|b| value < *b)
            .unwrap_or(self.cardinality - 1) as u8
    }

    /// Distance between two symbols in breakpoint space: zero for equal or
    /// adjacent bands, otherwise the gap between the facing breakpoints.
    pub fn symbol_distance(&self, a: u8, b: u8) -> f64 {
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        if hi - lo <= 1 {
            0.0
        } else {
            self.breakpoints[hi as usize - 1] - self.breakpoints[lo as usize]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breakpoints_match_normal_quantiles() {
        let bp = breakpoints(4);
        assert_eq!(bp.len(), 3);
        assert!((bp[0] + 0.6744897501960817).abs() < 1e-6);
        assert!(bp[1].abs() < 1e-9);
        assert!((bp[2] - 0.6744897501960817).abs() < 1e-6);

        let bp8 = breakpoints(8);
        assert_eq!(bp8.len(), 7);
        // median quantile of 8 bands
        assert!(bp8[3].abs() < 1e-9);
        // symmetric around zero
        for i in 0..3 {
            assert!((bp8[i] + bp8[6 - i]).abs() < 1e-6);
        }
        // strictly increasing
        assert!(bp8.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_encoder_parameter_validation() {
        assert!(SaxEncoder::new(4, 4).is_ok());
        assert!(SaxEncoder::new(0, 4).is_err());
        assert!(SaxEncoder::new(4, 3).is_err());
        assert!(SaxEncoder::new(4, 1).is_err());
        assert!(SaxEncoder::new(4, 512).is_err());
    }

    #[test]
    fn test_encode_ramp() {
        // an increasing ramp visits the bands bottom to top
        let encoder = SaxEncoder::new(4, 4).unwrap();
        let values: Vec<f64> = (0..16).map(|i| i as f64).collect();
        let word = encoder.encode(&values).unwrap();
        assert_eq!(word.symbols(), &[0, 1, 2, 3]);
    }

    #[test]
    fn test_encode_constant_series() {
        // constant input z-normalizes to zeros, which land in band c/2
        let encoder = SaxEncoder::new(4, 4).unwrap();
        let word = encoder.encode(&[5.0; 16]).unwrap();
        assert_eq!(word.symbols(), &[2, 2, 2, 2]);
    }

    #[test]
    fn test_encode_length_must_divide() {
        let encoder = SaxEncoder::new(4, 4).unwrap();
        assert!(encoder.encode(&[1.0; 15]).is_err());
        assert!(encoder.encode(&[]).is_err());
    }

    #[test]
    fn test_encode_is_offset_and_scale_invariant() {
        let encoder = SaxEncoder::new(4, 8).unwrap();
        let base: Vec<f64> = (0..32).map(|i| (i as f64 * 0.7).sin()).collect();
        let shifted: Vec<f64> = base.iter().map(|v| v * 12.0 - 40.0).collect();
        assert_eq!(
            encoder.encode(&base).unwrap(),
            encoder.encode(&shifted).unwrap()
        );
    }

    #[test]
    fn test_word_display_binary() {
        let word = SaxWord::new(vec![0, 1, 2, 3], 2);
        assert_eq!(word.to_string(), "00 01 10 11");
    }

    #[test]
    fn test_symbol_distance() {
        let encoder = SaxEncoder::new(4, 4).unwrap();
        assert_eq!(encoder.symbol_distance(1, 1), 0.0);
        assert_eq!(encoder.symbol_distance(1, 2), 0.0);
        // bands 0 and 3 face breakpoints bp[0] and bp[2]
        let expected = encoder.breakpoints()[2] - encoder.breakpoints()[0];
        assert!((encoder.symbol_distance(0, 3) - expected).abs() < 1e-12);
        assert_eq!(
            encoder.symbol_distance(0, 3),
            encoder.symbol_distance(3, 0)
        );
    }
}
