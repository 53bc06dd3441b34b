//! # Numeric Helpers
//!
//! Shannon entropy over occurrence counts and significant-digit rounding
//! for the reported feature values.

/// Shannon entropy (base 2) of a multiset given its occurrence counts.
///
/// Returns 0 when every occurrence belongs to one class.
pub fn entropy(counts: &[u64]) -> f64 {
    let total: u64 = counts.iter().sum();
    let total = total as f64;
    -counts
        .iter()
        .map(|&count| {
            let p = count as f64 / total;
            p * p.log2()
        })
        .sum::<f64>()
}

/// Round to `digits` significant digits, ties away from zero.
///
/// Zero stays exactly zero; NaN and infinities pass through unchanged.
///
/// # Examples
/// ```rust
/// use musefeat::stats::round_to_significant;
///
/// assert_eq!(round_to_significant(4.0 / 3.0, 3), 1.33);
/// assert_eq!(round_to_significant(-50.0 / 3.0, 5), -16.667);
/// assert_eq!(round_to_significant(0.0, 5), 0.0);
/// ```
pub fn round_to_significant(x: f64, digits: i32) -> f64 {
    if x == 0.0 {
        return 0.0;
    }
    if !x.is_finite() {
        return x;
    }
    let shift = digits - 1 - x.abs().log10().floor() as i32;
    if shift >= 0 {
        let factor = 10f64.powi(shift);
        (x * factor).round() / factor
    } else {
        let factor = 10f64.powi(-shift);
        (x / factor).round() * factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entropy_uniform() {
        // four classes, one occurrence each
        assert!((entropy(&[1, 1, 1, 1]) - 2.0).abs() < 1e-12);
        assert!((entropy(&[2, 2, 2, 2, 2]) - 5f64.log2()).abs() < 1e-12);
    }

    #[test]
    fn test_entropy_single_class() {
        assert_eq!(entropy(&[7]), 0.0);
    }

    #[test]
    fn test_entropy_skewed() {
        // p = 3/4, 1/4
        let expected = -(0.75f64 * 0.75f64.log2() + 0.25f64 * 0.25f64.log2());
        assert!((entropy(&[3, 1]) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_round_to_significant() {
        assert_eq!(round_to_significant(4.0 / 3.0, 3), 1.33);
        assert_eq!(round_to_significant(4.0 / 3.0, 5), 1.3333);
        assert_eq!(round_to_significant(-50.0 / 3.0, 5), -16.667);
        assert_eq!(round_to_significant(0.0, 5), 0.0);
        assert_eq!(round_to_significant(123456.0, 3), 123000.0);
        assert!(round_to_significant(f64::NAN, 5).is_nan());
    }
}
