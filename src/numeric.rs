//! Guarded arithmetic used by the operation catalog.

use num_traits::Float;

/// Marker for a value outside an operation's mathematical domain.
///
/// Never leaves the operator that produced it; see [`or_zero`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct DomainFault;

/// Resolves a domain fault to the `0.0` sentinel.
pub(crate) fn or_zero<T: Float>(value: Result<T, DomainFault>) -> T {
    value.unwrap_or_else(|DomainFault| T::zero())
}

/// `num / den`, with `0.0` substituted for a NaN quotient.
///
/// A zero denominator also yields `0.0` (rather than an infinity) so a single
/// fraction with a missing count cannot poison downstream sums.
pub fn divide_with_zero_for_nan_result<T: Float>(num: T, den: T) -> T {
    if den.is_zero() {
        return T::zero();
    }
    let result = num / den;
    if result.is_nan() {
        T::zero()
    } else {
        result
    }
}

pub(crate) fn checked_ln<T: Float>(x: T) -> Result<T, DomainFault> {
    if x.is_nan() || x <= T::zero() {
        return Err(DomainFault);
    }
    Ok(x.ln())
}

pub(crate) fn checked_sqrt<T: Float>(x: T) -> Result<T, DomainFault> {
    if x.is_nan() || x < T::zero() {
        return Err(DomainFault);
    }
    Ok(x.sqrt())
}

/// Arithmetic mean; `0.0` for no values.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n - 1 denominator); `0.0` for fewer than two
/// values.
pub fn sample_std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let sum_sq: f64 = values.iter().map(|v| (v - m) * (v - m)).sum();
    (sum_sq / (values.len() - 1) as f64).sqrt()
}

/// Inverse-variance weighted mean of `values` with one-sigma `sigmas`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WeightedMean {
    pub mean: f64,
    pub sigma: f64,
    pub mswd: f64,
}

/// Pairs whose sigma is not a positive finite number are skipped. Returns the
/// all-zero default when nothing usable remains.
pub fn weighted_mean(values: &[f64], sigmas: &[f64]) -> WeightedMean {
    let usable: Vec<(f64, f64)> = values
        .iter()
        .zip(sigmas.iter())
        .filter(|(v, s)| v.is_finite() && s.is_finite() && **s > 0.0)
        .map(|(v, s)| (*v, 1.0 / (s * s)))
        .collect();
    if usable.is_empty() {
        return WeightedMean::default();
    }

    let sum_w: f64 = usable.iter().map(|(_, w)| w).sum();
    let mean = usable.iter().map(|(v, w)| v * w).sum::<f64>() / sum_w;
    let sigma = (1.0 / sum_w).sqrt();
    let mswd = if usable.len() > 1 {
        let chi2: f64 = usable.iter().map(|(v, w)| (v - mean) * (v - mean) * w).sum();
        chi2 / (usable.len() - 1) as f64
    } else {
        0.0
    };
    WeightedMean { mean, sigma, mswd }
}
