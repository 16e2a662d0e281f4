//! Integer arithmetic for block election and fee scaling.

/// Median of `values`; an even count yields the average of the two middle
/// values rounded half up.
///
/// Returns `None` for an empty slice.
pub fn rounded_median(values: &[u64]) -> Option<u64> {
	let wide: Vec<u128> = values.iter().map(|v| *v as u128).collect();
	median_ceil(&wide).map(|m| m as u64)
}

/// Median of `values` with the even-count average rounded up.
///
/// For integers, rounding half up and taking the ceiling of a half agree, so
/// this also serves as the "ceil of median" aggregation of fee rewards.
pub fn median_ceil(values: &[u128]) -> Option<u128> {
	if values.is_empty() {
		return None;
	}
	let mut sorted = values.to_vec();
	sorted.sort_unstable();
	let mid = sorted.len() / 2;
	if sorted.len() % 2 == 1 {
		Some(sorted[mid])
	} else {
		let (low, high) = (sorted[mid - 1], sorted[mid]);
		Some(low / 2 + high / 2 + (low % 2 + high % 2 + 1) / 2)
	}
}

/// `round(value * multiplier^exponent)`, saturating at `u128::MAX`.
pub fn pow_scale(value: u128, multiplier: f64, exponent: u32) -> u128 {
	let factor = multiplier.powi(exponent.min(i32::MAX as u32) as i32);
	(value as f64 * factor).round() as u128
}

/// `ceil(value * numerator / denominator)` in integer arithmetic.
pub fn ceil_mul(value: u128, numerator: u128, denominator: u128) -> u128 {
	if denominator == 0 {
		return u128::MAX;
	}
	let product = value.saturating_mul(numerator);
	product / denominator + u128::from(product % denominator != 0)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_rounded_median_odd_and_even() {
		assert_eq!(rounded_median(&[1, 2, 2]), Some(2));
		assert_eq!(rounded_median(&[3, 4, 1]), Some(3));
		assert_eq!(rounded_median(&[1, 2]), Some(2));
		assert_eq!(rounded_median(&[1, 6, 2]), Some(2));
		assert_eq!(rounded_median(&[3, 8, 100]), Some(8));
		assert_eq!(rounded_median(&[100, 100, 98]), Some(100));
		assert_eq!(rounded_median(&[10, 13]), Some(12));
		assert_eq!(rounded_median(&[]), None);
	}

	#[test]
	fn test_median_ceil_does_not_overflow() {
		assert_eq!(median_ceil(&[u128::MAX, u128::MAX]), Some(u128::MAX));
		assert_eq!(median_ceil(&[u128::MAX - 1, u128::MAX]), Some(u128::MAX));
	}

	#[test]
	fn test_pow_scale() {
		assert_eq!(pow_scale(3, 2.0, 1), 6);
		assert_eq!(pow_scale(3, 2.0, 4), 48);
		assert_eq!(pow_scale(100, 1.125, 0), 100);
		assert_eq!(pow_scale(100, 1.125, 2), 127);
	}

	#[test]
	fn test_ceil_mul() {
		assert_eq!(ceil_mul(100, 101, 100), 101);
		assert_eq!(ceil_mul(101, 101, 100), 103);
		assert_eq!(ceil_mul(0, 101, 100), 0);
		assert_eq!(ceil_mul(1, 101, 100), 2);
	}
}
