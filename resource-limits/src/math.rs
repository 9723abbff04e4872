// Copyright (c) 2024 Botho Foundation

//! Fixed-point helpers used by every consensus computation in this crate.
//!
//! Percentages are integers where [`PERCENT_100`] means 100%. Proportions are
//! computed with a wider intermediate and truncated toward zero, so rounding
//! never creates value. Results that do not fit the narrower type are
//! internal-consistency violations and panic.

/// 100% in percentage units (1 unit = 0.01%).
pub const PERCENT_100: i64 = 10_000;

/// Fixed-point scale of [`crate::UsageAccumulator::value_ex`].
pub const RATE_LIMITING_PRECISION: u64 = 1_000_000;

/// `floor(arg * numer / denom)` computed in i128.
///
/// Panics if `denom` is zero or the result is outside the i64 range.
pub fn safe_prop(arg: i64, numer: i64, denom: i64) -> i64 {
    assert!(denom != 0, "safe_prop: zero denominator");
    let result = (arg as i128 * numer as i128) / denom as i128;
    i64::try_from(result).unwrap_or_else(|_| panic!("safe_prop: {result} out of range"))
}

/// `ceil(arg * numer / denom)` for non-negative operands, computed in i128.
///
/// Panics if `denom` is not positive, an operand is negative, or the result is
/// outside the i64 range.
pub fn safe_prop_ceil(arg: i64, numer: i64, denom: i64) -> i64 {
    assert!(denom > 0, "safe_prop_ceil: non-positive denominator");
    assert!(arg >= 0 && numer >= 0, "safe_prop_ceil: negative operand");
    let product = arg as i128 * numer as i128;
    let denom = denom as i128;
    let result = product / denom + i128::from(product % denom != 0);
    i64::try_from(result).unwrap_or_else(|_| panic!("safe_prop_ceil: {result} out of range"))
}

/// `safe_prop(arg, pct, PERCENT_100)`.
pub fn safe_pct(arg: i64, pct: i64) -> i64 {
    safe_prop(arg, pct, PERCENT_100)
}

/// Ceiling division for unsigned 128-bit operands.
pub fn integer_divide_ceil(num: u128, den: u128) -> u128 {
    assert!(den != 0, "integer_divide_ceil: zero denominator");
    num / den + u128::from(num % den != 0)
}

/// Narrow a u128 into any smaller integer type, panicking instead of
/// truncating.
pub fn downgrade_cast<T: TryFrom<u128>>(value: u128) -> T {
    T::try_from(value)
        .unwrap_or_else(|_| panic!("value {value} does not fit in {}", std::any::type_name::<T>()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_safe_prop_truncates() {
        assert_eq!(safe_prop(1000, 50, 150), 333);
        assert_eq!(safe_prop(1000, 50, 100), 500);
        assert_eq!(safe_prop(7, 1, 2), 3);
        assert_eq!(safe_prop(i64::MAX, i64::MAX, i64::MAX), i64::MAX);
    }

    #[test]
    fn test_safe_prop_ceil() {
        assert_eq!(safe_prop_ceil(7, 1, 2), 4);
        assert_eq!(safe_prop_ceil(8, 1, 2), 4);
        assert_eq!(safe_prop_ceil(0, 5, 3), 0);
    }

    #[test]
    fn test_safe_pct() {
        assert_eq!(safe_pct(1234, PERCENT_100), 1234);
        assert_eq!(safe_pct(1234, 5000), 617);
        assert_eq!(safe_pct(1234, 0), 0);
    }

    #[test]
    #[should_panic(expected = "zero denominator")]
    fn test_safe_prop_zero_denominator_panics() {
        safe_prop(1, 1, 0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_safe_prop_overflow_panics() {
        safe_prop(i64::MAX, 2, 1);
    }

    #[test]
    fn test_integer_divide_ceil() {
        assert_eq!(integer_divide_ceil(10, 5), 2);
        assert_eq!(integer_divide_ceil(11, 5), 3);
        assert_eq!(integer_divide_ceil(0, 5), 0);
    }

    #[test]
    #[should_panic(expected = "does not fit")]
    fn test_downgrade_cast_panics() {
        let _: u64 = downgrade_cast(u64::MAX as u128 + 1);
    }

    proptest! {
        #[test]
        fn prop_safe_prop_within_arg(a in 0i64.., d in 1i64.., n_frac in 0.0f64..=1.0) {
            let n = ((d as f64) * n_frac) as i64;
            let n = n.min(d);
            let result = safe_prop(a, n, d);
            prop_assert!(result >= 0);
            prop_assert!(result <= a);
        }

        #[test]
        fn prop_safe_prop_zero_numerator(a in 0i64.., d in 1i64..) {
            prop_assert_eq!(safe_prop(a, 0, d), 0);
        }
    }
}
