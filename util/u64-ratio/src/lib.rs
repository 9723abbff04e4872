// Copyright (c) 2024 Botho Foundation

//! A helper for computing with ratios of u64 numbers.
//!
//! Consensus code must not use floating point, so rates such as "contract by
//! 1%" are expressed as an exact `num / denom` pair. Multiplication goes
//! through a `u128` intermediate, so `value * num` never overflows before the
//! division.

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

/// A ratio `num / denom` of two u64 numbers.
///
/// A ratio built with [`U64Ratio::new`] always has a non-zero denominator.
/// A ratio obtained by deserialization may not; callers validate it with
/// [`U64Ratio::is_valid`] before using it.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct U64Ratio {
    num: u64,
    denom: u64,
}

impl U64Ratio {
    /// Create a new ratio. Returns `None` if the denominator is zero.
    pub const fn new(num: u64, denom: u64) -> Option<Self> {
        if denom == 0 {
            None
        } else {
            Some(Self { num, denom })
        }
    }

    /// True if the denominator is non-zero.
    pub const fn is_valid(&self) -> bool {
        self.denom != 0
    }

    /// Multiply `val` by this ratio, rounding down, as a u128.
    ///
    /// Panics if the denominator is zero.
    pub fn mul_u128_round_down(&self, val: u64) -> u128 {
        assert!(self.denom != 0, "ratio denominator must not be zero");
        (val as u128 * self.num as u128) / self.denom as u128
    }
}
