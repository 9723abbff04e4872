// Copyright (c) 2024 Botho Foundation

//! Fixed-window moving average of a per-slot quantity.
//!
//! A slot is one block (for block-level averages) or one account time slot.
//! Each slot's total contributes `value / window_size` to the average, and that
//! contribution decays linearly to zero over the next `window_size` slots.
//! The average is kept in fixed point (scaled by
//! [`RATE_LIMITING_PRECISION`]) and reported rounded up, so usage is never
//! under-reported.

use crate::math::{downgrade_cast, integer_divide_ceil, RATE_LIMITING_PRECISION};
use serde::{Deserialize, Serialize};

/// Decaying average of a scalar quantity over a rolling window of slots.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsageAccumulator {
    /// Last slot ordinal folded into the average.
    pub last_ordinal: u32,
    /// Average per slot, scaled by `RATE_LIMITING_PRECISION`.
    pub value_ex: u64,
    /// Total raw units added during slot `last_ordinal`, summed over every
    /// call in that slot.
    pub consumed: u64,
}

impl UsageAccumulator {
    /// Fold `units` into the slot `ordinal`.
    ///
    /// Moving to a later slot first decays the history by the number of slots
    /// skipped; a gap of `window_size` or more erases it entirely.
    ///
    /// Panics if `ordinal` is lower than the last ordinal, if `window_size` is
    /// zero, or if the scaled average no longer fits in a u64.
    pub fn add(&mut self, units: u64, ordinal: u32, window_size: u32) {
        assert!(window_size > 0, "usage accumulator window must be non-zero");

        if ordinal != self.last_ordinal {
            assert!(
                ordinal > self.last_ordinal,
                "new ordinal {} cannot be less than the previous ordinal {}",
                ordinal,
                self.last_ordinal
            );

            let window = window_size as u64;
            if self.last_ordinal as u64 + window > ordinal as u64 {
                let delta = (ordinal - self.last_ordinal) as u64;
                let decayed = self.value_ex as u128 * (window - delta) as u128 / window as u128;
                self.value_ex = downgrade_cast(decayed);
            } else {
                self.value_ex = 0;
            }

            self.last_ordinal = ordinal;
            self.consumed = 0;
        }

        self.consumed = downgrade_cast(self.consumed as u128 + units as u128);

        let contribution = integer_divide_ceil(
            units as u128 * RATE_LIMITING_PRECISION as u128,
            window_size as u128,
        );
        self.value_ex = downgrade_cast(self.value_ex as u128 + contribution);
    }

    /// The current average per slot, rounded up.
    pub fn average(&self) -> u64 {
        downgrade_cast(integer_divide_ceil(
            self.value_ex as u128,
            RATE_LIMITING_PRECISION as u128,
        ))
    }

    /// Usage over a whole window of `window_size` slots, rounded up.
    pub fn value_in_window(&self, window_size: u32) -> u64 {
        downgrade_cast(integer_divide_ceil(
            self.value_ex as u128 * window_size as u128,
            RATE_LIMITING_PRECISION as u128,
        ))
    }
}
