// Copyright (c) 2024 Botho Foundation

//! Elastic (self-adjusting) block limits.
//!
//! The virtual limit contracts while the average block usage stays above the
//! target and expands while it stays at or below it. It never drops below the
//! hard `max` and never exceeds `max * max_multiplier`.

use crate::error::ResourceLimitsError;
use bth_util_u64_ratio::U64Ratio;
use serde::{Deserialize, Serialize};

/// Parameters of one elastic limit (CPU or NET).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElasticLimitParameters {
    /// The desired average usage per block.
    pub target: u64,
    /// The hard per-block maximum, also the floor of the virtual limit.
    pub max: u64,
    /// Number of blocks in the block-usage averaging window.
    pub periods: u32,
    /// Ceiling of the virtual limit, as a multiple of `max`.
    pub max_multiplier: u32,
    /// Applied while average usage is above `target`.
    pub contract_rate: U64Ratio,
    /// Applied while average usage is at or below `target`.
    pub expand_rate: U64Ratio,
}

impl ElasticLimitParameters {
    /// Check the parameters before they are committed to the config.
    pub fn validate(&self) -> Result<(), ResourceLimitsError> {
        if self.periods == 0 {
            return Err(ResourceLimitsError::InvalidElasticLimit(
                "elastic limit parameter 'periods' cannot be zero".to_string(),
            ));
        }
        if !self.contract_rate.is_valid() {
            return Err(ResourceLimitsError::InvalidElasticLimit(
                "elastic limit parameter 'contract_rate' is not a well-defined ratio".to_string(),
            ));
        }
        if !self.expand_rate.is_valid() {
            return Err(ResourceLimitsError::InvalidElasticLimit(
                "elastic limit parameter 'expand_rate' is not a well-defined ratio".to_string(),
            ));
        }
        if self.target > self.max {
            return Err(ResourceLimitsError::InvalidElasticLimit(format!(
                "target {} exceeds max {}",
                self.target, self.max
            )));
        }
        if self.max_multiplier == 0 || self.max.checked_mul(self.max_multiplier as u64).is_none()
        {
            return Err(ResourceLimitsError::InvalidElasticLimit(format!(
                "max {} times max_multiplier {} is not representable",
                self.max, self.max_multiplier
            )));
        }
        Ok(())
    }

    /// Upper bound of the virtual limit.
    pub fn ceiling(&self) -> u64 {
        self.max.saturating_mul(self.max_multiplier as u64)
    }
}

/// Compute the next virtual limit from the current one and the average usage.
///
/// `params` must have passed [`ElasticLimitParameters::validate`].
pub fn update_elastic_limit(
    current_limit: u64,
    average_usage: u64,
    params: &ElasticLimitParameters,
) -> u64 {
    let rate = if average_usage > params.target {
        params.contract_rate
    } else {
        params.expand_rate
    };
    let result = rate.mul_u128_round_down(current_limit);
    let clamped = result.clamp(params.max as u128, params.ceiling() as u128);
    clamped as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn params(max: u64, contract: (u64, u64), expand: (u64, u64)) -> ElasticLimitParameters {
        ElasticLimitParameters {
            target: max / 10,
            max,
            periods: 120,
            max_multiplier: 1000,
            contract_rate: U64Ratio::new(contract.0, contract.1).unwrap(),
            expand_rate: U64Ratio::new(expand.0, expand.1).unwrap(),
        }
    }

    #[test]
    fn test_validate() {
        let good = params(1000, (99, 100), (1000, 999));
        assert!(good.validate().is_ok());

        let mut zero_periods = good;
        zero_periods.periods = 0;
        assert!(matches!(
            zero_periods.validate(),
            Err(ResourceLimitsError::InvalidElasticLimit(_))
        ));

        let mut overflow = good;
        overflow.max = u64::MAX;
        overflow.target = 0;
        assert!(overflow.validate().is_err());

        let mut target_above_max = good;
        target_above_max.target = 1001;
        assert!(target_above_max.validate().is_err());

        let mut zero_multiplier = good;
        zero_multiplier.max_multiplier = 0;
        assert!(matches!(
            zero_multiplier.validate(),
            Err(ResourceLimitsError::InvalidElasticLimit(_))
        ));
    }

    #[test]
    fn test_contract_and_expand() {
        let p = params(1000, (9, 10), (11, 10));
        assert_eq!(update_elastic_limit(5000, 500, &p), 4500);
        assert_eq!(update_elastic_limit(5000, 50, &p), 5500);
        // At target counts as slack.
        assert_eq!(update_elastic_limit(5000, 100, &p), 5500);
    }

    #[test]
    fn test_clamped_to_bounds() {
        let p = params(1000, (1, 2), (3, 1));
        assert_eq!(update_elastic_limit(1000, 900, &p), 1000);
        assert_eq!(update_elastic_limit(999_999, 0, &p), 1_000_000);
    }

    #[test]
    fn test_unit_rate_is_steady_state() {
        let p = params(1000, (7, 7), (3, 3));
        assert_eq!(update_elastic_limit(4321, 900, &p), 4321);
        assert_eq!(update_elastic_limit(4321, 0, &p), 4321);
    }

    #[test]
    fn test_contracts_strictly_toward_floor() {
        let p = params(1000, (9, 10), (1000, 999));
        let mut limit = 2000;
        for _ in 0..5 {
            let next = update_elastic_limit(limit, p.target + 1, &p);
            assert!(next < limit);
            assert!(next >= p.max);
            limit = next;
        }
        for _ in 0..50 {
            limit = update_elastic_limit(limit, p.target + 1, &p);
        }
        assert_eq!(limit, p.max);
    }

    proptest! {
        #[test]
        fn prop_output_stays_in_bounds(
            max in 1u64..1_000_000_000,
            multiplier in 1u32..10_000,
            current_frac in 0.0f64..=1.0,
            usage in any::<u64>(),
            contract_num in 1u64..1000,
            expand_num in 1u64..1000,
        ) {
            let p = ElasticLimitParameters {
                target: max / 2,
                max,
                periods: 10,
                max_multiplier: multiplier,
                contract_rate: U64Ratio::new(contract_num, 1000).unwrap(),
                expand_rate: U64Ratio::new(1000, expand_num).unwrap(),
            };
            prop_assume!(p.validate().is_ok());
            let span = p.ceiling() - p.max;
            let current = p.max + (span as f64 * current_frac) as u64;
            let current = current.min(p.ceiling());
            let next = update_elastic_limit(current, usage, &p);
            prop_assert!(next >= p.max);
            prop_assert!(next <= p.ceiling());
        }
    }
}
