//! Fee policy for the Replaceable-Tx Publisher's `CheckFee` step.
//!
//! Maps "blocks remaining until the confirmation deadline" to a conf-target
//! to hand the node's fee estimator, tightening as the deadline approaches,
//! and separately decides whether a replacement is worth broadcasting given
//! the minimum required fee bump.

use async_trait::async_trait;
use bitcoin::FeeRate;

use crate::constants::{
    FEE_POLICY_FLOOR_CONF_TARGET, FEE_POLICY_TIERS, MIN_FEE_BUMP_RATIO,
    URGENT_DEADLINE_BLOCKS,
};

/// A source of current feerate estimates, keyed by confirmation target (in
/// blocks). Implemented over the node's existing fee estimation
/// infrastructure; mocked in tests with a fixed table.
#[async_trait]
pub trait FeeEstimator: Send + Sync {
    /// Returns the estimated feerate needed to confirm within
    /// `conf_target` blocks. Never returns `None` for a reasonable
    /// `conf_target`; callers should treat a missing estimate as "use the
    /// node's minimum relay feerate".
    async fn estimate_feerate(&self, conf_target: u32) -> Option<FeeRate>;
}

/// Picks the confirmation target to request from a [`FeeEstimator`] given
/// how many blocks remain until the claim's absolute deadline (e.g. a CSV or
/// CLTV expiry).
///
/// Monotonic by construction: the tiers in [`FEE_POLICY_TIERS`] are ordered
/// from most to least relaxed and the first one satisfied wins, so a
/// smaller `blocks_remaining` can never produce a larger (more relaxed)
/// conf-target than a larger `blocks_remaining` did.
pub fn conf_target_for_deadline(blocks_remaining: i64) -> u32 {
    for (min_blocks, conf_target) in FEE_POLICY_TIERS {
        if blocks_remaining >= *min_blocks {
            return *conf_target;
        }
    }
    FEE_POLICY_FLOOR_CONF_TARGET
}

/// Whether the deadline is close enough that `CheckFee` should bump
/// unconditionally rather than deferring to the fee estimator's opinion.
pub fn is_urgent(blocks_remaining: i64) -> bool {
    blocks_remaining <= URGENT_DEADLINE_BLOCKS as i64
}

/// The minimum feerate a replacement transaction must carry relative to the
/// transaction it replaces, per BIP 125 rule 4 (paid for by the rest of the
/// node's RBF-compliant construction) and this module's own
/// [`MIN_FEE_BUMP_RATIO`] floor.
pub fn min_replacement_feerate(previous: FeeRate) -> FeeRate {
    let prev_sat_kwu = previous.to_sat_per_kwu();
    let bumped = (prev_sat_kwu as f64 * MIN_FEE_BUMP_RATIO).ceil() as u64;
    FeeRate::from_sat_per_kwu(bumped.max(prev_sat_kwu + 1))
}

/// Decides the feerate to use for a (possible) replacement, given the
/// estimator's current opinion, the urgency of the deadline, and the
/// previous transaction's feerate (`None` on a first attempt).
///
/// Returns `None` if no replacement is warranted: the estimator's feerate is
/// at or below the previous attempt's, and the deadline isn't urgent enough
/// to force a bump anyway.
pub fn decide_feerate(
    estimated: Option<FeeRate>,
    previous: Option<FeeRate>,
    blocks_remaining: i64,
) -> Option<FeeRate> {
    let urgent = is_urgent(blocks_remaining);

    match previous {
        None => estimated,
        Some(previous) => {
            let floor = min_replacement_feerate(previous);
            match estimated {
                Some(estimated) if estimated >= floor => Some(estimated),
                _ if urgent => Some(floor),
                _ => None,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn floor_conf_target_below_every_tier() {
        assert_eq!(conf_target_for_deadline(1), FEE_POLICY_FLOOR_CONF_TARGET);
        assert_eq!(conf_target_for_deadline(0), FEE_POLICY_FLOOR_CONF_TARGET);
        assert_eq!(
            conf_target_for_deadline(-10),
            FEE_POLICY_FLOOR_CONF_TARGET
        );
    }

    #[test]
    fn top_tier_at_or_above_144() {
        assert_eq!(conf_target_for_deadline(144), 144);
        assert_eq!(conf_target_for_deadline(1000), 144);
    }

    proptest! {
        /// conf_target_for_deadline is monotonically non-increasing as the
        /// deadline approaches (smaller blocks_remaining never yields a
        /// larger/more-relaxed conf_target).
        #[test]
        fn conf_target_is_monotonic(a in -50i64..2000, delta in 0i64..2000) {
            let b = a + delta;
            let conf_target_a = conf_target_for_deadline(a);
            let conf_target_b = conf_target_for_deadline(b);
            prop_assert!(conf_target_b <= conf_target_a);
        }

        #[test]
        fn bump_ratio_always_at_least_min(sat_per_kwu in 1u64..1_000_000) {
            let previous = FeeRate::from_sat_per_kwu(sat_per_kwu);
            let bumped = min_replacement_feerate(previous);
            prop_assert!(bumped.to_sat_per_kwu() > previous.to_sat_per_kwu());
            let ratio = bumped.to_sat_per_kwu() as f64 / previous.to_sat_per_kwu() as f64;
            prop_assert!(ratio >= MIN_FEE_BUMP_RATIO - 1e-9);
        }
    }

    #[test]
    fn first_attempt_uses_estimate_directly() {
        let estimated = FeeRate::from_sat_per_kwu(500);
        assert_eq!(decide_feerate(Some(estimated), None, 100), Some(estimated));
    }

    #[test]
    fn stale_estimate_below_floor_defers_unless_urgent() {
        let previous = FeeRate::from_sat_per_kwu(1000);
        let stale = FeeRate::from_sat_per_kwu(1000);
        assert_eq!(decide_feerate(Some(stale), Some(previous), 100), None);

        let floor = min_replacement_feerate(previous);
        assert_eq!(
            decide_feerate(Some(stale), Some(previous), 3),
            Some(floor)
        );
    }

    #[test]
    fn estimate_above_floor_wins_even_when_urgent() {
        let previous = FeeRate::from_sat_per_kwu(1000);
        let generous =
            FeeRate::from_sat_per_kwu(min_replacement_feerate(previous).to_sat_per_kwu() * 2);
        assert_eq!(
            decide_feerate(Some(generous), Some(previous), 1),
            Some(generous)
        );
    }
}
