//! Protocol constants for the on-chain funding pipeline.
//!
//! Centralized here (rather than threaded through call sites as magic
//! numbers) the same way the rest of the node keeps its wire-level constants
//! in one place.

use std::time::Duration;

/// The maximum serialized size, in bytes, of a previous transaction carried
/// in a `tx_add_input` message. Inputs whose backing transaction exceeds
/// this are unusable for interactive-tx and must be filtered out.
pub const TX_ADD_INPUT_MAX_ENCODED_SIZE: usize = 65_000;

/// The `nSequence` value used for the shared input, signaling opt-in RBF.
pub const SHARED_INPUT_SEQUENCE: u32 = 0xffff_fffd;

/// The transaction version used for all interactive-tx constructed
/// transactions.
pub const FUNDING_TX_VERSION: i32 = 2;

/// The upper bound of the random jitter applied before issuing a `CheckFee`
/// after observing our current candidate enter the mempool. Spreads out fee
/// bumps across many concurrently-waiting publishers to avoid a broadcast
/// herd.
pub const MAX_TX_PUBLISH_RETRY_DELAY: Duration = Duration::from_secs(30);

/// The minimum multiplicative bump applied to the feerate of a replacement
/// transaction relative to the transaction it replaces.
pub const MIN_FEE_BUMP_RATIO: f64 = 1.2;

/// Once the confirmation deadline is this close (in blocks), `CheckFee`
/// unconditionally bumps to at least `MIN_FEE_BUMP_RATIO` times the previous
/// feerate, regardless of what the fee estimator currently says.
pub const URGENT_DEADLINE_BLOCKS: u32 = 6;

/// The block-target tiers used by the fee policy (see `fee_policy` module),
/// expressed as `(min_blocks_until_deadline, conf_target)` pairs, ordered
/// from most to least relaxed. The first tier whose `min_blocks_until_deadline`
/// is satisfied wins.
pub const FEE_POLICY_TIERS: &[(i64, u32)] = &[
    (144, 144),
    (72, 72),
    (36, 36),
    (18, 12),
    (12, 6),
    (2, 2),
];

/// The block-target used once none of [`FEE_POLICY_TIERS`] apply, i.e. the
/// deadline is at most 1 block away.
pub const FEE_POLICY_FLOOR_CONF_TARGET: u32 = 1;
