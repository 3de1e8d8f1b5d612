//! The Time-Lock Monitor: blocks the Replaceable-Tx Publisher's
//! `CheckTimeLocks` step until every input the claim transaction will spend
//! is actually spendable (its CSV/CLTV relative or absolute lock has
//! matured).

use async_trait::async_trait;
use bitcoin::{OutPoint, Sequence};

/// One input's time-lock requirement: either none, a CSV relative lock
/// measured from the input's own confirmation, or a CLTV absolute lock
/// against the chain tip.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TimeLock {
    None,
    RelativeBlocks(Sequence),
    AbsoluteHeight(u32),
}

/// Checks whether a set of claim-transaction inputs have matured, and can
/// wait asynchronously until they do.
#[async_trait]
pub trait TimeLockChecker: Send + Sync {
    /// Returns `true` if every `(outpoint, lock)` pair is already
    /// spendable at the current chain tip.
    async fn all_matured(&self, inputs: &[(OutPoint, TimeLock)]) -> bool;

    /// Resolves once every `(outpoint, lock)` pair has matured. Used by
    /// `CheckTimeLocks` to suspend rather than poll.
    async fn wait_until_matured(&self, inputs: &[(OutPoint, TimeLock)]);
}
