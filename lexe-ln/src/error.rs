//! The error taxonomy surfaced at the Funder / Publisher API boundary.
//!
//! Internal plumbing (serialization, arithmetic over/underflow while
//! summing amounts, malformed backing transactions fetched from the wallet)
//! is propagated as `anyhow::Error`-wrapped context, matching the rest of
//! the node's non-public-API code. Only the taxonomy below is exposed to
//! callers of [`crate::funder`] and [`crate::publisher`].

use thiserror::Error;

/// Terminal outcomes of the [`crate::funder::InteractiveTxFunder`].
#[derive(Debug, Error)]
pub enum FundingError {
    /// The Wallet Adapter returned an error while attempting to fund the
    /// dummy transaction. All outpoints tracked by this session (other than
    /// those belonging to a previous funding attempt) are unlocked before
    /// this error is surfaced.
    #[error("wallet error: {0:#}")]
    Wallet(#[source] anyhow::Error),

    /// The wallet re-selected an outpoint that a previous iteration of the
    /// coin-selection loop already determined was unusable, or the funded
    /// transaction is missing the funding output or a required local
    /// output. Both indicate a violation of the UTXO-lock contract between
    /// this session and the wallet; unusable outpoints are kept locked to
    /// prevent the wallet from immediately re-offering them.
    #[error("protocol invariant violation: {0}")]
    ProtocolInvariantViolation(#[from] ProtocolInvariantViolation),
}

/// A violation of the invariants this module relies on the Wallet Adapter
/// upholding. See [`FundingError::ProtocolInvariantViolation`].
#[derive(Debug, Error)]
pub enum ProtocolInvariantViolation {
    #[error("wallet re-selected an outpoint already marked unusable: {0}")]
    UnusableInputReselected(bitcoin::OutPoint),

    #[error("funded transaction is missing the funding output")]
    MissingFundingOutput,

    #[error("funded transaction has more than one output matching the funding script")]
    DuplicateFundingOutput,

    #[error("funded transaction is missing a required local output")]
    MissingLocalOutput,
}

/// Terminal or recoverable outcomes surfaced by the
/// [`crate::publisher::ReplaceableTxPublisher`] state machine to its caller.
/// Unlike [`FundingError`], not every variant here ends the state machine:
/// only the ones returned from the `CheckPreconditions`, `CheckTimeLocks`,
/// and single-attempt `Wait` paths do. RBF failures of a replacement
/// attempt are handled internally (`CleanUpFailedTxAndWait`) and never
/// reach the caller.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The Pre-Publisher rejected the transaction outright; nothing was
    /// ever locked, so no cleanup is required.
    #[error("precondition check failed: {0}")]
    PreconditionFailed(String),

    /// Funding the initial (non-replacement) transaction failed.
    #[error("funding failed: {0}")]
    Funding(#[from] FundingError),

    /// The transaction was rejected from the mempool and this was the only
    /// attempt ever made (no RBF history to fall back on).
    #[error("transaction rejected: {0}")]
    Rejected(String),
}
