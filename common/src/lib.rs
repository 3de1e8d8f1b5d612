//! The `common` crate contains small, dependency-light utilities shared
//! between the node's long-lived actors. Nothing in here is specific to
//! Bitcoin or Lightning; see the `lexe-ln` crate for that.

/// Exponential backoff.
pub mod backoff;
/// Random number generation.
pub mod rng;
/// A synchronization primitive for broadcasting a one-shot shutdown signal.
pub mod shutdown;
/// A thin, `#[must_use]` wrapper around [`tokio::task::JoinHandle`].
pub mod task;
