//! On-chain funding and publishing primitives for Lightning channel opens,
//! splices, and their RBF replacements.
//!
//! Two state machines, both modeled as `tokio`-mailbox actors:
//!
//! - [`funder`]: the Interactive-Tx Funder, which builds one side's
//!   contribution to a jointly-constructed funding/splice transaction.
//! - [`publisher`]: the Replaceable-Tx Publisher, which funds, broadcasts,
//!   monitors, and fee-bumps a unilateral claim transaction until it
//!   confirms.
//!
//! Both are driven entirely through the [`wallet_adapter`], [`fee_policy`],
//! [`mempool_monitor`], and [`time_lock`] trait boundaries, so they can be
//! exercised in tests against in-memory doubles without a live node.

pub mod constants;
pub mod error;
pub mod fee_policy;
pub mod funder;
pub mod mempool_monitor;
pub mod publisher;
pub mod serial_id;
pub mod time_lock;
pub mod types;
pub mod wallet_adapter;
