//! The Mempool Monitor: notifies the Replaceable-Tx Publisher of a tracked
//! transaction's mempool and confirmation status.

use bitcoin::Txid;
use tokio::sync::mpsc;

/// A mempool/chain event concerning a transaction the publisher is
/// currently watching.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MempoolEvent {
    /// The transaction was accepted into the mempool, at the given chain
    /// tip height.
    TxInMempool { height: u32 },
    /// The transaction has confirmed, but not yet deeply enough to stop
    /// watching it (a reorg could still evict it).
    TxRecentlyConfirmed { depth: u32 },
    /// The transaction has accumulated enough confirmations that the
    /// publisher can stop tracking it and tell its caller it's done. This
    /// is always the last event delivered for a given watch.
    TxDeeplyBuried { depth: u32 },
    /// The transaction (or all of its ancestry) was evicted from the
    /// mempool and did not confirm, e.g. a conflicting transaction
    /// confirmed first or it expired from the mempool. Always the last
    /// event delivered for a given watch.
    TxRejected { reason: String },
}

impl MempoolEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MempoolEvent::TxDeeplyBuried { .. }
                | MempoolEvent::TxRejected { .. }
        )
    }
}

/// The confirmation depth at which a [`MempoolEvent::TxRecentlyConfirmed`]
/// is upgraded to [`MempoolEvent::TxDeeplyBuried`].
pub const DEEPLY_BURIED_CONFIRMATIONS: u32 = 6;

/// Watches a single transaction's progress from broadcast through deep
/// confirmation, delivering a sequence of [`MempoolEvent`]s ending in
/// exactly one terminal event.
pub trait MempoolMonitor: Send + Sync {
    /// Starts (or restarts, after a replacement) watching `txid`. Events
    /// are delivered on the returned channel until a terminal event is
    /// sent, at which point the channel closes.
    fn watch(&self, txid: Txid) -> mpsc::UnboundedReceiver<MempoolEvent>;

    /// Stops watching a txid, e.g. because it was replaced by a higher-fee
    /// transaction and is no longer relevant. Idempotent.
    fn stop_watching(&self, txid: Txid);
}
