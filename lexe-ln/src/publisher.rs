//! The Replaceable-Tx Publisher: funds, publishes, monitors, and RBFs a
//! claim transaction until it confirms or is abandoned.
//!
//! A sequential state machine: `CheckPreconditions -> CheckTimeLocks -> Fund
//! -> Wait`, with `Wait` cycling through `FundReplacement` and
//! `CleanUpFailed` as mempool events and fee-check timers arrive, until a
//! `TxDeeplyBuried` or `Stop` drives it to `UnlockAndStop`.
//!
//! Commands not yet expected while a wallet call is outstanding (a `Stop`
//! arriving mid-`Fund`, a stale mempool event arriving mid-`FundReplacement`)
//! are not dropped: since this actor only drains its own mailbox from
//! within [`ReplaceableTxPublisher::wait_loop`], any command sent while a
//! suspension point elsewhere is in flight simply queues in the mailbox and
//! is handled as soon as `Wait` resumes reading it, which gives the same
//! defer-and-redeliver behavior without a second timer-based mechanism.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::{Amount, FeeRate, OutPoint, Transaction, Txid};
use common::rng::Crng;
use common::shutdown::ShutdownChannel;
use common::task::LxTask;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, instrument, warn};

use crate::constants::MAX_TX_PUBLISH_RETRY_DELAY;
use crate::error::{FundingError, PublishError};
use crate::fee_policy::{self, FeeEstimator};
use crate::mempool_monitor::{MempoolEvent, MempoolMonitor};
use crate::time_lock::{TimeLock, TimeLockChecker};
use crate::types::FundedTx;
use crate::wallet_adapter::{FundTxRequest, WalletAdapter};

/// Validates a claim transaction's semantics before any wallet call is
/// made. Out of scope to implement fully here; only the interface this
/// state machine consumes is defined.
#[async_trait]
pub trait PrePublisher: Send + Sync {
    async fn check(&self, tx: &Transaction) -> Result<(), String>;
}

/// The current chain tip height. Out of scope to implement fully here
/// (block-height tracking is an external collaborator); only the interface
/// this state machine consumes is defined.
pub trait ChainTip: Send + Sync {
    fn current_height(&self) -> u32;
}

/// Parameters for one claim transaction's publish-and-RBF lifecycle.
#[derive(Clone, Debug)]
pub struct PublisherParams {
    /// The unfunded skeleton transaction: the claim input plus whatever
    /// fixed outputs the claim requires.
    pub claim_template: Transaction,
    /// The original claim outpoint. Common to every funded attempt; kept
    /// locked for retry by other components even after this instance
    /// terminates.
    pub claim_input: OutPoint,
    pub confirm_before_height: u32,
    /// Anchor-claim transactions skip `CheckTimeLocks` entirely.
    pub is_anchor_claim: bool,
    pub time_locks: Vec<(OutPoint, TimeLock)>,
    pub require_confirmed_inputs: bool,
}

/// The terminal, non-error outcome of a publish lifecycle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PublishOutcome {
    Confirmed { txid: Txid },
    /// Stopped cooperatively before confirming; not a failure.
    Stopped,
}

enum Command {
    Mempool { txid: Txid, event: MempoolEvent },
    CheckFee { height: u32 },
    Stop,
}

/// A handle to a spawned [`ReplaceableTxPublisher`] actor.
#[derive(Clone)]
pub struct ReplaceableTxPublisherHandle {
    tx: mpsc::Sender<Command>,
}

impl ReplaceableTxPublisherHandle {
    pub async fn stop(&self) {
        let _ = self.tx.send(Command::Stop).await;
    }
}

/// The actor backing a [`ReplaceableTxPublisherHandle`].
pub struct ReplaceableTxPublisher<R> {
    params: PublisherParams,
    wallet: Arc<dyn WalletAdapter>,
    mempool_monitor: Arc<dyn MempoolMonitor>,
    time_lock_checker: Arc<dyn TimeLockChecker>,
    pre_publisher: Arc<dyn PrePublisher>,
    fee_estimator: Arc<dyn FeeEstimator>,
    chain_tip: Arc<dyn ChainTip>,
    rng: R,
    self_tx: mpsc::Sender<Command>,
    /// Set by [`Self::handle_mempool_event`] when an event decides the
    /// overall outcome (confirmation, or rejection with nothing left to
    /// fall back on); consumed by [`Self::wait_loop`] right after.
    pending_terminal: Option<Result<PublishOutcome, PublishError>>,
}

#[allow(clippy::too_many_arguments)]
impl<R: Crng + Send + 'static> ReplaceableTxPublisher<R> {
    /// Spawns the publisher actor. The returned `oneshot::Receiver` resolves
    /// exactly once, with the terminal outcome of this claim's lifecycle.
    pub fn spawn(
        params: PublisherParams,
        wallet: Arc<dyn WalletAdapter>,
        mempool_monitor: Arc<dyn MempoolMonitor>,
        time_lock_checker: Arc<dyn TimeLockChecker>,
        pre_publisher: Arc<dyn PrePublisher>,
        fee_estimator: Arc<dyn FeeEstimator>,
        chain_tip: Arc<dyn ChainTip>,
        rng: R,
        shutdown: ShutdownChannel,
    ) -> (
        ReplaceableTxPublisherHandle,
        oneshot::Receiver<Result<PublishOutcome, PublishError>>,
        LxTask<()>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (reply_tx, reply_rx) = oneshot::channel();
        let actor = Self {
            params,
            wallet,
            mempool_monitor,
            time_lock_checker,
            pre_publisher,
            fee_estimator,
            chain_tip,
            rng,
            self_tx: cmd_tx.clone(),
            pending_terminal: None,
        };
        let task = LxTask::spawn_named(
            "replaceable-tx-publisher",
            actor.run(cmd_rx, reply_tx, shutdown),
        );
        (ReplaceableTxPublisherHandle { tx: cmd_tx }, reply_rx, task)
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<Command>,
        reply_tx: oneshot::Sender<Result<PublishOutcome, PublishError>>,
        mut shutdown: ShutdownChannel,
    ) {
        let result = self.drive(&mut rx, &mut shutdown).await;
        let _ = reply_tx.send(result);
    }

    #[instrument(skip(self, rx, shutdown))]
    async fn drive(
        &mut self,
        rx: &mut mpsc::Receiver<Command>,
        shutdown: &mut ShutdownChannel,
    ) -> Result<PublishOutcome, PublishError> {
        if let Err(reason) =
            self.pre_publisher.check(&self.params.claim_template).await
        {
            info!(%reason, "precondition check failed");
            return Err(PublishError::PreconditionFailed(reason));
        }

        if !self.params.is_anchor_claim {
            self.time_lock_checker
                .wait_until_matured(&self.params.time_locks)
                .await;
        }

        let height = self.chain_tip.current_height();
        let target_feerate = self.target_feerate(height).await;
        let first = self
            .fund_claim(self.params.claim_template.clone(), target_feerate)
            .await
            .map_err(PublishError::Funding)?;

        info!(txid = %first.txid(), feerate = ?first.feerate, "claim transaction funded");
        self.start_watch(first.txid());
        let txs = vec![first];

        self.wait_loop(rx, shutdown, txs).await
    }

    async fn target_feerate(&self, height: u32) -> FeeRate {
        let blocks_remaining =
            self.params.confirm_before_height as i64 - height as i64;
        let conf_target = fee_policy::conf_target_for_deadline(blocks_remaining);
        self.fee_estimator
            .estimate_feerate(conf_target)
            .await
            .unwrap_or_else(|| FeeRate::from_sat_per_vb(1).unwrap())
    }

    async fn wait_loop(
        &mut self,
        rx: &mut mpsc::Receiver<Command>,
        shutdown: &mut ShutdownChannel,
        mut txs: Vec<FundedTx>,
    ) -> Result<PublishOutcome, PublishError> {
        loop {
            let command = tokio::select! {
                command = rx.recv() => command,
                () = shutdown.recv() => Some(Command::Stop),
            };

            let Some(command) = command else {
                self.unlock_and_stop(&txs).await;
                return Ok(PublishOutcome::Stopped);
            };

            match command {
                Command::Mempool { txid, event } => {
                    self.handle_mempool_event(&mut txs, txid, event).await;
                    if let Some(outcome) = self.pending_terminal.take() {
                        return outcome;
                    }
                }
                Command::CheckFee { height } => {
                    self.handle_check_fee(&mut txs, height).await;
                }
                Command::Stop => {
                    self.unlock_and_stop(&txs).await;
                    return Ok(PublishOutcome::Stopped);
                }
            }
        }
    }

    async fn handle_mempool_event(
        &mut self,
        txs: &mut Vec<FundedTx>,
        txid: Txid,
        event: MempoolEvent,
    ) {
        match event {
            MempoolEvent::TxInMempool { height } => {
                if txs.last().map(|t| t.txid()) == Some(txid) {
                    self.schedule_check_fee(height);
                }
            }
            MempoolEvent::TxRecentlyConfirmed { depth } => {
                info!(%txid, depth, "transaction recently confirmed, awaiting burial");
            }
            MempoolEvent::TxDeeplyBuried { depth } => {
                info!(%txid, depth, "transaction deeply buried, confirmed");
                self.unlock_and_stop(txs).await;
                self.pending_terminal =
                    Some(Ok(PublishOutcome::Confirmed { txid }));
            }
            MempoolEvent::TxRejected { reason } => {
                if let Some(idx) = txs.iter().position(|t| t.txid() == txid) {
                    let failed = txs.remove(idx);
                    self.clean_up_failed(&failed, txs).await;
                    if txs.is_empty() {
                        self.pending_terminal =
                            Some(Err(PublishError::Rejected(reason)));
                    }
                } else {
                    info!(%txid, "ignoring rejection of an already-superseded attempt");
                }
            }
        }
    }

    async fn handle_check_fee(&mut self, txs: &mut Vec<FundedTx>, height: u32) {
        let Some(last) = txs.last() else { return };
        let blocks_remaining =
            self.params.confirm_before_height as i64 - height as i64;
        let conf_target = fee_policy::conf_target_for_deadline(blocks_remaining);
        let estimated = self.fee_estimator.estimate_feerate(conf_target).await;
        let target = fee_policy::decide_feerate(
            estimated,
            Some(last.feerate),
            blocks_remaining,
        );

        let Some(target) = target else { return };

        let previous = last.clone();
        match self.fund_claim(previous.tx.clone(), target).await {
            Ok(replacement) => {
                info!(
                    old_txid = %previous.txid(),
                    new_txid = %replacement.txid(),
                    feerate = ?replacement.feerate,
                    "funded replacement transaction"
                );
                self.start_watch(replacement.txid());
                txs.push(replacement);
            }
            Err(err) => {
                warn!(%err, "failed to fund replacement transaction, remaining on current candidate");
            }
        }
    }

    async fn fund_claim(
        &self,
        template: Transaction,
        target_feerate: FeeRate,
    ) -> Result<FundedTx, FundingError> {
        let request = FundTxRequest {
            template,
            target_feerate,
            require_confirmed_inputs: self.params.require_confirmed_inputs,
            excluded_outpoints: Vec::new(),
            external_inputs: Vec::new(),
            fee_budget: None,
        };
        let response = self
            .wallet
            .fund_transaction(request)
            .await
            .map_err(FundingError::Wallet)?;
        let feerate = effective_feerate(&response.tx, response.fee);
        Ok(FundedTx { tx: response.tx, feerate, fee: response.fee })
    }

    fn start_watch(&self, txid: Txid) {
        let mut receiver = self.mempool_monitor.watch(txid);
        let self_tx = self.self_tx.clone();
        let _ = LxTask::spawn_named("mempool-watch-forward", async move {
            while let Some(event) = receiver.recv().await {
                let terminal = event.is_terminal();
                if self_tx.send(Command::Mempool { txid, event }).await.is_err()
                {
                    return;
                }
                if terminal {
                    return;
                }
            }
        });
    }

    fn schedule_check_fee(&mut self, height: u32) {
        let max_delay_ms = MAX_TX_PUBLISH_RETRY_DELAY.as_millis().max(1) as u64;
        let jitter_ms = 1 + (self.rng.next_u64() % max_delay_ms);
        let self_tx = self.self_tx.clone();
        let _ = LxTask::spawn_named("check-fee-timer", async move {
            tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
            let _ = self_tx.send(Command::CheckFee { height }).await;
        });
    }

    async fn clean_up_failed(&self, failed: &FundedTx, remaining: &[FundedTx]) {
        if let Err(err) = self.wallet.abandon_transaction(failed.txid()).await
        {
            warn!(%err, txid = %failed.txid(), "failed to abandon replaced transaction");
        }
        self.mempool_monitor.stop_watching(failed.txid());

        let live: HashSet<OutPoint> =
            remaining.iter().flat_map(|t| t.input_outpoints()).collect();
        let to_unlock: Vec<OutPoint> = failed
            .input_outpoints()
            .filter(|outpoint| !live.contains(outpoint))
            .collect();
        if let Err(err) = self.wallet.unlock_outpoints(&to_unlock).await {
            warn!(%err, "failed to unlock outpoints of a cleaned-up transaction");
        }
    }

    async fn unlock_and_stop(&self, txs: &[FundedTx]) {
        for tx in txs {
            if let Err(err) = self.wallet.abandon_transaction(tx.txid()).await
            {
                warn!(%err, txid = %tx.txid(), "failed to abandon transaction during shutdown");
            }
            self.mempool_monitor.stop_watching(tx.txid());
        }

        let mut to_unlock: HashSet<OutPoint> =
            txs.iter().flat_map(|t| t.input_outpoints()).collect();
        to_unlock.remove(&self.params.claim_input);

        let to_unlock: Vec<OutPoint> = to_unlock.into_iter().collect();
        if let Err(err) = self.wallet.unlock_outpoints(&to_unlock).await {
            warn!(%err, "failed to unlock outpoints during shutdown");
        }
    }
}

fn effective_feerate(tx: &Transaction, fee: Amount) -> FeeRate {
    let wu = tx.weight().to_wu().max(1) as u128;
    let sat_per_kwu = (fee.to_sat() as u128 * 1000 / wu) as u64;
    FeeRate::from_sat_per_kwu(sat_per_kwu.max(1))
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{ScriptBuf, TxIn, TxOut, Txid};
    use common::rng::SmallRng;
    use rand_core::SeedableRng;

    use super::*;
    use crate::mempool_monitor::mock::MockMempoolMonitor;
    use crate::time_lock::mock::MockTimeLockChecker;
    use crate::wallet_adapter::mock::MockWalletAdapter;

    struct AllowAll;

    #[async_trait]
    impl PrePublisher for AllowAll {
        async fn check(&self, _tx: &Transaction) -> Result<(), String> {
            Ok(())
        }
    }

    struct FixedHeight(AtomicU32);

    impl ChainTip for FixedHeight {
        fn current_height(&self) -> u32 {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct FixedFeeEstimator(FeeRate);

    #[async_trait]
    impl FeeEstimator for FixedFeeEstimator {
        async fn estimate_feerate(&self, _conf_target: u32) -> Option<FeeRate> {
            Some(self.0)
        }
    }

    fn txid(byte: u8) -> Txid {
        Txid::from_byte_array([byte; 32])
    }

    fn claim_template() -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint { txid: txid(1), vout: 0 },
                script_sig: ScriptBuf::new(),
                sequence: bitcoin::Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: bitcoin::Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(10_000),
                script_pubkey: ScriptBuf::new(),
            }],
        }
    }

    fn params() -> PublisherParams {
        PublisherParams {
            claim_template: claim_template(),
            claim_input: OutPoint { txid: txid(1), vout: 0 },
            confirm_before_height: 700_000,
            is_anchor_claim: true,
            time_locks: Vec::new(),
            require_confirmed_inputs: false,
        }
    }

    /// The mock wallet's `fund_transaction` is a deterministic, single-pass
    /// coin selection; replicate its result here so the test can predict the
    /// funded txid without reaching into the wallet's internals.
    fn expected_funded_tx(extra_input_outpoint: OutPoint) -> Transaction {
        let mut tx = claim_template();
        tx.input.push(TxIn {
            previous_output: extra_input_outpoint,
            script_sig: ScriptBuf::new(),
            sequence: bitcoin::Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: bitcoin::Witness::new(),
        });
        tx.output.push(TxOut {
            value: Amount::from_sat(9_500), // 20_000 - 10_000 claim - 500 fee
            script_pubkey: ScriptBuf::new(),
        });
        tx
    }

    /// Scenario: claim transaction funds, publishes, and confirms deeply
    /// without any fee bump.
    #[tokio::test]
    async fn confirms_without_rbf() {
        let wallet = Arc::new(MockWalletAdapter::new());
        let utxo_outpoint = OutPoint { txid: txid(2), vout: 0 };
        wallet.add_utxo(
            utxo_outpoint,
            Amount::from_sat(20_000),
            bitcoin::Weight::ZERO,
            true,
        );
        let mempool = Arc::new(MockMempoolMonitor::new());
        let time_locks = Arc::new(MockTimeLockChecker::new(true));

        let (_handle, reply_rx, _task) = ReplaceableTxPublisher::spawn(
            params(),
            wallet.clone(),
            mempool.clone(),
            time_locks,
            Arc::new(AllowAll),
            Arc::new(FixedFeeEstimator(FeeRate::from_sat_per_vb(2).unwrap())),
            Arc::new(FixedHeight(AtomicU32::new(699_990))),
            SmallRng::from_seed_u64(1),
            ShutdownChannel::new(),
        );

        // Give the actor a moment to fund and start watching the result.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!wallet.locked_outpoints().is_empty());

        let funded_txid = expected_funded_tx(utxo_outpoint).compute_txid();
        mempool.emit(funded_txid, MempoolEvent::TxInMempool { height: 699_991 });
        mempool.emit(funded_txid, MempoolEvent::TxDeeplyBuried { depth: 6 });

        let outcome = tokio::time::timeout(Duration::from_secs(1), reply_rx)
            .await
            .expect("publisher did not reply in time")
            .expect("publisher reply channel dropped")
            .expect("expected a successful outcome");
        assert_eq!(outcome, PublishOutcome::Confirmed { txid: funded_txid });
    }

    /// Scenario: the sole attempt is rejected from the mempool with no RBF
    /// history to fall back on; the publisher reports a terminal rejection.
    #[tokio::test]
    async fn sole_attempt_rejection_is_terminal() {
        let wallet = Arc::new(MockWalletAdapter::new());
        let utxo_outpoint = OutPoint { txid: txid(3), vout: 0 };
        wallet.add_utxo(
            utxo_outpoint,
            Amount::from_sat(20_000),
            bitcoin::Weight::ZERO,
            true,
        );
        let mempool = Arc::new(MockMempoolMonitor::new());
        let time_locks = Arc::new(MockTimeLockChecker::new(true));

        let (_handle, reply_rx, _task) = ReplaceableTxPublisher::spawn(
            params(),
            wallet.clone(),
            mempool.clone(),
            time_locks,
            Arc::new(AllowAll),
            Arc::new(FixedFeeEstimator(FeeRate::from_sat_per_vb(2).unwrap())),
            Arc::new(FixedHeight(AtomicU32::new(699_990))),
            SmallRng::from_seed_u64(2),
            ShutdownChannel::new(),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;

        let funded_txid = expected_funded_tx(utxo_outpoint).compute_txid();
        mempool.emit(
            funded_txid,
            MempoolEvent::TxRejected { reason: "conflicting tx confirmed first".into() },
        );

        let outcome = tokio::time::timeout(Duration::from_secs(1), reply_rx)
            .await
            .expect("publisher did not reply in time")
            .expect("publisher reply channel dropped");
        assert!(matches!(outcome, Err(PublishError::Rejected(_))));
    }

    /// Scenario: a `Stop` command drives `UnlockAndStop` instead of an
    /// error, and leaves the original claim input unlocked for retry.
    #[tokio::test]
    async fn stop_unlocks_everything_but_the_claim_input() {
        let wallet = Arc::new(MockWalletAdapter::new());
        let utxo_outpoint = OutPoint { txid: txid(4), vout: 0 };
        wallet.add_utxo(
            utxo_outpoint,
            Amount::from_sat(20_000),
            bitcoin::Weight::ZERO,
            true,
        );
        let mempool = Arc::new(MockMempoolMonitor::new());
        let time_locks = Arc::new(MockTimeLockChecker::new(true));

        let (handle, reply_rx, _task) = ReplaceableTxPublisher::spawn(
            params(),
            wallet.clone(),
            mempool.clone(),
            time_locks,
            Arc::new(AllowAll),
            Arc::new(FixedFeeEstimator(FeeRate::from_sat_per_vb(2).unwrap())),
            Arc::new(FixedHeight(AtomicU32::new(699_990))),
            SmallRng::from_seed_u64(3),
            ShutdownChannel::new(),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.stop().await;

        let outcome = tokio::time::timeout(Duration::from_secs(1), reply_rx)
            .await
            .expect("publisher did not reply in time")
            .expect("publisher reply channel dropped")
            .expect("stop should not be an error");
        assert_eq!(outcome, PublishOutcome::Stopped);
        // The wallet-selected input is unlocked again; the claim input was
        // never a wallet UTXO to begin with.
        assert!(wallet.locked_outpoints().is_empty());
    }

    #[test]
    fn effective_feerate_is_reasonable() {
        let tx = claim_template();
        let fee = Amount::from_sat(200);
        let feerate = effective_feerate(&tx, fee);
        assert!(feerate.to_sat_per_kwu() > 0);
    }
}
