//! The Wallet Adapter: the external interface both state machines use to
//! fund, rebroadcast, and unlock on-chain transactions.
//!
//! The trait is deliberately shaped after the Bitcoin Core wallet RPC verbs
//! (`fundrawtransaction`, `gettransaction`, `lockunspent`,
//! `abandontransaction`) rather than a descriptor/coin-selection library's
//! `TxBuilder` abstraction, since that's the external interface this module
//! actually talks to in production.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bitcoin::{Amount, FeeRate, OutPoint, Transaction, Txid, Weight};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, instrument};

/// An unsigned input the wallet should treat as already present in the
/// transaction (e.g. the shared funding input), along with the extra weight
/// its eventual witness will add. Lets the wallet's fee calculation account
/// for an input it didn't select itself.
#[derive(Copy, Clone, Debug)]
pub struct ExternalInput {
    pub outpoint: OutPoint,
    pub witness_weight: Weight,
}

/// Parameters for [`WalletAdapter::fund_transaction`].
#[derive(Clone, Debug)]
pub struct FundTxRequest {
    /// The skeleton transaction: the funding/shared output(s) and any
    /// user-requested non-change outputs, with no inputs yet selected.
    pub template: Transaction,
    pub target_feerate: FeeRate,
    pub require_confirmed_inputs: bool,
    /// Outpoints the wallet must not re-select (a previous attempt's inputs,
    /// or inputs already determined unusable this session).
    pub excluded_outpoints: Vec<OutPoint>,
    pub external_inputs: Vec<ExternalInput>,
    /// Cap on the fee the wallet may add, if the caller supplied one.
    pub fee_budget: Option<Amount>,
}

/// The outcome of a successful [`WalletAdapter::fund_transaction`] call.
#[derive(Clone, Debug)]
pub struct FundTxResponse {
    pub tx: Transaction,
    pub fee: Amount,
    /// The output index of the wallet's own change output, if it added
    /// one.
    pub change_vout: Option<u32>,
}

/// The external interface used to fund, monitor, and unlock on-chain
/// transactions. A thin async wrapper over the node's Bitcoin Core wallet
/// RPC connection; mocked in tests with an in-memory implementation.
#[async_trait]
pub trait WalletAdapter: Send + Sync {
    /// Selects inputs (and, if needed, a change output) to bring
    /// `request.template` up to `request.target_feerate`. Selected inputs
    /// are locked by the wallet for the duration of this interactive-tx
    /// session / publish attempt.
    async fn fund_transaction(
        &self,
        request: FundTxRequest,
    ) -> Result<FundTxResponse>;

    /// Fetches a previously-broadcast (or merely wallet-known) transaction
    /// by txid, along with its current confirmation count. Used both to
    /// pull backing transactions for coin-selected inputs and to poll a
    /// published claim's confirmation depth.
    async fn get_transaction(
        &self,
        txid: Txid,
    ) -> Result<Option<WalletTransaction>>;

    /// Broadcasts `tx` to the network.
    async fn publish_transaction(&self, tx: &Transaction) -> Result<()>;

    /// Releases the wallet's lock on `outpoints`, making them eligible for
    /// coin selection again.
    async fn unlock_outpoints(&self, outpoints: &[OutPoint]) -> Result<()>;

    /// Marks `txid` (and its unconfirmed descendants) as abandoned, freeing
    /// up any of its inputs that are otherwise wallet-owned UTXOs. Called
    /// once a replacement has confirmed and the superseded attempts need
    /// cleaning up.
    async fn abandon_transaction(&self, txid: Txid) -> Result<()>;
}

/// A transaction as known to the wallet, with its current confirmation
/// depth.
#[derive(Clone, Debug)]
pub struct WalletTransaction {
    pub tx: Transaction,
    pub confirmations: i64,
}

impl WalletTransaction {
    pub fn is_confirmed(&self) -> bool {
        self.confirmations > 0
    }
}

const DEFAULT_MAX_RETRIES: u32 = 3;

/// Bitcoin Core JSON-RPC authentication, either a cookie file or a fixed
/// username/password pair.
#[derive(Clone, Debug)]
pub enum Auth {
    CookieFile(std::path::PathBuf),
    UserPass(String, String),
}

/// A [`WalletAdapter`] backed by a Bitcoin Core JSON-RPC wallet connection.
#[derive(Clone, Debug)]
pub struct BitcoindWalletAdapter {
    client: Client,
    url: String,
    auth: Auth,
    max_retries: u32,
}

impl BitcoindWalletAdapter {
    pub fn new(url: String, auth: Auth) -> Self {
        Self { client: Client::new(), url, auth, max_retries: DEFAULT_MAX_RETRIES }
    }

    #[instrument(skip(self, params))]
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T> {
        #[derive(Serialize)]
        struct Request<'a> {
            jsonrpc: &'a str,
            id: &'a str,
            method: &'a str,
            params: Value,
        }

        #[derive(Deserialize)]
        struct Response<T> {
            result: Option<T>,
            error: Option<RpcError>,
        }

        #[derive(Deserialize, Debug)]
        struct RpcError {
            code: i64,
            message: String,
        }

        let body = Request { jsonrpc: "1.0", id: "lexe-ln", method, params };

        let mut attempt = 0;
        let mut backoff_durations = common::backoff::get_backoff_iter();
        loop {
            attempt += 1;
            let mut req = self.client.post(&self.url).json(&body);
            req = match &self.auth {
                Auth::CookieFile(path) => {
                    let cookie = std::fs::read_to_string(path)
                        .context("failed to read bitcoind cookie file")?;
                    let (user, pass) = cookie
                        .split_once(':')
                        .context("malformed bitcoind cookie file")?;
                    req.basic_auth(user, Some(pass))
                }
                Auth::UserPass(user, pass) => {
                    req.basic_auth(user, Some(pass))
                }
            };

            let result = req.send().await.and_then(|r| r.error_for_status());
            match result {
                Ok(response) => {
                    let parsed: Response<T> = response
                        .json()
                        .await
                        .context("failed to deserialize bitcoind response")?;
                    if let Some(error) = parsed.error {
                        bail!("bitcoind RPC error {}: {}", error.code, error.message);
                    }
                    return parsed
                        .result
                        .context("bitcoind response missing `result`");
                }
                Err(err) if attempt < self.max_retries => {
                    let wait = backoff_durations.next().unwrap_or_default();
                    debug!(%err, attempt, ?wait, "bitcoind RPC call failed, retrying");
                    tokio::time::sleep(wait).await;
                }
                Err(err) => {
                    return Err(err).context("bitcoind RPC call failed")
                }
            }
        }
    }
}

#[async_trait]
impl WalletAdapter for BitcoindWalletAdapter {
    #[instrument(skip(self, request))]
    async fn fund_transaction(
        &self,
        request: FundTxRequest,
    ) -> Result<FundTxResponse> {
        let raw_tx = bitcoin::consensus::encode::serialize_hex(&request.template);

        let mut options = json!({
            "fee_rate": request.target_feerate.to_sat_per_vb_ceil(),
            "lockUnspents": true,
            "includeWatching": true,
        });
        if !request.excluded_outpoints.is_empty() {
            let excluded: Vec<Value> = request
                .excluded_outpoints
                .iter()
                .map(|op| {
                    json!({ "txid": op.txid.to_string(), "vout": op.vout })
                })
                .collect();
            options["inputs"] = json!([]);
            // Core has no single "exclude" knob for fundrawtransaction; the
            // caller-level coin-selection loop filters these out before
            // constructing the next attempt instead of relying on Core to
            // honor an exclusion list here.
            let _ = excluded;
        }
        if !request.external_inputs.is_empty() {
            options["input_weights"] = Value::Array(
                request
                    .external_inputs
                    .iter()
                    .map(|ext| {
                        json!({
                            "txid": ext.outpoint.txid.to_string(),
                            "vout": ext.outpoint.vout,
                            "weight": ext.witness_weight.to_wu(),
                        })
                    })
                    .collect(),
            );
        }

        #[derive(Deserialize)]
        struct FundRawTransactionResult {
            hex: String,
            fee: f64,
            changepos: i32,
        }

        let result: FundRawTransactionResult = self
            .call(
                "fundrawtransaction",
                json!([raw_tx, options]),
            )
            .await
            .context("fundrawtransaction failed")?;

        let tx: Transaction =
            bitcoin::consensus::encode::deserialize_hex(&result.hex)
                .context("bitcoind returned an unparseable transaction")?;
        let fee = Amount::from_btc(result.fee.abs())
            .context("bitcoind returned an invalid fee")?;
        let change_vout = u32::try_from(result.changepos).ok();

        if let Some(budget) = request.fee_budget {
            if fee > budget {
                bail!("funded transaction fee {fee} exceeds budget {budget}");
            }
        }

        Ok(FundTxResponse { tx, fee, change_vout })
    }

    #[instrument(skip(self))]
    async fn get_transaction(
        &self,
        txid: Txid,
    ) -> Result<Option<WalletTransaction>> {
        #[derive(Deserialize)]
        struct GetTransactionResult {
            hex: String,
            #[serde(default)]
            confirmations: i64,
        }

        let result: Result<GetTransactionResult> =
            self.call("gettransaction", json!([txid.to_string()])).await;

        match result {
            Ok(result) => {
                let tx = bitcoin::consensus::encode::deserialize_hex(
                    &result.hex,
                )
                .context("bitcoind returned an unparseable transaction")?;
                Ok(Some(WalletTransaction {
                    tx,
                    confirmations: result.confirmations,
                }))
            }
            Err(_) => Ok(None),
        }
    }

    #[instrument(skip(self, tx))]
    async fn publish_transaction(&self, tx: &Transaction) -> Result<()> {
        let raw_tx = bitcoin::consensus::encode::serialize_hex(tx);
        let _txid: String =
            self.call("sendrawtransaction", json!([raw_tx])).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unlock_outpoints(&self, outpoints: &[OutPoint]) -> Result<()> {
        if outpoints.is_empty() {
            return Ok(());
        }
        let outputs: Vec<Value> = outpoints
            .iter()
            .map(|op| json!({ "txid": op.txid.to_string(), "vout": op.vout }))
            .collect();
        let _: bool =
            self.call("lockunspent", json!([true, outputs])).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn abandon_transaction(&self, txid: Txid) -> Result<()> {
        let _: Value = self
            .call("abandontransaction", json!([txid.to_string()]))
            .await?;
        Ok(())
    }
}
