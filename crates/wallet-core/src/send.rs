//! send / sendMax: fetch outputs, build, sign, broadcast, re-query the balance.

use chain_bch::amount::Unit;
use chain_bch::assembler::{BuildOptions, SendRequest, TransactionDraft};
use chain_bch::error::BchError;
use chain_bch::utxo::Utxo;
use log::{info, warn};
use serde::Serialize;

use crate::config::SendOptions;
use crate::error::WalletError;
use crate::wallet::Wallet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendResponse {
    pub txid: String,
    /// Spendable balance re-read from the UTXO source after broadcast.
    pub balance_after: u64,
}

impl Wallet {
    /// Pay `requests` in one transaction.
    pub async fn send(
        &self,
        requests: &[SendRequest],
        options: &SendOptions,
    ) -> Result<SendResponse, WalletError> {
        let usd_rate = self.rate_for(requests).await?;
        let (txid, _) = self
            .submit(options, usd_rate, |available, build| {
                Ok(self.assembler.build(requests, available, build)?)
            })
            .await?;
        self.respond(txid).await
    }

    /// Sweep every spendable output (or every pinned one) to `to`.
    pub async fn send_max(
        &self,
        to: &str,
        options: &SendOptions,
    ) -> Result<SendResponse, WalletError> {
        let (txid, _) = self
            .submit(options, None, |available, build| {
                Ok(self.assembler.build_max(to, available, build)?)
            })
            .await?;
        self.respond(txid).await
    }

    /// What [`Wallet::send_max`] would deliver, in satoshis. Zero when the
    /// wallet cannot cover a dust output plus its fee.
    pub async fn max_amount_to_send(&self, options: &SendOptions) -> Result<u64, WalletError> {
        let (available, build) = self.prepare(options, None).await?;
        match self.assembler.build_max(&self.address, &available, &build) {
            Ok(draft) => Ok(draft.output_satoshis()),
            Err(BchError::InsufficientFunds { .. }) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Funded, unsigned draft for `requests`. Works for watch-only wallets.
    pub async fn build_draft(
        &self,
        requests: &[SendRequest],
        options: &SendOptions,
    ) -> Result<TransactionDraft, WalletError> {
        let usd_rate = self.rate_for(requests).await?;
        let (available, build) = self.prepare(options, usd_rate).await?;
        Ok(self.assembler.build(requests, &available, &build)?)
    }

    /// Build, sign and broadcast. A broadcast rejected for spent inputs is
    /// rebuilt from a fresh fetch exactly once.
    pub(crate) async fn submit<F>(
        &self,
        options: &SendOptions,
        usd_rate: Option<f64>,
        build: F,
    ) -> Result<(String, TransactionDraft), WalletError>
    where
        F: Fn(&[Utxo], &BuildOptions) -> Result<TransactionDraft, WalletError>,
    {
        let signer = self.key.private_key()?.signer()?;
        let locking = self.locking_bytecode()?;

        let mut retried = false;
        loop {
            let (available, build_options) = self.prepare(options, usd_rate).await?;
            let draft = build(&available, &build_options)?;
            let raw = draft.sign(&signer, &locking)?.to_bytes()?;
            match self.io(self.source.broadcast(&raw)).await {
                Ok(txid) => {
                    info!(
                        "broadcast {txid}: {} input(s), {} output(s), fee {} sat",
                        draft.inputs.len(),
                        draft.outputs.len(),
                        draft.fee_satoshis
                    );
                    return Ok((txid, draft));
                }
                Err(WalletError::StaleInputs(reason)) if !retried => {
                    warn!("broadcast rejected stale inputs ({reason}), rebuilding once");
                    retried = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub(crate) async fn respond(&self, txid: String) -> Result<SendResponse, WalletError> {
        Ok(SendResponse {
            txid,
            balance_after: self.balance().await?,
        })
    }

    async fn rate_for(&self, requests: &[SendRequest]) -> Result<Option<f64>, WalletError> {
        let needs_rate = requests.iter().any(|r| {
            matches!(r, SendRequest::Unit { amount, .. } if amount.unit == Unit::Usd)
        });
        if needs_rate {
            Ok(Some(self.usd_rate().await?))
        } else {
            Ok(None)
        }
    }
}
