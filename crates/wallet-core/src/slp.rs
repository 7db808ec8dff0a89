//! SLP token operations: genesis, mint, send, sendMax, balances and NFT1
//! parent/child issuance.

use std::collections::BTreeSet;

use chain_bch::amount::TokenAmount;
use chain_bch::assembler::{BuildPlan, ResolvedOutput};
use chain_bch::error::BchError;
use chain_bch::slp::{
    encode_genesis, encode_mint, encode_send, GenesisParams, MintParams, SendParams, SlpTokenType,
};
use chain_bch::utxo::{SlpDatum, Utxo};
use chain_bch::DUST_THRESHOLD;
use log::debug;
use serde::Serialize;

use crate::config::SendOptions;
use crate::error::WalletError;
use crate::send::SendResponse;
use crate::wallet::Wallet;

/// Token genesis settings. Receivers default to the wallet's own address.
#[derive(Debug, Clone, Default)]
pub struct SlpGenesisOptions {
    pub name: String,
    pub ticker: String,
    pub document_url: String,
    /// 64 hex characters, or empty.
    pub document_hash: String,
    pub decimals: u8,
    pub initial_amount: TokenAmount,
    /// Drop the mint baton, fixing the supply forever.
    pub end_baton: bool,
    pub token_receiver: Option<String>,
    pub baton_receiver: Option<String>,
    pub token_type: SlpTokenType,
}

#[derive(Debug, Clone, Default)]
pub struct SlpMintOptions {
    pub token_id: String,
    pub amount: TokenAmount,
    pub end_baton: bool,
    pub token_receiver: Option<String>,
    pub baton_receiver: Option<String>,
}

/// One SLP payment, naming its token by id or by ticker.
#[derive(Debug, Clone)]
pub struct SlpSendRequest {
    pub to: String,
    pub value: TokenAmount,
    pub token_id: Option<String>,
    pub ticker: Option<String>,
}

impl SlpSendRequest {
    pub fn by_id(to: impl Into<String>, value: TokenAmount, token_id: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            value,
            token_id: Some(token_id.into()),
            ticker: None,
        }
    }

    pub fn by_ticker(to: impl Into<String>, value: TokenAmount, ticker: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            value,
            token_id: None,
            ticker: Some(ticker.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenesisResponse {
    /// SLP token id or CashToken category of the new token.
    pub token_id: String,
    pub txid: String,
    pub balance_after: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlpBalance {
    pub token_id: String,
    pub ticker: Option<String>,
    pub decimals: u8,
    /// Raw base units.
    pub raw: u64,
}

impl SlpBalance {
    pub fn value(&self) -> TokenAmount {
        TokenAmount::from_raw(self.raw, self.decimals)
    }
}

impl Wallet {
    pub async fn slp_genesis(
        &self,
        options: &SlpGenesisOptions,
        send: &SendOptions,
    ) -> Result<GenesisResponse, WalletError> {
        let params = GenesisParams {
            token_type: options.token_type,
            ticker: options.ticker.clone(),
            name: options.name.clone(),
            document_url: options.document_url.clone(),
            document_hash: options.document_hash.clone(),
            decimals: options.decimals,
            end_baton: options.end_baton,
            initial_amount: options.initial_amount,
        };
        let plan = BuildPlan {
            data_carrier: Some(encode_genesis(&params)?),
            outputs: self.token_outputs(
                options.token_receiver.as_deref(),
                options.baton_receiver.as_deref(),
                options.end_baton,
            )?,
            ..BuildPlan::default()
        };
        let (txid, _) = self
            .submit(send, None, |available, build| {
                Ok(self.assembler.build_plan(plan.clone(), available, build)?)
            })
            .await?;
        let response = self.respond(txid).await?;
        Ok(GenesisResponse {
            token_id: response.txid.clone(),
            txid: response.txid,
            balance_after: response.balance_after,
        })
    }

    /// Genesis of an NFT1 group (parent) token.
    pub async fn nft_parent_genesis(
        &self,
        options: &SlpGenesisOptions,
        send: &SendOptions,
    ) -> Result<GenesisResponse, WalletError> {
        let options = SlpGenesisOptions {
            token_type: SlpTokenType::NftParent,
            ..options.clone()
        };
        self.slp_genesis(&options, send).await
    }

    /// Genesis of one NFT1 child, burning exactly one unit of `parent_id`.
    /// When no output holds exactly one unit, one is split off to this
    /// wallet first.
    pub async fn nft_child_genesis(
        &self,
        parent_id: &str,
        options: &SlpGenesisOptions,
        send: &SendOptions,
    ) -> Result<GenesisResponse, WalletError> {
        let utxos = self.utxos().await?;
        let units = slp_units(&utxos, parent_id);
        if units.is_empty() {
            return Err(BchError::InsufficientTokens {
                category: parent_id.to_string(),
                required: 1,
                available: 0,
            }
            .into());
        }
        if !units.iter().any(|u| slp_amount(u) == 1) {
            debug!("splitting one unit of group token {parent_id} before child genesis");
            let split =
                SlpSendRequest::by_id(self.address.clone(), TokenAmount::from_raw(1, 0), parent_id);
            let split_options = SendOptions {
                utxo_ids: None,
                change_address: None,
                ..send.clone()
            };
            self.slp_send(&[split], &split_options).await?;
        }

        let params = GenesisParams {
            token_type: SlpTokenType::NftChild,
            ticker: options.ticker.clone(),
            name: options.name.clone(),
            document_url: options.document_url.clone(),
            document_hash: options.document_hash.clone(),
            decimals: 0,
            end_baton: true,
            initial_amount: TokenAmount::from(1u64),
        };
        let plan = BuildPlan {
            data_carrier: Some(encode_genesis(&params)?),
            outputs: self.token_outputs(options.token_receiver.as_deref(), None, true)?,
            ..BuildPlan::default()
        };
        let (txid, _) = self
            .submit(send, None, |available, build| {
                let unit = slp_units(available, parent_id)
                    .into_iter()
                    .find(|u| slp_amount(u) == 1)
                    .ok_or_else(|| BchError::InsufficientTokens {
                        category: parent_id.to_string(),
                        required: 1,
                        available: 0,
                    })?;
                let plan = BuildPlan {
                    required_inputs: vec![unit],
                    ..plan.clone()
                };
                Ok(self.assembler.build_plan(plan, available, build)?)
            })
            .await?;
        let response = self.respond(txid).await?;
        Ok(GenesisResponse {
            token_id: response.txid.clone(),
            txid: response.txid,
            balance_after: response.balance_after,
        })
    }

    /// Mint more of a token whose baton this wallet holds.
    pub async fn slp_mint(
        &self,
        options: &SlpMintOptions,
        send: &SendOptions,
    ) -> Result<SendResponse, WalletError> {
        let outputs = self.token_outputs(
            options.token_receiver.as_deref(),
            options.baton_receiver.as_deref(),
            options.end_baton,
        )?;
        let token_id = options.token_id.to_ascii_lowercase();
        let (txid, _) = self
            .submit(send, None, |available, build| {
                let baton = available
                    .iter()
                    .find(|u| {
                        u.slp
                            .as_ref()
                            .is_some_and(|s| s.is_baton && s.token_id.eq_ignore_ascii_case(&token_id))
                    })
                    .ok_or_else(|| {
                        BchError::InvalidToken(format!("no mint baton for token {token_id}"))
                    })?;
                let datum = slp_datum(baton)?;
                let carrier = encode_mint(&MintParams {
                    token_type: datum.token_type,
                    token_id: token_id.clone(),
                    decimals: datum.decimals,
                    end_baton: options.end_baton,
                    amount: options.amount,
                })?;
                let plan = BuildPlan {
                    data_carrier: Some(carrier),
                    outputs: outputs.clone(),
                    required_inputs: vec![baton.clone()],
                    balance_tokens: false,
                };
                Ok(self.assembler.build_plan(plan, available, build)?)
            })
            .await?;
        self.respond(txid).await
    }

    /// Pay SLP tokens. All requests must resolve to the same token.
    pub async fn slp_send(
        &self,
        requests: &[SlpSendRequest],
        send: &SendOptions,
    ) -> Result<SendResponse, WalletError> {
        if requests.is_empty() {
            return Err(BchError::InvalidRequest("empty token send requests".into()).into());
        }
        let (txid, _) = self
            .submit(send, None, |available, build| {
                let token_id = resolve_token(requests, available)?;
                let datum = first_datum(available, &token_id)?;
                let amounts = requests
                    .iter()
                    .map(|r| r.value.to_raw(datum.decimals))
                    .collect::<Result<Vec<_>, BchError>>()?;
                let spend = amounts
                    .iter()
                    .try_fold(0u64, |acc, a| acc.checked_add(*a))
                    .ok_or_else(|| BchError::InvalidAmount("token spend overflows 64 bits".into()))?;
                let inputs = select_slp(available, &token_id, spend)?;
                let plan = self.slp_send_plan(
                    requests.iter().map(|r| r.to.as_str()),
                    &token_id,
                    &datum,
                    amounts,
                    inputs,
                    build.change_address.as_str(),
                )?;
                Ok(self.assembler.build_plan(plan, available, build)?)
            })
            .await?;
        self.respond(txid).await
    }

    /// Send every unit of `token_id` to `to`.
    pub async fn slp_send_max(
        &self,
        to: &str,
        token_id: &str,
        send: &SendOptions,
    ) -> Result<SendResponse, WalletError> {
        let token_id = token_id.to_ascii_lowercase();
        let (txid, _) = self
            .submit(send, None, |available, build| {
                let inputs = slp_units(available, &token_id);
                let datum = first_datum(available, &token_id)?;
                let total = inputs
                    .iter()
                    .try_fold(0u64, |acc, u| acc.checked_add(slp_amount(u)))
                    .ok_or_else(|| BchError::InvalidAmount("token balance overflows 64 bits".into()))?;
                let plan = self.slp_send_plan(
                    std::iter::once(to),
                    &token_id,
                    &datum,
                    vec![total],
                    inputs,
                    build.change_address.as_str(),
                )?;
                Ok(self.assembler.build_plan(plan, available, build)?)
            })
            .await?;
        self.respond(txid).await
    }

    pub async fn slp_balance(&self, token_id: &str) -> Result<SlpBalance, WalletError> {
        let token_id = token_id.to_ascii_lowercase();
        let utxos = self.utxos().await?;
        let datum = first_datum(&utxos, &token_id)
            .map_err(|_| WalletError::UnknownToken(token_id.clone()))?;
        let raw = slp_units(&utxos, &token_id)
            .iter()
            .try_fold(0u64, |acc, u| acc.checked_add(slp_amount(u)))
            .ok_or_else(|| BchError::InvalidAmount("token balance overflows 64 bits".into()))?;
        Ok(SlpBalance {
            token_id,
            ticker: datum.ticker,
            decimals: datum.decimals,
            raw,
        })
    }

    /// Balances of every SLP token held, ordered by token id.
    pub async fn slp_balances(&self) -> Result<Vec<SlpBalance>, WalletError> {
        let utxos = self.utxos().await?;
        let ids: BTreeSet<&str> = utxos
            .iter()
            .filter_map(|u| u.slp.as_ref())
            .filter(|s| !s.is_baton)
            .map(|s| s.token_id.as_str())
            .collect();
        let mut balances = Vec::with_capacity(ids.len());
        for id in ids {
            let datum = first_datum(&utxos, id)?;
            let raw = slp_units(&utxos, id).iter().map(slp_amount).sum();
            balances.push(SlpBalance {
                token_id: id.to_string(),
                ticker: datum.ticker,
                decimals: datum.decimals,
                raw,
            });
        }
        Ok(balances)
    }

    /// Dust outputs for the token receiver and, unless ended, the baton.
    fn token_outputs(
        &self,
        token_receiver: Option<&str>,
        baton_receiver: Option<&str>,
        end_baton: bool,
    ) -> Result<Vec<ResolvedOutput>, WalletError> {
        let codec = self.assembler.codec();
        let mut outputs = vec![ResolvedOutput::new(
            codec.decode(token_receiver.unwrap_or(&self.address))?,
            DUST_THRESHOLD,
        )];
        if !end_baton {
            outputs.push(ResolvedOutput::new(
                codec.decode(baton_receiver.unwrap_or(&self.address))?,
                DUST_THRESHOLD,
            ));
        }
        Ok(outputs)
    }

    fn slp_send_plan<'a>(
        &self,
        receivers: impl Iterator<Item = &'a str>,
        token_id: &str,
        datum: &SlpDatum,
        amounts: Vec<u64>,
        inputs: Vec<Utxo>,
        change_address: &str,
    ) -> Result<BuildPlan, WalletError> {
        let available = inputs
            .iter()
            .try_fold(0u64, |acc, u| acc.checked_add(slp_amount(u)))
            .ok_or_else(|| BchError::InvalidAmount("token inputs overflow 64 bits".into()))?;
        let params = SendParams {
            token_type: datum.token_type,
            token_id: token_id.to_string(),
            amounts,
            available,
        };
        let carrier = encode_send(&params)?;

        let codec = self.assembler.codec();
        let mut outputs = receivers
            .map(|to| Ok(ResolvedOutput::new(codec.decode(to)?, DUST_THRESHOLD)))
            .collect::<Result<Vec<_>, BchError>>()?;
        if params.change()?.is_some() {
            outputs.push(ResolvedOutput::new(codec.decode(change_address)?, DUST_THRESHOLD));
        }
        Ok(BuildPlan {
            data_carrier: Some(carrier),
            outputs,
            required_inputs: inputs,
            balance_tokens: false,
        })
    }
}

fn slp_amount(utxo: &Utxo) -> u64 {
    utxo.slp.as_ref().map_or(0, |s| s.amount)
}

fn slp_datum(utxo: &Utxo) -> Result<SlpDatum, BchError> {
    utxo.slp
        .clone()
        .ok_or_else(|| BchError::InvalidToken(format!("{} carries no slp data", utxo.id())))
}

/// Non-baton outputs of `token_id`, smallest first.
fn slp_units(utxos: &[Utxo], token_id: &str) -> Vec<Utxo> {
    let mut units: Vec<Utxo> = utxos
        .iter()
        .filter(|u| {
            u.slp
                .as_ref()
                .is_some_and(|s| !s.is_baton && s.token_id.eq_ignore_ascii_case(token_id))
        })
        .cloned()
        .collect();
    units.sort_by_key(slp_amount);
    units
}

fn first_datum(utxos: &[Utxo], token_id: &str) -> Result<SlpDatum, BchError> {
    utxos
        .iter()
        .filter_map(|u| u.slp.as_ref())
        .find(|s| s.token_id.eq_ignore_ascii_case(token_id))
        .cloned()
        .ok_or_else(|| BchError::InsufficientTokens {
            category: token_id.to_string(),
            required: 1,
            available: 0,
        })
}

/// Smallest-first token outputs covering `spend` raw units.
fn select_slp(utxos: &[Utxo], token_id: &str, spend: u64) -> Result<Vec<Utxo>, BchError> {
    let mut selected = Vec::new();
    let mut total = 0u64;
    for utxo in slp_units(utxos, token_id) {
        if total >= spend {
            break;
        }
        total = total.saturating_add(slp_amount(&utxo));
        selected.push(utxo);
    }
    if total < spend {
        return Err(BchError::InsufficientTokens {
            category: token_id.to_string(),
            required: spend,
            available: total,
        });
    }
    Ok(selected)
}

/// The single token id the requests name, directly or through a ticker.
fn resolve_token(requests: &[SlpSendRequest], utxos: &[Utxo]) -> Result<String, BchError> {
    let mut ids = BTreeSet::new();
    for request in requests {
        match (&request.token_id, &request.ticker) {
            (Some(id), _) => {
                ids.insert(id.to_ascii_lowercase());
            }
            (None, Some(ticker)) => {
                let matching: BTreeSet<String> = utxos
                    .iter()
                    .filter_map(|u| u.slp.as_ref())
                    .filter(|s| s.ticker.as_deref() == Some(ticker.as_str()))
                    .map(|s| s.token_id.to_ascii_lowercase())
                    .collect();
                if matching.is_empty() {
                    return Err(BchError::InvalidToken(format!("no token with ticker {ticker}")));
                }
                ids.extend(matching);
            }
            (None, None) => {
                return Err(BchError::InvalidRequest(
                    "token send request names neither a token id nor a ticker".into(),
                ))
            }
        }
    }
    let mut ids = ids.into_iter();
    match (ids.next(), ids.next()) {
        (Some(id), None) => Ok(id),
        (Some(a), Some(b)) => Err(BchError::AmbiguousToken(format!(
            "requests name more than one token ({a}, {b})"
        ))),
        (None, _) => Err(BchError::InvalidRequest("empty token send requests".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID_A: &str = "aa00000000000000000000000000000000000000000000000000000000000000";
    const ID_B: &str = "bb00000000000000000000000000000000000000000000000000000000000000";

    fn slp_utxo(txid_byte: u8, token_id: &str, ticker: &str, amount: u64) -> Utxo {
        let mut utxo = Utxo::new(format!("{txid_byte:02x}").repeat(32), 1, DUST_THRESHOLD);
        utxo.slp = Some(SlpDatum {
            token_id: token_id.into(),
            token_type: SlpTokenType::Type1,
            decimals: 2,
            amount,
            is_baton: false,
            ticker: Some(ticker.into()),
        });
        utxo
    }

    #[test]
    fn same_ticker_different_ids_is_ambiguous() {
        let utxos = vec![slp_utxo(1, ID_A, "TST", 100), slp_utxo(2, ID_B, "TST", 100)];
        let requests = [SlpSendRequest::by_ticker("x", TokenAmount::from(1u64), "TST")];
        assert!(matches!(
            resolve_token(&requests, &utxos),
            Err(BchError::AmbiguousToken(_))
        ));

        let requests = [
            SlpSendRequest::by_id("x", TokenAmount::from(1u64), ID_A),
            SlpSendRequest::by_id("x", TokenAmount::from(1u64), ID_B),
        ];
        assert!(matches!(
            resolve_token(&requests, &utxos),
            Err(BchError::AmbiguousToken(_))
        ));
    }

    #[test]
    fn ticker_and_id_agreeing_resolve() {
        let utxos = vec![slp_utxo(1, ID_A, "AAA", 100), slp_utxo(2, ID_B, "BBB", 100)];
        let requests = [
            SlpSendRequest::by_ticker("x", TokenAmount::from(1u64), "AAA"),
            SlpSendRequest::by_id("y", TokenAmount::from(1u64), ID_A.to_uppercase()),
        ];
        assert_eq!(resolve_token(&requests, &utxos).unwrap(), ID_A);
    }

    #[test]
    fn unknown_ticker() {
        let requests = [SlpSendRequest::by_ticker("x", TokenAmount::from(1u64), "NOPE")];
        assert!(matches!(
            resolve_token(&requests, &[]),
            Err(BchError::InvalidToken(_))
        ));
    }

    #[test]
    fn selects_smallest_token_outputs_first() {
        let utxos = vec![
            slp_utxo(1, ID_A, "AAA", 500),
            slp_utxo(2, ID_A, "AAA", 50),
            slp_utxo(3, ID_A, "AAA", 70),
            slp_utxo(4, ID_B, "BBB", 1),
        ];
        let selected = select_slp(&utxos, ID_A, 100).unwrap();
        let amounts: Vec<u64> = selected.iter().map(slp_amount).collect();
        assert_eq!(amounts, vec![50, 70]);

        let err = select_slp(&utxos, ID_A, 1_000).unwrap_err();
        assert!(matches!(
            err,
            BchError::InsufficientTokens {
                required: 1_000,
                available: 620,
                ..
            }
        ));
    }

    #[test]
    fn batons_are_not_units() {
        let mut baton = slp_utxo(9, ID_A, "AAA", 0);
        if let Some(slp) = baton.slp.as_mut() {
            slp.is_baton = true;
        }
        let utxos = vec![baton, slp_utxo(1, ID_A, "AAA", 5)];
        assert_eq!(slp_units(&utxos, ID_A).len(), 1);
    }
}
