use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::cashtoken::{Nft, TokenDatum};
use crate::error::BchError;
use crate::slp::SlpTokenType;

/// Blocks a coinbase output must age before it is spendable.
pub const COINBASE_MATURITY: u64 = 100;

/// Canonical `txid:vout` identifier of an output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UtxoId {
    pub txid: String,
    pub vout: u32,
}

impl UtxoId {
    pub fn new(txid: impl Into<String>, vout: u32) -> Self {
        Self {
            txid: txid.into(),
            vout,
        }
    }
}

impl fmt::Display for UtxoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

impl FromStr for UtxoId {
    type Err = BchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (txid, vout) = s
            .split_once(':')
            .ok_or_else(|| BchError::InvalidRequest(format!("utxo id {s:?} is not txid:vout")))?;
        if txid.len() != 64 || hex::decode(txid).is_err() {
            return Err(BchError::InvalidRequest(format!("invalid txid in utxo id {s:?}")));
        }
        let vout = vout
            .parse()
            .map_err(|_| BchError::InvalidRequest(format!("invalid vout in utxo id {s:?}")))?;
        Ok(Self::new(txid.to_ascii_lowercase(), vout))
    }
}

/// SLP token data an indexer reports for an output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlpDatum {
    pub token_id: String,
    #[serde(default)]
    pub token_type: SlpTokenType,
    pub decimals: u8,
    /// Raw base-unit amount; zero for a baton.
    pub amount: u64,
    #[serde(default)]
    pub is_baton: bool,
    #[serde(default)]
    pub ticker: Option<String>,
}

/// A spendable output as reported by the UTXO source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    /// Transaction id, hex in display order.
    pub txid: String,
    pub vout: u32,
    pub satoshis: u64,
    #[serde(default)]
    pub token: Option<TokenDatum>,
    #[serde(default)]
    pub slp: Option<SlpDatum>,
    #[serde(default)]
    pub coinbase: bool,
    /// Confirmation height, if confirmed.
    #[serde(default)]
    pub height: Option<u64>,
}

impl Utxo {
    pub fn new(txid: impl Into<String>, vout: u32, satoshis: u64) -> Self {
        Self {
            txid: txid.into(),
            vout,
            satoshis,
            token: None,
            slp: None,
            coinbase: false,
            height: None,
        }
    }

    pub fn id(&self) -> UtxoId {
        UtxoId::new(self.txid.clone(), self.vout)
    }

    pub fn matches(&self, id: &UtxoId) -> bool {
        self.vout == id.vout && self.txid.eq_ignore_ascii_case(&id.txid)
    }

    /// Carries CashTokens or SLP tokens; spending it as plain value burns them.
    pub fn is_token_bearing(&self) -> bool {
        self.token.is_some() || self.slp.is_some()
    }

    pub fn is_mature(&self, best_height: u64) -> bool {
        match (self.coinbase, self.height) {
            // Spendable in block `height + COINBASE_MATURITY`, the one after the tip.
            (true, Some(height)) if best_height > 0 => {
                best_height.saturating_add(1).saturating_sub(height) >= COINBASE_MATURITY
            }
            _ => true,
        }
    }
}

/// Sum of satoshis, failing on overflow.
pub fn total_satoshis<'a>(utxos: impl IntoIterator<Item = &'a Utxo>) -> Result<u64, BchError> {
    utxos
        .into_iter()
        .try_fold(0u64, |acc, u| acc.checked_add(u.satoshis))
        .ok_or_else(|| BchError::InvalidAmount("utxo total overflows 64 bits".into()))
}

/// Choose plain (token-free) UTXOs covering `target` satoshis.
///
/// With `pinned`, exactly those outputs are returned in the given order and
/// every id must be present in `available`. Otherwise mature, token-free
/// outputs are taken smallest first until the running total reaches
/// `target`.
pub fn select(
    available: &[Utxo],
    target: u64,
    pinned: Option<&[UtxoId]>,
    best_height: u64,
) -> Result<Vec<Utxo>, BchError> {
    if let Some(ids) = pinned {
        let selected = resolve_pinned(available, ids, best_height)?;
        let total = total_satoshis(&selected)?;
        if total < target {
            return Err(BchError::InsufficientFunds {
                required: target,
                available: total,
            });
        }
        return Ok(selected);
    }

    let mut eligible: Vec<&Utxo> = available
        .iter()
        .filter(|u| !u.is_token_bearing() && u.is_mature(best_height))
        .collect();
    eligible.sort_by_key(|u| u.satoshis);

    let mut selected = Vec::new();
    let mut total: u64 = 0;
    for utxo in eligible {
        if total >= target {
            break;
        }
        selected.push(utxo.clone());
        total = total.saturating_add(utxo.satoshis);
    }

    if total < target {
        return Err(BchError::InsufficientFunds {
            required: target,
            available: total,
        });
    }
    debug!(
        "selected {} utxo(s) totalling {total} sat for target {target}",
        selected.len()
    );
    Ok(selected)
}

/// Look up pinned ids, preserving order. Pinned outputs must be plain value.
pub fn resolve_pinned(
    available: &[Utxo],
    ids: &[UtxoId],
    best_height: u64,
) -> Result<Vec<Utxo>, BchError> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        if !seen.insert(id.to_string()) {
            return Err(BchError::InvalidRequest(format!("utxo {id} pinned twice")));
        }
        let utxo = available
            .iter()
            .find(|u| u.matches(id))
            .ok_or_else(|| BchError::UtxoNotFound(id.to_string()))?;
        if utxo.is_token_bearing() {
            return Err(BchError::TokenInputRejected(id.to_string()));
        }
        if !utxo.is_mature(best_height) {
            return Err(BchError::ImmatureCoinbase(id.to_string()));
        }
        out.push(utxo.clone());
    }
    Ok(out)
}

/// Choose CashToken inputs of one category: one input per requested NFT
/// (matched on capability and commitment), then fungible-only inputs smallest
/// first until `fungible` is covered. Inputs holding an unrequested NFT are
/// never picked.
pub fn select_tokens(
    available: &[Utxo],
    category: &str,
    nfts: &[&Nft],
    fungible: u64,
    best_height: u64,
) -> Result<Vec<Utxo>, BchError> {
    let pool: Vec<&Utxo> = available
        .iter()
        .filter(|u| u.slp.is_none() && u.is_mature(best_height))
        .filter(|u| {
            u.token
                .as_ref()
                .is_some_and(|t| t.category.eq_ignore_ascii_case(category))
        })
        .collect();

    let mut chosen: Vec<&Utxo> = Vec::new();
    for wanted in nfts {
        let found = pool
            .iter()
            .find(|u| {
                !chosen.iter().any(|c| c.matches(&u.id()))
                    && u.token.as_ref().and_then(|t| t.nft.as_ref()) == Some(*wanted)
            })
            .ok_or_else(|| {
                BchError::InvalidToken(format!(
                    "no spendable {:?} nft with commitment {} in category {category}",
                    wanted.capability,
                    hex::encode(&wanted.commitment)
                ))
            })?;
        chosen.push(found);
    }

    let token_amount = |u: &Utxo| u.token.as_ref().map_or(0, |t| t.amount);
    let mut have: u64 = chosen.iter().map(|u| token_amount(u)).sum();
    if have < fungible {
        let mut fungible_only: Vec<&Utxo> = pool
            .iter()
            .copied()
            .filter(|u| u.token.as_ref().is_some_and(|t| t.nft.is_none() && t.amount > 0))
            .filter(|u| !chosen.iter().any(|c| c.matches(&u.id())))
            .collect();
        fungible_only.sort_by_key(|u| token_amount(u));
        for utxo in fungible_only {
            if have >= fungible {
                break;
            }
            have = have.saturating_add(token_amount(utxo));
            chosen.push(utxo);
        }
    }
    if have < fungible {
        return Err(BchError::InsufficientTokens {
            category: category.to_string(),
            required: fungible,
            available: have,
        });
    }
    Ok(chosen.into_iter().cloned().collect())
}
