//! Transaction assembly with fee convergence and dust folding.
//!
//! Output order is fixed: an optional protocol data carrier at vout 0, then
//! the requested outputs in request order, then token change, then BCH change.

use std::collections::HashSet;

use log::debug;

use crate::address::{AddressCodec, CashAddrCodec};
use crate::amount::Amount;
use crate::cashtoken::{Nft, TokenDatum};
use crate::error::BchError;
use crate::fee::{EngineConfig, FeeEstimateContext, FeeEstimator, FeePaidBy, OutputShape};
use crate::script::{op_return, LockingBytecode, ScriptKind};
use crate::slp::DataCarrierOutput;
use crate::transaction::{
    parse_txid, sign_transaction, Signer, SpentOutput, Transaction, TxInput, TxOutput,
    SEQUENCE_FINAL, TX_VERSION,
};
use crate::utxo::{self, total_satoshis, Utxo, UtxoId};
use crate::DUST_THRESHOLD;

/// One thing the caller wants paid.
#[derive(Debug, Clone, PartialEq)]
pub enum SendRequest {
    /// Plain value in satoshis.
    Value { to: String, satoshis: u64 },
    /// Value in a display unit, resolved to satoshis before assembly.
    Unit { to: String, amount: Amount },
    /// CashToken output; satoshis default to the dust threshold.
    Token {
        to: String,
        token: TokenDatum,
        satoshis: Option<u64>,
    },
    /// OP_RETURN output carrying the given pushes.
    OpReturn { chunks: Vec<Vec<u8>> },
}

impl SendRequest {
    pub fn value(to: impl Into<String>, satoshis: u64) -> Self {
        SendRequest::Value {
            to: to.into(),
            satoshis,
        }
    }

    pub fn token(to: impl Into<String>, token: TokenDatum) -> Self {
        SendRequest::Token {
            to: to.into(),
            token,
            satoshis: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputRole {
    Request,
    DataCarrier,
    TokenChange,
    Change,
}

/// An output with its locking script and value fixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOutput {
    pub script: LockingBytecode,
    pub satoshis: u64,
    pub token: Option<TokenDatum>,
    pub role: OutputRole,
}

impl ResolvedOutput {
    pub fn new(script: LockingBytecode, satoshis: u64) -> Self {
        Self {
            script,
            satoshis,
            token: None,
            role: OutputRole::Request,
        }
    }

    pub fn with_token(script: LockingBytecode, satoshis: u64, token: TokenDatum) -> Self {
        Self {
            script,
            satoshis,
            token: Some(token),
            role: OutputRole::Request,
        }
    }

    pub fn data_carrier(output: DataCarrierOutput) -> Self {
        Self {
            script: output.bytecode,
            satoshis: output.satoshis,
            token: None,
            role: OutputRole::DataCarrier,
        }
    }

    pub fn shape(&self) -> OutputShape {
        OutputShape::of(&self.script, self.token.as_ref())
    }

    pub fn is_data_carrier(&self) -> bool {
        self.role == OutputRole::DataCarrier || self.script.kind() == ScriptKind::DataCarrier
    }

    /// Only plain requested value outputs may be reduced to pay the fee.
    pub fn can_pay_fee(&self) -> bool {
        self.role == OutputRole::Request && self.token.is_none() && !self.is_data_carrier()
    }
}

/// A funded transaction before signing.
///
/// `Σ inputs.satoshis == Σ outputs.satoshis + fee_satoshis` always holds for
/// drafts returned by the assembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionDraft {
    pub inputs: Vec<Utxo>,
    pub outputs: Vec<ResolvedOutput>,
    pub fee_satoshis: u64,
}

impl TransactionDraft {
    pub fn input_satoshis(&self) -> u64 {
        self.inputs.iter().map(|u| u.satoshis).sum()
    }

    pub fn output_satoshis(&self) -> u64 {
        self.outputs.iter().map(|o| o.satoshis).sum()
    }

    pub fn is_balanced(&self) -> bool {
        self.input_satoshis() == self.output_satoshis() + self.fee_satoshis
    }

    pub fn change(&self) -> Option<&ResolvedOutput> {
        self.outputs.iter().find(|o| o.role == OutputRole::Change)
    }

    /// Unsigned transaction with empty unlocking scripts.
    pub fn to_transaction(&self) -> Result<Transaction, BchError> {
        let inputs = self
            .inputs
            .iter()
            .map(|u| {
                Ok(TxInput {
                    prev_txid: parse_txid(&u.txid)?,
                    prev_vout: u.vout,
                    script_sig: Vec::new(),
                    sequence: SEQUENCE_FINAL,
                })
            })
            .collect::<Result<Vec<_>, BchError>>()?;
        let outputs = self
            .outputs
            .iter()
            .map(|o| TxOutput {
                satoshis: o.satoshis,
                script: o.script.clone(),
                token: o.token.clone(),
            })
            .collect();
        Ok(Transaction {
            version: TX_VERSION,
            inputs,
            outputs,
            lock_time: 0,
        })
    }

    /// Wire bytes of the unsigned transaction, for external signing.
    pub fn unsigned_bytes(&self) -> Result<Vec<u8>, BchError> {
        self.to_transaction()?.to_bytes()
    }

    /// Sign all inputs, which must all be locked by `locking`.
    pub fn sign(&self, signer: &dyn Signer, locking: &LockingBytecode) -> Result<Transaction, BchError> {
        let tx = self.to_transaction()?;
        let spent: Vec<SpentOutput> = self
            .inputs
            .iter()
            .map(|u| SpentOutput {
                satoshis: u.satoshis,
                script: locking.clone(),
                token: u.token.clone(),
            })
            .collect();
        sign_transaction(&tx, &spent, signer)
    }
}

/// Per-call parameters of a build.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Restrict inputs to exactly these outputs, in this order.
    pub pinned: Option<Vec<UtxoId>>,
    pub fee_rate: u64,
    pub fee_paid_by: FeePaidBy,
    pub change_address: String,
    pub best_height: u64,
    /// BCH price in USD, needed only for USD-denominated requests.
    pub usd_rate: Option<f64>,
}

impl BuildOptions {
    pub fn new(change_address: impl Into<String>) -> Self {
        Self {
            pinned: None,
            fee_rate: 1,
            fee_paid_by: FeePaidBy::Change,
            change_address: change_address.into(),
            best_height: 0,
            usd_rate: None,
        }
    }
}

/// Outputs and forced inputs of a build, beyond plain requests.
#[derive(Debug, Clone, Default)]
pub struct BuildPlan {
    /// Protocol data carrier placed at vout 0.
    pub data_carrier: Option<DataCarrierOutput>,
    pub outputs: Vec<ResolvedOutput>,
    /// Inputs spent first, in order, whatever they carry.
    pub required_inputs: Vec<Utxo>,
    /// Fund CashToken outputs from inputs of the same category and return
    /// leftover tokens as change. Off for genesis and minting, where the
    /// caller supplies the token inputs and outputs.
    pub balance_tokens: bool,
}

/// Builds funded drafts from requests and spendable outputs.
pub struct TransactionAssembler {
    codec: Box<dyn AddressCodec>,
    estimator: FeeEstimator,
}

impl Default for TransactionAssembler {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl TransactionAssembler {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_codec(Box::new(CashAddrCodec), config)
    }

    pub fn with_codec(codec: Box<dyn AddressCodec>, config: EngineConfig) -> Self {
        Self {
            codec,
            estimator: FeeEstimator::new(config),
        }
    }

    pub fn codec(&self) -> &dyn AddressCodec {
        self.codec.as_ref()
    }

    pub fn estimator(&self) -> &FeeEstimator {
        &self.estimator
    }

    /// Turn requests into outputs, rejecting dust.
    pub fn resolve(
        &self,
        requests: &[SendRequest],
        usd_rate: Option<f64>,
    ) -> Result<Vec<ResolvedOutput>, BchError> {
        let mut outputs = Vec::with_capacity(requests.len());
        for request in requests {
            let output = match request {
                SendRequest::Value { to, satoshis } => {
                    ResolvedOutput::new(self.codec.decode(to)?, *satoshis)
                }
                SendRequest::Unit { to, amount } => {
                    ResolvedOutput::new(self.codec.decode(to)?, amount.to_satoshis(usd_rate)?)
                }
                SendRequest::Token {
                    to,
                    token,
                    satoshis,
                } => {
                    token.validate()?;
                    ResolvedOutput::with_token(
                        self.codec.decode(to)?,
                        satoshis.unwrap_or(DUST_THRESHOLD),
                        token.clone(),
                    )
                }
                SendRequest::OpReturn { chunks } => {
                    ResolvedOutput::data_carrier(DataCarrierOutput::new(op_return(chunks)))
                }
            };
            check_dust(&output)?;
            outputs.push(output);
        }
        Ok(outputs)
    }

    /// Build a funded draft paying `requests`.
    pub fn build(
        &self,
        requests: &[SendRequest],
        available: &[Utxo],
        options: &BuildOptions,
    ) -> Result<TransactionDraft, BchError> {
        let plan = BuildPlan {
            outputs: self.resolve(requests, options.usd_rate)?,
            balance_tokens: true,
            ..BuildPlan::default()
        };
        self.build_plan(plan, available, options)
    }

    /// Build a funded draft for an explicit plan.
    pub fn build_plan(
        &self,
        plan: BuildPlan,
        available: &[Utxo],
        options: &BuildOptions,
    ) -> Result<TransactionDraft, BchError> {
        // SLP receivers must hold exactly dust; none may absorb the sweep.
        if options.fee_paid_by == FeePaidBy::Input && plan.data_carrier.is_some() {
            return Err(BchError::InvalidRequest(
                "fee paid by input cannot fund an SLP transaction".into(),
            ));
        }
        let change_script = self.codec.decode(&options.change_address)?;

        let mut outputs = Vec::with_capacity(plan.outputs.len() + 3);
        if let Some(carrier) = plan.data_carrier {
            outputs.push(ResolvedOutput::data_carrier(carrier));
        }
        for output in plan.outputs {
            check_dust(&output)?;
            outputs.push(output);
        }
        if outputs.is_empty() {
            return Err(BchError::InvalidRequest("nothing to send".into()));
        }

        // Split pinned ids between token funding and plain funding.
        let required_ids: HashSet<UtxoId> = plan.required_inputs.iter().map(Utxo::id).collect();
        let mut pinned_tokens: Vec<Utxo> = Vec::new();
        let mut pinned_plain: Option<Vec<UtxoId>> = None;
        if let Some(ids) = &options.pinned {
            let mut plain = Vec::new();
            for id in ids {
                if required_ids.contains(id) {
                    continue;
                }
                let utxo = available
                    .iter()
                    .find(|u| u.matches(id))
                    .ok_or_else(|| BchError::UtxoNotFound(id.to_string()))?;
                if plan.balance_tokens && utxo.token.is_some() && utxo.slp.is_none() {
                    pinned_tokens.push(utxo.clone());
                } else {
                    plain.push(id.clone());
                }
            }
            pinned_plain = Some(plain);
        }

        let mut base_inputs = plan.required_inputs;
        if plan.balance_tokens {
            let (token_inputs, token_change) = fund_tokens(
                &outputs,
                available,
                options.pinned.as_ref().map(|_| pinned_tokens.as_slice()),
                options.best_height,
                &change_script,
            )?;
            base_inputs.extend(token_inputs);
            outputs.extend(token_change);
        }

        let base_ids: HashSet<UtxoId> = base_inputs.iter().map(Utxo::id).collect();
        let pool: Vec<Utxo> = available
            .iter()
            .filter(|u| !base_ids.contains(&u.id()))
            .cloned()
            .collect();
        let base_sats = total_satoshis(&base_inputs)?;

        let funding = Funding {
            pool: &pool,
            pinned: pinned_plain.as_deref(),
            base_inputs: &base_inputs,
            base_sats,
        };
        let funding = match options.fee_paid_by {
            FeePaidBy::Input => funding.sweep(options.best_height)?,
            _ => self.converge(&outputs, &funding, &change_script, options)?,
        };

        let mut inputs = base_inputs;
        inputs.extend(funding);
        let draft = self.finalize(inputs, outputs, change_script, options)?;
        debug!(
            "built draft: {} input(s), {} output(s), fee {} sat",
            draft.inputs.len(),
            draft.outputs.len(),
            draft.fee_satoshis
        );
        Ok(draft)
    }

    /// Fixed-point search for the funding inputs: assume a funding input count,
    /// price the transaction, select for that price, and repeat with the
    /// selected count until it stops growing.
    fn converge(
        &self,
        outputs: &[ResolvedOutput],
        funding: &Funding<'_>,
        change_script: &LockingBytecode,
        options: &BuildOptions,
    ) -> Result<Vec<Utxo>, BchError> {
        let Funding {
            pool,
            pinned,
            base_inputs,
            base_sats,
        } = *funding;
        let spend = sum_outputs(outputs)?;
        let mut shapes: Vec<OutputShape> = outputs.iter().map(ResolvedOutput::shape).collect();
        shapes.push(OutputShape::of(change_script, None));
        let policy = options.fee_paid_by;

        let mut guess = usize::from(base_inputs.is_empty());
        let mut last_required = spend;
        for round in 0..self.estimator.config().max_fee_iterations {
            let fee = self.fee_for(base_inputs.len() + guess, &shapes, options);
            let total = if policy.uses_change() {
                spend.saturating_add(fee)
            } else {
                spend
            };
            last_required = total;

            let need = |total: u64| {
                let need = total.saturating_sub(base_sats);
                if base_inputs.is_empty() {
                    need.max(1)
                } else {
                    need
                }
            };
            let funding = match utxo::select(pool, need(total), pinned, options.best_height) {
                Ok(funding) => funding,
                // Change could not cover the whole fee; outputs pay the rest.
                Err(BchError::InsufficientFunds { .. })
                    if policy.uses_change() && policy.fallback().is_some() =>
                {
                    utxo::select(pool, need(spend), pinned, options.best_height)?
                }
                Err(e) => return Err(e),
            };
            debug!(
                "fee round {round}: assumed {guess} funding input(s), fee {fee}, selected {}",
                funding.len()
            );
            if funding.len() <= guess {
                return Ok(funding);
            }
            guess = funding.len();
        }

        let available = base_sats.saturating_add(total_satoshis(pool)?);
        Err(BchError::InsufficientFunds {
            required: last_required,
            available,
        })
    }

    /// Apply the fee policy to the converged inputs: emit or fold change and
    /// deduct from outputs where the policy says so.
    fn finalize(
        &self,
        inputs: Vec<Utxo>,
        mut outputs: Vec<ResolvedOutput>,
        change_script: LockingBytecode,
        options: &BuildOptions,
    ) -> Result<TransactionDraft, BchError> {
        let received = total_satoshis(&inputs)?;
        let spend = sum_outputs(&outputs)?;
        let input_count = inputs.len();
        let policy = options.fee_paid_by;

        let change_output = ResolvedOutput {
            script: change_script,
            satoshis: 0,
            token: None,
            role: OutputRole::Change,
        };
        let fee_without = self.fee_of(input_count, &outputs, None, options);
        let fee_with = self.fee_of(input_count, &outputs, Some(&change_output), options);

        let surplus = received.checked_sub(spend).ok_or(BchError::InsufficientFunds {
            required: spend,
            available: received,
        });

        match policy {
            FeePaidBy::Input => {
                let surplus = surplus?;
                let payers: Vec<usize> = fee_payers(&outputs);
                let [payer] = payers.as_slice() else {
                    return Err(BchError::InvalidRequest(format!(
                        "fee paid by input needs exactly one plain output, found {}",
                        payers.len()
                    )));
                };
                let gross = outputs[*payer].satoshis.saturating_add(surplus);
                let value = gross.saturating_sub(fee_without);
                if gross < fee_without || value < DUST_THRESHOLD {
                    return Err(BchError::DustOutputRequested {
                        satoshis: value,
                        threshold: DUST_THRESHOLD,
                    });
                }
                outputs[*payer].satoshis = value;
            }
            FeePaidBy::First | FeePaidBy::Last | FeePaidBy::Any => {
                let surplus = received.saturating_sub(spend);
                if surplus >= DUST_THRESHOLD {
                    deduct_fee(&mut outputs, fee_with, policy)?;
                    outputs.push(ResolvedOutput {
                        satoshis: surplus,
                        ..change_output
                    });
                } else {
                    // Leftover below dust is folded into the fee.
                    deduct_fee(&mut outputs, fee_without, policy)?;
                }
            }
            FeePaidBy::Change
            | FeePaidBy::ChangeThenFirst
            | FeePaidBy::ChangeThenLast
            | FeePaidBy::ChangeThenAny => {
                let surplus = surplus?;
                match surplus.checked_sub(fee_with) {
                    Some(change) if change >= DUST_THRESHOLD => outputs.push(ResolvedOutput {
                        satoshis: change,
                        ..change_output
                    }),
                    _ if surplus >= fee_without => {
                        debug!("folding {surplus} sat of sub-dust change into the fee");
                    }
                    _ => match policy.fallback() {
                        Some(fallback) => {
                            deduct_fee(&mut outputs, fee_without - surplus, fallback)?
                        }
                        None => {
                            return Err(BchError::InsufficientFunds {
                                required: spend.saturating_add(fee_without),
                                available: received,
                            })
                        }
                    },
                }
            }
        }

        let out_total = sum_outputs(&outputs)?;
        let fee = received
            .checked_sub(out_total)
            .ok_or(BchError::InsufficientFunds {
                required: out_total,
                available: received,
            })?;
        let minimum = self.fee_of(input_count, &outputs, None, options);
        if fee < minimum {
            return Err(BchError::InsufficientFunds {
                required: out_total.saturating_add(minimum),
                available: received,
            });
        }

        Ok(TransactionDraft {
            inputs,
            outputs,
            fee_satoshis: fee,
        })
    }

    /// Send everything spendable (or everything pinned) to one address.
    /// The single output is the input total minus the fee; there is no change.
    pub fn build_max(
        &self,
        to: &str,
        available: &[Utxo],
        options: &BuildOptions,
    ) -> Result<TransactionDraft, BchError> {
        let script = self.codec.decode(to)?;
        let inputs = Funding {
            pool: available,
            pinned: options.pinned.as_deref(),
            base_inputs: &[],
            base_sats: 0,
        }
        .sweep(options.best_height)?;
        let received = total_satoshis(&inputs)?;
        let output = ResolvedOutput::new(script, 0);
        let fee = self.fee_of(inputs.len(), std::slice::from_ref(&output), None, options);
        let value = received
            .checked_sub(fee)
            .filter(|v| *v >= DUST_THRESHOLD && !inputs.is_empty())
            .ok_or(BchError::InsufficientFunds {
                required: fee.saturating_add(DUST_THRESHOLD),
                available: received,
            })?;
        debug!(
            "send max: {} input(s), {received} sat, fee {fee}, delivering {value}",
            inputs.len()
        );
        Ok(TransactionDraft {
            inputs,
            outputs: vec![ResolvedOutput {
                satoshis: value,
                ..output
            }],
            fee_satoshis: fee,
        })
    }

    fn fee_for(&self, input_count: usize, shapes: &[OutputShape], options: &BuildOptions) -> u64 {
        self.estimator.estimate(&FeeEstimateContext {
            input_count: u32::try_from(input_count).unwrap_or(u32::MAX),
            outputs: shapes.to_vec(),
            fee_rate_per_byte: options.fee_rate,
            fee_paid_by: options.fee_paid_by,
        })
    }

    fn fee_of(
        &self,
        input_count: usize,
        outputs: &[ResolvedOutput],
        extra: Option<&ResolvedOutput>,
        options: &BuildOptions,
    ) -> u64 {
        let shapes: Vec<OutputShape> = outputs
            .iter()
            .chain(extra)
            .map(ResolvedOutput::shape)
            .collect();
        self.fee_for(input_count, &shapes, options)
    }
}

/// Outputs a plan may draw on beyond its required and token inputs.
#[derive(Clone, Copy)]
struct Funding<'a> {
    pool: &'a [Utxo],
    pinned: Option<&'a [UtxoId]>,
    base_inputs: &'a [Utxo],
    base_sats: u64,
}

impl Funding<'_> {
    /// Every pinned output, or every mature plain output of the pool.
    fn sweep(&self, best_height: u64) -> Result<Vec<Utxo>, BchError> {
        match self.pinned {
            Some(ids) => utxo::resolve_pinned(self.pool, ids, best_height),
            None => Ok(self
                .pool
                .iter()
                .filter(|u| !u.is_token_bearing() && u.is_mature(best_height))
                .cloned()
                .collect()),
        }
    }
}

fn check_dust(output: &ResolvedOutput) -> Result<(), BchError> {
    if !output.is_data_carrier() && output.satoshis < DUST_THRESHOLD {
        return Err(BchError::DustOutputRequested {
            satoshis: output.satoshis,
            threshold: DUST_THRESHOLD,
        });
    }
    Ok(())
}

fn sum_outputs(outputs: &[ResolvedOutput]) -> Result<u64, BchError> {
    outputs
        .iter()
        .try_fold(0u64, |acc, o| acc.checked_add(o.satoshis))
        .ok_or_else(|| BchError::InvalidAmount("output total overflows 64 bits".into()))
}

fn fee_payers(outputs: &[ResolvedOutput]) -> Vec<usize> {
    outputs
        .iter()
        .enumerate()
        .filter(|(_, o)| o.can_pay_fee())
        .map(|(i, _)| i)
        .collect()
}

/// Take `fee` out of plain request outputs per `policy` (first, last or any).
fn deduct_fee(
    outputs: &mut Vec<ResolvedOutput>,
    fee: u64,
    policy: FeePaidBy,
) -> Result<(), BchError> {
    if fee == 0 {
        return Ok(());
    }
    let payers = fee_payers(outputs);
    if payers.is_empty() {
        return Err(BchError::InvalidRequest(
            "no plain output can pay the fee".into(),
        ));
    }

    match policy {
        FeePaidBy::First | FeePaidBy::Last => {
            let index = if policy == FeePaidBy::First {
                payers[0]
            } else {
                payers[payers.len() - 1]
            };
            let value = outputs[index].satoshis.saturating_sub(fee);
            if outputs[index].satoshis < fee || value < DUST_THRESHOLD {
                return Err(BchError::DustOutputRequested {
                    satoshis: value,
                    threshold: DUST_THRESHOLD,
                });
            }
            outputs[index].satoshis = value;
        }
        FeePaidBy::Any => {
            let spare: u64 = payers
                .iter()
                .map(|&i| outputs[i].satoshis.saturating_sub(DUST_THRESHOLD))
                .sum();
            if spare < fee {
                return Err(BchError::InsufficientFunds {
                    required: fee,
                    available: spare,
                });
            }

            let mut order = payers;
            order.sort_by_key(|&i| outputs[i].satoshis);
            let n = order.len() as u64;
            let mut remaining = fee;
            for (r, &index) in order.iter().enumerate() {
                if remaining == 0 {
                    break;
                }
                let share_count = n - r as u64;
                let share = remaining / share_count + remaining % share_count;
                let value = outputs[index].satoshis;
                if value < share.saturating_add(DUST_THRESHOLD) {
                    // Too small to keep after its share; it goes to the fee whole.
                    remaining = remaining.saturating_sub(value);
                    outputs[index].satoshis = 0;
                } else {
                    remaining -= share;
                    outputs[index].satoshis = value - share;
                }
            }
            outputs.retain(|o| !(o.can_pay_fee() && o.satoshis == 0));
        }
        other => {
            return Err(BchError::InvalidRequest(format!(
                "{other:?} does not deduct from outputs"
            )))
        }
    }
    Ok(())
}

/// Choose token inputs for the token outputs and compute token change.
///
/// With `pinned`, exactly the given token outputs are spent and each must
/// belong to a requested category.
fn fund_tokens(
    outputs: &[ResolvedOutput],
    available: &[Utxo],
    pinned: Option<&[Utxo]>,
    best_height: u64,
    change_script: &LockingBytecode,
) -> Result<(Vec<Utxo>, Vec<ResolvedOutput>), BchError> {
    let mut categories: Vec<String> = Vec::new();
    for token in outputs.iter().filter_map(|o| o.token.as_ref()) {
        let category = token.category.to_ascii_lowercase();
        if !categories.contains(&category) {
            categories.push(category);
        }
    }

    let mut inputs: Vec<Utxo> = Vec::new();
    let mut change = Vec::new();
    for category in &categories {
        let requested: Vec<&TokenDatum> = outputs
            .iter()
            .filter_map(|o| o.token.as_ref())
            .filter(|t| t.category.eq_ignore_ascii_case(category))
            .collect();
        let nfts: Vec<&Nft> = requested.iter().filter_map(|t| t.nft.as_ref()).collect();
        let fungible = requested
            .iter()
            .try_fold(0u64, |acc, t| acc.checked_add(t.amount))
            .ok_or_else(|| BchError::InvalidToken("token amount overflows 64 bits".into()))?;

        let chosen = match pinned {
            Some(pinned) => pinned
                .iter()
                .filter(|u| {
                    u.token
                        .as_ref()
                        .is_some_and(|t| t.category.eq_ignore_ascii_case(category))
                })
                .cloned()
                .collect(),
            None => utxo::select_tokens(available, category, &nfts, fungible, best_height)?,
        };

        let have = chosen
            .iter()
            .filter_map(|u| u.token.as_ref())
            .try_fold(0u64, |acc, t| acc.checked_add(t.amount))
            .ok_or_else(|| BchError::InvalidToken("token amount overflows 64 bits".into()))?;
        if have < fungible {
            return Err(BchError::InsufficientTokens {
                category: category.clone(),
                required: fungible,
                available: have,
            });
        }

        let mut spare_nfts: Vec<Nft> = chosen
            .iter()
            .filter_map(|u| u.token.as_ref().and_then(|t| t.nft.clone()))
            .collect();
        for wanted in &nfts {
            let position = spare_nfts.iter().position(|n| n == *wanted).ok_or_else(|| {
                BchError::InvalidToken(format!(
                    "no input holds the requested nft of category {category}"
                ))
            })?;
            spare_nfts.remove(position);
        }
        for nft in spare_nfts {
            change.push(token_change(change_script, category, 0, Some(nft)));
        }
        if have > fungible {
            change.push(token_change(change_script, category, have - fungible, None));
        }
        inputs.extend(chosen);
    }

    if let Some(pinned) = pinned {
        if let Some(stray) = pinned.iter().find(|u| {
            !u.token
                .as_ref()
                .is_some_and(|t| categories.iter().any(|c| t.category.eq_ignore_ascii_case(c)))
        }) {
            return Err(BchError::TokenInputRejected(stray.id().to_string()));
        }
    }
    if !inputs.is_empty() {
        debug!(
            "token funding: {} input(s), {} change output(s)",
            inputs.len(),
            change.len()
        );
    }
    Ok((inputs, change))
}

fn token_change(
    script: &LockingBytecode,
    category: &str,
    amount: u64,
    nft: Option<Nft>,
) -> ResolvedOutput {
    ResolvedOutput {
        script: script.clone(),
        satoshis: DUST_THRESHOLD,
        token: Some(TokenDatum {
            category: category.to_string(),
            amount,
            nft,
        }),
        role: OutputRole::TokenChange,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cashtoken::NftCapability;
    use crate::transaction::P2pkhSigner;

    const ALICE: &str = "bitcoincash:qr6m7j9njldwwzlg9v7v53unlr4jkmx6eylep8ekg2";
    const BOB: &str = "bitcoincash:qp63uahgrxged4z5jswyt5dn5v3lzsem6cy4spdc2h";
    const CATEGORY: &str = "c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1c1";

    fn make_utxo(tag: char, satoshis: u64) -> Utxo {
        Utxo::new(tag.to_string().repeat(64), 0, satoshis)
    }

    fn token_utxo(tag: char, token: TokenDatum) -> Utxo {
        Utxo {
            token: Some(token),
            ..make_utxo(tag, 1_000)
        }
    }

    fn options() -> BuildOptions {
        BuildOptions::new(ALICE)
    }

    fn assembler() -> TransactionAssembler {
        TransactionAssembler::default()
    }

    #[test]
    fn simple_send_has_change_and_balances() {
        let utxos = vec![make_utxo('a', 100_000)];
        let draft = assembler()
            .build(&[SendRequest::value(BOB, 10_000)], &utxos, &options())
            .unwrap();
        assert!(draft.is_balanced());
        assert_eq!(draft.outputs.len(), 2);
        assert_eq!(draft.outputs[0].satoshis, 10_000);
        // 1 input, 2 p2pkh outputs at 1 sat/byte.
        assert_eq!(draft.fee_satoshis, 227);
        assert_eq!(draft.change().unwrap().satoshis, 100_000 - 10_000 - 227);
    }

    #[test]
    fn sub_dust_change_folds_into_fee() {
        // 1 in / 2 out costs 227, so 10_000 + 227 + 400 leaves 400 of change.
        let utxos = vec![make_utxo('a', 10_627)];
        let draft = assembler()
            .build(&[SendRequest::value(BOB, 10_000)], &utxos, &options())
            .unwrap();
        assert!(draft.change().is_none());
        assert_eq!(draft.outputs.len(), 1);
        assert_eq!(draft.fee_satoshis, 627);
        assert!(draft.is_balanced());
    }

    #[test]
    fn change_at_exact_dust_is_kept() {
        let utxos = vec![make_utxo('a', 10_000 + 227 + DUST_THRESHOLD)];
        let draft = assembler()
            .build(&[SendRequest::value(BOB, 10_000)], &utxos, &options())
            .unwrap();
        assert_eq!(draft.change().unwrap().satoshis, DUST_THRESHOLD);
    }

    #[test]
    fn fee_grows_with_inputs_until_converged() {
        let utxos: Vec<Utxo> = ('a'..='j').map(|c| make_utxo(c, 1_000)).collect();
        let draft = assembler()
            .build(&[SendRequest::value(BOB, 5_000)], &utxos, &options())
            .unwrap();
        assert!(draft.is_balanced());
        assert!(draft.inputs.len() >= 6);
        let minimum = assembler().fee_of(draft.inputs.len(), &draft.outputs, None, &options());
        assert!(draft.fee_satoshis >= minimum);
    }

    #[test]
    fn iteration_cap_fails_closed() {
        let utxos: Vec<Utxo> = ('a'..='j').map(|c| make_utxo(c, 1_000)).collect();
        let capped = TransactionAssembler::new(EngineConfig {
            max_fee_iterations: 1,
            ..EngineConfig::default()
        });
        assert!(matches!(
            capped.build(&[SendRequest::value(BOB, 5_000)], &utxos, &options()),
            Err(BchError::InsufficientFunds { .. })
        ));
    }

    #[test]
    fn insufficient_funds() {
        let utxos = vec![make_utxo('a', 5_000)];
        assert!(matches!(
            assembler().build(&[SendRequest::value(BOB, 5_000)], &utxos, &options()),
            Err(BchError::InsufficientFunds { .. })
        ));
    }

    #[test]
    fn dust_request_rejected() {
        let utxos = vec![make_utxo('a', 100_000)];
        assert!(matches!(
            assembler().build(&[SendRequest::value(BOB, 545)], &utxos, &options()),
            Err(BchError::DustOutputRequested { satoshis: 545, .. })
        ));
    }

    #[test]
    fn usd_request_needs_rate() {
        let utxos = vec![make_utxo('a', 10_000_000)];
        let request = SendRequest::Unit {
            to: BOB.into(),
            amount: Amount::usd(1.0),
        };
        assert!(assembler().build(&[request.clone()], &utxos, &options()).is_err());
        let opts = BuildOptions {
            usd_rate: Some(100.0),
            ..options()
        };
        let draft = assembler().build(&[request], &utxos, &opts).unwrap();
        assert_eq!(draft.outputs[0].satoshis, 1_000_000);
    }

    #[test]
    fn op_return_is_zero_valued_and_ordered() {
        let utxos = vec![make_utxo('a', 100_000)];
        let requests = vec![
            SendRequest::value(BOB, 1_000),
            SendRequest::OpReturn {
                chunks: vec![b"memo".to_vec()],
            },
        ];
        let draft = assembler().build(&requests, &utxos, &options()).unwrap();
        assert_eq!(draft.outputs[1].satoshis, 0);
        assert!(draft.outputs[1].is_data_carrier());
        assert_eq!(draft.outputs[2].role, OutputRole::Change);
    }

    #[test]
    fn pinned_inputs_used_exactly() {
        let utxos = vec![
            make_utxo('a', 600),
            make_utxo('b', 20_000),
            make_utxo('c', 30_000),
        ];
        let opts = BuildOptions {
            pinned: Some(vec![utxos[2].id(), utxos[1].id()]),
            ..options()
        };
        let draft = assembler()
            .build(&[SendRequest::value(BOB, 1_000)], &utxos, &opts)
            .unwrap();
        let ids: Vec<UtxoId> = draft.inputs.iter().map(Utxo::id).collect();
        assert_eq!(ids, vec![utxos[2].id(), utxos[1].id()]);
    }

    #[test]
    fn token_utxos_not_spent_by_plain_send() {
        let utxos = vec![
            token_utxo('t', TokenDatum::fungible(CATEGORY, 50)),
            make_utxo('a', 50_000),
        ];
        let draft = assembler()
            .build(&[SendRequest::value(BOB, 1_000)], &utxos, &options())
            .unwrap();
        assert!(draft.inputs.iter().all(|u| u.token.is_none()));
        assert!(draft.outputs.iter().all(|o| o.token.is_none()));
    }

    #[test]
    fn pinned_token_utxo_rejected_for_plain_send() {
        let utxos = vec![
            token_utxo('t', TokenDatum::fungible(CATEGORY, 50)),
            make_utxo('a', 50_000),
        ];
        let opts = BuildOptions {
            pinned: Some(vec![utxos[0].id(), utxos[1].id()]),
            ..options()
        };
        assert!(matches!(
            assembler().build(&[SendRequest::value(BOB, 1_000)], &utxos, &opts),
            Err(BchError::TokenInputRejected(_))
        ));
    }

    #[test]
    fn fungible_token_send_returns_token_change() {
        let utxos = vec![
            token_utxo('t', TokenDatum::fungible(CATEGORY, 50)),
            token_utxo('u', TokenDatum::fungible(CATEGORY, 5)),
            make_utxo('a', 50_000),
        ];
        let draft = assembler()
            .build(
                &[SendRequest::token(BOB, TokenDatum::fungible(CATEGORY, 20))],
                &utxos,
                &options(),
            )
            .unwrap();
        assert!(draft.is_balanced());
        assert_eq!(draft.outputs[0].satoshis, DUST_THRESHOLD);
        let token_in: u64 = draft.inputs.iter().filter_map(|u| u.token.as_ref()).map(|t| t.amount).sum();
        let token_out: u64 = draft.outputs.iter().filter_map(|o| o.token.as_ref()).map(|t| t.amount).sum();
        assert_eq!(token_in, token_out);
        let change = draft
            .outputs
            .iter()
            .find(|o| o.role == OutputRole::TokenChange)
            .unwrap();
        assert_eq!(change.token.as_ref().unwrap().amount, token_in - 20);
    }

    #[test]
    fn nft_send_keeps_other_nfts_home() {
        let utxos = vec![
            token_utxo('n', TokenDatum::nft(CATEGORY, NftCapability::None, vec![1])),
            token_utxo('m', TokenDatum::nft(CATEGORY, NftCapability::None, vec![2])),
            make_utxo('a', 50_000),
        ];
        let draft = assembler()
            .build(
                &[SendRequest::token(
                    BOB,
                    TokenDatum::nft(CATEGORY, NftCapability::None, vec![2]),
                )],
                &utxos,
                &options(),
            )
            .unwrap();
        let nft_inputs: Vec<&Utxo> = draft.inputs.iter().filter(|u| u.token.is_some()).collect();
        assert_eq!(nft_inputs.len(), 1);
        assert_eq!(nft_inputs[0].txid, "m".repeat(64));
        assert!(draft.outputs.iter().all(|o| o.role != OutputRole::TokenChange));
    }

    #[test]
    fn insufficient_tokens() {
        let utxos = vec![
            token_utxo('t', TokenDatum::fungible(CATEGORY, 5)),
            make_utxo('a', 50_000),
        ];
        assert!(matches!(
            assembler().build(
                &[SendRequest::token(BOB, TokenDatum::fungible(CATEGORY, 6))],
                &utxos,
                &options()
            ),
            Err(BchError::InsufficientTokens { required: 6, available: 5, .. })
        ));
    }

    #[test]
    fn fee_paid_by_first_and_last() {
        let utxos = vec![make_utxo('a', 20_000)];
        let requests = vec![SendRequest::value(BOB, 10_000), SendRequest::value(BOB, 10_000)];
        let first = BuildOptions {
            fee_paid_by: FeePaidBy::First,
            ..options()
        };
        let draft = assembler().build(&requests, &utxos, &first).unwrap();
        assert!(draft.is_balanced());
        assert!(draft.change().is_none());
        assert_eq!(draft.outputs[1].satoshis, 10_000);
        assert_eq!(draft.outputs[0].satoshis, 10_000 - draft.fee_satoshis);

        let last = BuildOptions {
            fee_paid_by: FeePaidBy::Last,
            ..options()
        };
        let draft = assembler().build(&requests, &utxos, &last).unwrap();
        assert_eq!(draft.outputs[0].satoshis, 10_000);
        assert_eq!(draft.outputs[1].satoshis, 10_000 - draft.fee_satoshis);
    }

    #[test]
    fn fee_paid_by_first_into_dust_fails() {
        let utxos = vec![make_utxo('a', 20_000)];
        let requests = vec![SendRequest::value(BOB, 600), SendRequest::value(BOB, 10_000)];
        let opts = BuildOptions {
            fee_paid_by: FeePaidBy::First,
            ..options()
        };
        assert!(matches!(
            assembler().build(&requests, &utxos, &opts),
            Err(BchError::DustOutputRequested { .. })
        ));
    }

    #[test]
    fn fee_paid_by_any_spreads_from_smallest() {
        let mut outputs = vec![
            ResolvedOutput::new(LockingBytecode::p2pkh(&[1; 20]), 5_000),
            ResolvedOutput::new(LockingBytecode::p2pkh(&[2; 20]), 1_000),
            ResolvedOutput::new(LockingBytecode::p2pkh(&[3; 20]), 3_000),
        ];
        deduct_fee(&mut outputs, 301, FeePaidBy::Any).unwrap();
        // Smallest pays floor(301/3) + 301 % 3 = 101, then 100 each.
        assert_eq!(outputs[1].satoshis, 899);
        assert_eq!(outputs[2].satoshis, 2_900);
        assert_eq!(outputs[0].satoshis, 4_900);
    }

    #[test]
    fn fee_paid_by_any_consumes_outputs_that_would_become_dust() {
        let mut outputs = vec![
            ResolvedOutput::new(LockingBytecode::p2pkh(&[1; 20]), 600),
            ResolvedOutput::new(LockingBytecode::p2pkh(&[2; 20]), 10_000),
        ];
        deduct_fee(&mut outputs, 200, FeePaidBy::Any).unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].satoshis, 10_000);
    }

    #[test]
    fn fee_paid_by_any_needs_spare_value() {
        let mut outputs = vec![ResolvedOutput::new(LockingBytecode::p2pkh(&[1; 20]), 700)];
        assert!(matches!(
            deduct_fee(&mut outputs, 200, FeePaidBy::Any),
            Err(BchError::InsufficientFunds { required: 200, available: 154 })
        ));
    }

    #[test]
    fn token_outputs_never_pay_fee() {
        let mut outputs = vec![ResolvedOutput::with_token(
            LockingBytecode::p2pkh(&[1; 20]),
            10_000,
            TokenDatum::fungible(CATEGORY, 1),
        )];
        assert!(matches!(
            deduct_fee(&mut outputs, 200, FeePaidBy::First),
            Err(BchError::InvalidRequest(_))
        ));
    }

    #[test]
    fn change_then_first_uses_outputs_when_change_short() {
        let utxos = vec![make_utxo('a', 10_100)];
        let opts = BuildOptions {
            fee_paid_by: FeePaidBy::ChangeThenFirst,
            ..options()
        };
        let draft = assembler()
            .build(&[SendRequest::value(BOB, 10_000)], &utxos, &opts)
            .unwrap();
        assert!(draft.is_balanced());
        assert!(draft.change().is_none());
        // 1 in / 1 out costs 193; change covered 100 of it.
        assert_eq!(draft.fee_satoshis, 193);
        assert_eq!(draft.outputs[0].satoshis, 10_000 - 93);
    }

    #[test]
    fn change_then_any_behaves_like_change_when_funded() {
        let utxos = vec![make_utxo('a', 100_000)];
        let opts = BuildOptions {
            fee_paid_by: FeePaidBy::ChangeThenAny,
            ..options()
        };
        let draft = assembler()
            .build(&[SendRequest::value(BOB, 10_000)], &utxos, &opts)
            .unwrap();
        assert_eq!(draft.outputs[0].satoshis, 10_000);
        assert!(draft.change().is_some());
    }

    #[test]
    fn fee_paid_by_input_takes_remainder() {
        let utxos = vec![make_utxo('a', 50_000)];
        let opts = BuildOptions {
            fee_paid_by: FeePaidBy::Input,
            pinned: Some(vec![utxos[0].id()]),
            ..options()
        };
        let draft = assembler()
            .build(&[SendRequest::value(BOB, 50_000)], &utxos, &opts)
            .unwrap();
        assert_eq!(draft.outputs.len(), 1);
        assert_eq!(draft.fee_satoshis, 193);
        assert_eq!(draft.outputs[0].satoshis, 50_000 - 193);

        let two = vec![SendRequest::value(BOB, 1_000), SendRequest::value(ALICE, 1_000)];
        assert!(matches!(
            assembler().build(&two, &utxos, &opts),
            Err(BchError::InvalidRequest(_))
        ));
    }

    #[test]
    fn fee_paid_by_input_spends_every_plain_utxo() {
        let utxos = vec![
            make_utxo('a', 1_000_000),
            make_utxo('b', 5_000_000),
            token_utxo('t', TokenDatum::fungible(CATEGORY, 10)),
        ];
        let opts = BuildOptions {
            fee_paid_by: FeePaidBy::Input,
            ..options()
        };
        let draft = assembler()
            .build(&[SendRequest::value(BOB, 1_000)], &utxos, &opts)
            .unwrap();
        assert_eq!(draft.inputs.len(), 2);
        assert!(draft.inputs.iter().all(|u| u.token.is_none()));
        assert_eq!(draft.outputs.len(), 1);
        assert_eq!(draft.fee_satoshis, 342);
        assert_eq!(draft.outputs[0].satoshis, 6_000_000 - 342);
        assert!(draft.is_balanced());
    }

    #[test]
    fn fee_paid_by_input_short_balance() {
        let utxos = vec![make_utxo('a', 600)];
        let opts = BuildOptions {
            fee_paid_by: FeePaidBy::Input,
            ..options()
        };
        assert!(matches!(
            assembler().build(&[SendRequest::value(BOB, 1_000)], &utxos, &opts),
            Err(BchError::InsufficientFunds { .. })
        ));
    }

    #[test]
    fn fee_paid_by_input_rejected_for_slp_plan() {
        let utxos = vec![make_utxo('a', 1_000_000)];
        let plan = BuildPlan {
            data_carrier: Some(DataCarrierOutput::new(op_return(&[b"SLP\0".to_vec()]))),
            outputs: assembler().resolve(&[SendRequest::value(BOB, DUST_THRESHOLD)], None).unwrap(),
            ..BuildPlan::default()
        };
        let opts = BuildOptions {
            fee_paid_by: FeePaidBy::Input,
            ..options()
        };
        assert!(matches!(
            assembler().build_plan(plan, &utxos, &opts),
            Err(BchError::InvalidRequest(_))
        ));
    }

    #[test]
    fn data_carrier_goes_first() {
        let utxos = vec![make_utxo('a', 100_000)];
        let plan = BuildPlan {
            data_carrier: Some(DataCarrierOutput::new(op_return(&[b"SLP\0".to_vec()]))),
            outputs: assembler().resolve(&[SendRequest::value(BOB, DUST_THRESHOLD)], None).unwrap(),
            ..BuildPlan::default()
        };
        let draft = assembler().build_plan(plan, &utxos, &options()).unwrap();
        assert!(draft.outputs[0].is_data_carrier());
        assert_eq!(draft.outputs[0].satoshis, 0);
        assert_eq!(draft.outputs[1].satoshis, DUST_THRESHOLD);
        assert!(draft.is_balanced());
    }

    #[test]
    fn required_inputs_come_first() {
        let required = token_utxo('r', TokenDatum::fungible(CATEGORY, 10));
        let utxos = vec![required.clone(), make_utxo('a', 100_000)];
        let plan = BuildPlan {
            outputs: vec![ResolvedOutput::with_token(
                LockingBytecode::p2pkh(&[9; 20]),
                5_000,
                TokenDatum::fungible(CATEGORY, 10),
            )],
            required_inputs: vec![required.clone()],
            ..BuildPlan::default()
        };
        let draft = assembler().build_plan(plan, &utxos, &options()).unwrap();
        assert_eq!(draft.inputs[0], required);
        assert_eq!(draft.inputs.len(), 2);
        assert!(draft.is_balanced());
    }

    #[test]
    fn send_max_empties_wallet() {
        let utxos = vec![
            make_utxo('a', 10_000),
            make_utxo('b', 20_000),
            token_utxo('t', TokenDatum::fungible(CATEGORY, 1)),
        ];
        let draft = assembler().build_max(BOB, &utxos, &options()).unwrap();
        assert_eq!(draft.inputs.len(), 2);
        assert_eq!(draft.outputs.len(), 1);
        // 2 inputs, 1 output: 4 + 1 + 298 + 1 + 34 + 4.
        assert_eq!(draft.fee_satoshis, 342);
        assert_eq!(draft.outputs[0].satoshis, 30_000 - 342);
        assert!(draft.is_balanced());
    }

    #[test]
    fn send_max_too_small() {
        let utxos = vec![make_utxo('a', 700)];
        assert!(matches!(
            assembler().build_max(BOB, &utxos, &options()),
            Err(BchError::InsufficientFunds { .. })
        ));
        assert!(assembler().build_max(BOB, &[], &options()).is_err());
    }

    #[test]
    fn signed_draft_parses_back() {
        let mut key = [0u8; 32];
        key[31] = 1;
        let signer = P2pkhSigner::from_bytes(&key).unwrap();
        let utxos = vec![make_utxo('a', 100_000)];
        let draft = assembler()
            .build(&[SendRequest::value(ALICE, 10_000)], &utxos, &BuildOptions::new(BOB))
            .unwrap();
        let locking = LockingBytecode::p2pkh(&signer.pubkey_hash());
        let signed = draft.sign(&signer, &locking).unwrap();
        let bytes = signed.to_bytes().unwrap();
        let parsed = Transaction::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.inputs.len(), 1);
        assert_eq!(parsed.outputs[0].satoshis, 10_000);
        // The size budget per input is never below the real signed size.
        let budget = assembler().fee_of(1, &draft.outputs, None, &BuildOptions::new(BOB));
        assert!(bytes.len() as u64 <= budget);
        assert!(draft.unsigned_bytes().unwrap().len() < bytes.len());
    }
}
