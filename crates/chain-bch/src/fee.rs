//! Fee estimation for a transaction shape.
//!
//! The estimator is a pure function of input count, output shapes and fee
//! rate. The circularity between fee and input count is resolved by the
//! assembler, which calls [`FeeEstimator::estimate`] once per round.

use serde::{Deserialize, Serialize};

use crate::cashtoken::TokenDatum;
use crate::script::{compact_size_len, LockingBytecode, ScriptKind, P2PKH_SCRIPT_LEN, P2SH_SCRIPT_LEN};

/// Worst-case P2PKH input: outpoint(36) + scriptSig length(1) +
/// scriptSig(1 + 72 DER sig + 1 sighash + 1 + 33 pubkey = 108) + sequence(4).
pub const DEFAULT_INPUT_BYTES: u64 = 149;

/// Hard cap on fee/selection rounds before giving up.
pub const DEFAULT_MAX_FEE_ITERATIONS: usize = 8;

/// version(4) + locktime(4); the input and output counts are added per shape.
const TX_FIXED_BYTES: u64 = 8;

/// Value field of every output.
const OUTPUT_VALUE_BYTES: u64 = 8;

/// Token prefix without commitment or amount: PREFIX_TOKEN + category + bitfield.
const TOKEN_PREFIX_BASE: u64 = 1 + 32 + 1;

/// Largest compact-size encoding of a fungible amount.
const TOKEN_AMOUNT_MAX_BYTES: u64 = 9;

/// Tunables for the transaction engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bytes budgeted per input, since signatures are unknown when sizing.
    pub input_bytes: u64,
    /// Fee/selection rounds allowed before the build fails closed.
    pub max_fee_iterations: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            input_bytes: DEFAULT_INPUT_BYTES,
            max_fee_iterations: DEFAULT_MAX_FEE_ITERATIONS,
        }
    }
}

/// Who pays the network fee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FeePaidBy {
    /// Deducted from the change output.
    #[default]
    Change,
    /// Deducted from the single spend output; no change is produced.
    Input,
    /// Deducted from the first plain spend output.
    First,
    /// Deducted from the last plain spend output.
    Last,
    /// Spread across plain spend outputs, smallest first.
    Any,
    ChangeThenFirst,
    ChangeThenLast,
    ChangeThenAny,
}

impl FeePaidBy {
    /// Whether change is consumed before any output is touched.
    pub fn uses_change(self) -> bool {
        matches!(
            self,
            FeePaidBy::Change
                | FeePaidBy::ChangeThenFirst
                | FeePaidBy::ChangeThenLast
                | FeePaidBy::ChangeThenAny
        )
    }

    /// The output policy that covers whatever change could not.
    pub fn fallback(self) -> Option<FeePaidBy> {
        match self {
            FeePaidBy::Change => None,
            FeePaidBy::ChangeThenFirst | FeePaidBy::First => Some(FeePaidBy::First),
            FeePaidBy::ChangeThenLast | FeePaidBy::Last => Some(FeePaidBy::Last),
            FeePaidBy::ChangeThenAny | FeePaidBy::Any => Some(FeePaidBy::Any),
            FeePaidBy::Input => Some(FeePaidBy::Input),
        }
    }
}

/// Enough about an output to know its serialized size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputShape {
    P2pkh,
    P2sh,
    /// OP_RETURN output with a locking script of exactly this many bytes.
    DataCarrier(usize),
    /// Token-carrying P2PKH output.
    TokenCategory {
        has_nft: bool,
        has_amount: bool,
        commitment_len: usize,
    },
    /// Any other locking script of known length.
    Bytecode(usize),
}

impl OutputShape {
    /// Classify an output by its script and token payload.
    pub fn of(script: &LockingBytecode, token: Option<&TokenDatum>) -> Self {
        if let Some(token) = token {
            let nft = token.nft.as_ref();
            return OutputShape::TokenCategory {
                has_nft: nft.is_some(),
                has_amount: token.amount > 0,
                commitment_len: nft.map_or(0, |n| n.commitment.len()),
            };
        }
        match script.kind() {
            ScriptKind::P2pkh(_) => OutputShape::P2pkh,
            ScriptKind::P2sh(_) => OutputShape::P2sh,
            ScriptKind::DataCarrier => OutputShape::DataCarrier(script.len()),
            ScriptKind::Other => OutputShape::Bytecode(script.len()),
        }
    }

    /// Serialized size of the output in bytes.
    pub fn size(self) -> u64 {
        let script_len = match self {
            OutputShape::P2pkh => P2PKH_SCRIPT_LEN as u64,
            OutputShape::P2sh => P2SH_SCRIPT_LEN as u64,
            OutputShape::DataCarrier(len) | OutputShape::Bytecode(len) => len as u64,
            OutputShape::TokenCategory {
                has_nft,
                has_amount,
                commitment_len,
            } => {
                let mut prefix = TOKEN_PREFIX_BASE;
                if has_nft && commitment_len > 0 {
                    prefix += compact_size_len(commitment_len as u64) + commitment_len as u64;
                }
                if has_amount {
                    prefix += TOKEN_AMOUNT_MAX_BYTES;
                }
                prefix + P2PKH_SCRIPT_LEN as u64
            }
        };
        OUTPUT_VALUE_BYTES + compact_size_len(script_len) + script_len
    }
}

/// Everything needed to price a draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeEstimateContext {
    pub input_count: u32,
    pub outputs: Vec<OutputShape>,
    pub fee_rate_per_byte: u64,
    pub fee_paid_by: FeePaidBy,
}

/// Prices transaction shapes with a configured per-input budget.
#[derive(Debug, Clone, Default)]
pub struct FeeEstimator {
    config: EngineConfig,
}

impl FeeEstimator {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Approximate serialized size, using the worst-case input budget.
    pub fn approx_size(&self, ctx: &FeeEstimateContext) -> u64 {
        let inputs = u64::from(ctx.input_count);
        let outputs: u64 = ctx.outputs.iter().map(|o| o.size()).sum();
        TX_FIXED_BYTES
            + compact_size_len(inputs)
            + compact_size_len(ctx.outputs.len() as u64)
            + inputs.saturating_mul(self.config.input_bytes)
            + outputs
    }

    /// Fee in satoshis for the given shape.
    pub fn estimate(&self, ctx: &FeeEstimateContext) -> u64 {
        self.approx_size(ctx).saturating_mul(ctx.fee_rate_per_byte)
    }
}

/// Fee for `ctx` under the default engine configuration.
pub fn estimate(ctx: &FeeEstimateContext) -> u64 {
    FeeEstimator::default().estimate(ctx)
}
