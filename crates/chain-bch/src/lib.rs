//! Bitcoin Cash chain support for the wallet.
//!
//! Turns spend requests (plain value, CashToken-aware, SLP) into a funded,
//! fee-correct, dust-safe transaction: CashAddr codec, amount/unit model,
//! coin selection, fee estimation, SLP and CashToken output encoding,
//! transaction assembly with fee convergence, BCH (FORKID) sighash and P2PKH
//! signing.

pub mod address;
pub mod amount;
pub mod assembler;
pub mod cashtoken;
pub mod error;
pub mod fee;
pub mod network;
pub mod script;
pub mod slp;
pub mod transaction;
pub mod utxo;

/// Minimum value (satoshis) of any output that is not a data carrier.
pub const DUST_THRESHOLD: u64 = 546;
