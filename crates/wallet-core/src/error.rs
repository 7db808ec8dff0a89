use chain_bch::error::BchError;
use thiserror::Error;

use crate::provider::SourceError;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    #[error("key derivation failed: {0}")]
    DerivationFailed(String),

    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("wallet is watch-only and cannot sign")]
    WatchOnly,

    #[error("unknown token: {0}")]
    UnknownToken(String),

    #[error("exchange rate unavailable: {0}")]
    RateUnavailable(String),

    /// A broadcast was rejected because an input is already spent.
    #[error("stale inputs: {0}")]
    StaleInputs(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("operation timed out after {0} ms")]
    Timeout(u64),

    #[error(transparent)]
    Engine(#[from] BchError),
}

impl From<SourceError> for WalletError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::StaleInputs(msg) => WalletError::StaleInputs(msg),
            SourceError::Network(msg) => WalletError::Network(msg),
        }
    }
}

impl WalletError {
    /// The engine error behind this failure, if any.
    pub fn engine(&self) -> Option<&BchError> {
        match self {
            WalletError::Engine(e) => Some(e),
            _ => None,
        }
    }
}
