//! Collaborators the wallet talks to over the network.

use async_trait::async_trait;
use chain_bch::utxo::Utxo;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// The transaction spends an output that is no longer unspent.
    #[error("input already spent: {0}")]
    StaleInputs(String),

    #[error("{0}")]
    Network(String),
}

/// Supplies spendable outputs and relays transactions.
#[async_trait]
pub trait UtxoSource: Send + Sync {
    async fn list_utxos(&self, address: &str) -> Result<Vec<Utxo>, SourceError>;

    async fn block_height(&self) -> Result<u64, SourceError>;

    /// Relay a signed transaction, returning its txid.
    async fn broadcast(&self, raw_tx: &[u8]) -> Result<String, SourceError>;
}

/// Quotes the BCH price.
#[async_trait]
pub trait RateSource: Send + Sync {
    /// USD per 1 BCH.
    async fn usd_per_bch(&self) -> Result<f64, SourceError>;
}
