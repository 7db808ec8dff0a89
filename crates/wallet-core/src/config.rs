use std::time::Duration;

use chain_bch::fee::{EngineConfig, FeePaidBy};
use chain_bch::network::BchNetwork;
use chain_bch::utxo::UtxoId;
use serde::{Deserialize, Serialize};

use crate::error::WalletError;

pub const DEFAULT_FEE_PER_BYTE: u64 = 1;
pub const DEFAULT_RATE_TTL_MS: u64 = 250_000;
pub const DEFAULT_IO_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_DERIVATION_PATH: &str = "m/44'/0'/0'/0/0";

/// Wallet-wide settings. Missing JSON fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    pub network: BchNetwork,
    /// Relay fee in satoshis per byte.
    pub fee_per_byte: u64,
    /// How long a BCH/USD quote stays fresh.
    pub rate_ttl_ms: u64,
    /// Deadline for each call to the UTXO or rate source.
    pub io_timeout_ms: u64,
    /// BIP-32 path used for mnemonic wallets.
    pub derivation_path: String,
    pub engine: EngineConfig,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            network: BchNetwork::Mainnet,
            fee_per_byte: DEFAULT_FEE_PER_BYTE,
            rate_ttl_ms: DEFAULT_RATE_TTL_MS,
            io_timeout_ms: DEFAULT_IO_TIMEOUT_MS,
            derivation_path: DEFAULT_DERIVATION_PATH.to_string(),
            engine: EngineConfig::default(),
        }
    }
}

impl WalletConfig {
    pub fn for_network(network: BchNetwork) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, WalletError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| WalletError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), WalletError> {
        if self.fee_per_byte == 0 {
            return Err(WalletError::InvalidConfig("fee_per_byte must be at least 1".into()));
        }
        if self.io_timeout_ms == 0 {
            return Err(WalletError::InvalidConfig("io_timeout_ms must be positive".into()));
        }
        if self.engine.max_fee_iterations == 0 {
            return Err(WalletError::InvalidConfig(
                "engine.max_fee_iterations must be positive".into(),
            ));
        }
        if !self.derivation_path.starts_with("m/") {
            return Err(WalletError::InvalidConfig(format!(
                "derivation path {:?} must start with m/",
                self.derivation_path
            )));
        }
        Ok(())
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn rate_ttl(&self) -> Duration {
        Duration::from_millis(self.rate_ttl_ms)
    }
}

/// Per-send overrides.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Spend exactly these outputs, in this order.
    pub utxo_ids: Option<Vec<UtxoId>>,
    /// Where change goes; the wallet's own address when unset.
    pub change_address: Option<String>,
    /// Overrides [`WalletConfig::fee_per_byte`].
    pub fee_per_byte: Option<u64>,
    pub fee_paid_by: FeePaidBy,
}

impl SendOptions {
    pub fn pinned(utxo_ids: Vec<UtxoId>) -> Self {
        Self {
            utxo_ids: Some(utxo_ids),
            ..Self::default()
        }
    }
}
