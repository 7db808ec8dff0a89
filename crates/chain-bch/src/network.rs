use serde::{Deserialize, Serialize};

/// Supported Bitcoin Cash networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BchNetwork {
    #[default]
    Mainnet,
    Testnet,
    Regtest,
}

impl BchNetwork {
    /// Human-readable part used by CashAddr on this network.
    pub fn cashaddr_prefix(self) -> &'static str {
        match self {
            BchNetwork::Mainnet => "bitcoincash",
            BchNetwork::Testnet => "bchtest",
            BchNetwork::Regtest => "bchreg",
        }
    }

    /// Version byte of WIF-encoded private keys.
    pub fn wif_version(self) -> u8 {
        match self {
            BchNetwork::Mainnet => 0x80,
            BchNetwork::Testnet | BchNetwork::Regtest => 0xEF,
        }
    }

    /// Look a network up by its CashAddr prefix.
    pub fn from_cashaddr_prefix(prefix: &str) -> Option<Self> {
        [BchNetwork::Mainnet, BchNetwork::Testnet, BchNetwork::Regtest]
            .into_iter()
            .find(|n| n.cashaddr_prefix().eq_ignore_ascii_case(prefix))
    }
}

impl std::fmt::Display for BchNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BchNetwork::Mainnet => write!(f, "mainnet"),
            BchNetwork::Testnet => write!(f, "testnet"),
            BchNetwork::Regtest => write!(f, "regtest"),
        }
    }
}
