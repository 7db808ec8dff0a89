//! Wallet orchestration on top of `chain-bch`: key material, collaborator
//! traits, the exchange-rate cache, and the send/sendMax, SLP and CashToken
//! operations that fetch outputs, build, sign and broadcast.

pub mod config;
pub mod error;
pub mod key;
pub mod mnemonic;
pub mod provider;
pub mod rate;
pub mod send;
pub mod slp;
pub mod tokens;
pub mod wallet;

pub use config::{SendOptions, WalletConfig};
pub use error::WalletError;
pub use key::{KeyMaterial, PrivateKey};
pub use provider::{RateSource, SourceError, UtxoSource};
pub use send::SendResponse;
pub use slp::{GenesisResponse, SlpBalance, SlpGenesisOptions, SlpMintOptions, SlpSendRequest};
pub use tokens::{TokenGenesisOptions, TokenMintRequest};
pub use wallet::Wallet;
