//! The wallet value: a network, key material and the collaborators it talks to.

use std::future::Future;
use std::sync::Arc;

use chain_bch::address::CashAddress;
use chain_bch::amount::{satoshis_to_unit, Unit};
use chain_bch::assembler::{BuildOptions, TransactionAssembler};
use chain_bch::network::BchNetwork;
use chain_bch::script::LockingBytecode;
use chain_bch::utxo::{total_satoshis, Utxo};
use log::debug;

use crate::config::{SendOptions, WalletConfig};
use crate::error::WalletError;
use crate::key::{derive_from_mnemonic, KeyMaterial, PrivateKey};
use crate::mnemonic::generate_mnemonic;
use crate::provider::{RateSource, SourceError, UtxoSource};
use crate::rate::ExchangeRateCache;

/// Words in a phrase generated by [`Wallet::new_random`].
pub const NEW_WALLET_WORDS: usize = 12;

/// A single-address BCH wallet.
///
/// Spendable and watch-only wallets share this type; the difference lives in
/// [`KeyMaterial`]. Watch-only wallets can price and build drafts but every
/// call that signs fails with [`WalletError::WatchOnly`].
pub struct Wallet {
    pub(crate) network: BchNetwork,
    pub(crate) key: KeyMaterial,
    pub(crate) address: String,
    pub(crate) config: WalletConfig,
    pub(crate) source: Arc<dyn UtxoSource>,
    pub(crate) rates: Option<ExchangeRateCache>,
    pub(crate) assembler: TransactionAssembler,
}

impl Wallet {
    pub fn from_private_key(
        key: PrivateKey,
        config: WalletConfig,
        source: Arc<dyn UtxoSource>,
    ) -> Result<Self, WalletError> {
        config.validate()?;
        let address = key.address(config.network)?;
        Ok(Self::assemble(KeyMaterial::Spendable(key), address, config, source))
    }

    pub fn from_wif(
        wif: &str,
        config: WalletConfig,
        source: Arc<dyn UtxoSource>,
    ) -> Result<Self, WalletError> {
        let key = PrivateKey::from_wif(wif, config.network)?;
        Self::from_private_key(key, config, source)
    }

    /// Derive the key at `config.derivation_path`.
    pub fn from_mnemonic(
        phrase: &str,
        passphrase: &str,
        config: WalletConfig,
        source: Arc<dyn UtxoSource>,
    ) -> Result<Self, WalletError> {
        config.validate()?;
        let key = derive_from_mnemonic(phrase, passphrase, &config.derivation_path)?;
        Self::from_private_key(key, config, source)
    }

    /// A fresh wallet and the phrase that restores it.
    pub fn new_random(
        config: WalletConfig,
        source: Arc<dyn UtxoSource>,
    ) -> Result<(Self, String), WalletError> {
        let phrase = generate_mnemonic(NEW_WALLET_WORDS)?;
        let wallet = Self::from_mnemonic(&phrase, "", config, source)?;
        Ok((wallet, phrase))
    }

    pub fn watch_only(
        address: &str,
        config: WalletConfig,
        source: Arc<dyn UtxoSource>,
    ) -> Result<Self, WalletError> {
        config.validate()?;
        let parsed = CashAddress::parse(address)?;
        if parsed.network != config.network {
            return Err(WalletError::InvalidConfig(format!(
                "{address} is a {} address, wallet is on {}",
                parsed.network, config.network
            )));
        }
        Ok(Self::assemble(
            KeyMaterial::WatchOnly,
            parsed.encode(),
            config,
            source,
        ))
    }

    fn assemble(
        key: KeyMaterial,
        address: String,
        config: WalletConfig,
        source: Arc<dyn UtxoSource>,
    ) -> Self {
        Self {
            network: config.network,
            key,
            address,
            assembler: TransactionAssembler::new(config.engine.clone()),
            config,
            source,
            rates: None,
        }
    }

    /// Quote USD amounts through `source`, cached for `config.rate_ttl_ms`.
    pub fn with_rate_source(mut self, source: Arc<dyn RateSource>) -> Self {
        self.rates = Some(ExchangeRateCache::new(source, self.config.rate_ttl()));
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn network(&self) -> BchNetwork {
        self.network
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    pub fn is_watch_only(&self) -> bool {
        self.key.is_watch_only()
    }

    pub fn wif(&self) -> Result<String, WalletError> {
        Ok(self.key.private_key()?.to_wif(self.network))
    }

    /// Spendable BCH in satoshis. Token-bearing outputs are not counted.
    pub async fn balance(&self) -> Result<u64, WalletError> {
        let utxos = self.utxos().await?;
        Ok(total_satoshis(utxos.iter().filter(|u| !u.is_token_bearing()))?)
    }

    pub async fn balance_in(&self, unit: Unit) -> Result<f64, WalletError> {
        let sats = self.balance().await?;
        let rate = match unit {
            Unit::Usd => Some(self.usd_rate().await?),
            Unit::Bch | Unit::Sat => None,
        };
        Ok(satoshis_to_unit(sats, unit, rate)?)
    }

    /// Current BCH price in USD from the configured rate source.
    pub async fn usd_rate(&self) -> Result<f64, WalletError> {
        match &self.rates {
            Some(cache) => cache.usd_rate().await,
            None => Err(WalletError::RateUnavailable(
                "no rate source configured".into(),
            )),
        }
    }

    /// Every output at this wallet's address, token-bearing ones included.
    pub async fn utxos(&self) -> Result<Vec<Utxo>, WalletError> {
        let utxos = self.io(self.source.list_utxos(&self.address)).await?;
        debug!("{} utxo(s) at {}", utxos.len(), self.address);
        Ok(utxos)
    }

    pub(crate) async fn best_height(&self) -> Result<u64, WalletError> {
        self.io(self.source.block_height()).await
    }

    pub(crate) fn locking_bytecode(&self) -> Result<LockingBytecode, WalletError> {
        Ok(self.assembler.codec().decode(&self.address)?)
    }

    /// Fresh outputs and the engine options for one build attempt.
    pub(crate) async fn prepare(
        &self,
        options: &SendOptions,
        usd_rate: Option<f64>,
    ) -> Result<(Vec<Utxo>, BuildOptions), WalletError> {
        let available = self.utxos().await?;
        let change_address = options
            .change_address
            .clone()
            .unwrap_or_else(|| self.address.clone());
        let mut build = BuildOptions::new(change_address);
        build.pinned = options.utxo_ids.clone();
        build.fee_rate = options.fee_per_byte.unwrap_or(self.config.fee_per_byte);
        build.fee_paid_by = options.fee_paid_by;
        build.best_height = self.best_height().await?;
        build.usd_rate = usd_rate;
        Ok((available, build))
    }

    /// Run a source call under the configured I/O deadline.
    pub(crate) async fn io<T>(
        &self,
        call: impl Future<Output = Result<T, SourceError>>,
    ) -> Result<T, WalletError> {
        match tokio::time::timeout(self.config.io_timeout(), call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(WalletError::Timeout(self.config.io_timeout_ms)),
        }
    }
}
