//! CashToken genesis, minting and balances. Transfers go through
//! [`Wallet::send`] with token-aware requests.

use chain_bch::assembler::{BuildPlan, OutputRole, ResolvedOutput, SendRequest};
use chain_bch::cashtoken::{Nft, NftCapability, TokenDatum};
use chain_bch::error::BchError;
use chain_bch::utxo::Utxo;

use crate::config::SendOptions;
use crate::error::WalletError;
use crate::send::SendResponse;
use crate::slp::GenesisResponse;
use crate::wallet::Wallet;

/// Satoshis placed on genesis and freshly minted token outputs.
pub const TOKEN_OUTPUT_SATOSHIS: u64 = 1000;

#[derive(Debug, Clone, Default)]
pub struct TokenGenesisOptions {
    /// Defaults to the wallet's own address.
    pub receiver: Option<String>,
    /// Fungible supply; zero for an NFT-only category.
    pub amount: u64,
    pub nft: Option<Nft>,
    pub satoshis: Option<u64>,
    /// Plain payments carried in the same transaction.
    pub extra: Vec<SendRequest>,
}

/// One NFT to create from a minting NFT.
#[derive(Debug, Clone, Default)]
pub struct TokenMintRequest {
    pub receiver: Option<String>,
    pub capability: NftCapability,
    pub commitment: Vec<u8>,
    pub satoshis: Option<u64>,
}

impl Wallet {
    /// Create a category from a plain vout-0 output; the category id is that
    /// output's txid.
    pub async fn token_genesis(
        &self,
        options: &TokenGenesisOptions,
        send: &SendOptions,
    ) -> Result<GenesisResponse, WalletError> {
        if options.amount == 0 && options.nft.is_none() {
            return Err(BchError::InvalidToken(
                "genesis needs a fungible amount or an nft".into(),
            )
            .into());
        }
        let receiver = self
            .assembler
            .codec()
            .decode(options.receiver.as_deref().unwrap_or(&self.address))?;
        let extra = self.assembler.resolve(&options.extra, None)?;
        if extra.iter().any(|o| o.token.is_some()) {
            return Err(BchError::InvalidRequest(
                "genesis cannot carry other token outputs".into(),
            )
            .into());
        }

        let (txid, draft) = self
            .submit(send, None, |available, build| {
                let genesis_input = available
                    .iter()
                    .filter(|u| {
                        u.vout == 0 && !u.is_token_bearing() && u.is_mature(build.best_height)
                    })
                    .min_by_key(|u| u.satoshis)
                    .ok_or_else(|| {
                        BchError::InvalidRequest(
                            "no suitable inputs with vout=0 available for new token genesis".into(),
                        )
                    })?;
                let token = TokenDatum {
                    category: genesis_input.txid.to_ascii_lowercase(),
                    amount: options.amount,
                    nft: options.nft.clone(),
                };
                token.validate()?;
                let mut outputs = vec![ResolvedOutput::with_token(
                    receiver.clone(),
                    options.satoshis.unwrap_or(TOKEN_OUTPUT_SATOSHIS),
                    token,
                )];
                outputs.extend(extra.iter().cloned());
                let plan = BuildPlan {
                    outputs,
                    required_inputs: vec![genesis_input.clone()],
                    ..BuildPlan::default()
                };
                Ok(self.assembler.build_plan(plan, available, build)?)
            })
            .await?;

        let category = draft
            .outputs
            .iter()
            .find_map(|o| o.token.as_ref())
            .map(|t| t.category.clone())
            .ok_or_else(|| BchError::TransactionBuildError("genesis output missing".into()))?;
        let response = self.respond(txid).await?;
        Ok(GenesisResponse {
            token_id: category,
            txid: response.txid,
            balance_after: response.balance_after,
        })
    }

    /// Create NFTs of `category` from this wallet's minting NFT. The minting
    /// NFT comes back to the wallet; with `deduct_amount` its fungible amount
    /// drops by the number of NFTs minted, stopping at zero.
    pub async fn token_mint(
        &self,
        category: &str,
        requests: &[TokenMintRequest],
        deduct_amount: bool,
        send: &SendOptions,
    ) -> Result<SendResponse, WalletError> {
        if requests.is_empty() {
            return Err(BchError::InvalidRequest("nothing to mint".into()).into());
        }
        let category = category.to_ascii_lowercase();
        let codec = self.assembler.codec();
        let minted = requests
            .iter()
            .map(|r| {
                let token = TokenDatum::nft(category.clone(), r.capability, r.commitment.clone());
                token.validate()?;
                Ok(ResolvedOutput::with_token(
                    codec.decode(r.receiver.as_deref().unwrap_or(&self.address))?,
                    r.satoshis.unwrap_or(TOKEN_OUTPUT_SATOSHIS),
                    token,
                ))
            })
            .collect::<Result<Vec<_>, BchError>>()?;
        let own = self.locking_bytecode()?;

        let (txid, _) = self
            .submit(send, None, |available, build| {
                let minter = available
                    .iter()
                    .find(|u| is_minting_nft(u, &category))
                    .ok_or_else(|| {
                        BchError::InvalidToken(format!("no minting nft for category {category}"))
                    })?;
                let mut returned = minter
                    .token
                    .clone()
                    .ok_or_else(|| BchError::InvalidToken(format!("{} has no token", minter.id())))?;
                if deduct_amount {
                    returned.amount = returned.amount.saturating_sub(requests.len() as u64);
                }
                let mut outputs = vec![ResolvedOutput {
                    role: OutputRole::TokenChange,
                    ..ResolvedOutput::with_token(own.clone(), minter.satoshis, returned)
                }];
                outputs.extend(minted.iter().cloned());
                let plan = BuildPlan {
                    outputs,
                    required_inputs: vec![minter.clone()],
                    ..BuildPlan::default()
                };
                Ok(self.assembler.build_plan(plan, available, build)?)
            })
            .await?;
        self.respond(txid).await
    }

    /// Fungible amount of `category` held.
    pub async fn token_balance(&self, category: &str) -> Result<u64, WalletError> {
        let utxos = self.token_utxos(category).await?;
        utxos
            .iter()
            .filter_map(|u| u.token.as_ref())
            .try_fold(0u64, |acc, t| acc.checked_add(t.amount))
            .ok_or_else(|| {
                BchError::InvalidAmount(format!("balance of {category} overflows 64 bits")).into()
            })
    }

    /// Outputs carrying tokens of `category`.
    pub async fn token_utxos(&self, category: &str) -> Result<Vec<Utxo>, WalletError> {
        Ok(self
            .utxos()
            .await?
            .into_iter()
            .filter(|u| {
                u.token
                    .as_ref()
                    .is_some_and(|t| t.category.eq_ignore_ascii_case(category))
            })
            .collect())
    }
}

fn is_minting_nft(utxo: &Utxo, category: &str) -> bool {
    utxo.token.as_ref().is_some_and(|t| {
        t.category.eq_ignore_ascii_case(category)
            && t.nft
                .as_ref()
                .is_some_and(|n| n.capability == NftCapability::Minting)
    })
}
