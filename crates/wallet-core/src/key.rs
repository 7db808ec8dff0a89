//! Key material: raw secp256k1 keys, WIF import/export and BIP-32 derivation.

use std::fmt;

use bip32::{DerivationPath, XPrv};
use chain_bch::address::pubkey_to_cashaddr;
use chain_bch::network::BchNetwork;
use chain_bch::transaction::P2pkhSigner;
use k256::ecdsa::SigningKey;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::WalletError;
use crate::mnemonic::mnemonic_to_seed;

const WIF_COMPRESSED_FLAG: u8 = 0x01;

/// A secp256k1 private key, wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey([u8; 32]);

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

impl PrivateKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, WalletError> {
        SigningKey::from_bytes(&bytes.into())
            .map_err(|e| WalletError::InvalidPrivateKey(e.to_string()))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// SEC1 compressed public key.
    pub fn public_key(&self) -> Result<[u8; 33], WalletError> {
        Ok(*self.signer()?.public_key())
    }

    pub fn signer(&self) -> Result<P2pkhSigner, WalletError> {
        Ok(P2pkhSigner::from_bytes(&self.0)?)
    }

    /// P2PKH CashAddr of this key on `network`.
    pub fn address(&self, network: BchNetwork) -> Result<String, WalletError> {
        Ok(pubkey_to_cashaddr(&self.public_key()?, network)?)
    }

    /// Compressed-key WIF for `network`.
    pub fn to_wif(&self, network: BchNetwork) -> String {
        let mut payload = Vec::with_capacity(34);
        payload.push(network.wif_version());
        payload.extend_from_slice(&self.0);
        payload.push(WIF_COMPRESSED_FLAG);
        let wif = bs58::encode(&payload).with_check().into_string();
        payload.zeroize();
        wif
    }

    /// Decode a compressed-key WIF. Returns the key and the network its
    /// version byte names; testnet and regtest share a version byte, so the
    /// caller's `network` breaks the tie and must agree with the version.
    pub fn from_wif(wif: &str, network: BchNetwork) -> Result<Self, WalletError> {
        let mut payload = bs58::decode(wif.trim())
            .with_check(None)
            .into_vec()
            .map_err(|e| WalletError::InvalidPrivateKey(format!("bad WIF encoding: {e}")))?;
        let parsed = Self::from_wif_payload(&payload, network);
        payload.zeroize();
        parsed
    }

    fn from_wif_payload(payload: &[u8], network: BchNetwork) -> Result<Self, WalletError> {
        match payload {
            [version, key @ .., WIF_COMPRESSED_FLAG] if key.len() == 32 => {
                if *version != network.wif_version() {
                    return Err(WalletError::InvalidPrivateKey(format!(
                        "WIF version 0x{version:02x} does not belong to {network}"
                    )));
                }
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(key);
                let key = Self::from_bytes(bytes);
                bytes.zeroize();
                key
            }
            [_, key @ ..] if key.len() == 32 => Err(WalletError::InvalidPrivateKey(
                "uncompressed WIF keys are not supported".into(),
            )),
            _ => Err(WalletError::InvalidPrivateKey(format!(
                "WIF payload has {} bytes",
                payload.len()
            ))),
        }
    }
}

/// What a wallet can do with its address.
#[derive(Debug, Clone)]
pub enum KeyMaterial {
    Spendable(PrivateKey),
    /// Address only; drafts can be built but not signed.
    WatchOnly,
}

impl KeyMaterial {
    pub fn private_key(&self) -> Result<&PrivateKey, WalletError> {
        match self {
            KeyMaterial::Spendable(key) => Ok(key),
            KeyMaterial::WatchOnly => Err(WalletError::WatchOnly),
        }
    }

    pub fn is_watch_only(&self) -> bool {
        matches!(self, KeyMaterial::WatchOnly)
    }
}

/// Derive the key at `path` from a BIP-39 phrase.
pub fn derive_from_mnemonic(
    phrase: &str,
    passphrase: &str,
    path: &str,
) -> Result<PrivateKey, WalletError> {
    let path: DerivationPath = path
        .parse()
        .map_err(|e: bip32::Error| WalletError::DerivationFailed(format!("{path}: {e}")))?;
    let seed = mnemonic_to_seed(phrase, passphrase)?;
    let xprv = XPrv::derive_from_path(seed.as_slice(), &path)
        .map_err(|e| WalletError::DerivationFailed(e.to_string()))?;
    let mut bytes: [u8; 32] = xprv.to_bytes().into();
    let key = PrivateKey::from_bytes(bytes);
    bytes.zeroize();
    key
}
