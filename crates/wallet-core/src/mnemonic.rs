use bip39::{Language, Mnemonic};
use rand::RngCore;
use zeroize::{Zeroize, Zeroizing};

use crate::error::WalletError;

/// Generate an English BIP-39 phrase of 12 or 24 words.
pub fn generate_mnemonic(word_count: usize) -> Result<String, WalletError> {
    let entropy_len = match word_count {
        12 => 16,
        24 => 32,
        other => {
            return Err(WalletError::InvalidMnemonic(format!(
                "unsupported word count {other}, expected 12 or 24"
            )))
        }
    };
    let mut entropy = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut entropy[..entropy_len]);
    let mnemonic = Mnemonic::from_entropy_in(Language::English, &entropy[..entropy_len])
        .map_err(|e| WalletError::InvalidMnemonic(e.to_string()));
    entropy.zeroize();
    Ok(mnemonic?.to_string())
}

pub fn validate_mnemonic(phrase: &str) -> bool {
    Mnemonic::parse_in_normalized(Language::English, phrase).is_ok()
}

/// 64-byte BIP-39 seed, wiped when dropped.
pub fn mnemonic_to_seed(phrase: &str, passphrase: &str) -> Result<Zeroizing<[u8; 64]>, WalletError> {
    let mnemonic = Mnemonic::parse_in_normalized(Language::English, phrase)
        .map_err(|e| WalletError::InvalidMnemonic(e.to_string()))?;
    Ok(Zeroizing::new(mnemonic.to_seed(passphrase)))
}
